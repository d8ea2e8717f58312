/// Map math: a small arithmetic language evaluated per pixel
///
/// Expressions use the pixel value `x`, numbers, `+ - * /`, powers
/// (`^` or `**`, right-associative), parentheses, the constants `pi` and
/// `e`, and the functions `sqrt`, `abs`, `exp`, `ln`, `log`, `log10`,
/// `log2` and `log1p` (`log` is natural). A leading `np.` on a function
/// name is accepted, so `np.log10(x) * 2` parses.
///
/// Only populated, positive pixels are rewritten; zeros and missing pixels
/// pass through unchanged.

use std::fmt;
use std::str::FromStr;

use crate::data::matrix::{Grid, MISSING};
use crate::error::{MapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Sqrt,
    Abs,
    Exp,
    Ln,
    Log10,
    Log2,
    Log1p,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        let name = name.strip_prefix("np.").unwrap_or(name);
        Some(match name {
            "sqrt" => Func::Sqrt,
            "abs" => Func::Abs,
            "exp" => Func::Exp,
            "ln" | "log" => Func::Ln,
            "log10" => Func::Log10,
            "log2" => Func::Log2,
            "log1p" => Func::Log1p,
            _ => return None,
        })
    }

    fn apply(self, v: f64) -> f64 {
        match self {
            Func::Sqrt => v.sqrt(),
            Func::Abs => v.abs(),
            Func::Exp => v.exp(),
            Func::Ln => v.ln(),
            Func::Log10 => v.log10(),
            Func::Log2 => v.log2(),
            Func::Log1p => v.ln_1p(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Value,
    Number(f64),
    Neg(Box<Node>),
    Add(Box<Node>, Box<Node>),
    Sub(Box<Node>, Box<Node>),
    Mul(Box<Node>, Box<Node>),
    Div(Box<Node>, Box<Node>),
    Pow(Box<Node>, Box<Node>),
    Call(Func, Box<Node>),
}

impl Node {
    fn eval(&self, x: f64) -> f64 {
        match self {
            Node::Value => x,
            Node::Number(n) => *n,
            Node::Neg(a) => -a.eval(x),
            Node::Add(a, b) => a.eval(x) + b.eval(x),
            Node::Sub(a, b) => a.eval(x) - b.eval(x),
            Node::Mul(a, b) => a.eval(x) * b.eval(x),
            Node::Div(a, b) => a.eval(x) / b.eval(x),
            Node::Pow(a, b) => a.eval(x).powf(b.eval(x)),
            Node::Call(f, a) => f.apply(a.eval(x)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Open,
    Close,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Caret);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent, as in 1e-3
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| MapError::config(format!("bad number '{}' in expression", text)))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(MapError::config(format!(
                    "unexpected '{}' at position {} in expression",
                    other, i
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_close(&mut self) -> Result<()> {
        match self.next() {
            Some(Token::Close) => Ok(()),
            _ => Err(MapError::config("missing ')' in expression")),
        }
    }

    fn sum(&mut self) -> Result<Node> {
        let mut lhs = self.product()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    lhs = Node::Add(Box::new(lhs), Box::new(self.product()?));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    lhs = Node::Sub(Box::new(lhs), Box::new(self.product()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn product(&mut self) -> Result<Node> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    lhs = Node::Mul(Box::new(lhs), Box::new(self.unary()?));
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    lhs = Node::Div(Box::new(lhs), Box::new(self.unary()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn unary(&mut self) -> Result<Node> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Node> {
        let base = self.atom()?;
        if let Some(Token::Caret) = self.peek() {
            self.pos += 1;
            return Ok(Node::Pow(Box::new(base), Box::new(self.unary()?)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Number(n)),
            Some(Token::Open) => {
                let inner = self.sum()?;
                self.expect_close()?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "x" => Ok(Node::Value),
                "pi" | "np.pi" => Ok(Node::Number(std::f64::consts::PI)),
                "e" | "np.e" => Ok(Node::Number(std::f64::consts::E)),
                _ => {
                    let func = Func::lookup(&name)
                        .ok_or_else(|| MapError::config(format!("unknown name '{}' in expression", name)))?;
                    match self.next() {
                        Some(Token::Open) => {}
                        _ => return Err(MapError::config(format!("'{}' needs an argument in parentheses", name))),
                    }
                    let arg = self.sum()?;
                    self.expect_close()?;
                    Ok(Node::Call(func, Box::new(arg)))
                }
            },
            Some(t) => Err(MapError::config(format!("unexpected {:?} in expression", t))),
            None => Err(MapError::config("expression ends too early")),
        }
    }
}

/// A parsed per-pixel expression
#[derive(Debug, Clone, PartialEq)]
pub struct MapExpression {
    source: String,
    root: Node,
}

impl MapExpression {
    pub fn parse(src: &str) -> Result<Self> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(MapError::config("empty expression"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.sum()?;
        if let Some(t) = parser.peek() {
            return Err(MapError::config(format!("unexpected {:?} after expression", t)));
        }
        Ok(Self {
            source: src.trim().to_string(),
            root,
        })
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.root.eval(x)
    }

    /// Rewrite every populated, positive pixel. Non-finite results
    /// become missing.
    pub fn apply(&self, grid: &Grid) -> Result<Grid> {
        let mut rewritten = 0usize;
        let data: Vec<f64> = grid
            .values()
            .iter()
            .map(|&v| {
                if v.is_finite() && v > 0.0 {
                    rewritten += 1;
                    let out = self.eval(v);
                    if out.is_finite() {
                        out
                    } else {
                        MISSING
                    }
                } else {
                    v
                }
            })
            .collect();
        log::info!("Applied '{}' to {} pixel(s)", self.source, rewritten);
        Grid::new(grid.rows(), grid.cols(), data)
    }
}

impl FromStr for MapExpression {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for MapExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn eval(src: &str, x: f64) -> f64 {
        MapExpression::parse(src).unwrap().eval(x)
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("1 + 2 * x", 3.0), 7.0);
        assert_eq!(eval("(1 + 2) * x", 3.0), 9.0);
        assert_eq!(eval("x / 2 / 2", 8.0), 2.0);
        assert_eq!(eval("-x^2", 3.0), -9.0);
        assert_eq!(eval("2^3^2", 0.0), 512.0);
        assert_eq!(eval("x**2 - 1", 4.0), 15.0);
        assert_eq!(eval("1.5e2 + x", 1.0), 151.0);
    }

    #[test]
    fn test_functions() {
        assert_relative_eq!(eval("log10(x) * 2", 100.0), 4.0);
        assert_relative_eq!(eval("np.log(x)", std::f64::consts::E), 1.0);
        assert_relative_eq!(eval("sqrt(abs(x - 20))", 4.0), 4.0);
        assert_relative_eq!(eval("exp(0) + pi - pi", 0.0), 1.0);
    }

    #[test]
    fn test_parse_errors() {
        assert!(MapExpression::parse("").is_err());
        assert!(MapExpression::parse("x +").is_err());
        assert!(MapExpression::parse("(x + 1").is_err());
        assert!(MapExpression::parse("foo(x)").is_err());
        assert!(MapExpression::parse("y * 2").is_err());
        assert!(MapExpression::parse("x $ 2").is_err());
        assert!(MapExpression::parse("x 2").is_err());
        assert!(MapExpression::parse("sqrt x").is_err());
    }

    #[test]
    fn test_apply_skips_empty_pixels() {
        let g = Grid::new(1, 4, vec![4.0, 0.0, f64::NAN, -2.0]).unwrap();
        let out: Grid = "sqrt(x) * 10".parse::<MapExpression>().unwrap().apply(&g).unwrap();
        assert_eq!(out.get(0, 0), 20.0);
        assert_eq!(out.get(0, 1), 0.0);
        assert!(out.get(0, 2).is_nan());
        assert_eq!(out.get(0, 3), -2.0);

        let div = MapExpression::parse("1 / (x - 4)").unwrap().apply(&g).unwrap();
        assert!(div.get(0, 0).is_nan());
    }
}
