use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MapError, Result};

/// Sentinel for a missing or masked pixel.
pub const MISSING: f64 = f64::NAN;

/// Unit an element map was exported in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnitKind {
    Ppm,
    Cps,
    Raw,
}

impl UnitKind {
    /// Label printed next to the colour bar.
    pub fn axis_label(self) -> &'static str {
        match self {
            UnitKind::Ppm => "ppm",
            UnitKind::Cps => "CPS",
            UnitKind::Raw => "counts",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Ppm => write!(f, "ppm"),
            UnitKind::Cps => write!(f, "CPS"),
            UnitKind::Raw => write!(f, "raw"),
        }
    }
}

impl FromStr for UnitKind {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ppm" => Ok(UnitKind::Ppm),
            "CPS" | "cps" => Ok(UnitKind::Cps),
            "raw" => Ok(UnitKind::Raw),
            other => Err(MapError::config(format!(
                "unknown unit '{}' (expected ppm, CPS or raw)",
                other
            ))),
        }
    }
}

/// Sample / element / unit carried by a matrix file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixMeta {
    pub sample: String,
    pub element: String,
    pub unit: UnitKind,
}

impl MatrixMeta {
    pub fn new(sample: &str, element: &str, unit: UnitKind) -> Self {
        Self {
            sample: sample.to_string(),
            element: element.to_string(),
            unit,
        }
    }

    /// Output folder / file prefix for this element, e.g. `Fe56_ppm`.
    pub fn element_key(&self) -> String {
        format!("{}_{}", self.element, self.unit)
    }
}

/// Dense row-major 2D grid of intensities; `NaN` marks missing pixels.
#[derive(Debug, Clone)]
pub struct Grid {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Grid {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(MapError::data(format!(
                "grid of {}x{} needs {} values, got {}",
                rows,
                cols,
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Build from possibly ragged rows; short rows are padded with missing values.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let n_rows = rows.len();
        let n_cols = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let mut data = Vec::with_capacity(n_rows * n_cols);
        for row in rows {
            let pad = n_cols - row.len();
            data.extend(row);
            data.extend(std::iter::repeat(MISSING).take(pad));
        }
        Self {
            rows: n_rows,
            cols: n_cols,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// Iterator over populated (finite) cells.
    pub fn valid(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().copied().filter(|v| v.is_finite())
    }

    pub fn valid_count(&self) -> usize {
        self.valid().count()
    }

    pub fn min(&self) -> Option<f64> {
        self.valid().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.valid().reduce(f64::max)
    }

    pub fn mean(&self) -> Option<f64> {
        let (sum, n) = self.valid().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        if n == 0 {
            None
        } else {
            Some(sum / n as f64)
        }
    }

    /// Sorted copy of the populated values, for repeated percentile queries.
    pub fn sorted_valid(&self) -> Vec<f64> {
        let mut v: Vec<f64> = self.valid().collect();
        v.sort_by(f64::total_cmp);
        v
    }

    /// Percentile (0..=100) with linear interpolation between closest ranks.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile_of_sorted(&self.sorted_valid(), p)
    }

    /// Drop every row and every column that holds no populated cell.
    pub fn trim_missing(&self) -> Grid {
        let keep_rows: Vec<usize> = (0..self.rows)
            .filter(|&r| self.row(r).iter().any(|v| v.is_finite()))
            .collect();
        let keep_cols: Vec<usize> = (0..self.cols)
            .filter(|&c| (0..self.rows).any(|r| self.get(r, c).is_finite()))
            .collect();

        let mut data = Vec::with_capacity(keep_rows.len() * keep_cols.len());
        for &r in &keep_rows {
            for &c in &keep_cols {
                data.push(self.get(r, c));
            }
        }
        Grid {
            rows: keep_rows.len(),
            cols: keep_cols.len(),
            data,
        }
    }

    /// Block-average down to at most `target_max` on the longer side.
    ///
    /// Trailing rows/columns that do not fill a whole block are cropped.
    /// A block averages only its populated cells and stays missing when it
    /// has none.
    pub fn downsample(&self, target_max: usize) -> Grid {
        let longest = self.rows.max(self.cols);
        if target_max == 0 || longest <= target_max {
            return self.clone();
        }
        let factor = (longest as f64 / target_max as f64).floor().max(1.0) as usize;
        let out_rows = self.rows / factor;
        let out_cols = self.cols / factor;

        let mut data = Vec::with_capacity(out_rows * out_cols);
        for br in 0..out_rows {
            for bc in 0..out_cols {
                let mut sum = 0.0;
                let mut n = 0usize;
                for r in br * factor..(br + 1) * factor {
                    for c in bc * factor..(bc + 1) * factor {
                        let v = self.get(r, c);
                        if v.is_finite() {
                            sum += v;
                            n += 1;
                        }
                    }
                }
                data.push(if n == 0 { MISSING } else { sum / n as f64 });
            }
        }
        Grid {
            rows: out_rows,
            cols: out_cols,
            data,
        }
    }
}

/// Linear-interpolated percentile of an ascending slice.
pub fn percentile_of_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let pos = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// One element map of one sample
#[derive(Debug, Clone)]
pub struct ElementMatrix {
    pub grid: Grid,
    pub meta: MatrixMeta,
}

impl ElementMatrix {
    pub fn new(grid: Grid, meta: MatrixMeta) -> Self {
        Self { grid, meta }
    }

    pub fn sample(&self) -> &str {
        &self.meta.sample
    }

    pub fn element(&self) -> &str {
        &self.meta.element
    }

    pub fn unit(&self) -> UnitKind {
        self.meta.unit
    }

    pub fn shape(&self) -> (usize, usize) {
        self.grid.shape()
    }
}
