/// Display normalisation: maps raw intensities into [0, 1]
///
/// Two policies are supported:
/// - linear: `clip((v - min) / (max - min), 0, 1)`
/// - pseudo-log: `log1p`-based, defined at zero; negative inputs count as 0
///
/// Both have an inverse so colour-bar ticks can be labelled with data values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::data::matrix::percentile_of_sorted;
use crate::error::{MapError, Result};

/// Relative step used to separate `max` from `min` when they collide.
pub const SCALE_EPSILON: f64 = 1e-6;

const MAX_TICKS_PER_TARGET: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    #[default]
    Linear,
    PseudoLog,
}

impl fmt::Display for NormKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormKind::Linear => write!(f, "linear"),
            NormKind::PseudoLog => write!(f, "pseudo_log"),
        }
    }
}

impl FromStr for NormKind {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" | "lin" => Ok(NormKind::Linear),
            "pseudo_log" | "pseudo-log" | "pseudolog" | "log" => Ok(NormKind::PseudoLog),
            other => Err(MapError::config(format!(
                "unknown normalisation '{}' (expected linear or pseudo_log)",
                other
            ))),
        }
    }
}

/// A colour-bar tick: data value plus its position along the bar (0 = bottom)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub value: f64,
    pub position: f64,
}

/// Bounds and policy used to turn intensities into palette positions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayScale {
    min: f64,
    max: f64,
    kind: NormKind,
}

impl DisplayScale {
    /// Build a scale. `min >= max` is repaired by nudging `max` upward.
    /// Pseudo-log scales never start below zero.
    pub fn new(min: f64, max: f64, kind: NormKind) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() {
            return Err(MapError::data(format!(
                "display range [{}, {}] is not finite",
                min, max
            )));
        }
        let min = match kind {
            NormKind::Linear => min,
            NormKind::PseudoLog => min.max(0.0),
        };
        let max = if max <= min {
            let bumped = min + SCALE_EPSILON.max(min.abs() * SCALE_EPSILON);
            log::debug!("Display max {} <= min {}, using {}", max, min, bumped);
            bumped
        } else {
            max
        };
        if !(max - min).is_finite() {
            return Err(MapError::data(format!(
                "display range [{}, {}] is too wide",
                min, max
            )));
        }
        Ok(Self { min, max, kind })
    }

    /// Data minimum to the 99th percentile of all populated values,
    /// rounded to 3 decimals.
    pub fn from_values(values: impl IntoIterator<Item = f64>, kind: NormKind) -> Result<Self> {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Err(MapError::data("no populated values to derive a display range"));
        }
        sorted.sort_by(f64::total_cmp);
        let min = sorted[0];
        let p99 = percentile_of_sorted(&sorted, 99.0).unwrap_or(min);
        Self::new(min, (p99 * 1000.0).round() / 1000.0, kind)
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn kind(&self) -> NormKind {
        self.kind
    }

    /// Same bounds, different policy.
    pub fn with_kind(&self, kind: NormKind) -> Result<Self> {
        Self::new(self.min, self.max, kind)
    }

    /// Same policy, new upper bound.
    pub fn with_max(&self, max: f64) -> Result<Self> {
        Self::new(self.min, max, self.kind)
    }

    /// Position in [0, 1]; `None` for missing values.
    pub fn forward(&self, v: f64) -> Option<f64> {
        if v.is_nan() {
            return None;
        }
        let t = match self.kind {
            NormKind::Linear => (v - self.min) / (self.max - self.min),
            NormKind::PseudoLog => {
                let lo = self.min.ln_1p();
                (v.max(0.0).ln_1p() - lo) / (self.max.ln_1p() - lo)
            }
        };
        Some(t.clamp(0.0, 1.0))
    }

    /// Data value at position `t`.
    pub fn inverse(&self, t: f64) -> f64 {
        match self.kind {
            NormKind::Linear => self.min + t * (self.max - self.min),
            NormKind::PseudoLog => {
                let lo = self.min.ln_1p();
                (t * (self.max.ln_1p() - lo) + lo).exp_m1()
            }
        }
    }

    /// Roughly `target` ticks for a colour bar.
    ///
    /// Linear scales get round values at a 1/2/5 step. Pseudo-log scales
    /// take evenly spaced bar positions, map them back through
    /// [`inverse`](Self::inverse) and round to two significant digits.
    pub fn ticks(&self, target: usize) -> Vec<Tick> {
        let target = target.max(2);
        let mut ticks = Vec::new();
        match self.kind {
            NormKind::Linear => {
                let step = nice_step((self.max - self.min) / target as f64);
                let tol = step * 1e-9;
                let first = (self.min / step).ceil() * step;
                // ranges a few ulps wide would otherwise repeat the same value
                for i in 0..=MAX_TICKS_PER_TARGET * target {
                    let v = first + i as f64 * step;
                    if v > self.max + tol {
                        break;
                    }
                    if ticks.last().map_or(false, |p: &Tick| v <= p.value) {
                        continue;
                    }
                    ticks.push(Tick {
                        value: v,
                        position: ((v - self.min) / (self.max - self.min)).clamp(0.0, 1.0),
                    });
                }
            }
            NormKind::PseudoLog => {
                for i in 0..target {
                    let t = i as f64 / (target - 1) as f64;
                    let value = round_significant(self.inverse(t), 2);
                    let position = self.forward(value).unwrap_or(t);
                    if ticks.last().map_or(true, |p: &Tick| value > p.value) {
                        ticks.push(Tick { value, position });
                    }
                }
            }
        }
        ticks
    }
}

/// Smallest 1/2/5 × 10^k step that is at least `raw`.
pub fn nice_step(raw: f64) -> f64 {
    if !raw.is_finite() || raw <= 0.0 {
        return 1.0;
    }
    let magnitude = 10f64.powf(raw.log10().floor());
    for m in [1.0, 2.0, 5.0, 10.0] {
        if m * magnitude >= raw * (1.0 - 1e-12) {
            return m * magnitude;
        }
    }
    10.0 * magnitude
}

pub fn round_significant(v: f64, digits: i32) -> f64 {
    if v == 0.0 || !v.is_finite() {
        return v;
    }
    let power = digits - 1 - v.abs().log10().floor() as i32;
    if power >= 0 {
        let scale = 10f64.powi(power);
        (v * scale).round() / scale
    } else {
        let scale = 10f64.powi(-power);
        (v / scale).round() * scale
    }
}

/// Short label for a tick value.
pub fn format_tick(v: f64) -> String {
    let a = v.abs();
    if a == 0.0 {
        "0".to_string()
    } else if a >= 1e5 || a < 1e-2 {
        format!("{:.1e}", v)
    } else if (v - v.round()).abs() < 1e-9 {
        format!("{:.0}", v)
    } else if a >= 10.0 {
        format!("{:.1}", v)
    } else {
        let s = format!("{:.2}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
