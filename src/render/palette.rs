/// Colour palettes for element maps.
///
/// Every palette maps a normalised position `t` in [0, 1] to an 8-bit RGB
/// triple. Missing pixels take the palette's colour at 0, which also serves
/// as the composite background.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Palette {
    #[default]
    Jet,
    Viridis,
    Magma,
    Inferno,
    Hot,
    Gray,
}

type Stop = [u8; 3];

// Nine evenly spaced samples of the perceptually uniform maps.
const VIRIDIS: [Stop; 9] = [
    [68, 1, 84],
    [71, 44, 122],
    [59, 81, 139],
    [44, 113, 142],
    [33, 144, 141],
    [39, 173, 129],
    [92, 200, 99],
    [170, 220, 50],
    [253, 231, 37],
];

const MAGMA: [Stop; 9] = [
    [0, 0, 4],
    [28, 16, 68],
    [79, 18, 123],
    [129, 37, 129],
    [181, 54, 122],
    [229, 80, 100],
    [251, 135, 97],
    [254, 194, 135],
    [252, 253, 191],
];

const INFERNO: [Stop; 9] = [
    [0, 0, 4],
    [31, 12, 72],
    [85, 15, 109],
    [136, 34, 106],
    [186, 54, 85],
    [227, 89, 51],
    [249, 140, 10],
    [249, 201, 50],
    [252, 255, 164],
];

impl Palette {
    pub const ALL: [Palette; 6] = [
        Palette::Jet,
        Palette::Viridis,
        Palette::Magma,
        Palette::Inferno,
        Palette::Hot,
        Palette::Gray,
    ];

    /// Colour at position `t`; out-of-range values are clamped, NaN is
    /// treated as 0.
    pub fn color(self, t: f64) -> [u8; 3] {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        match self {
            Palette::Jet => {
                let ch = |centre: f64| to_u8(1.5 - (4.0 * t - centre).abs());
                [ch(3.0), ch(2.0), ch(1.0)]
            }
            Palette::Hot => [
                to_u8(t * 8.0 / 3.0),
                to_u8(t * 8.0 / 3.0 - 1.0),
                to_u8(4.0 * t - 3.0),
            ],
            Palette::Gray => {
                let v = to_u8(t);
                [v, v, v]
            }
            Palette::Viridis => sample_stops(&VIRIDIS, t),
            Palette::Magma => sample_stops(&MAGMA, t),
            Palette::Inferno => sample_stops(&INFERNO, t),
        }
    }

    /// Colour used for missing pixels and grid padding.
    pub fn masked(self) -> [u8; 3] {
        self.color(0.0)
    }

    /// Text colour that stays readable on top of [`masked`](Self::masked).
    pub fn contrast_text(self) -> [u8; 3] {
        contrast_text(self.masked())
    }
}

/// White on dark backgrounds, black on light ones.
pub fn contrast_text(background: [u8; 3]) -> [u8; 3] {
    let mean = background.iter().map(|&c| c as f64 / 255.0).sum::<f64>() / 3.0;
    if mean < 0.5 {
        [255, 255, 255]
    } else {
        [0, 0, 0]
    }
}

fn to_u8(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn sample_stops(stops: &[Stop], t: f64) -> [u8; 3] {
    let pos = t * (stops.len() - 1) as f64;
    let i = (pos.floor() as usize).min(stops.len() - 2);
    let frac = pos - i as f64;
    let (a, b) = (stops[i], stops[i + 1]);
    let mut out = [0u8; 3];
    for k in 0..3 {
        out[k] = (a[k] as f64 + (b[k] as f64 - a[k] as f64) * frac).round() as u8;
    }
    out
}

impl fmt::Display for Palette {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Palette::Jet => write!(f, "jet"),
            Palette::Viridis => write!(f, "viridis"),
            Palette::Magma => write!(f, "magma"),
            Palette::Inferno => write!(f, "inferno"),
            Palette::Hot => write!(f, "hot"),
            Palette::Gray => write!(f, "gray"),
        }
    }
}

impl FromStr for Palette {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jet" => Ok(Palette::Jet),
            "viridis" => Ok(Palette::Viridis),
            "magma" => Ok(Palette::Magma),
            "inferno" => Ok(Palette::Inferno),
            "hot" => Ok(Palette::Hot),
            "gray" | "grey" | "grayscale" => Ok(Palette::Gray),
            other => Err(MapError::config(format!("unknown palette '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(Palette::Jet.color(0.0), [0, 0, 128]);
        assert_eq!(Palette::Jet.color(1.0), [128, 0, 0]);
        assert_eq!(Palette::Jet.color(0.5), [128, 255, 128]);
    }

    #[test]
    fn test_stops_hit_endpoints() {
        assert_eq!(Palette::Viridis.color(0.0), VIRIDIS[0]);
        assert_eq!(Palette::Viridis.color(1.0), VIRIDIS[8]);
        assert_eq!(Palette::Gray.color(1.0), [255, 255, 255]);
        assert_eq!(Palette::Hot.color(0.0), [0, 0, 0]);
        assert_eq!(Palette::Hot.color(1.0), [255, 255, 255]);
    }

    #[test]
    fn test_nan_and_out_of_range() {
        for p in Palette::ALL {
            assert_eq!(p.color(f64::NAN), p.masked());
            assert_eq!(p.color(-3.0), p.color(0.0));
            assert_eq!(p.color(7.0), p.color(1.0));
        }
    }

    #[test]
    fn test_contrast_text() {
        assert_eq!(Palette::Jet.contrast_text(), [255, 255, 255]);
        assert_eq!(contrast_text([240, 240, 240]), [0, 0, 0]);
    }

    #[test]
    fn test_names_round_trip() {
        for p in Palette::ALL {
            assert_eq!(p.to_string().parse::<Palette>().unwrap(), p);
        }
        assert!("rainbow".parse::<Palette>().is_err());
    }
}
