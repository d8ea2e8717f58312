/// Render settings shared by the composite, colour-bar and overlay exports.
///
/// Settings can be stored as a JSON file; fields missing from the file take
/// their default values, and command-line flags are applied on top.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{MapError, Result};
use crate::pipeline::normalize::NormKind;
use crate::render::palette::Palette;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Export resolution; all font sizes are converted with `pt * dpi / 72`
    pub dpi: u32,
    /// Edge length of one map cell in inches
    pub cell_inches: f64,
    pub palette: Palette,
    pub normalization: NormKind,
    /// Upper display bound (None = 99th percentile of all samples)
    pub scale_max: Option<f64>,
    /// Requested grid rows (None = layout with fewest empty cells)
    pub rows: Option<usize>,
    /// Pixel size in µm used for samples without a custom entry
    pub pixel_size_um: f64,
    /// Physical scale-bar length in µm
    pub scale_bar_um: f64,
    pub show_scale_bar: bool,
    /// Sample label size in points (None = no labels)
    pub sample_label_pt: Option<f32>,
    pub scale_bar_pt: f32,
    pub color_bar_pt: f32,
    /// Element label size in points (None = no element label)
    pub element_label_pt: Option<f32>,
    /// Credit / grant line printed bottom right
    pub credit_text: Option<String>,
    pub credit_pt: f32,
    /// Downsample maps when more samples than this are composited
    pub downsample_above: usize,
    /// Longest side after downsampling
    pub downsample_target: usize,
    /// Also write the stitched composite matrix as CSV
    pub export_matrix: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            dpi: 300,
            cell_inches: 4.0,
            palette: Palette::Jet,
            normalization: NormKind::Linear,
            scale_max: None,
            rows: None,
            pixel_size_um: 6.0,
            scale_bar_um: 500.0,
            show_scale_bar: true,
            sample_label_pt: Some(12.0),
            scale_bar_pt: 10.0,
            color_bar_pt: 10.0,
            element_label_pt: None,
            credit_text: None,
            credit_pt: 8.0,
            downsample_above: 10,
            downsample_target: 512,
            export_matrix: false,
        }
    }
}

impl RenderSettings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MapError::FileMissing {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path)?;
        let settings: RenderSettings = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        log::info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would make the output geometry undefined.
    ///
    /// Pixel size and scale-bar length are not checked here: a bad value
    /// only removes the scale bar.
    pub fn validate(&self) -> Result<()> {
        if self.dpi == 0 || self.dpi > 2400 {
            return Err(MapError::config(format!("dpi {} out of range 1..=2400", self.dpi)));
        }
        if !(self.cell_inches.is_finite() && self.cell_inches > 0.0) {
            return Err(MapError::config(format!(
                "cell size {} in must be positive",
                self.cell_inches
            )));
        }
        if let Some(max) = self.scale_max {
            if !max.is_finite() {
                return Err(MapError::config("scale max must be a finite number"));
            }
        }
        if self.downsample_target == 0 {
            return Err(MapError::config("downsample target must be at least 1"));
        }
        Ok(())
    }

    /// Cell edge in output pixels.
    pub fn cell_px(&self) -> u32 {
        (self.cell_inches * self.dpi as f64).round().max(16.0) as u32
    }

    /// Scale-bar length when both the bar length and `pixel_size_um` are
    /// usable, in matrix pixels: `max(1, round(length / pixel size))`.
    pub fn scale_bar_matrix_px(&self, pixel_size_um: f64) -> Option<u32> {
        if !self.show_scale_bar {
            return None;
        }
        scale_bar_pixels(self.scale_bar_um, pixel_size_um)
    }
}

/// `max(1, round(length / pixel size))`, or `None` (with a warning) when
/// either value is not a positive number.
pub fn scale_bar_pixels(length_um: f64, pixel_size_um: f64) -> Option<u32> {
    let usable = |v: f64| v.is_finite() && v > 0.0;
    if !usable(pixel_size_um) || !usable(length_um) {
        log::warn!(
            "Scale bar omitted: pixel size {} µm, bar length {} µm",
            pixel_size_um,
            length_um
        );
        return None;
    }
    Some(((length_um / pixel_size_um).round() as u32).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = RenderSettings::default();
        assert_eq!(s.dpi, 300);
        assert_eq!(s.cell_px(), 1200);
        assert_eq!(s.palette, Palette::Jet);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let s: RenderSettings =
            serde_json::from_str(r#"{"dpi": 150, "palette": "viridis", "normalization": "pseudo_log"}"#)
                .unwrap();
        assert_eq!(s.dpi, 150);
        assert_eq!(s.palette, Palette::Viridis);
        assert_eq!(s.normalization, NormKind::PseudoLog);
        assert_eq!(s.scale_bar_um, 500.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = RenderSettings::default();
        s.rows = Some(2);
        s.credit_text = Some("Funded by grant 42".to_string());
        s.save(&path).unwrap();
        assert_eq!(RenderSettings::load(&path).unwrap(), s);
        assert!(matches!(
            RenderSettings::load(&dir.path().join("absent.json")),
            Err(MapError::FileMissing { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_dpi() {
        let s = RenderSettings {
            dpi: 0,
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(MapError::Config(_))));
    }

    #[test]
    fn test_scale_bar_pixels() {
        let s = RenderSettings::default();
        assert_eq!(s.scale_bar_matrix_px(6.0), Some(83));
        assert_eq!(s.scale_bar_matrix_px(1000.0), Some(1));
        assert_eq!(s.scale_bar_matrix_px(0.0), None);
        assert_eq!(s.scale_bar_matrix_px(-2.0), None);
        assert_eq!(s.scale_bar_matrix_px(f64::NAN), None);
        let hidden = RenderSettings {
            show_scale_bar: false,
            ..Default::default()
        };
        assert_eq!(hidden.scale_bar_matrix_px(6.0), None);
    }
}
