/// Per-sample intensity histograms exported as PNG.
///
/// Values are binned over `[0, p99]`; pixels above the 99th percentile and
/// negative pixels fall outside the range and are not counted.

use image::{Rgb, RgbImage};
use std::path::Path;

use crate::data::matrix::{percentile_of_sorted, ElementMatrix, Grid};
use crate::error::{MapError, Result};
use crate::pipeline::layout::PixelRect;
use crate::pipeline::normalize::{format_tick, nice_step};
use crate::render::text::{draw_line, draw_text, draw_text_centered, draw_text_right, fill_rect, text_height};

pub const HISTOGRAM_BINS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub lo: f64,
    pub hi: f64,
    pub counts: Vec<u64>,
}

impl Histogram {
    /// `bins` equal-width bins over `[0, p99]` of the populated values.
    pub fn from_grid(grid: &Grid, bins: usize) -> Option<Self> {
        let sorted = grid.sorted_valid();
        let p99 = percentile_of_sorted(&sorted, 99.0)?;
        let bins = bins.max(1);
        let lo = 0.0;
        let hi = if p99 > lo { p99 } else { lo + 1.0 };
        let width = (hi - lo) / bins as f64;
        let mut counts = vec![0u64; bins];
        for v in sorted {
            if v < lo || v > hi {
                continue;
            }
            let i = (((v - lo) / width) as usize).min(bins - 1);
            counts[i] += 1;
        }
        Some(Self { lo, hi, counts })
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Bar chart with axes and a title, on white.
    pub fn render(&self, title: &str, width: u32, height: u32) -> RgbImage {
        let mut img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        let ts = (height / 150).max(1);
        let char_h = text_height(ts);
        let margin_left = 10 * 4 * ts;
        let margin_right = 4 * ts;
        let margin_top = char_h * 3;
        let margin_bottom = char_h * 4;
        let plot_w = width.saturating_sub(margin_left + margin_right).max(1);
        let plot_h = height.saturating_sub(margin_top + margin_bottom).max(1);

        let axis = Rgb([100, 100, 110]);
        let bar = Rgb([70, 110, 170]);
        let ink = Rgb([60, 60, 70]);

        draw_text_centered(&mut img, title, (width / 2) as i64, char_h as i64, ink, ts);

        let peak = self.counts.iter().copied().max().unwrap_or(0).max(1);
        let n = self.counts.len() as u32;
        for (i, &c) in self.counts.iter().enumerate() {
            let x0 = margin_left + plot_w * i as u32 / n;
            let x1 = margin_left + plot_w * (i as u32 + 1) / n;
            let h = (plot_h as f64 * c as f64 / peak as f64).round() as u32;
            fill_rect(
                &mut img,
                PixelRect {
                    x: x0,
                    y: margin_top + plot_h - h,
                    w: x1.saturating_sub(x0).saturating_sub(1).max(1),
                    h,
                },
                bar,
            );
        }

        let (left, top) = (margin_left as i64, margin_top as i64);
        let (right, bottom) = (left + plot_w as i64, top + plot_h as i64);
        draw_line(&mut img, left, bottom, right, bottom, axis);
        draw_line(&mut img, left, top, left, bottom, axis);

        // x ticks
        let step = nice_step((self.hi - self.lo) / 5.0);
        let mut tick = (self.lo / step).ceil() * step;
        while tick <= self.hi + step * 1e-9 {
            let x = left + ((tick - self.lo) / (self.hi - self.lo) * plot_w as f64).round() as i64;
            draw_line(&mut img, x, bottom, x, bottom + ts as i64 * 2, axis);
            draw_text_centered(&mut img, &format_tick(tick), x, bottom + ts as i64 * 4, ink, ts);
            tick += step;
        }
        // y ticks
        let ystep = nice_step(peak as f64 / 4.0).max(1.0);
        let mut count = 0.0;
        while count <= peak as f64 {
            let y = bottom - (count / peak as f64 * plot_h as f64).round() as i64;
            draw_line(&mut img, left - ts as i64 * 2, y, left, y, axis);
            draw_text_right(&mut img, &format_tick(count), left - ts as i64 * 3, y - char_h as i64 / 2, ink, ts);
            count += ystep;
        }

        draw_text(&mut img, "Intensity", right - 9 * 4 * ts as i64, bottom + char_h as i64 * 2 + ts as i64 * 4, ink, ts);
        img
    }
}

/// Write `{sample}_histogram.png` for one matrix into `dir`.
pub fn save_histogram(matrix: &ElementMatrix, dir: &Path) -> Result<()> {
    let hist = Histogram::from_grid(&matrix.grid, HISTOGRAM_BINS)
        .ok_or_else(|| MapError::data(format!("{} has no values to histogram", matrix.sample())))?;
    std::fs::create_dir_all(dir)?;
    let title = format!("{} {} ({})", matrix.sample(), matrix.element(), matrix.unit().axis_label());
    let path = dir.join(format!("{}_histogram.png", matrix.sample()));
    hist.render(&title, 900, 600).save(&path)?;
    log::debug!("Saved histogram {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{MatrixMeta, UnitKind};

    #[test]
    fn test_bins_cover_zero_to_p99() {
        let values: Vec<f64> = (0..=100).map(|v| v as f64).collect();
        let grid = Grid::new(1, 101, values).unwrap();
        let h = Histogram::from_grid(&grid, HISTOGRAM_BINS).unwrap();
        assert_eq!(h.lo, 0.0);
        assert_eq!(h.hi, 99.0);
        assert_eq!(h.counts.len(), 50);
        // 100 is above p99 and is not counted.
        assert_eq!(h.total(), 100);
        assert_eq!(h.counts[49], 2);
    }

    #[test]
    fn test_negative_and_missing_ignored() {
        let grid = Grid::new(1, 4, vec![-5.0, f64::NAN, 0.0, 0.0]).unwrap();
        let h = Histogram::from_grid(&grid, 10).unwrap();
        assert_eq!(h.hi, 1.0);
        assert_eq!(h.total(), 2);
        assert!(Histogram::from_grid(&Grid::filled(2, 2, f64::NAN), 10).is_none());
    }

    #[test]
    fn test_save_histogram_png() {
        let dir = tempfile::tempdir().unwrap();
        let m = ElementMatrix::new(
            Grid::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            MatrixMeta::new("Liver", "Fe56", UnitKind::Ppm),
        );
        let out = dir.path().join("Histograms");
        save_histogram(&m, &out).unwrap();
        let written = image::open(out.join("Liver_histogram.png")).unwrap();
        assert_eq!((written.width(), written.height()), (900, 600));
    }
}
