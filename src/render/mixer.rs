/// Multi-channel colour mixer: blends up to three element maps, each with
/// its own colour and display maximum, into one RGB image, and draws the
/// matching legend (gradient bar or barycentric triangle).
///
/// Every present channel must have the same shape as the first present
/// channel; absent channels contribute nothing.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::scale_bar_pixels;
use crate::data::matrix::ElementMatrix;
use crate::error::{MapError, Result};
use crate::pipeline::layout::PixelRect;
use crate::render::text::{draw_hbar, draw_text, draw_text_centered, draw_text_right, fill_rect, scale_for_points, text_height, text_width};

pub const MAX_CHANNELS: usize = 3;
/// Added to each channel maximum before dividing.
pub const MIX_EPSILON: f64 = 1e-6;

/// Legend canvas in base units; the triangle vertices live on it.
const LEGEND_W: f64 = 240.0;
const TRIANGLE_H: f64 = 120.0;
const TRIANGLE_VERTICES: [(f64, f64); 3] = [(120.0, 10.0), (178.0, 110.0), (62.0, 110.0)];
const GRADIENT_H_ONE: f64 = 30.0;
const GRADIENT_H_TWO: f64 = 40.0;

/// RGB colour with components in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelColor {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl ChannelColor {
    pub const BLACK: ChannelColor = ChannelColor { r: 0.0, g: 0.0, b: 0.0 };
    pub const RED: ChannelColor = ChannelColor { r: 1.0, g: 0.0, b: 0.0 };
    pub const GREEN: ChannelColor = ChannelColor { r: 0.0, g: 1.0, b: 0.0 };
    pub const BLUE: ChannelColor = ChannelColor { r: 0.0, g: 0.0, b: 1.0 };

    pub fn new(r: f64, g: f64, b: f64) -> Result<Self> {
        if [r, g, b].iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(MapError::config(format!(
                "colour components ({}, {}, {}) must lie in [0, 1]",
                r, g, b
            )));
        }
        Ok(Self { r, g, b })
    }

    /// Red, green and blue, in channel order.
    pub fn defaults() -> [ChannelColor; MAX_CHANNELS] {
        [Self::RED, Self::GREEN, Self::BLUE]
    }

    pub fn to_u8(self) -> [u8; 3] {
        let q = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.r), q(self.g), q(self.b)]
    }

    fn weighted(weights: &[f64], colors: &[ChannelColor]) -> ChannelColor {
        let mut out = ChannelColor::BLACK;
        for (w, c) in weights.iter().zip(colors) {
            out.r += w * c.r;
            out.g += w * c.g;
            out.b += w * c.b;
        }
        out
    }
}

impl fmt::Display for ChannelColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.to_u8();
        write!(f, "#{:02x}{:02x}{:02x}", r, g, b)
    }
}

impl FromStr for ChannelColor {
    type Err = MapError;

    /// `#rrggbb`, `rrggbb` or one of red / green / blue / cyan / magenta /
    /// yellow / white.
    fn from_str(s: &str) -> Result<Self> {
        let named = match s.trim().to_ascii_lowercase().as_str() {
            "red" => Some([255, 0, 0]),
            "green" => Some([0, 255, 0]),
            "blue" => Some([0, 0, 255]),
            "cyan" => Some([0, 255, 255]),
            "magenta" => Some([255, 0, 255]),
            "yellow" => Some([255, 255, 0]),
            "white" => Some([255, 255, 255]),
            _ => None,
        };
        let bytes = match named {
            Some(b) => b,
            None => {
                let hex = s.trim().trim_start_matches('#');
                if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(MapError::config(format!("invalid colour '{}' (expected #rrggbb)", s)));
                }
                let part = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0);
                [part(0), part(2), part(4)]
            }
        };
        Ok(ChannelColor {
            r: bytes[0] as f64 / 255.0,
            g: bytes[1] as f64 / 255.0,
            b: bytes[2] as f64 / 255.0,
        })
    }
}

/// A loaded channel: its map, colour, display maximum and legend label
#[derive(Debug, Clone)]
pub struct ChannelData {
    pub matrix: ElementMatrix,
    pub color: ChannelColor,
    pub max: f64,
    pub label: String,
}

impl ChannelData {
    /// Channel with the data maximum as display maximum and the element
    /// name as label.
    pub fn new(matrix: ElementMatrix, color: ChannelColor) -> Result<Self> {
        let max = matrix.grid.max().ok_or_else(|| {
            MapError::data(format!("{} {} has no values", matrix.sample(), matrix.element()))
        })?;
        let label = matrix.element().to_string();
        Ok(Self {
            matrix,
            color,
            max,
            label,
        })
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = max;
        self
    }

    /// User maximum, optionally capped by the 99th percentile.
    pub fn effective_max(&self, opts: &MixOptions) -> f64 {
        if opts.normalize_p99 {
            match self.matrix.grid.percentile(99.0) {
                Some(p99) => self.max.min(p99),
                None => self.max,
            }
        } else {
            self.max
        }
    }

    /// Per-pixel contribution in [0, 1]; missing pixels give 0.
    pub fn scaled(&self, opts: &MixOptions) -> Vec<f64> {
        let vmax = self.effective_max(opts);
        self.matrix
            .grid
            .values()
            .iter()
            .map(|&v| {
                let s = (v / (vmax + MIX_EPSILON)).clamp(0.0, 1.0);
                if s.is_nan() {
                    0.0
                } else {
                    s
                }
            })
            .collect()
    }

    /// `"{label}: {rounded max}"`
    pub fn legend_text(&self) -> String {
        format!("{}: {}", self.label, self.max.round() as i64)
    }
}

/// One of the three mixer inputs
#[derive(Debug, Clone, Default)]
pub enum ChannelSlot {
    #[default]
    Unloaded,
    Loaded(ChannelData),
}

impl ChannelSlot {
    pub fn loaded(&self) -> Option<&ChannelData> {
        match self {
            ChannelSlot::Loaded(data) => Some(data),
            ChannelSlot::Unloaded => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded().is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixOptions {
    /// Cap every channel maximum at the channel's 99th percentile
    pub normalize_p99: bool,
}

/// Mixed image with float components in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct RgbComposite {
    rows: usize,
    cols: usize,
    pixels: Vec<[f64; 3]>,
}

impl RgbComposite {
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> [f64; 3] {
        self.pixels[row * self.cols + col]
    }

    pub fn to_image(&self) -> RgbImage {
        let mut img = RgbImage::new(self.cols as u32, self.rows as u32);
        for (i, px) in self.pixels.iter().enumerate() {
            let q = |v: f64| (v * 255.0).round() as u8;
            img.put_pixel(
                (i % self.cols) as u32,
                (i / self.cols) as u32,
                Rgb([q(px[0]), q(px[1]), q(px[2])]),
            );
        }
        img
    }
}

/// Blend the loaded channels into one RGB image.
pub fn mix(channels: &[ChannelSlot], opts: &MixOptions) -> Result<RgbComposite> {
    if channels.len() > MAX_CHANNELS {
        return Err(MapError::config(format!(
            "at most {} channels can be mixed, got {}",
            MAX_CHANNELS,
            channels.len()
        )));
    }
    let loaded: Vec<&ChannelData> = channels.iter().filter_map(ChannelSlot::loaded).collect();
    let Some(first) = loaded.first() else {
        return Err(MapError::data("no channel loaded"));
    };
    let shape = first.matrix.shape();
    for ch in &loaded {
        if ch.matrix.shape() != shape {
            return Err(MapError::ShapeMismatch {
                expected: shape,
                found: ch.matrix.shape(),
            });
        }
    }

    let n = shape.0 * shape.1;
    let scaled: Vec<Vec<f64>> = loaded.iter().map(|ch| ch.scaled(opts)).collect();
    let mut pixels = vec![[0.0; 3]; n];
    for (i, px) in pixels.iter_mut().enumerate() {
        if scaled.iter().all(|s| s[i] == 0.0) {
            continue;
        }
        for (ch, s) in loaded.iter().zip(&scaled) {
            px[0] += s[i] * ch.color.r;
            px[1] += s[i] * ch.color.g;
            px[2] += s[i] * ch.color.b;
        }
        for v in px.iter_mut() {
            *v = v.clamp(0.0, 1.0);
        }
        if px.iter().all(|&v| v == 0.0) {
            *px = [0.0; 3];
        }
    }
    log::debug!(
        "Mixed {} channel(s) into a {}x{} image",
        loaded.len(),
        shape.0,
        shape.1
    );
    Ok(RgbComposite {
        rows: shape.0,
        cols: shape.1,
        pixels,
    })
}

/// Barycentric coordinates of `p` against triangle `v`, or `None` for a
/// degenerate triangle. Points inside have all three weights >= 0.
pub fn barycentric(p: (f64, f64), v: [(f64, f64); 3]) -> Option<[f64; 3]> {
    let [(x0, y0), (x1, y1), (x2, y2)] = v;
    let denom = (y1 - y2) * (x0 - x2) + (x2 - x1) * (y0 - y2);
    if denom == 0.0 {
        return None;
    }
    let l1 = ((y1 - y2) * (p.0 - x2) + (x2 - x1) * (p.1 - y2)) / denom;
    let l2 = ((y2 - y0) * (p.0 - x2) + (x0 - x2) * (p.1 - y2)) / denom;
    Some([l1, l2, 1.0 - l1 - l2])
}

/// Legend matching the number of loaded channels
#[derive(Debug, Clone, PartialEq)]
pub enum MixLegend {
    /// Horizontal bar from `from` (left) to `to` (right)
    Gradient {
        from: ChannelColor,
        to: ChannelColor,
        /// One label (right end) or two labels (left and right ends)
        labels: Vec<(String, ChannelColor)>,
    },
    /// Triangle with one channel colour per vertex: apex, bottom right,
    /// bottom left
    Triangle {
        colors: [ChannelColor; 3],
        labels: [String; 3],
    },
}

impl MixLegend {
    /// Legend for the loaded channels; `None` when nothing is loaded.
    pub fn for_channels(channels: &[ChannelSlot]) -> Option<MixLegend> {
        let loaded: Vec<&ChannelData> = channels.iter().filter_map(ChannelSlot::loaded).collect();
        match loaded.as_slice() {
            [a] => Some(MixLegend::Gradient {
                from: ChannelColor::BLACK,
                to: a.color,
                labels: vec![(a.legend_text(), a.color)],
            }),
            [a, b] => Some(MixLegend::Gradient {
                from: a.color,
                to: b.color,
                labels: vec![(a.legend_text(), a.color), (b.legend_text(), b.color)],
            }),
            [a, b, c] => Some(MixLegend::Triangle {
                colors: [a.color, b.color, c.color],
                labels: [a.legend_text(), b.legend_text(), c.legend_text()],
            }),
            _ => None,
        }
    }

    /// Base-unit size of the coloured area.
    fn canvas(&self) -> (f64, f64) {
        match self {
            MixLegend::Gradient { labels, .. } if labels.len() > 1 => (LEGEND_W, GRADIENT_H_TWO),
            MixLegend::Gradient { .. } => (LEGEND_W, GRADIENT_H_ONE),
            MixLegend::Triangle { .. } => (LEGEND_W, TRIANGLE_H),
        }
    }

    /// Colour at base-unit position (x, y); `None` outside the triangle.
    pub fn color_at(&self, x: f64, y: f64) -> Option<ChannelColor> {
        match self {
            MixLegend::Gradient { from, to, .. } => {
                let t = (x / (LEGEND_W - 1.0)).clamp(0.0, 1.0);
                Some(ChannelColor::weighted(&[1.0 - t, t], &[*from, *to]))
            }
            MixLegend::Triangle { colors, .. } => {
                let l = barycentric((x, y), TRIANGLE_VERTICES)?;
                if l.iter().all(|&w| w >= 0.0) {
                    Some(ChannelColor::weighted(&l, colors))
                } else {
                    None
                }
            }
        }
    }

    /// Raster legend on black, `unit` output pixels per base unit.
    pub fn render(&self, unit: u32, text_scale: u32) -> RgbImage {
        let unit = unit.max(1);
        let (cw, ch) = self.canvas();
        let (cw, ch) = ((cw as u32) * unit, (ch as u32) * unit);
        let th = text_height(text_scale);
        let gap = 2 * text_scale;
        let label_widths: Vec<u32> = match self {
            MixLegend::Gradient { labels, .. } => labels.iter().map(|(t, _)| text_width(t, text_scale)).collect(),
            MixLegend::Triangle { labels, .. } => labels.iter().map(|t| text_width(t, text_scale)).collect(),
        };
        let margin = match self {
            MixLegend::Triangle { .. } => label_widths.iter().copied().max().unwrap_or(0) / 2,
            MixLegend::Gradient { .. } => 0,
        };
        let (top_band, bottom_band) = match self {
            MixLegend::Gradient { .. } => (th + gap, 0),
            MixLegend::Triangle { .. } => (th + gap, th + gap),
        };
        let width = cw + 2 * margin;
        let height = top_band + ch + bottom_band;
        let mut img = RgbImage::new(width, height);

        for py in 0..ch {
            for px in 0..cw {
                let (x, y) = (px as f64 / unit as f64, py as f64 / unit as f64);
                if let Some(c) = self.color_at(x, y) {
                    img.put_pixel(margin + px, top_band + py, Rgb(c.to_u8()));
                }
            }
        }

        match self {
            MixLegend::Gradient { labels, .. } => {
                if let [(text, color)] = labels.as_slice() {
                    draw_text_right(&mut img, text, width as i64, 0, Rgb(color.to_u8()), text_scale);
                } else if let [(left, lc), (right, rc)] = labels.as_slice() {
                    draw_text(&mut img, left, 0, 0, Rgb(lc.to_u8()), text_scale);
                    draw_text_right(&mut img, right, width as i64, 0, Rgb(rc.to_u8()), text_scale);
                }
            }
            MixLegend::Triangle { colors, labels } => {
                let at = |v: (f64, f64)| ((margin as f64 + v.0 * unit as f64) as i64, (top_band as f64 + v.1 * unit as f64) as i64);
                let (ax, ay) = at(TRIANGLE_VERTICES[0]);
                draw_text_centered(&mut img, &labels[0], ax, ay - (th + gap) as i64, Rgb(colors[0].to_u8()), text_scale);
                let (rx, ry) = at(TRIANGLE_VERTICES[1]);
                draw_text(&mut img, &labels[1], rx, ry + gap as i64, Rgb(colors[1].to_u8()), text_scale);
                let (lx, ly) = at(TRIANGLE_VERTICES[2]);
                draw_text_right(&mut img, &labels[2], lx, ly + gap as i64, Rgb(colors[2].to_u8()), text_scale);
            }
        }
        img
    }
}

/// Options for exporting a mixed image
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayExport {
    /// Longest output side of the image part; the map is upscaled by a
    /// whole factor towards it
    pub target_px: u32,
    pub pixel_size_um: f64,
    pub scale_bar_um: f64,
    pub show_scale_bar: bool,
    pub include_legend: bool,
    pub dpi: u32,
    pub font_pt: f32,
}

impl Default for OverlayExport {
    fn default() -> Self {
        Self {
            target_px: 1200,
            pixel_size_um: 6.0,
            scale_bar_um: 500.0,
            show_scale_bar: true,
            include_legend: true,
            dpi: 300,
            font_pt: 9.0,
        }
    }
}

/// Stack the mixed image, a scale-bar strip and (optionally) the legend on
/// a black canvas.
pub fn export_overlay(composite: &RgbComposite, legend: Option<&MixLegend>, opts: &OverlayExport) -> RgbImage {
    let (rows, cols) = composite.shape();
    let longest = rows.max(cols).max(1) as u32;
    let up = (opts.target_px / longest).max(1);
    let (iw, ih) = (cols as u32 * up, rows as u32 * up);
    let ts = scale_for_points(opts.font_pt, opts.dpi);
    let strip_h = ((ih as f64 * 0.08).round() as u32).max(text_height(ts) * 5);

    let legend_img = match legend {
        Some(l) if opts.include_legend => {
            let unit = (iw / (2 * LEGEND_W as u32)).max(1);
            Some(l.render(unit, ts))
        }
        _ => None,
    };
    let legend_h = legend_img.as_ref().map_or(0, |l| l.height() + strip_h / 4);
    let width = iw.max(legend_img.as_ref().map_or(0, |l| l.width()));
    let height = ih + strip_h + legend_h;
    let mut out = RgbImage::new(width, height);

    let x_off = (width - iw) / 2;
    for r in 0..rows {
        for c in 0..cols {
            let [pr, pg, pb] = composite.get(r, c);
            let q = |v: f64| (v * 255.0).round() as u8;
            fill_rect(
                &mut out,
                PixelRect {
                    x: x_off + c as u32 * up,
                    y: r as u32 * up,
                    w: up,
                    h: up,
                },
                Rgb([q(pr), q(pg), q(pb)]),
            );
        }
    }

    if opts.show_scale_bar {
        if let Some(px) = scale_bar_pixels(opts.scale_bar_um, opts.pixel_size_um) {
            let length = px as i64 * up as i64;
            let cx = (width / 2) as i64;
            let x0 = (cx - length / 2).max(0);
            let x1 = (cx + length / 2).min(width as i64 - 1);
            if x1 - x0 + 1 < length {
                log::warn!("Scale bar of {} px clipped to the image width ({} px)", length, width);
            }
            let bar_y = (ih as f64 + strip_h as f64 * (1.0 - 0.68)).round() as i64;
            let white = Rgb([255, 255, 255]);
            draw_hbar(&mut out, x0, x1, bar_y, (3 * opts.dpi / 150).max(2), white);
            let label_y = (ih as f64 + strip_h as f64 * (1.0 - 0.22)).round() as i64 - text_height(ts) as i64;
            draw_text_centered(&mut out, &format!("{:.0} µm", opts.scale_bar_um), cx, label_y, white, ts);
        }
    }

    if let Some(l) = legend_img {
        let x = (width - l.width()) / 2;
        let y = ih + strip_h + strip_h / 4;
        image::imageops::replace(&mut out, &l, x as i64, y as i64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{Grid, MatrixMeta, UnitKind};
    use approx::assert_relative_eq;

    fn channel(element: &str, rows: usize, cols: usize, values: Vec<f64>, color: ChannelColor) -> ChannelSlot {
        let m = ElementMatrix::new(
            Grid::new(rows, cols, values).unwrap(),
            MatrixMeta::new("S1", element, UnitKind::Ppm),
        );
        ChannelSlot::Loaded(ChannelData::new(m, color).unwrap())
    }

    #[test]
    fn test_single_red_channel_is_identity() {
        let values = vec![0.0, 12.5, 50.0, 99.0, 100.0, f64::NAN];
        let slots = [
            channel("Fe56", 2, 3, values.clone(), ChannelColor::RED),
            ChannelSlot::Unloaded,
            ChannelSlot::Unloaded,
        ];
        let out = mix(&slots, &MixOptions::default()).unwrap();
        for (i, v) in values.iter().enumerate() {
            let px = out.get(i / 3, i % 3);
            let expected = if v.is_nan() { 0.0 } else { (v / (100.0 + MIX_EPSILON)).clamp(0.0, 1.0) };
            assert_eq!(px[0], expected);
            assert_eq!(px[1], 0.0);
            assert_eq!(px[2], 0.0);
        }
    }

    #[test]
    fn test_black_mask() {
        let slots = [
            channel("Fe56", 1, 3, vec![0.0, f64::NAN, 5.0], ChannelColor::RED),
            channel("Cu63", 1, 3, vec![-2.0, 0.0, 0.0], ChannelColor::GREEN),
        ];
        let out = mix(&slots, &MixOptions::default()).unwrap();
        assert_eq!(out.get(0, 0), [0.0, 0.0, 0.0]);
        assert_eq!(out.get(0, 1), [0.0, 0.0, 0.0]);
        assert!(out.get(0, 2)[0] > 0.99);
        let img = out.to_image();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let slots = [
            ChannelSlot::Unloaded,
            channel("Fe56", 2, 2, vec![1.0; 4], ChannelColor::RED),
            channel("Cu63", 1, 4, vec![1.0; 4], ChannelColor::GREEN),
        ];
        match mix(&slots, &MixOptions::default()) {
            Err(MapError::ShapeMismatch { expected, found }) => {
                assert_eq!(expected, (2, 2));
                assert_eq!(found, (1, 4));
            }
            other => panic!("expected shape mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_no_channels_and_too_many() {
        let none = [ChannelSlot::Unloaded, ChannelSlot::Unloaded];
        assert!(matches!(mix(&none, &MixOptions::default()), Err(MapError::Data(_))));
        let four = vec![ChannelSlot::Unloaded; 4];
        assert!(matches!(mix(&four, &MixOptions::default()), Err(MapError::Config(_))));
    }

    #[test]
    fn test_normalize_caps_at_p99() {
        let mut values: Vec<f64> = (0..100).map(|v| v as f64).collect();
        values.push(10_000.0);
        let m = ElementMatrix::new(
            Grid::new(1, 101, values).unwrap(),
            MatrixMeta::new("S", "Zn66", UnitKind::Cps),
        );
        let data = ChannelData::new(m, ChannelColor::BLUE).unwrap();
        assert_eq!(data.max, 10_000.0);
        let capped = data.effective_max(&MixOptions { normalize_p99: true });
        assert_relative_eq!(capped, 99.0);
        assert_eq!(data.effective_max(&MixOptions::default()), 10_000.0);
        assert_eq!(data.with_max(50.0).effective_max(&MixOptions { normalize_p99: true }), 50.0);
    }

    #[test]
    fn test_additive_blend_clips() {
        let slots = [
            channel("A1", 1, 1, vec![10.0], ChannelColor::RED),
            channel("B2", 1, 1, vec![10.0], "#ff8000".parse().unwrap()),
        ];
        let out = mix(&slots, &MixOptions::default()).unwrap();
        let px = out.get(0, 0);
        assert_eq!(px[0], 1.0);
        assert!(px[1] > 0.49 && px[1] < 0.51);
        assert_eq!(px[2], 0.0);
    }

    #[test]
    fn test_barycentric_vertices_and_centroid() {
        let colors = [ChannelColor::RED, ChannelColor::GREEN, ChannelColor::BLUE];
        let legend = MixLegend::Triangle {
            colors,
            labels: ["a".into(), "b".into(), "c".into()],
        };
        for (i, &(x, y)) in TRIANGLE_VERTICES.iter().enumerate() {
            let c = legend.color_at(x, y).unwrap();
            assert_relative_eq!(c.r, colors[i].r, epsilon = 1e-12);
            assert_relative_eq!(c.g, colors[i].g, epsilon = 1e-12);
            assert_relative_eq!(c.b, colors[i].b, epsilon = 1e-12);
        }
        let cx = TRIANGLE_VERTICES.iter().map(|v| v.0).sum::<f64>() / 3.0;
        let cy = TRIANGLE_VERTICES.iter().map(|v| v.1).sum::<f64>() / 3.0;
        let c = legend.color_at(cx, cy).unwrap();
        assert_relative_eq!(c.r, 1.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(c.g, 1.0 / 3.0, epsilon = 1e-9);
        assert!(legend.color_at(0.0, 0.0).is_none());

        let l = barycentric((150.0, 80.0), TRIANGLE_VERTICES).unwrap();
        assert_relative_eq!(l.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(barycentric((0.0, 0.0), [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)]).is_none());
    }

    #[test]
    fn test_legend_kind_follows_channel_count() {
        let one = [channel("Fe56", 1, 1, vec![4.4], ChannelColor::GREEN)];
        match MixLegend::for_channels(&one).unwrap() {
            MixLegend::Gradient { from, to, labels } => {
                assert_eq!(from, ChannelColor::BLACK);
                assert_eq!(to, ChannelColor::GREEN);
                assert_eq!(labels[0].0, "Fe56: 4");
            }
            other => panic!("unexpected legend {:?}", other),
        }
        let two = [
            channel("Fe56", 1, 1, vec![1.0], ChannelColor::RED),
            ChannelSlot::Unloaded,
            channel("Cu63", 1, 1, vec![1.0], ChannelColor::BLUE),
        ];
        let legend = MixLegend::for_channels(&two).unwrap();
        let left = legend.color_at(0.0, 0.0).unwrap();
        let right = legend.color_at(LEGEND_W - 1.0, 0.0).unwrap();
        assert_eq!(left, ChannelColor::RED);
        assert_eq!(right, ChannelColor::BLUE);
        let three = [
            channel("Fe56", 1, 1, vec![1.0], ChannelColor::RED),
            channel("Cu63", 1, 1, vec![1.0], ChannelColor::GREEN),
            channel("Zn66", 1, 1, vec![1.0], ChannelColor::BLUE),
        ];
        assert!(matches!(MixLegend::for_channels(&three), Some(MixLegend::Triangle { .. })));
        assert!(MixLegend::for_channels(&[ChannelSlot::Unloaded]).is_none());
    }

    #[test]
    fn test_color_parsing() {
        let c: ChannelColor = "#00ff80".parse().unwrap();
        assert_eq!(c.to_u8(), [0, 255, 128]);
        assert_eq!(c.to_string(), "#00ff80");
        assert_eq!("magenta".parse::<ChannelColor>().unwrap().to_u8(), [255, 0, 255]);
        assert!("#12345".parse::<ChannelColor>().is_err());
        assert!("#gg0000".parse::<ChannelColor>().is_err());
        assert!(ChannelColor::new(1.2, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_export_stacks_strip_and_legend() {
        let slots = [
            channel("Fe56", 10, 20, vec![5.0; 200], ChannelColor::RED),
            channel("Cu63", 10, 20, vec![5.0; 200], ChannelColor::GREEN),
            channel("Zn66", 10, 20, vec![0.0; 200], ChannelColor::BLUE),
        ];
        let out = mix(&slots, &MixOptions::default()).unwrap();
        let legend = MixLegend::for_channels(&slots);
        let opts = OverlayExport {
            target_px: 200,
            dpi: 72,
            ..Default::default()
        };
        let img = export_overlay(&out, legend.as_ref(), &opts);
        assert!(img.height() > 100);
        assert!(img.width() >= 200);
        // Top-left map pixel is red + green.
        let x_off = (img.width() - 200) / 2;
        assert_eq!(img.get_pixel(x_off, 0).0, [255, 255, 0]);

        let bare = export_overlay(
            &out,
            legend.as_ref(),
            &OverlayExport {
                include_legend: false,
                show_scale_bar: false,
                ..opts
            },
        );
        assert!(bare.height() < img.height());
        assert!(bare.pixels().skip(200 * 100).all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_oversized_scale_bar_is_clipped() {
        let slots = [
            channel("Fe56", 10, 20, vec![5.0; 200], ChannelColor::RED),
            ChannelSlot::Unloaded,
            ChannelSlot::Unloaded,
        ];
        let out = mix(&slots, &MixOptions::default()).unwrap();
        let opts = OverlayExport {
            pixel_size_um: 1e-6,
            include_legend: false,
            dpi: 72,
            ..Default::default()
        };
        let img = export_overlay(&out, None, &opts);
        assert_eq!(img.width(), 1200);
        // the bar spans the whole strip
        let lit_rows = (600..img.height())
            .filter(|&y| (0..img.width()).all(|x| img.get_pixel(x, y).0 == [255, 255, 255]))
            .count();
        assert!(lit_rows >= 2);
    }
}
