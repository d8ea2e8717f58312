/// Composite renderer: paints several element maps into one grid image with
/// a shared colour bar and scale bar.
///
/// Output is built as two layers of identical size:
/// - `base`: the heatmaps and the colour gradient (expensive to paint)
/// - `overlay`: all text and line annotations on a transparent RGBA layer
///
/// Labels can be changed and the overlay redrawn without touching `base`.

use image::{imageops, DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
use std::path::Path;

use crate::config::RenderSettings;
use crate::data::matrix::{ElementMatrix, UnitKind};
use crate::data::samples::PixelSizes;
use crate::error::{MapError, Result};
use crate::pipeline::layout::{CompositeLayout, PixelRect};
use crate::pipeline::normalize::{format_tick, DisplayScale};
use crate::render::palette::Palette;
use crate::render::text::{
    draw_hbar, draw_line, draw_text, draw_text_centered, draw_text_right, fill_rect, scale_for_points,
    text_height, text_width,
};

/// Colour-bar share of the legend cell; the rest holds the scale bar.
const COLORBAR_SHARE: f64 = 3.5 / 4.5;
const TICK_TARGET: usize = 5;
const CREDIT_GREY: [u8; 3] = [0x66, 0x66, 0x66];

/// One painted map and where it landed
#[derive(Debug, Clone)]
pub struct PaintedCell {
    pub sample: String,
    /// Text drawn above the map (sample name or alias)
    pub label: String,
    /// Matrix shape (rows, cols)
    pub shape: (usize, usize),
    pub cell: PixelRect,
    pub image: PixelRect,
    pub pixel_size_um: f64,
}

impl PaintedCell {
    /// Output pixels per matrix pixel.
    pub fn display_ratio(&self) -> f64 {
        if self.shape.1 == 0 {
            0.0
        } else {
            self.image.w as f64 / self.shape.1 as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompositeRender {
    pub base: RgbImage,
    pub overlay: RgbaImage,
    cells: Vec<PaintedCell>,
    layout: CompositeLayout,
    legend: PixelRect,
    color_bar: PixelRect,
    scale_bar_area: PixelRect,
    scale: DisplayScale,
    palette: Palette,
    element: String,
    unit: UnitKind,
    custom_pixel_sizes: bool,
    dpi: u32,
}

/// Render `matrices` (one element, one unit) into a composite.
///
/// Every map shares `scale`. Cells beyond the number of maps stay in the
/// background colour. Sample labels come from the matrix metadata and can
/// be replaced later with [`CompositeRender::relabel`].
pub fn render_composite(
    matrices: &[ElementMatrix],
    scale: &DisplayScale,
    layout: &CompositeLayout,
    pixel_sizes: &PixelSizes,
    settings: &RenderSettings,
) -> Result<CompositeRender> {
    if matrices.is_empty() {
        return Err(MapError::data("nothing to lay out: no matrices"));
    }
    if layout.count() != matrices.len() {
        return Err(MapError::config(format!(
            "layout holds {} maps but {} were given",
            layout.count(),
            matrices.len()
        )));
    }
    settings.validate()?;

    let first = &matrices[0];
    if let Some(m) = matrices
        .iter()
        .find(|m| m.element() != first.element() || m.unit() != first.unit())
    {
        return Err(MapError::data(format!(
            "composite mixes {} {} with {} {}",
            first.element(),
            first.unit(),
            m.element(),
            m.unit()
        )));
    }

    let cell_px = settings.cell_px();
    let (fw, fh) = layout.figure_units();
    let width = (fw * cell_px as f64).round() as u32;
    let height = (fh * cell_px as f64).round() as u32;
    let palette = settings.palette;

    let mut base = RgbImage::from_pixel(width, height, Rgb(palette.masked()));
    let pad = (cell_px / 40).max(2);
    // Label room is reserved even when labels are hidden so that toggling
    // them never moves the maps.
    let label_pt = settings.sample_label_pt.unwrap_or(12.0);
    let top_margin = text_height(scale_for_points(label_pt, settings.dpi)) + 2 * pad;
    let bottom_margin = if pixel_sizes.is_custom() {
        text_height(scale_for_points(settings.scale_bar_pt, settings.dpi)) + 2 * pad
    } else {
        pad
    };

    let mut cells = Vec::with_capacity(matrices.len());
    for (i, m) in matrices.iter().enumerate() {
        let cell = layout.cell_rect(i).to_pixels(width, height);
        let inner = PixelRect {
            x: cell.x + pad,
            y: cell.y + top_margin,
            w: cell.w.saturating_sub(2 * pad),
            h: cell.h.saturating_sub(top_margin + bottom_margin),
        };
        let (rows, cols) = m.shape();
        let image = inner.fit_aspect(cols, rows);
        paint_matrix(&mut base, m, image, scale, palette);
        cells.push(PaintedCell {
            sample: m.sample().to_string(),
            label: m.sample().to_string(),
            shape: (rows, cols),
            cell,
            image,
            pixel_size_um: pixel_sizes.for_sample(m.sample()),
        });
    }

    let legend = layout.legend_rect().to_pixels(width, height);
    let split = (legend.h as f64 * COLORBAR_SHARE).round() as u32;
    let color_area = PixelRect { h: split, ..legend };
    let scale_bar_area = PixelRect {
        y: legend.y + split,
        h: legend.h - split,
        ..legend
    };
    let color_bar = color_bar_rect(color_area, settings);
    paint_gradient(&mut base, color_bar, palette);

    log::debug!(
        "Painted {} maps of {} {} on a {}x{} canvas ({} rows x {} cols)",
        cells.len(),
        first.element(),
        first.unit(),
        width,
        height,
        layout.rows(),
        layout.cols()
    );

    let mut render = CompositeRender {
        base,
        overlay: RgbaImage::new(width, height),
        cells,
        layout: *layout,
        legend,
        color_bar,
        scale_bar_area,
        scale: *scale,
        palette,
        element: first.element().to_string(),
        unit: first.unit(),
        custom_pixel_sizes: pixel_sizes.is_custom(),
        dpi: settings.dpi,
    };
    render.redraw_overlay(settings);
    Ok(render)
}

impl CompositeRender {
    pub fn cells(&self) -> &[PaintedCell] {
        &self.cells
    }

    pub fn painted_cells(&self) -> usize {
        self.cells.len()
    }

    /// Grid slots painted as background.
    pub fn empty_cells(&self) -> usize {
        self.layout.empty_cells()
    }

    pub fn layout(&self) -> &CompositeLayout {
        &self.layout
    }

    pub fn legend_rect(&self) -> PixelRect {
        self.legend
    }

    pub fn color_bar_rect(&self) -> PixelRect {
        self.color_bar
    }

    /// Sample whose pixel size the scale bar reflects.
    pub fn reference_cell(&self) -> &PaintedCell {
        &self.cells[0]
    }

    /// Replace the per-cell labels (e.g. with aliases) and redraw the overlay.
    pub fn relabel(&mut self, labels: Vec<String>, settings: &RenderSettings) -> Result<()> {
        if labels.len() != self.cells.len() {
            return Err(MapError::config(format!(
                "{} labels for {} cells",
                labels.len(),
                self.cells.len()
            )));
        }
        for (cell, label) in self.cells.iter_mut().zip(labels) {
            cell.label = label;
        }
        self.redraw_overlay(settings);
        Ok(())
    }

    /// Repaint the annotation layer from scratch.
    ///
    /// Only annotation settings are read; geometry, palette and resolution
    /// stay as they were when the base layer was painted.
    pub fn redraw_overlay(&mut self, settings: &RenderSettings) {
        let (w, h) = self.base.dimensions();
        let mut overlay = RgbaImage::new(w, h);
        let text = rgba(self.palette.contrast_text());
        let dpi = self.dpi;
        let pad = (self.legend.w / 20).max(2);

        if let Some(pt) = settings.sample_label_pt {
            let ts = scale_for_points(pt, dpi);
            for cell in &self.cells {
                let y = cell.image.y as i64 - pad as i64 - text_height(ts) as i64;
                draw_text_centered(&mut overlay, &cell.label, cell.image.center_x() as i64, y, text, ts);
            }
        }

        if self.custom_pixel_sizes {
            let ts = scale_for_points(settings.scale_bar_pt, dpi);
            for cell in &self.cells {
                let caption = format!("{} µm/px", format_tick(cell.pixel_size_um));
                let y = (cell.image.y + cell.image.h + pad) as i64;
                draw_text_centered(&mut overlay, &caption, cell.image.center_x() as i64, y, text, ts);
            }
        }

        let cb_ts = scale_for_points(settings.color_bar_pt, dpi);
        annotate_color_bar(
            &mut overlay,
            self.color_bar,
            &self.scale,
            self.unit.axis_label(),
            text,
            cb_ts,
        );

        self.draw_scale_bar(&mut overlay, settings, text);

        if let Some(pt) = settings.element_label_pt {
            let ts = scale_for_points(pt.clamp(6.0, 72.0), dpi);
            let margin = (50 * dpi / 300).max(4) as i64;
            let label = format!("{} ({})", self.element, self.unit.axis_label());
            let y = h as i64 - margin - text_height(ts) as i64;
            draw_text(&mut overlay, &label, margin, y, text, ts);
        }

        if let Some(credit) = settings.credit_text.as_deref().filter(|c| !c.trim().is_empty()) {
            let ts = scale_for_points(settings.credit_pt.clamp(6.0, 48.0), dpi);
            let margin = (12 * dpi / 150).max(10) as i64;
            let y = h as i64 - margin - text_height(ts) as i64;
            draw_text_right(&mut overlay, credit, w as i64 - margin, y, rgba(CREDIT_GREY), ts);
        }

        self.overlay = overlay;
    }

    fn draw_scale_bar(&self, overlay: &mut RgbaImage, settings: &RenderSettings, color: Rgba<u8>) {
        let reference = self.reference_cell();
        let Some(matrix_px) = settings.scale_bar_matrix_px(reference.pixel_size_um) else {
            return;
        };
        let length = ((matrix_px as f64 * reference.display_ratio()).round() as i64).max(1);
        let area = self.scale_bar_area;
        let (cx, cy) = (area.center_x() as i64, (area.y + area.h / 3) as i64);
        let x0 = (cx - length / 2).max(0);
        let x1 = (cx + length / 2).min(overlay.width() as i64 - 1);
        if x1 - x0 + 1 < length {
            log::warn!(
                "Scale bar of {} px clipped to the image width ({} px)",
                length,
                x1 - x0 + 1
            );
        }
        let thickness = (3 * self.dpi / 150).max(2);
        draw_hbar(overlay, x0, x1, cy, thickness, color);

        let ts = scale_for_points(settings.scale_bar_pt, self.dpi);
        let mut y = cy + thickness as i64 + ts as i64 * 2;
        let label = format!("{:.0} µm", settings.scale_bar_um);
        draw_text_centered(overlay, &label, cx, y, color, ts);
        if self.custom_pixel_sizes {
            y += text_height(ts) as i64 + ts as i64 * 2;
            draw_text_centered(overlay, &reference.label, cx, y, color, ts);
        }
    }

    /// Base with the overlay alpha-composited on top.
    pub fn flatten(&self) -> RgbImage {
        let mut out = DynamicImage::ImageRgb8(self.base.clone()).to_rgba8();
        imageops::overlay(&mut out, &self.overlay, 0, 0);
        DynamicImage::ImageRgba8(out).to_rgb8()
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        self.flatten().save(path)?;
        log::info!("Saved composite {}", path.display());
        Ok(())
    }
}

fn rgba(c: [u8; 3]) -> Rgba<u8> {
    Rgba([c[0], c[1], c[2], 255])
}

/// Nearest-neighbour paint of one matrix into `target`.
fn paint_matrix(
    img: &mut RgbImage,
    matrix: &ElementMatrix,
    target: PixelRect,
    scale: &DisplayScale,
    palette: Palette,
) {
    let (rows, cols) = matrix.shape();
    if rows == 0 || cols == 0 || target.w == 0 || target.h == 0 {
        return;
    }
    let masked = Rgb(palette.masked());
    for dy in 0..target.h {
        let r = ((dy as usize * rows) / target.h as usize).min(rows - 1);
        for dx in 0..target.w {
            let c = ((dx as usize * cols) / target.w as usize).min(cols - 1);
            let px = match scale.forward(matrix.grid.get(r, c)) {
                Some(t) => Rgb(palette.color(t)),
                None => masked,
            };
            let (x, y) = (target.x + dx, target.y + dy);
            if x < img.width() && y < img.height() {
                img.put_pixel(x, y, px);
            }
        }
    }
}

/// Gradient bar inside the colour-bar part of the legend.
fn color_bar_rect(area: PixelRect, settings: &RenderSettings) -> PixelRect {
    let ts = scale_for_points(settings.color_bar_pt, settings.dpi);
    let pad = (area.h / 20).max(2);
    let top = area.y + pad + text_height(ts) + 2 * pad;
    let bottom = (area.y + area.h).saturating_sub(pad + text_height(ts));
    PixelRect {
        x: area.x + area.w / 10,
        y: top,
        w: (area.w / 4).max(1),
        h: bottom.saturating_sub(top).max(1),
    }
}

/// Vertical gradient, palette maximum at the top.
fn paint_gradient(img: &mut RgbImage, bar: PixelRect, palette: Palette) {
    let span = bar.h.saturating_sub(1).max(1) as f64;
    for dy in 0..bar.h {
        let t = 1.0 - dy as f64 / span;
        fill_rect(
            img,
            PixelRect {
                y: bar.y + dy,
                h: 1,
                ..bar
            },
            Rgb(palette.color(t)),
        );
    }
}

/// Tick marks, tick labels and the unit label next to a gradient bar.
fn annotate_color_bar<I: image::GenericImage>(
    img: &mut I,
    bar: PixelRect,
    scale: &DisplayScale,
    unit_label: &str,
    color: I::Pixel,
    text_scale: u32,
) {
    let tick_len = (bar.w / 4).max(2) as i64;
    let right = (bar.x + bar.w) as i64;
    let span = bar.h.saturating_sub(1) as f64;
    for tick in scale.ticks(TICK_TARGET) {
        let y = bar.y as i64 + ((1.0 - tick.position) * span).round() as i64;
        draw_line(img, right, y, right + tick_len, y, color);
        let label_y = y - text_height(text_scale) as i64 / 2;
        draw_text(img, &format_tick(tick.value), right + tick_len + text_scale as i64 * 2, label_y, color, text_scale);
    }
    let unit_y = bar.y as i64 - text_height(text_scale) as i64 - text_scale as i64 * 3;
    draw_text(img, unit_label, bar.x as i64, unit_y, color, text_scale);
}

/// Stand-alone colour bar image for one element.
pub fn render_colorbar(scale: &DisplayScale, unit: UnitKind, settings: &RenderSettings) -> Result<RgbImage> {
    settings.validate()?;
    let height = settings.cell_px();
    let ts = scale_for_points(settings.color_bar_pt, settings.dpi);
    let widest = scale
        .ticks(TICK_TARGET)
        .iter()
        .map(|t| text_width(&format_tick(t.value), ts))
        .chain([text_width(unit.axis_label(), ts)])
        .max()
        .unwrap_or(0);
    let bar_w = (height / 12).max(4);
    let width = bar_w * 3 + widest + 8 * ts;

    let palette = settings.palette;
    let mut img = RgbImage::from_pixel(width, height, Rgb(palette.masked()));
    let area = PixelRect {
        x: 0,
        y: 0,
        w: bar_w * 4,
        h: height,
    };
    let bar = color_bar_rect(area, settings);
    paint_gradient(&mut img, bar, palette);
    annotate_color_bar(&mut img, bar, scale, unit.axis_label(), Rgb(palette.contrast_text()), ts);
    Ok(img)
}
