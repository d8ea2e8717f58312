/// Viewing session state, independent of any front end
///
/// Holds what a viewer shows: the loaded maps with their shared display
/// scale and grid layout, the three overlay channels with their colours,
/// and a z-stack of slices. Front ends read and write these fields and call
/// the render functions; nothing here knows about widgets.

use image::RgbImage;
use std::ops::Range;
use std::path::Path;

use crate::config::RenderSettings;
use crate::data::loader::{load_element_matrix, LoadOptions};
use crate::data::matrix::{ElementMatrix, Grid};
use crate::data::samples::{PixelSizes, SampleAliases};
use crate::error::{MapError, Result};
use crate::pipeline::batch::display_scale_for;
use crate::pipeline::expression::MapExpression;
use crate::pipeline::layout::CompositeLayout;
use crate::pipeline::map_ops::{crop, ratio_map, RatioMap, ZStack};
use crate::pipeline::normalize::{DisplayScale, NormKind};
use crate::render::composite::{render_composite, CompositeRender};
use crate::render::mixer::{
    export_overlay, mix, ChannelColor, ChannelData, ChannelSlot, MixLegend, MixOptions, OverlayExport,
    RgbComposite, MAX_CHANNELS,
};

#[derive(Debug, Clone)]
pub struct ViewSession {
    pub settings: RenderSettings,
    pub pixel_sizes: PixelSizes,
    pub aliases: SampleAliases,
    matrices: Vec<ElementMatrix>,
    /// Derived on load; the maximum may then be adjusted
    scale: Option<DisplayScale>,
    /// Requested row count; `None` picks the layout with fewest gaps
    rows: Option<usize>,

    channels: [ChannelSlot; MAX_CHANNELS],
    /// Colours survive unloading a channel
    colors: [ChannelColor; MAX_CHANNELS],
    pub mix_options: MixOptions,

    pub zstack: ZStack,
}

impl ViewSession {
    pub fn new(settings: RenderSettings) -> Self {
        let pixel_sizes = PixelSizes::uniform(settings.pixel_size_um);
        Self {
            rows: settings.rows,
            settings,
            pixel_sizes,
            aliases: SampleAliases::default(),
            matrices: Vec::new(),
            scale: None,
            channels: Default::default(),
            colors: ChannelColor::defaults(),
            mix_options: MixOptions::default(),
            zstack: ZStack::new(),
        }
    }

    // ── Composite maps ──────────────────────────────────────────────

    pub fn matrices(&self) -> &[ElementMatrix] {
        &self.matrices
    }

    /// Add one map and re-derive the display scale from all loaded maps.
    pub fn add_matrix(&mut self, matrix: ElementMatrix) -> Result<()> {
        if let Some(first) = self.matrices.first() {
            if first.element() != matrix.element() || first.unit() != matrix.unit() {
                return Err(MapError::data(format!(
                    "session holds {} {}, cannot add {} {}",
                    first.element(),
                    first.unit(),
                    matrix.element(),
                    matrix.unit()
                )));
            }
        }
        self.matrices.push(matrix);
        if let Err(e) = self.rescale() {
            self.matrices.pop();
            return Err(e);
        }
        Ok(())
    }

    pub fn load_matrix(&mut self, path: &Path) -> Result<()> {
        let m = load_element_matrix(path, LoadOptions::default().mask_negative(true))?;
        log::info!("Loaded {} ({} x {})", path.display(), m.shape().0, m.shape().1);
        self.add_matrix(m)
    }

    pub fn clear_matrices(&mut self) {
        self.matrices.clear();
        self.scale = None;
    }

    /// Same derivation as a batch composite.
    fn rescale(&mut self) -> Result<()> {
        self.scale = Some(display_scale_for(&self.matrices, &self.settings)?);
        Ok(())
    }

    /// Run `expr` over one loaded map and re-derive the scale.
    pub fn apply_expression(&mut self, index: usize, expr: &MapExpression) -> Result<()> {
        let m = self
            .matrices
            .get(index)
            .ok_or_else(|| MapError::config(format!("no map {} loaded", index)))?;
        let grid = expr.apply(&m.grid)?;
        self.replace_grid(index, grid)
    }

    /// Keep only `rows` x `cols` of one loaded map.
    pub fn crop_matrix(&mut self, index: usize, rows: Range<usize>, cols: Range<usize>) -> Result<()> {
        let m = self
            .matrices
            .get(index)
            .ok_or_else(|| MapError::config(format!("no map {} loaded", index)))?;
        let grid = crop(&m.grid, rows, cols)?;
        self.replace_grid(index, grid)
    }

    fn replace_grid(&mut self, index: usize, grid: Grid) -> Result<()> {
        let previous = std::mem::replace(&mut self.matrices[index].grid, grid);
        if let Err(e) = self.rescale() {
            self.matrices[index].grid = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn scale(&self) -> Option<DisplayScale> {
        self.scale
    }

    pub fn set_scale_max(&mut self, max: f64) -> Result<()> {
        let scale = self.scale.ok_or_else(|| MapError::data("no maps loaded"))?;
        self.scale = Some(scale.with_max(max)?);
        Ok(())
    }

    pub fn set_normalization(&mut self, kind: NormKind) -> Result<()> {
        self.settings.normalization = kind;
        if let Some(scale) = self.scale {
            self.scale = Some(scale.with_kind(kind)?);
        }
        Ok(())
    }

    pub fn set_rows(&mut self, rows: Option<usize>) {
        self.rows = rows;
    }

    pub fn layout(&self) -> CompositeLayout {
        match self.rows {
            Some(r) => CompositeLayout::with_rows(self.matrices.len(), r),
            None => CompositeLayout::best(self.matrices.len()),
        }
    }

    /// Paint the loaded maps, labelled with their aliases.
    pub fn render(&self) -> Result<CompositeRender> {
        let scale = self.scale.ok_or_else(|| MapError::data("no maps loaded"))?;
        let mut out = render_composite(
            &self.matrices,
            &scale,
            &self.layout(),
            &self.pixel_sizes,
            &self.settings,
        )?;
        if !self.aliases.is_empty() {
            let labels = self
                .matrices
                .iter()
                .map(|m| self.aliases.display_name(m.sample()).to_string())
                .collect();
            out.relabel(labels, &self.settings)?;
        }
        Ok(out)
    }

    // ── Overlay channels ────────────────────────────────────────────

    fn check_index(index: usize) -> Result<()> {
        if index >= MAX_CHANNELS {
            return Err(MapError::config(format!(
                "channel {} out of range (0..{})",
                index, MAX_CHANNELS
            )));
        }
        Ok(())
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelData> {
        self.channels.get(index).and_then(ChannelSlot::loaded)
    }

    pub fn channels(&self) -> &[ChannelSlot] {
        &self.channels
    }

    /// Put a map into a channel with the channel's current colour and the
    /// data maximum as display maximum.
    pub fn set_channel(&mut self, index: usize, matrix: ElementMatrix) -> Result<()> {
        Self::check_index(index)?;
        let data = ChannelData::new(matrix, self.colors[index])?;
        self.channels[index] = ChannelSlot::Loaded(data);
        Ok(())
    }

    pub fn clear_channel(&mut self, index: usize) -> Result<()> {
        Self::check_index(index)?;
        self.channels[index] = ChannelSlot::Unloaded;
        Ok(())
    }

    pub fn color(&self, index: usize) -> Option<ChannelColor> {
        self.colors.get(index).copied()
    }

    pub fn set_channel_color(&mut self, index: usize, color: ChannelColor) -> Result<()> {
        Self::check_index(index)?;
        self.colors[index] = color;
        if let ChannelSlot::Loaded(data) = &mut self.channels[index] {
            data.color = color;
        }
        Ok(())
    }

    pub fn set_channel_max(&mut self, index: usize, max: f64) -> Result<()> {
        Self::check_index(index)?;
        match &mut self.channels[index] {
            ChannelSlot::Loaded(data) => {
                data.max = max;
                Ok(())
            }
            ChannelSlot::Unloaded => Err(MapError::data(format!("channel {} is not loaded", index))),
        }
    }

    pub fn mix(&self) -> Result<RgbComposite> {
        mix(&self.channels, &self.mix_options)
    }

    /// `numerator / denominator` of two loaded channels.
    pub fn ratio(&self, numerator: usize, denominator: usize) -> Result<RatioMap> {
        if numerator == denominator {
            return Err(MapError::config("ratio needs two different channels"));
        }
        let loaded = |i: usize| {
            self.channel(i)
                .ok_or_else(|| MapError::data(format!("channel {} is not loaded", i)))
        };
        ratio_map(&loaded(numerator)?.matrix.grid, &loaded(denominator)?.matrix.grid)
    }

    pub fn mix_legend(&self) -> Option<MixLegend> {
        MixLegend::for_channels(&self.channels)
    }

    /// Mixed image with scale-bar strip and legend, ready to save.
    pub fn export_overlay(&self, opts: &OverlayExport) -> Result<RgbImage> {
        let composite = self.mix()?;
        let legend = self.mix_legend();
        Ok(export_overlay(&composite, legend.as_ref(), opts))
    }
}

impl Default for ViewSession {
    fn default() -> Self {
        Self::new(RenderSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{MatrixMeta, UnitKind};
    use approx::assert_relative_eq;

    fn map(sample: &str, element: &str, scale: f64) -> ElementMatrix {
        let values = (0..16).map(|v| v as f64 * scale).collect();
        ElementMatrix::new(
            Grid::new(4, 4, values).unwrap(),
            MatrixMeta::new(sample, element, UnitKind::Ppm),
        )
    }

    fn small() -> ViewSession {
        ViewSession::new(RenderSettings {
            dpi: 40,
            cell_inches: 2.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_scale_follows_loaded_maps() {
        let mut s = small();
        assert!(s.scale().is_none());
        s.add_matrix(map("A", "Fe56", 1.0)).unwrap();
        s.add_matrix(map("B", "Fe56", 2.0)).unwrap();
        let scale = s.scale().unwrap();
        assert_relative_eq!(scale.min(), 0.0);
        assert!(scale.max() > 15.0 && scale.max() <= 30.0);
        s.set_scale_max(10.0).unwrap();
        assert_relative_eq!(s.scale().unwrap().max(), 10.0);
        assert!(s.add_matrix(map("C", "Zn66", 1.0)).is_err());
    }

    #[test]
    fn test_layout_and_render() {
        let mut s = small();
        for name in ["A", "B", "C", "D"] {
            s.add_matrix(map(name, "Fe56", 1.0)).unwrap();
        }
        assert_eq!((s.layout().rows(), s.layout().cols()), (2, 2));
        s.set_rows(Some(1));
        assert_eq!(s.layout().cols(), 4);
        s.aliases.set("A", "Liver");
        let out = s.render().unwrap();
        assert_eq!(out.painted_cells(), 4);
        assert_eq!(out.cells()[0].label, "Liver");
    }

    #[test]
    fn test_channel_colour_persists_after_clear() {
        let mut s = small();
        let magenta = ChannelColor::new(1.0, 0.0, 1.0).unwrap();
        s.set_channel_color(1, magenta).unwrap();
        s.set_channel(1, map("A", "Cu63", 1.0)).unwrap();
        assert_eq!(s.channel(1).unwrap().color, magenta);
        s.clear_channel(1).unwrap();
        assert!(s.channel(1).is_none());
        assert_eq!(s.color(1), Some(magenta));
        assert!(s.set_channel(3, map("A", "Cu63", 1.0)).is_err());
    }

    #[test]
    fn test_single_red_channel_mix() {
        let mut s = small();
        s.set_channel(0, map("A", "Fe56", 1.0)).unwrap();
        s.set_channel_max(0, 15.0).unwrap();
        let rgb = s.mix().unwrap();
        let px = rgb.get(3, 3);
        assert_relative_eq!(px[0], 15.0 / (15.0 + 1e-6), epsilon = 1e-9);
        assert_eq!(px[1], 0.0);
        assert_eq!(px[2], 0.0);
        assert_eq!(rgb.get(0, 0), [0.0, 0.0, 0.0]);
        assert!(s.set_channel_max(2, 1.0).is_err());
    }

    #[test]
    fn test_export_overlay_needs_a_channel() {
        let mut s = small();
        assert!(s.export_overlay(&OverlayExport::default()).is_err());
        s.set_channel(0, map("A", "Fe56", 1.0)).unwrap();
        s.set_channel(1, map("A", "Zn66", 1.0)).unwrap();
        let img = s
            .export_overlay(&OverlayExport {
                target_px: 64,
                dpi: 72,
                ..Default::default()
            })
            .unwrap();
        assert!(img.width() >= 64);
    }

    #[test]
    fn test_failed_add_leaves_session_unchanged() {
        let mut s = small();
        let empty = ElementMatrix::new(Grid::filled(2, 2, f64::NAN), MatrixMeta::new("A", "Fe56", UnitKind::Ppm));
        assert!(s.add_matrix(empty).is_err());
        assert!(s.matrices().is_empty());
        assert!(s.scale().is_none());

        s.add_matrix(map("B", "Fe56", 1.0)).unwrap();
        let before = s.scale().unwrap();
        let blank = ElementMatrix::new(Grid::filled(2, 2, f64::NAN), MatrixMeta::new("C", "Fe56", UnitKind::Ppm));
        s.add_matrix(blank).unwrap();
        assert_eq!(s.matrices().len(), 2);
        assert_eq!(s.scale(), Some(before));
    }

    #[test]
    fn test_session_maximum_matches_batch_rounding() {
        let mut s = small();
        let values = (0..16).map(|v| v as f64 / 7.0).collect();
        let m = ElementMatrix::new(Grid::new(4, 4, values).unwrap(), MatrixMeta::new("A", "Fe56", UnitKind::Ppm));
        let expected = display_scale_for(std::slice::from_ref(&m), &s.settings).unwrap();
        s.add_matrix(m).unwrap();
        assert_eq!(s.scale(), Some(expected));
        let max = s.scale().unwrap().max();
        assert_eq!(max, (max * 1000.0).round() / 1000.0);
    }

    #[test]
    fn test_load_normalise_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A Fe56_ppm matrix.csv");
        std::fs::write(&path, "1,2\n3,-4\n").unwrap();
        let mut s = small();
        s.load_matrix(&path).unwrap();
        assert_eq!(s.matrices()[0].sample(), "A");
        assert!(s.matrices()[0].grid.get(1, 1).is_nan());

        s.set_normalization(NormKind::PseudoLog).unwrap();
        assert_eq!(s.scale().unwrap().kind(), NormKind::PseudoLog);
        assert_eq!(s.settings.normalization, NormKind::PseudoLog);

        s.clear_matrices();
        assert!(s.matrices().is_empty() && s.scale().is_none());
        assert!(s.render().is_err());
    }

    #[test]
    fn test_expression_and_crop_rescale() {
        let mut s = small();
        s.add_matrix(map("A", "Fe56", 1.0)).unwrap();
        let expr = MapExpression::parse("x * 10").unwrap();
        s.apply_expression(0, &expr).unwrap();
        assert_eq!(s.matrices()[0].grid.get(3, 3), 150.0);
        assert_eq!(s.matrices()[0].grid.get(0, 0), 0.0);
        assert!(s.scale().unwrap().max() > 100.0);

        s.crop_matrix(0, 0..2, 1..3).unwrap();
        assert_eq!(s.matrices()[0].shape(), (2, 2));
        assert_eq!(s.matrices()[0].grid.get(1, 1), 60.0);
        assert!(s.crop_matrix(0, 0..5, 0..1).is_err());
        assert!(s.apply_expression(4, &expr).is_err());
    }

    #[test]
    fn test_ratio_of_channels() {
        let mut s = small();
        assert!(s.ratio(0, 1).is_err());
        s.set_channel(0, map("A", "Fe56", 2.0)).unwrap();
        s.set_channel(1, map("A", "Zn66", 1.0)).unwrap();
        let r = s.ratio(0, 1).unwrap();
        assert!(r.grid.get(0, 0).is_nan());
        assert_eq!(r.grid.get(2, 2), 2.0);
        assert_relative_eq!(r.pearson_r.unwrap(), 1.0, epsilon = 1e-12);
        assert!(s.ratio(1, 1).is_err());
    }

    #[test]
    fn test_zstack_in_session() {
        let mut s = small();
        s.zstack.push(map("A", "Fe56", 1.0).grid);
        s.zstack.push(map("B", "Fe56", 1.0).grid);
        let total = s.zstack.sum().unwrap();
        assert_eq!(total.get(3, 3), 30.0);
    }
}
