/// Batch runner: turns every (element, unit) group of an input folder into
/// its set of output files.
///
/// Each group is an independent unit of work. Groups may run in parallel;
/// a failing group is recorded in the run log and the run continues.

use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::RenderSettings;
use crate::data::loader::{load_grid, LoadOptions};
use crate::data::matrix::ElementMatrix;
use crate::data::samples::{ElementGroup, PixelSizes, SampleAliases, ScanResult};
use crate::error::{MapError, Result};
use crate::log::run_log::RunLog;
use crate::pipeline::composite_matrix::{build_composite_matrix, composite_matrix_path, save_matrix_csv};
use crate::pipeline::layout::CompositeLayout;
use crate::pipeline::normalize::DisplayScale;
use crate::pipeline::stats::{SampleStats, StatsTable};
use crate::render::composite::{render_colorbar, render_composite};
use crate::render::histogram::save_histogram;

pub const SUBPLOTS_DIR: &str = "subplots";
pub const HISTOGRAMS_DIR: &str = "Histograms";

/// Shared, read-only inputs of a run
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub output_dir: PathBuf,
    pub settings: RenderSettings,
    pub pixel_sizes: PixelSizes,
    pub aliases: SampleAliases,
}

impl BatchContext {
    pub fn new(output_dir: &Path, settings: RenderSettings, pixel_sizes: PixelSizes) -> Result<Self> {
        settings.validate()?;
        let aliases = SampleAliases::load(&SampleAliases::path_in(output_dir))?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            settings,
            pixel_sizes,
            aliases,
        })
    }

    pub fn element_dir(&self, group: &ElementGroup) -> PathBuf {
        self.output_dir.join(group.key())
    }
}

/// What one group produced
#[derive(Debug, Clone, Default)]
pub struct ElementOutcome {
    pub key: String,
    pub samples: usize,
    pub new_samples: usize,
    pub written: Vec<PathBuf>,
}

/// Load the group's matrices with negative values masked.
///
/// Samples missing from a custom pixel-size table are left out. A sample
/// that fails to load is logged and skipped; the group fails only when no
/// sample is left.
pub fn load_group(group: &ElementGroup, pixel_sizes: &PixelSizes, log: &mut RunLog) -> Result<Vec<ElementMatrix>> {
    let opts = LoadOptions::default().mask_negative(true);
    let mut matrices = Vec::with_capacity(group.files.len());
    for file in &group.files {
        if !pixel_sizes.includes(&file.meta.sample) {
            log::info!("{}: not in the pixel-size table, skipped", file.meta.sample);
            continue;
        }
        match load_grid(&file.path, opts) {
            Ok(grid) => matrices.push(ElementMatrix::new(grid, file.meta.clone())),
            Err(e) => {
                log::warn!("{}: {}", file.path.display(), e);
                log.add_entry("Skip", &format!("{} ({}): {}", file.meta.sample, group.key(), e));
            }
        }
    }
    if matrices.is_empty() {
        return Err(MapError::data(format!("no loadable matrices for {}", group.key())));
    }
    log.add_entry("Load", &format!("{} matrices for {}", matrices.len(), group.key()));
    Ok(matrices)
}

/// Shared scale of a composite: data minimum to the requested maximum, or
/// to the 99th percentile of every loaded value (rounded to 3 decimals).
pub fn display_scale_for(matrices: &[ElementMatrix], settings: &RenderSettings) -> Result<DisplayScale> {
    let scale = DisplayScale::from_values(
        matrices.iter().flat_map(|m| m.grid.valid()),
        settings.normalization,
    )?;
    match settings.scale_max {
        Some(max) => scale.with_max(max),
        None => Ok(scale),
    }
}

pub fn layout_for(count: usize, settings: &RenderSettings) -> CompositeLayout {
    match settings.rows {
        Some(rows) => CompositeLayout::with_rows(count, rows),
        None => CompositeLayout::best(count),
    }
}

/// Block-average every map when more than `downsample_above` samples share
/// one composite.
pub fn downsample_for_display(matrices: Vec<ElementMatrix>, settings: &RenderSettings) -> Vec<ElementMatrix> {
    if matrices.len() <= settings.downsample_above {
        return matrices;
    }
    log::info!(
        "{} samples: downsampling to at most {} px per side",
        matrices.len(),
        settings.downsample_target
    );
    matrices
        .into_iter()
        .map(|m| ElementMatrix::new(m.grid.downsample(settings.downsample_target), m.meta))
        .collect()
}

/// Update the statistics table and write histograms for samples it did not
/// hold yet. Returns the number of new samples.
fn update_statistics(
    matrices: &[ElementMatrix],
    element_dir: &Path,
    key: &str,
    aliases: &SampleAliases,
    log: &mut RunLog,
) -> Result<usize> {
    let path = StatsTable::path_for(element_dir, key);
    let mut table = StatsTable::load(&path)?;
    let fresh: Vec<&ElementMatrix> = matrices.iter().filter(|m| !table.contains(m.sample())).collect();

    let mut rows = Vec::with_capacity(fresh.len());
    for m in &fresh {
        rows.push(SampleStats::compute(m, aliases.display_name(m.sample()))?);
    }
    let added = table.merge_new(rows);
    table.apply_aliases(aliases);
    table.save(&path)?;

    let hist_dir = element_dir.join(HISTOGRAMS_DIR);
    for m in &fresh {
        save_histogram(m, &hist_dir)?;
    }
    log.add_entry(
        "Statistics",
        &format!("{}: {} new sample(s), {} total", key, added, table.rows().len()),
    );
    Ok(added)
}

fn needs_write(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true)
}

/// Produce every output file for one group.
pub fn process_group(group: &ElementGroup, ctx: &BatchContext, log: &mut RunLog) -> Result<ElementOutcome> {
    let key = group.key();
    let settings = &ctx.settings;
    let element_dir = ctx.element_dir(group);
    fs::create_dir_all(&element_dir)?;

    let matrices = load_group(group, &ctx.pixel_sizes, log)?;
    let new_samples = update_statistics(&matrices, &element_dir, &key, &ctx.aliases, log)?;
    let scale = display_scale_for(&matrices, settings)?;
    log.add_entry(
        "Scale",
        &format!("{}: {:.3} to {:.3} ({})", key, scale.min(), scale.max(), scale.kind()),
    );

    let matrices = downsample_for_display(matrices, settings);
    let layout = layout_for(matrices.len(), settings);
    let labels: Vec<String> = matrices
        .iter()
        .map(|m| ctx.aliases.display_name(m.sample()).to_string())
        .collect();

    let mut written = Vec::new();
    let mut render = render_composite(&matrices, &scale, &layout, &ctx.pixel_sizes, settings)?;
    render.relabel(labels, settings)?;
    let composite_path = element_dir.join(format!("{}_composite.png", key));
    render.save_png(&composite_path)?;
    written.push(composite_path);
    log.add_entry(
        "Composite",
        &format!(
            "{}: {} maps in {} x {} grid",
            key,
            matrices.len(),
            layout.rows(),
            layout.cols()
        ),
    );

    let colorbar_path = element_dir.join(format!("{}_colorbar.png", key));
    render_colorbar(&scale, group.unit, settings)?.save(&colorbar_path)?;
    written.push(colorbar_path);

    let subplot_dir = element_dir.join(SUBPLOTS_DIR);
    fs::create_dir_all(&subplot_dir)?;
    let mut subplots = 0;
    for m in &matrices {
        let path = subplot_dir.join(format!("{}.png", m.sample()));
        if !needs_write(&path) {
            continue;
        }
        let single = std::slice::from_ref(m);
        let mut one = render_composite(single, &scale, &CompositeLayout::best(1), &ctx.pixel_sizes, settings)?;
        one.relabel(vec![ctx.aliases.display_name(m.sample()).to_string()], settings)?;
        one.save_png(&path)?;
        written.push(path);
        subplots += 1;
    }
    if subplots > 0 {
        log.add_entry("Subplots", &format!("{}: {} written", key, subplots));
    }

    if settings.export_matrix {
        let grid = build_composite_matrix(&matrices, &layout)?;
        let path = composite_matrix_path(&element_dir, &key);
        save_matrix_csv(&grid, &path)?;
        written.push(path);
        log.add_entry("Matrix", &format!("{}: {} x {}", key, grid.rows(), grid.cols()));
    }

    Ok(ElementOutcome {
        key,
        samples: matrices.len(),
        new_samples,
        written,
    })
}

fn run_one(group: &ElementGroup, ctx: &BatchContext, input_dir: &Path) -> (RunLog, Option<ElementOutcome>) {
    let mut log = RunLog::new(input_dir, &ctx.output_dir);
    match process_group(group, ctx, &mut log) {
        Ok(outcome) => (log, Some(outcome)),
        Err(e) => {
            log.add_failure(&group.key(), &e.to_string());
            (log, None)
        }
    }
}

/// Process every group of `scan`, `jobs` at a time.
///
/// Per-group failures end up in the returned log; only a failure to set up
/// the run or to write the log itself is returned as an error.
pub fn run_batch(
    scan: &ScanResult,
    input_dir: &Path,
    ctx: &BatchContext,
    jobs: usize,
) -> Result<(RunLog, Vec<ElementOutcome>)> {
    let groups = scan.element_groups();
    let mut log = RunLog::new(input_dir, &ctx.output_dir);
    log.add_entry(
        "Scan",
        &format!(
            "{} file(s) matched, {} skipped, {} element group(s)",
            scan.matched.len(),
            scan.skipped.len(),
            groups.len()
        ),
    );

    let results: Vec<(RunLog, Option<ElementOutcome>)> = if jobs > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .map_err(|e| MapError::config(format!("cannot start {} workers: {}", jobs, e)))?;
        pool.install(|| groups.par_iter().map(|g| run_one(g, ctx, input_dir)).collect())
    } else {
        groups.iter().map(|g| run_one(g, ctx, input_dir)).collect()
    };

    let mut outcomes = Vec::new();
    for (part, outcome) in results {
        log.absorb(part);
        outcomes.extend(outcome);
    }
    log.save(&ctx.output_dir)?;
    log::info!("{}", log.summary().trim_end());
    Ok((log, outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{Grid, MatrixMeta, UnitKind};
    use crate::data::samples::scan_input_dir;
    use approx::assert_relative_eq;

    fn small_settings() -> RenderSettings {
        RenderSettings {
            dpi: 40,
            cell_inches: 2.0,
            ..Default::default()
        }
    }

    fn write_matrix(dir: &Path, name: &str, offset: f64) {
        let mut text = String::new();
        for r in 0..6 {
            let row: Vec<String> = (0..6).map(|c| format!("{}", offset + (r * 6 + c) as f64)).collect();
            text.push_str(&row.join(","));
            text.push('\n');
        }
        fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn test_display_scale_uses_p99_or_override() {
        let values: Vec<f64> = (0..=100).map(|v| v as f64).collect();
        let m = ElementMatrix::new(
            Grid::new(1, 101, values).unwrap(),
            MatrixMeta::new("S", "Fe56", UnitKind::Ppm),
        );
        let s = display_scale_for(std::slice::from_ref(&m), &RenderSettings::default()).unwrap();
        assert_relative_eq!(s.min(), 0.0);
        assert_relative_eq!(s.max(), 99.0);

        let fixed = RenderSettings {
            scale_max: Some(40.0),
            ..Default::default()
        };
        assert_relative_eq!(display_scale_for(&[m], &fixed).unwrap().max(), 40.0);
    }

    #[test]
    fn test_layout_for_respects_rows() {
        assert_eq!(layout_for(6, &RenderSettings::default()).rows(), 2);
        let s = RenderSettings {
            rows: Some(3),
            ..Default::default()
        };
        assert_eq!(layout_for(6, &s).cols(), 2);
    }

    #[test]
    fn test_downsample_only_above_threshold() {
        let m = |s: &str| {
            ElementMatrix::new(Grid::filled(8, 8, 1.0), MatrixMeta::new(s, "Fe56", UnitKind::Ppm))
        };
        let settings = RenderSettings {
            downsample_above: 2,
            downsample_target: 4,
            ..Default::default()
        };
        let kept = downsample_for_display(vec![m("a"), m("b")], &settings);
        assert_eq!(kept[0].shape(), (8, 8));
        let reduced = downsample_for_display(vec![m("a"), m("b"), m("c")], &settings);
        assert_eq!(reduced[2].shape(), (4, 4));
    }

    #[test]
    fn test_batch_writes_outputs_and_reports_failures() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_matrix(input.path(), "Liver Fe56_ppm matrix.csv", 0.0);
        write_matrix(input.path(), "Kidney Fe56_ppm matrix.csv", 10.0);
        fs::write(input.path().join("Liver Zn66_ppm matrix.csv"), "a,b\nc,d\n").unwrap();

        let scan = scan_input_dir(input.path()).unwrap();
        let mut settings = small_settings();
        settings.export_matrix = true;
        let ctx = BatchContext::new(output.path(), settings, PixelSizes::uniform(6.0)).unwrap();
        let (log, outcomes) = run_batch(&scan, input.path(), &ctx, 1).unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].samples, 2);
        assert_eq!(outcomes[0].new_samples, 2);
        assert_eq!(log.failures.len(), 1);
        assert_eq!(log.failures[0].element, "Zn66_ppm");

        let dir = output.path().join("Fe56_ppm");
        for name in [
            "Fe56_ppm_composite.png",
            "Fe56_ppm_colorbar.png",
            "Fe56_ppm_statistics.csv",
            "Fe56_ppm_composite_matrix.csv",
            "subplots/Liver.png",
            "Histograms/Kidney_histogram.png",
        ] {
            assert!(dir.join(name).exists(), "missing {}", name);
        }
        assert!(output.path().join("processing_log.txt").exists());

        // A re-run keeps existing subplots and adds no statistics rows.
        let (_, again) = run_batch(&scan, input.path(), &ctx, 2).unwrap();
        assert_eq!(again[0].new_samples, 0);
        assert!(again[0].written.iter().all(|p| !p.starts_with(dir.join(SUBPLOTS_DIR))));
    }

    #[test]
    fn test_custom_pixel_sizes_filter_samples() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_matrix(input.path(), "Liver Fe56_ppm matrix.csv", 0.0);
        write_matrix(input.path(), "Kidney Fe56_ppm matrix.csv", 0.0);
        let table = input.path().join("pixels.csv");
        fs::write(&table, "Sample,Pixel Size\nKidney,4\n").unwrap();

        let scan = scan_input_dir(input.path()).unwrap();
        let group = scan.group_for("Fe56", None).unwrap();
        let sizes = PixelSizes::load_csv(&table, 6.0).unwrap();
        let ctx = BatchContext::new(output.path(), small_settings(), sizes).unwrap();
        let mut log = RunLog::new(input.path(), output.path());
        let outcome = process_group(&group, &ctx, &mut log).unwrap();
        assert_eq!(outcome.samples, 1);
        assert!(!output.path().join("Fe56_ppm/subplots/Liver.png").exists());
    }
}
