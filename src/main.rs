use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use elemap::data::matrix::UnitKind;
use elemap::data::samples::{scan_input_dir, PixelSizes, ScanResult};
use elemap::log::run_log::RunLog;
use elemap::data::loader::{load_element_matrix, LoadOptions};
use elemap::pipeline::batch::{process_group, run_batch, BatchContext};
use elemap::pipeline::composite_matrix::save_matrix_csv;
use elemap::pipeline::expression::MapExpression;
use elemap::pipeline::map_ops::{cropped_path, ratio_file_name, zstack_file_name};
use elemap::pipeline::normalize::NormKind;
use elemap::render::mixer::{ChannelColor, MixOptions, OverlayExport, MAX_CHANNELS};
use elemap::render::palette::Palette;
use elemap::{RenderSettings, ViewSession};

#[derive(Parser)]
#[command(
    name = "elemap",
    version,
    about = "Composite heatmaps, colour bars and RGB overlays from element-map exports"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List matrix files in a folder and how their names were parsed
    Scan {
        /// Input folder
        input: PathBuf,
    },
    /// Build the composite and its side outputs for one element
    Composite {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Element token, e.g. Fe56 or TotalMo
        #[arg(short, long)]
        element: String,
        /// ppm, CPS or raw (required when both ppm and CPS files exist)
        #[arg(short, long)]
        unit: Option<UnitKind>,
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Process every element found in the input folder
    Batch {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Elements processed at the same time
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Blend up to three element maps into one RGB image
    Overlay {
        /// Matrix file per channel (1 to 3)
        #[arg(short, long = "channel", required = true, num_args = 1..=3)]
        channels: Vec<PathBuf>,
        /// Channel colours as #rrggbb or a name; defaults to red, green, blue
        #[arg(long = "color")]
        colors: Vec<ChannelColor>,
        /// Display maximum per channel (defaults to the data maximum)
        #[arg(long = "max")]
        maxima: Vec<f64>,
        /// Cap each channel maximum at its 99th percentile
        #[arg(long, default_value_t = false)]
        normalize_p99: bool,
        #[arg(long, default_value_t = false)]
        no_legend: bool,
        #[arg(long, default_value_t = 1200)]
        target_px: u32,
        /// Output PNG
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Write a pixel-size table with the default size for every sample
    PixelTemplate {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = 6.0)]
        default_um: f64,
    },
    /// Update the statistics table of one element without rendering
    Stats {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        element: String,
        #[arg(short, long)]
        unit: Option<UnitKind>,
    },
    /// Pixel-wise ratio of two maps with their Pearson correlation
    Ratio {
        numerator: PathBuf,
        denominator: PathBuf,
        /// Output folder (defaults to the numerator's folder)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Sum slices of one element into a single map
    Zstack {
        #[arg(required = true)]
        slices: Vec<PathBuf>,
        /// Offset per slice as dy,dx (in slice order)
        #[arg(long = "offset", value_parser = parse_offset, allow_hyphen_values = true)]
        offsets: Vec<(i64, i64)>,
        /// Require equal slice shapes instead of zero-padding
        #[arg(long, default_value_t = false)]
        no_pad: bool,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Apply an expression in x to every positive pixel, e.g. "log10(x) * 2"
    Math {
        input: PathBuf,
        expression: MapExpression,
        /// Output CSV (defaults to {stem}_math.csv next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Keep a rectangular part of a map (half-open row and column ranges)
    Crop {
        input: PathBuf,
        #[arg(long)]
        row_start: usize,
        #[arg(long)]
        row_end: usize,
        #[arg(long)]
        col_start: usize,
        #[arg(long)]
        col_end: usize,
    },
}

fn parse_offset(s: &str) -> Result<(i64, i64), String> {
    let (dy, dx) = s
        .split_once(',')
        .ok_or_else(|| format!("offset '{}' is not dy,dx", s))?;
    let num = |v: &str| v.trim().parse::<i64>().map_err(|e| format!("offset '{}': {}", s, e));
    Ok((num(dy)?, num(dx)?))
}

/// Render options; flags override the settings file
#[derive(Args)]
struct RenderArgs {
    /// JSON settings file
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    dpi: Option<u32>,
    /// jet, viridis, magma, inferno, hot or gray
    #[arg(long)]
    palette: Option<Palette>,
    /// linear or pseudo_log
    #[arg(long)]
    norm: Option<NormKind>,
    /// Upper display bound (default: 99th percentile)
    #[arg(long)]
    scale_max: Option<f64>,
    /// Grid rows (default: fewest empty cells)
    #[arg(long)]
    rows: Option<usize>,
    /// Pixel size in µm
    #[arg(long)]
    pixel_size: Option<f64>,
    /// CSV with `Sample,Pixel Size`; only listed samples are used
    #[arg(long)]
    pixel_sizes: Option<PathBuf>,
    /// Scale-bar length in µm
    #[arg(long)]
    scale_bar: Option<f64>,
    #[arg(long, default_value_t = false)]
    no_scale_bar: bool,
    #[arg(long)]
    label_pt: Option<f32>,
    #[arg(long, default_value_t = false)]
    no_labels: bool,
    /// Print "{element} ({unit})" bottom left at this size
    #[arg(long)]
    element_label_pt: Option<f32>,
    /// Credit line printed bottom right
    #[arg(long)]
    credit: Option<String>,
    /// Also write the stitched composite matrix as CSV
    #[arg(long, default_value_t = false)]
    export_matrix: bool,
}

impl RenderArgs {
    fn settings(&self) -> Result<RenderSettings, Box<dyn std::error::Error>> {
        let mut s = match &self.settings {
            Some(path) => RenderSettings::load(path)?,
            None => RenderSettings::default(),
        };
        if let Some(v) = self.dpi {
            s.dpi = v;
        }
        if let Some(v) = self.palette {
            s.palette = v;
        }
        if let Some(v) = self.norm {
            s.normalization = v;
        }
        if self.scale_max.is_some() {
            s.scale_max = self.scale_max;
        }
        if self.rows.is_some() {
            s.rows = self.rows;
        }
        if let Some(v) = self.pixel_size {
            s.pixel_size_um = v;
        }
        if let Some(v) = self.scale_bar {
            s.scale_bar_um = v;
        }
        if self.no_scale_bar {
            s.show_scale_bar = false;
        }
        if let Some(v) = self.label_pt {
            s.sample_label_pt = Some(v);
        }
        if self.no_labels {
            s.sample_label_pt = None;
        }
        if self.element_label_pt.is_some() {
            s.element_label_pt = self.element_label_pt;
        }
        if self.credit.is_some() {
            s.credit_text = self.credit.clone();
        }
        if self.export_matrix {
            s.export_matrix = true;
        }
        s.validate()?;
        Ok(s)
    }

    fn pixel_sizes(&self, settings: &RenderSettings) -> Result<PixelSizes, Box<dyn std::error::Error>> {
        Ok(match &self.pixel_sizes {
            Some(path) => PixelSizes::load_csv(path, settings.pixel_size_um)?,
            None => PixelSizes::uniform(settings.pixel_size_um),
        })
    }
}

fn print_scan(scan: &ScanResult) {
    for f in &scan.matched {
        println!("{}\t{}\t{}\t{}", f.meta.sample, f.meta.element, f.meta.unit, f.path.display());
    }
    for p in &scan.skipped {
        println!("(skipped)\t{}", p.display());
    }
    for g in scan.element_groups() {
        println!("{}: {} file(s)", g.key(), g.files.len());
    }
}

fn composite(
    input: &Path,
    output: &Path,
    element: &str,
    unit: Option<UnitKind>,
    render: &RenderArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = render.settings()?;
    let pixel_sizes = render.pixel_sizes(&settings)?;
    let scan = scan_input_dir(input)?;
    let group = scan.group_for(element, unit)?;
    let ctx = BatchContext::new(output, settings, pixel_sizes)?;

    let mut log = RunLog::new(input, output);
    let result = process_group(&group, &ctx, &mut log);
    if let Err(e) = &result {
        log.add_failure(&group.key(), &e.to_string());
    }
    log.save(output)?;
    let outcome = result?;
    for path in &outcome.written {
        println!("{}", path.display());
    }
    Ok(())
}

fn overlay(
    channels: &[PathBuf],
    colors: &[ChannelColor],
    maxima: &[f64],
    normalize_p99: bool,
    include_legend: bool,
    target_px: u32,
    output: &Path,
    render: &RenderArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = render.settings()?;
    let mut session = ViewSession::new(settings.clone());
    session.mix_options = MixOptions { normalize_p99 };
    for (i, path) in channels.iter().enumerate().take(MAX_CHANNELS) {
        if let Some(&color) = colors.get(i) {
            session.set_channel_color(i, color)?;
        }
        let m = load_element_matrix(path, LoadOptions::default())?;
        session.set_channel(i, m)?;
        if let Some(&max) = maxima.get(i) {
            session.set_channel_max(i, max)?;
        }
    }
    let opts = OverlayExport {
        target_px,
        pixel_size_um: settings.pixel_size_um,
        scale_bar_um: settings.scale_bar_um,
        show_scale_bar: settings.show_scale_bar,
        include_legend,
        dpi: settings.dpi,
        ..Default::default()
    };
    session.export_overlay(&opts)?.save(output)?;
    log::info!("Overlay saved to {}", output.display());
    Ok(())
}

fn stats(input: &Path, output: &Path, element: &str, unit: Option<UnitKind>) -> Result<(), Box<dyn std::error::Error>> {
    use elemap::data::samples::SampleAliases;
    use elemap::pipeline::stats::{SampleStats, StatsTable};

    let scan = scan_input_dir(input)?;
    let group = scan.group_for(element, unit)?;
    let aliases = SampleAliases::load(&SampleAliases::path_in(output))?;
    let path = StatsTable::path_for(&output.join(group.key()), &group.key());
    let mut table = StatsTable::load(&path)?;

    let mut log = RunLog::new(input, output);
    let matrices = elemap::pipeline::batch::load_group(&group, &PixelSizes::uniform(0.0), &mut log)?;
    let mut fresh = Vec::new();
    for m in matrices.iter().filter(|m| !table.contains(m.sample())) {
        fresh.push(SampleStats::compute(m, aliases.display_name(m.sample()))?);
    }
    let added = table.merge_new(fresh);
    table.apply_aliases(&aliases);
    table.save(&path)?;
    println!("{}: {} new sample(s), {} total", group.key(), added, table.rows().len());
    Ok(())
}

fn ratio(numerator: &Path, denominator: &Path, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = ViewSession::default();
    session.set_channel(0, load_element_matrix(numerator, LoadOptions::default())?)?;
    session.set_channel(1, load_element_matrix(denominator, LoadOptions::default())?)?;
    let result = session.ratio(0, 1)?;

    let names = |i: usize| session.channel(i).map(|c| c.label.clone()).unwrap_or_default();
    let dir = output
        .map(Path::to_path_buf)
        .or_else(|| numerator.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let path = dir.join(ratio_file_name(&names(0), &names(1)));
    save_matrix_csv(&result.grid, &path)?;
    match result.pearson_r {
        Some(r) => println!("Pearson r = {:.4} over {} pixels", r, result.pairs),
        None => println!("Pearson r: insufficient data ({} pixels)", result.pairs),
    }
    println!("{}", path.display());
    Ok(())
}

fn zstack(slices: &[PathBuf], offsets: &[(i64, i64)], no_pad: bool, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = ViewSession::default();
    session.zstack.auto_pad = !no_pad;
    let mut element = None;
    for (i, path) in slices.iter().enumerate() {
        let m = load_element_matrix(path, LoadOptions::default())?;
        element.get_or_insert_with(|| m.element().to_string());
        session.zstack.push(m.grid);
        if let Some(&(dy, dx)) = offsets.get(i) {
            session.zstack.set_offset(i, dy, dx)?;
        }
    }
    let total = session.zstack.sum()?;
    let path = output.join(zstack_file_name(element.as_deref()));
    save_matrix_csv(&total, &path)?;
    println!("{}", path.display());
    Ok(())
}

fn math(input: &Path, expression: &MapExpression, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = ViewSession::default();
    session.load_matrix(input)?;
    session.apply_expression(0, expression)?;
    let path = match output {
        Some(p) => p.to_path_buf(),
        None => {
            let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("matrix");
            input.with_file_name(format!("{}_math.csv", stem))
        }
    };
    save_matrix_csv(&session.matrices()[0].grid, &path)?;
    println!("{}", path.display());
    Ok(())
}

fn crop(input: &Path, rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = ViewSession::default();
    session.load_matrix(input)?;
    session.crop_matrix(0, rows.clone(), cols.clone())?;
    let path = cropped_path(input, &rows, &cols);
    save_matrix_csv(&session.matrices()[0].grid, &path)?;
    println!("{}", path.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Scan { input } => print_scan(&scan_input_dir(&input)?),
        Command::Composite {
            input,
            output,
            element,
            unit,
            render,
        } => composite(&input, &output, &element, unit, &render)?,
        Command::Batch {
            input,
            output,
            jobs,
            render,
        } => {
            let settings = render.settings()?;
            let pixel_sizes = render.pixel_sizes(&settings)?;
            let scan = scan_input_dir(&input)?;
            let ctx = BatchContext::new(&output, settings, pixel_sizes)?;
            let (log, outcomes) = run_batch(&scan, &input, &ctx, jobs.max(1))?;
            println!("{} element(s) written", outcomes.len());
            println!("{}", log.summary().trim_end());
            if log.has_failures() {
                std::process::exit(1);
            }
        }
        Command::Overlay {
            channels,
            colors,
            maxima,
            normalize_p99,
            no_legend,
            target_px,
            output,
            render,
        } => overlay(
            &channels,
            &colors,
            &maxima,
            normalize_p99,
            !no_legend,
            target_px,
            &output,
            &render,
        )?,
        Command::PixelTemplate {
            input,
            output,
            default_um,
        } => {
            let scan = scan_input_dir(&input)?;
            PixelSizes::write_template(&output, scan.samples(), default_um)?;
            println!("Template for {} sample(s) written to {}", scan.samples().len(), output.display());
        }
        Command::Stats {
            input,
            output,
            element,
            unit,
        } => stats(&input, &output, &element, unit)?,
        Command::Ratio {
            numerator,
            denominator,
            output,
        } => ratio(&numerator, &denominator, output.as_deref())?,
        Command::Zstack {
            slices,
            offsets,
            no_pad,
            output,
        } => zstack(&slices, &offsets, no_pad, &output)?,
        Command::Math {
            input,
            expression,
            output,
        } => math(&input, &expression, output.as_deref())?,
        Command::Crop {
            input,
            row_start,
            row_end,
            col_start,
            col_end,
        } => crop(&input, row_start..row_end, col_start..col_end)?,
    }
    Ok(())
}
