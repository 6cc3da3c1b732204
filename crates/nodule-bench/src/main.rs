//! nodule-bench: CLI tool for running the nodule analysis on image files.
//!
//! Loads a colour image and its foreground mask, runs every stage with an
//! automatic reviewer that accepts all mixed regions and keeps all clump
//! estimates, and prints a per-stage report. Useful for:
//!
//! - Tuning the clump and merge thresholds on real images
//! - Checking how many holes, specks, and mixed fragments a mask produces
//! - Producing the per-nodule CSV table without an interactive session
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin nodule-bench -- [OPTIONS] <IMAGE_PATH> <MASK_PATH>
//! ```
//!
//! Set `RUST_LOG=debug` for per-step engine logs.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use nodule_core::{AcceptAll, Channel, NoduleConfig, NoduleError, NoduleResult, Pipeline};

/// Root nodule counting on image files.
///
/// Runs the full analysis on an image and its foreground mask and prints
/// per-stage counts and timings.
#[derive(Parser)]
#[command(name = "nodule-bench", version)]
struct Cli {
    /// Path to the colour image (PNG, JPEG, BMP, TIFF).
    image_path: PathBuf,

    /// Path to the foreground mask, same size as the image.
    mask_path: PathBuf,

    /// Treat dark mask pixels as foreground.
    #[arg(long)]
    invert_mask: bool,

    /// Largest area (pixels) a red region may have and still count as a
    /// single nodule.
    #[arg(long, default_value_t = NoduleConfig::DEFAULT_SINGLE_UPPER_BOUND)]
    red_upper_bound: u32,

    /// Same as `--red-upper-bound`, for green regions.
    #[arg(long, default_value_t = NoduleConfig::DEFAULT_SINGLE_UPPER_BOUND)]
    green_upper_bound: u32,

    /// Regions smaller than this many pixels are dropped as noise.
    #[arg(long, default_value_t = NoduleConfig::DEFAULT_LOW_AREA_THRESHOLD)]
    low_area: u32,

    /// Distance under which mixed regions merge with each other.
    #[arg(long, default_value_t = NoduleConfig::DEFAULT_SELF_MERGE_DISTANCE)]
    merge_distance: f64,

    /// Distance under which mixed regions absorb red and green ones.
    #[arg(long, default_value_t = NoduleConfig::DEFAULT_ABSORB_DISTANCE)]
    absorb_distance: f64,

    /// Skip adaptive widening of the mask.
    #[arg(long)]
    no_widening: bool,

    /// Write the per-nodule table to this CSV file.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Print the full result as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Full analysis config as a JSON string.
    ///
    /// When provided, all other threshold flags are ignored.
    /// The JSON must be a valid `NoduleConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,
}

/// Build a [`NoduleConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual threshold flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<NoduleConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(NoduleConfig {
        red_single_upper_bound: cli.red_upper_bound,
        green_single_upper_bound: cli.green_upper_bound,
        low_area_threshold: cli.low_area,
        self_merge_distance: cli.merge_distance,
        absorb_distance: cli.absorb_distance,
        improve_segmentation: !cli.no_widening,
        ..NoduleConfig::default()
    })
}

fn read(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))
}

/// Wall time of each stage, in pipeline order.
#[derive(Default)]
struct Timings(Vec<(&'static str, Duration)>);

impl Timings {
    fn time<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.0.push((name, start.elapsed()));
        out
    }

    fn report(&self) -> String {
        let mut out = format!("{:<20} {:>12}\n{}\n", "Stage", "Time (ms)", "-".repeat(34));
        for (name, d) in &self.0 {
            out.push_str(&format!("{name:<20} {:>10.3}ms\n", d.as_secs_f64() * 1000.0));
        }
        out
    }
}

fn run(
    image: nodule_core::RgbImage,
    mask: nodule_core::GrayImage,
    config: NoduleConfig,
    timings: &mut Timings,
) -> Result<NoduleResult, NoduleError> {
    let mut reviewer = AcceptAll;
    let pending = Pipeline::new(image, mask, config)?;
    let refined = timings.time("widen", || pending.refine())?;
    let partitioned = timings.time("partition", || refined.partition())?;
    let detected = timings.time("detect", || partitioned.detect());
    for channel in Channel::ALL {
        eprintln!(
            "{channel}: {} regions detected",
            detected.dataset(channel).len()
        );
    }
    let absorbed = timings.time("fill holes", || detected.absorb_holes())?;
    for channel in Channel::ALL {
        let r = absorbed.report(channel);
        eprintln!(
            "{channel}: {} holes, {} filled, {} unmatched",
            r.holes, r.filled, r.unmatched
        );
    }
    let filtered = timings.time("redetect + noise", || absorbed.redetect())?;
    for channel in Channel::ALL {
        eprintln!(
            "{channel}: {} noise regions removed, {} kept",
            filtered.removed(channel),
            filtered.dataset(channel).len()
        );
    }
    let split = timings.time("split clumps", || filtered.split_clumps(&mut reviewer))?;
    for channel in [Channel::Red, Channel::Green] {
        if let Some(outcome) = split.outcome(channel) {
            eprintln!("{channel}: {outcome:?}");
        }
    }
    let merged = timings.time("merge mixed", || split.merge_mixed(&mut reviewer))?;
    let a = merged.absorbed();
    eprintln!(
        "mixed: {} self-merges, {} absorbed, {} clumps linked, {} claimed clumps skipped",
        merged.merges(),
        a.absorbed,
        a.linked,
        a.skipped
    );
    timings.time("finish", || merged.into_result())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let (image_bytes, mask_bytes) = match (read(&cli.image_path), read(&cli.mask_path)) {
        (Ok(image), Ok(mask)) => (image, mask),
        (Err(msg), _) | (_, Err(msg)) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!(
        "Image: {} ({} bytes), mask: {} ({} bytes)",
        cli.image_path.display(),
        image_bytes.len(),
        cli.mask_path.display(),
        mask_bytes.len(),
    );
    eprintln!("Config: {config:#?}");
    eprintln!();

    let decoded = nodule_core::decode::decode_rgb(&image_bytes).and_then(|image| {
        nodule_core::decode::decode_mask(&mask_bytes, cli.invert_mask).map(|mask| (image, mask))
    });
    let (image, mask) = match decoded {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Decode error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut timings = Timings::default();
    let result = match run(image, mask, config, &mut timings) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Analysis error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing result: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        let summary = result.summary();
        println!(
            "Image {}x{}",
            result.dimensions.width, result.dimensions.height
        );
        println!(
            "Nodules: {} total ({} red, {} green, {} mixed)",
            summary.total(),
            summary.red,
            summary.green,
            summary.mixed
        );
        println!();
        print!("{}", timings.report());
    }

    if let Some(ref csv_path) = cli.csv {
        let csv = match nodule_export::to_csv(&result) {
            Ok(csv) => csv,
            Err(e) => {
                eprintln!("Error building CSV: {e}");
                return ExitCode::FAILURE;
            }
        };
        match std::fs::write(csv_path, &csv) {
            Ok(()) => eprintln!("CSV written to {} ({} bytes)", csv_path.display(), csv.len()),
            Err(e) => {
                eprintln!("Error writing CSV to {}: {e}", csv_path.display());
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
