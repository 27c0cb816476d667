// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use env_logger;
use log::info;

use ecount::algorithm::{find_most_likely_counts, integrate_peaks,
                        CountingConfig, DEFAULT_INTEGRATION_RANGE_GAMMA};
use ecount::image_funcs::{load_image, save_image};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    /// Integrate peak charge per row; no count inference.
    Integrate,
    /// Convert each pixel value directly to a count; no peak search.
    Count,
    /// Integrate peak charge per row, then infer counts.
    Both,
}

/// Software electron counting for low-dose STEM images.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Path of the image to process.
    input: String,

    /// Typical area under a single-electron Lorentzian pulse.
    #[arg(short, long)]
    countlevel: f32,

    /// Baseline subtracted from all pixel intensities before integrating or
    /// counting electrons.
    #[arg(short, long, default_value_t = 0.0)]
    baseline: f32,

    /// Typical width of the Lorentzian pulses in pixels (HWHM). Only used by
    /// modes "integrate" and "both".
    #[arg(short, long, default_value_t = 1.0)]
    peakwidth: f32,

    /// Processing steps to execute on the image.
    #[arg(short, long, value_enum, default_value = "both")]
    mode: Mode,

    /// Number of pulse half-widths on each side of the peak center that the
    /// integration window captures.
    #[arg(long, default_value_t = DEFAULT_INTEGRATION_RANGE_GAMMA)]
    gamma: f32,

    /// Seed for the randomized restart of truncated peaks. Fresh per run if
    /// not given.
    #[arg(long)]
    seed: Option<u64>,

    /// Path of the result image. Defaults to ecount_<input stem>.tiff next
    /// to the input.
    #[arg(short, long)]
    output: Option<String>,
}

fn default_output_path(input: &Path) -> PathBuf {
    let mut name = OsString::from("ecount_");
    name.push(input.file_stem().unwrap_or_default());
    let mut path = input.with_file_name(name);
    path.set_extension("tiff");
    path
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let input_path = PathBuf::from(&args.input);
    let image = load_image(&input_path)?;
    let (width, height) = image.dimensions();
    info!("Processing {} (WxH {}x{})", input_path.display(), width, height);

    let processing_start = Instant::now();
    let result = match args.mode {
        Mode::Count => find_most_likely_counts(
            &image, args.baseline, args.countlevel)?,
        Mode::Integrate | Mode::Both => {
            let config = CountingConfig {
                baseline: args.baseline,
                countlevel: args.countlevel,
                peakwidth: args.peakwidth,
                integration_range_gamma: args.gamma,
                only_integrate: matches!(args.mode, Mode::Integrate),
            };
            let seed = args.seed.unwrap_or_else(rand::random);
            info!("Peak integration seed: {}", seed);
            integrate_peaks(&image, &config, seed)?
        }
    };
    let elapsed = processing_start.elapsed();
    info!("Processed in {:?} ({:.1}ms per megapixel)",
          elapsed,
          elapsed.as_secs_f64() * 1000.0 / ((width * height) as f64 / 1000000.0));

    let output_path = match &args.output {
        Some(output) => PathBuf::from(output),
        None => default_output_path(&input_path),
    };
    save_image(&result, &output_path)?;
    info!("Wrote {}", output_path.display());
    Ok(())
}
