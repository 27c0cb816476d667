//! Electron counting for low-dose STEM images. Given a raw floating-point
//! image, [integrate_peaks] detects and integrates contiguous electron-impact
//! pulses along each fast-scan row and writes each pulse's integrated charge
//! (or its most likely electron count) into the result image at the pulse's
//! start column. [find_most_likely_counts] skips the pulse search and counts
//! every pixel independently, for longer dwell times where pulses are not
//! spatially resolved.
//!
//! # Algorithm
//!
//! Pulses are approximated as Lorentzian in shape along the row, with a known
//! expected integral (`countlevel`) and half-width (`peakwidth`). From these
//! the scan derives the amplitude a single-electron pulse should reach and
//! the sample threshold at which such a pulse crosses the edge of its
//! integration window. Each row is walked left to right:
//!
//! * A baseline-corrected sample above the threshold opens a peak.
//! * Samples keep accumulating while they stay above a fixed fraction of the
//!   brightest sample seen in the peak so far, so bright multi-electron
//!   pulses are followed further down their flanks.
//! * A peak closes when its samples fall off, when it reaches the maximum
//!   window length, or at the end of the row. The integrated charge (or its
//!   estimated count) lands at the peak's start column; all other result
//!   pixels stay zero.
//! * A peak cut off by the length limit while still above threshold restarts
//!   at a randomized offset so that repeated truncation of overlong pulses
//!   does not produce periodic artifacts.
//!
//! Rows share no state and are processed in parallel; each row draws from its
//! own seeded random stream so results are reproducible for a given `seed`.
//!
//! # Caveats
//!
//! The scan is one-dimensional by design. Pulses overlapping in the cross-row
//! direction are integrated per row, and two electrons landing in the same
//! window are only separated statistically, by the count estimator.

use std::time::Instant;

use anyhow::{ensure, Result};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::counting::{most_likely_count, FactorialTable, FACTORIAL_TABLE_LENGTH};
use crate::Gray32FImage;

/// Number of pulse half-widths on each side of the peak center that the
/// integration window captures. The reference material uses both 2.0 and 4.0;
/// this default can be overridden per call via
/// [CountingConfig::integration_range_gamma].
pub const DEFAULT_INTEGRATION_RANGE_GAMMA: f32 = 2.0;

/// Per-call configuration for [integrate_peaks]. Validated once at the
/// operation boundary; the scan itself assumes positive, finite values.
#[derive(Copy, Clone, Debug)]
pub struct CountingConfig {
    /// Constant intensity offset subtracted from every sample.
    pub baseline: f32,

    /// Expected integrated charge of a single-electron pulse.
    pub countlevel: f32,

    /// Expected half-width (HWHM) of a single-electron pulse, in columns.
    pub peakwidth: f32,

    /// See [DEFAULT_INTEGRATION_RANGE_GAMMA].
    pub integration_range_gamma: f32,

    /// If set, report raw integrated charge instead of electron counts.
    pub only_integrate: bool,
}

impl CountingConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.baseline.is_finite(),
                "baseline must be finite, got {}", self.baseline);
        ensure!(self.countlevel.is_finite() && self.countlevel > 0.0,
                "countlevel must be positive, got {}", self.countlevel);
        ensure!(self.peakwidth.is_finite() && self.peakwidth > 0.0,
                "peakwidth must be positive, got {}", self.peakwidth);
        ensure!(self.integration_range_gamma.is_finite()
                    && self.integration_range_gamma > 0.0,
                "integration_range_gamma must be positive, got {}",
                self.integration_range_gamma);
        Ok(())
    }
}

// Constants derived from the configuration once per image call.
struct PeakParams {
    // Sample amplitude (above baseline) at which a single-electron Lorentzian
    // crosses the edge of its integration window. Opens and restarts peaks.
    threshold: f32,

    // A peak ends when its samples drop below this fraction of the brightest
    // sample seen within the peak.
    relative_threshold: f32,

    // Maximum number of columns a single peak may span.
    peak_length: usize,

    // Normalizes a baseline-corrected integral to expected-count units.
    counts_divisor: f32,
}

impl PeakParams {
    fn derive(config: &CountingConfig) -> PeakParams {
        let gamma = config.integration_range_gamma;
        // Amplitude of a Lorentzian of integral `countlevel` and half-width
        // `peakwidth`, sampled over +/-10 half-widths.
        let peak_height = config.countlevel / config.peakwidth
            / (2.0 * 10.0_f32.atan());
        // A Lorentzian of that height falls to height/(1 + gamma^2) at
        // `gamma` half-widths from its center.
        let edge_fraction = 1.0 / (1.0 + gamma * gamma);
        PeakParams {
            threshold: peak_height * edge_fraction,
            relative_threshold: edge_fraction,
            peak_length: ((2.0 * gamma * config.peakwidth).round() as usize).max(1),
            counts_divisor: config.countlevel,
        }
    }
}

// Scans one row left to right, writing each detected peak's value into
// `result_row` at the peak's start column. `rownum` is only used for logging.
fn scan_row_for_peaks(row: &[f32], result_row: &mut [f32], rownum: usize,
                      config: &CountingConfig, params: &PeakParams,
                      factorials: &FactorialTable, rng: &mut StdRng) {
    let width = row.len();
    let mut start: Option<usize> = None;
    let mut integral = 0.0_f32;
    let mut peak_max = 0.0_f32;

    let close_peak = |start_col: usize, integral: f32,
                          result_row: &mut [f32]| {
        let value = if config.only_integrate {
            integral
        } else {
            most_likely_count(integral / params.counts_divisor, factorials) as f32
        };
        debug!("Peak at row {} col {}: integral {}, value {}",
               rownum, start_col, integral, value);
        result_row[start_col] = value;
    };

    let mut i = 0;
    while i < width {
        let sample = row[i] - config.baseline;
        match start {
            None => {
                if sample > params.threshold {
                    start = Some(i);
                    integral = sample;
                    peak_max = sample;
                }
            }
            Some(start_col) => {
                let above_termination = sample > peak_max * params.relative_threshold;
                let at_length_limit = i - start_col >= params.peak_length;
                let last_column = i + 1 == width;
                if above_termination && !at_length_limit && !last_column {
                    integral += sample;
                    if sample > peak_max {
                        peak_max = sample;
                    }
                } else {
                    // The closing sample itself is not accumulated.
                    close_peak(start_col, integral, result_row);
                    if sample > params.threshold {
                        // Truncated while still above threshold. Restart at a
                        // randomized offset to desynchronize repeated
                        // truncation points; the skipped columns are not
                        // examined.
                        let next = i + 1 + rng.random_range(0..params.peak_length);
                        if next < width {
                            start = Some(next);
                            integral = row[next] - config.baseline;
                            peak_max = integral;
                            i = next;
                        } else {
                            start = None;
                        }
                    } else {
                        start = None;
                    }
                }
            }
        }
        i += 1;
    }
    // A peak opened at the last column is force-closed.
    if let Some(start_col) = start {
        close_peak(start_col, integral, result_row);
    }
}

/// Detects and integrates electron-impact pulses along each row of `image`.
///
/// Returns a zero-initialized image of the same dimensions with each detected
/// peak's integrated charge (if `config.only_integrate`) or most likely
/// electron count written at the peak's start column.
///
/// `seed` determines the randomized-restart behavior; row `r` draws from a
/// stream seeded with `seed + r`, so results are reproducible and independent
/// of how rows are scheduled across threads.
pub fn integrate_peaks(image: &Gray32FImage, config: &CountingConfig,
                       seed: u64) -> Result<Gray32FImage> {
    config.validate()?;
    let scan_start = Instant::now();
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Ok(Gray32FImage::new(width, height));
    }
    let params = PeakParams::derive(config);
    let factorials = FactorialTable::new(FACTORIAL_TABLE_LENGTH);

    let row_width = width as usize;
    let mut result = vec![0.0_f32; (width * height) as usize];
    result
        .par_chunks_mut(row_width)
        .zip(image.as_raw().par_chunks(row_width))
        .enumerate()
        .for_each(|(rownum, (result_row, row))| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(rownum as u64));
            scan_row_for_peaks(row, result_row, rownum, config, &params,
                               &factorials, &mut rng);
        });
    info!("Integrated peaks in {}x{} image in {:?}",
          width, height, scan_start.elapsed());
    Ok(Gray32FImage::from_raw(width, height, result).unwrap())
}

/// Estimates an electron count for every pixel independently, with no pulse
/// search: `most_likely_count((pixel - baseline) / countlevel)`. Used when
/// pulses are not spatially resolved.
pub fn find_most_likely_counts(image: &Gray32FImage, baseline: f32,
                               countlevel: f32) -> Result<Gray32FImage> {
    ensure!(baseline.is_finite(), "baseline must be finite, got {}", baseline);
    ensure!(countlevel.is_finite() && countlevel > 0.0,
            "countlevel must be positive, got {}", countlevel);
    let count_start = Instant::now();
    let (width, height) = image.dimensions();
    let factorials = FactorialTable::new(FACTORIAL_TABLE_LENGTH);
    let counts: Vec<f32> = image
        .as_raw()
        .par_iter()
        .map(|&pixel| {
            most_likely_count((pixel - baseline) / countlevel, &factorials) as f32
        })
        .collect();
    info!("Counted {}x{} image in {:?}", width, height, count_start.elapsed());
    Ok(Gray32FImage::from_raw(width, height, counts).unwrap())
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::counting::{most_likely_count, FactorialTable,
                          FACTORIAL_TABLE_LENGTH};

    fn test_config(baseline: f32, countlevel: f32, peakwidth: f32,
                   only_integrate: bool) -> CountingConfig {
        CountingConfig {
            baseline,
            countlevel,
            peakwidth,
            integration_range_gamma: DEFAULT_INTEGRATION_RANGE_GAMMA,
            only_integrate,
        }
    }

    fn image_from_rows(rows: &[Vec<f32>]) -> Gray32FImage {
        let width = rows[0].len() as u32;
        let height = rows.len() as u32;
        let samples: Vec<f32> = rows.iter().flatten().copied().collect();
        Gray32FImage::from_raw(width, height, samples).unwrap()
    }

    // A Lorentzian pulse of integral `charge` and half-width `hwhm` centered
    // at `center`, on a flat baseline.
    fn lorentzian_row(width: usize, center: f32, hwhm: f32, charge: f32,
                      baseline: f32) -> Vec<f32> {
        (0..width)
            .map(|i| {
                let d = (i as f32 - center) / hwhm;
                baseline + charge / (std::f32::consts::PI * hwhm) / (1.0 + d * d)
            })
            .collect()
    }

    fn nonzero_entries(row: &[f32]) -> Vec<(usize, f32)> {
        row.iter()
            .enumerate()
            .filter(|(_i, &v)| v != 0.0)
            .map(|(i, &v)| (i, v))
            .collect()
    }

    #[test]
    fn test_flat_row_produces_no_peaks() {
        let image = image_from_rows(&[vec![5.0; 32]]);
        let config = test_config(5.0, 1.0, 1.7, /*only_integrate=*/true);
        let result = integrate_peaks(&image, &config, 42).unwrap();
        assert_eq!(result.dimensions(), image.dimensions());
        assert!(result.as_raw().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_single_lorentzian_integrate_only() {
        let baseline = 5.0;
        let charge = 1.0;
        let row = lorentzian_row(64, 32.0, 1.7, charge, baseline);
        let image = image_from_rows(&[row.clone()]);
        let config = test_config(baseline, 1.0, 1.7, /*only_integrate=*/true);
        let result = integrate_peaks(&image, &config, 42).unwrap();

        let nonzero = nonzero_entries(result.as_raw());
        assert_eq!(nonzero.len(), 1);
        let (start, integral) = nonzero[0];
        // The pulse exceeds the start threshold three columns either side of
        // its center, so the window is columns 29..=35.
        assert_eq!(start, 29);
        let expected: f32 = row[29..=35].iter().map(|&v| v - baseline).sum();
        assert_abs_diff_eq!(integral, expected, epsilon = 1e-5);
        // A truncated Lorentzian captures most, but not all, of the charge.
        assert!(integral > 0.6 * charge && integral < charge);
    }

    #[test]
    fn test_single_lorentzian_counting_mode() {
        let baseline = 5.0;
        let row = lorentzian_row(64, 32.0, 1.7, 1.0, baseline);
        let image = image_from_rows(&[row]);
        let integrate_config = test_config(baseline, 1.0, 1.7, true);
        let counting_config = test_config(baseline, 1.0, 1.7, false);

        let integrated = integrate_peaks(&image, &integrate_config, 42).unwrap();
        let counted = integrate_peaks(&image, &counting_config, 42).unwrap();

        let factorials = FactorialTable::new(FACTORIAL_TABLE_LENGTH);
        let integral = integrated.as_raw()[29];
        assert!(integral > 0.0);
        let expected = most_likely_count(
            integral / counting_config.countlevel, &factorials) as f32;
        assert_eq!(counted.as_raw()[29], expected);
        assert_eq!(expected, 1.0);
    }

    #[test]
    fn test_overlong_peak_is_truncated_and_restarted() {
        // A box-shaped pulse much wider than the integration window. With
        // peakwidth 1 and gamma 2 the window is 4 columns.
        let mut row = vec![0.0_f32; 64];
        for col in 20..40 {
            row[col] = 1.0;
        }
        let image = image_from_rows(&[row]);
        let config = test_config(0.0, 1.0, 1.0, /*only_integrate=*/true);
        let result = integrate_peaks(&image, &config, 42).unwrap();

        let nonzero = nonzero_entries(result.as_raw());
        assert!(nonzero.len() >= 2);
        // First peak starts where the pulse crosses threshold and is cut at
        // exactly peak_length columns.
        assert_eq!(nonzero[0], (20, 4.0));
        // The follow-on peak starts at a randomized offset in
        // [close + 1, close + 1 + peak_length).
        let (second_start, _) = nonzero[1];
        assert!((25..29).contains(&second_start),
                "restart at {}", second_start);
        for &(start, value) in &nonzero {
            assert!(start < 40);
            assert!(value <= 4.0);
        }
    }

    #[test]
    fn test_rows_are_independent_under_seeding() {
        let mut box_row = vec![0.0_f32; 64];
        for col in 10..50 {
            box_row[col] = 1.0;
        }
        let lorentzian = lorentzian_row(64, 40.0, 1.7, 2.0, 0.0);
        let image = image_from_rows(&[box_row.clone(), lorentzian.clone()]);
        let config = test_config(0.0, 1.0, 1.0, /*only_integrate=*/true);

        let seed = 7;
        let both = integrate_peaks(&image, &config, seed).unwrap();
        // Row r of a multi-row image uses the stream seeded with seed + r.
        let row0 = integrate_peaks(
            &image_from_rows(&[box_row]), &config, seed).unwrap();
        let row1 = integrate_peaks(
            &image_from_rows(&[lorentzian]), &config, seed + 1).unwrap();

        assert_eq!(&both.as_raw()[0..64], row0.as_raw().as_slice());
        assert_eq!(&both.as_raw()[64..128], row1.as_raw().as_slice());
    }

    #[test]
    fn test_same_seed_reproduces_result() {
        let mut row = vec![0.0_f32; 128];
        for col in 8..120 {
            row[col] = 1.0;
        }
        let image = image_from_rows(&[row]);
        let config = test_config(0.0, 1.0, 1.0, /*only_integrate=*/true);
        let first = integrate_peaks(&image, &config, 99).unwrap();
        let second = integrate_peaks(&image, &config, 99).unwrap();
        assert_eq!(first.as_raw(), second.as_raw());
    }

    #[test]
    fn test_peak_at_last_column_is_closed() {
        let mut row = vec![0.0_f32; 16];
        row[15] = 1.0;
        let image = image_from_rows(&[row]);
        let config = test_config(0.0, 1.0, 1.0, /*only_integrate=*/true);
        let result = integrate_peaks(&image, &config, 42).unwrap();
        assert_eq!(nonzero_entries(result.as_raw()), vec![(15, 1.0)]);
    }

    #[test]
    fn test_degenerate_config_is_rejected() {
        let image = image_from_rows(&[vec![0.0; 8]]);
        let mut config = test_config(0.0, 1.0, 1.0, true);
        config.peakwidth = 0.0;
        assert!(integrate_peaks(&image, &config, 42).is_err());
        config = test_config(0.0, -1.0, 1.0, true);
        assert!(integrate_peaks(&image, &config, 42).is_err());
        config = test_config(f32::NAN, 1.0, 1.0, true);
        assert!(integrate_peaks(&image, &config, 42).is_err());
        assert!(find_most_likely_counts(&image, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_direct_counts() {
        let image = image_from_rows(&[vec![0.1, 0.2, 0.31]]);
        let result = find_most_likely_counts(&image, 0.0, 0.1).unwrap();
        assert_eq!(result.dimensions(), image.dimensions());
        // Normalized charges 1.0, 2.0 and 3.1. The model's variance grows
        // with n, which pulls the argmax below the face value for x >= 2.
        assert_eq!(result.as_raw().as_slice(), &[1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_direct_counts_baseline_subtraction() {
        let image = image_from_rows(&[vec![10.1, 10.0, 9.9]]);
        let result = find_most_likely_counts(&image, 10.0, 0.1).unwrap();
        assert_eq!(result.as_raw().as_slice(), &[1.0, 0.0, 0.0]);
    }
}
