//! Software electron counting for low-dose scanning transmission electron
//! microscopy (STEM) images.
//!
//! Electron impacts on the detector show up as spatially localized,
//! roughly Lorentzian intensity pulses along the fast-scan (row) direction.
//! [algorithm::integrate_peaks] detects and integrates those pulses per row
//! and, unless integrate-only mode is selected, converts each pulse's charge
//! into the most likely electron count via [counting::most_likely_count].
//! [algorithm::find_most_likely_counts] applies the count estimator to every
//! pixel independently, for exposures where pulses are not spatially
//! resolved.

pub mod algorithm;
pub mod counting;
pub mod image_funcs;

/// Grayscale image with 32-bit float samples, row-major.
pub type Gray32FImage = image::ImageBuffer<image::Luma<f32>, Vec<f32>>;
