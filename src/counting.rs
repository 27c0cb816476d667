// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Most-likely electron count estimation.
//!
//! Given a peak's integrated charge normalized by the expected charge of a
//! single electron, [most_likely_count] returns the integer count `n` that
//! maximizes
//!
//! ```text
//! P(n, x) = 1/sqrt(2*pi*n^2) * exp(-(x - n)^2 / (2*n^2))   (Gaussian noise)
//!         * n^n * exp(-n) / n!                             (Poisson weight)
//! ```
//!
//! `P(0, x)` is zero by definition; the Gaussian factor has no width at
//! n = 0, so near-zero charges are handled by a rounding fast path instead.
//! The Gaussian variance grows as n^2, which makes the probability sequence
//! unimodal in `n` for a fixed `x`: the search walks upward and stops at the
//! first decrease.

use std::f64::consts::PI;

/// Number of precomputed factorials, and thus one past the largest count
/// the estimator can report. 19! still fits in a u64.
pub const FACTORIAL_TABLE_LENGTH: usize = 20;

// Bias added to the normalized charge before rounding in the zero-count
// fast path, so charges just under 0.5 still count as one electron.
const COUNT_ROUND_BIAS: f64 = 0.25;

/// Precomputed factorials 0..length. Built once per top-level operation and
/// shared read-only across worker threads.
pub struct FactorialTable {
    table: Vec<u64>,
}

impl FactorialTable {
    pub fn new(length: usize) -> FactorialTable {
        assert!(length <= 21,
                "factorial table of length {} overflows u64", length);
        let mut table = Vec::with_capacity(length);
        let mut value: u64 = 1;
        for i in 0..length {
            if i > 0 {
                value *= i as u64;
            }
            table.push(value);
        }
        FactorialTable { table }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn factorial(&self, n: usize) -> u64 {
        self.table[n]
    }
}

// Probability of observing normalized charge `x` from `n` electrons, n >= 1.
// Callers must special-case n = 0 rather than evaluate this there.
fn count_probability(n: usize, x: f64, factorials: &FactorialTable) -> f64 {
    let n_f = n as f64;
    let gaussian = 1.0 / (2.0 * PI * n_f * n_f).sqrt()
        * (-(x - n_f) * (x - n_f) / (2.0 * n_f * n_f)).exp();
    let poisson = n_f.powf(n_f) * (-n_f).exp() / factorials.factorial(n) as f64;
    gaussian * poisson
}

/// Returns the electron count maximizing `P(n, x)` for the normalized charge
/// `x`, searching `n` in `0..factorials.len()`. If no maximum is found within
/// the table range the count saturates at `factorials.len() - 1`.
pub fn most_likely_count(x: f32, factorials: &FactorialTable) -> u32 {
    let x = x as f64;
    // Fast path: charges that round to zero electrons (or are negative after
    // baseline subtraction) are zero counts.
    if (x + COUNT_ROUND_BIAS).round() <= 0.0 {
        return 0;
    }
    let mut prev = 0.0; // P(0, x) is zero by definition.
    for n in 1..factorials.len() {
        let p = count_probability(n, x, factorials);
        if p < prev {
            // The sequence is unimodal; the first decrease marks the argmax.
            return (n - 1) as u32;
        }
        prev = p;
    }
    (factorials.len() - 1) as u32
}
