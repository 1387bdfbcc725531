//! Base-quality probability tables.
//!
//! Log probabilities of a base matching or mismatching the reference for a
//! given PHRED score, precomputed once per process, plus the rest-of-genome
//! correction applied when turning probabilities into alignment scores.

use std::sync::OnceLock;

const MAX_QUALITY: usize = 64;

fn log_match_table() -> &'static [f64; MAX_QUALITY] {
    static TABLE: OnceLock<[f64; MAX_QUALITY]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0; MAX_QUALITY];
        for (quality, entry) in table.iter_mut().enumerate() {
            let p_error = 10f64.powf(quality as f64 / -10.0);
            *entry = (1.0 - p_error).max(f64::MIN_POSITIVE).ln();
        }
        table
    })
}

fn log_mismatch_table() -> &'static [f64; MAX_QUALITY] {
    static TABLE: OnceLock<[f64; MAX_QUALITY]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0; MAX_QUALITY];
        for (quality, entry) in table.iter_mut().enumerate() {
            *entry = log_mismatch_slow(quality as u32);
        }
        table
    })
}

fn log_mismatch_slow(quality: u32) -> f64 {
    // if there is an error, each of the three other bases is equally likely
    let p_error = 10f64.powf(quality as f64 / -10.0);
    (p_error / 3.0).ln()
}

/// Natural log of the probability that a base matches the reference.
pub fn log_match(quality: u8) -> f64 {
    log_match_table()[(quality as usize).min(MAX_QUALITY - 1)]
}

/// Natural log of the probability of a mismatching base.
pub fn log_mismatch(quality: u8) -> f64 {
    log_mismatch_table()[(quality as usize).min(MAX_QUALITY - 1)]
}

pub const LOG_MISMATCH_Q40: f64 = -10.308952660644293; // ln(10^-4 / 3)

/// Rest-of-genome correction: the prior `2 * G * 4^-L` added to the
/// denominator of score computations so that reads extremely unlikely to
/// occur by chance anywhere in the genome get inflated confidence.
pub fn rest_of_genome_correction(genome_length: u64, read_length: u32) -> f64 {
    (2f64.ln() + (genome_length as f64).ln() - 4f64.ln() * read_length as f64).exp()
}

/// Fuzzy comparison helpers for accumulated log probabilities.
pub fn lp_equals(left: f64, right: f64) -> bool {
    (left - right).abs() <= 1e-7
}

pub fn lp_less(left: f64, right: f64) -> bool {
    !lp_equals(left, right) && left < right
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_probability_increases_with_quality() {
        assert!(log_match(2) < log_match(20));
        assert!(log_match(20) < log_match(40));
        assert!(log_match(40) < 0.0);
    }

    #[test]
    fn mismatch_probability_decreases_with_quality() {
        assert!(log_mismatch(40) < log_mismatch(20));
        assert!(log_mismatch(20) < log_mismatch(2));
    }

    #[test]
    fn q40_mismatch_constant_matches_table() {
        assert!((log_mismatch(40) - LOG_MISMATCH_Q40).abs() < 1e-12);
    }

    #[test]
    fn rest_of_genome_correction_shrinks_with_read_length() {
        let short = rest_of_genome_correction(3_000_000_000, 50);
        let long = rest_of_genome_correction(3_000_000_000, 150);
        assert!(long < short);
        assert!(short > 0.0);
    }

    #[test]
    fn lp_comparisons_tolerate_rounding() {
        assert!(lp_equals(-10.0, -10.0 + 1e-9));
        assert!(lp_less(-11.0, -10.0));
        assert!(!lp_less(-10.0 + 1e-9, -10.0));
    }
}
