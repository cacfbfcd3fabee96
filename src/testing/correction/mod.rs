use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Multiple testing correction applied to the p-values of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Correction {
    /// Benjamini-Hochberg false discovery rate.
    #[default]
    BenjaminiHochberg,
    /// Benjamini-Yekutieli, valid under arbitrary dependence.
    BenjaminiYekutieli,
    /// Family-wise error control.
    Bonferroni,
}

impl Correction {
    /// Adjust `p_values` as if `n_tests` hypotheses had been tested.
    ///
    /// `n_tests` may exceed the number of p-values supplied, for hypotheses that were
    /// attempted but yielded no p-value.
    pub fn adjust(&self, p_values: &[f64], n_tests: usize) -> Result<Vec<f64>> {
        match self {
            Correction::BenjaminiHochberg => benjamini_hochberg_correction(p_values, n_tests),
            Correction::BenjaminiYekutieli => benjamini_yekutieli_correction(p_values, n_tests),
            Correction::Bonferroni => bonferroni_correction(p_values, n_tests),
        }
    }
}

fn validate(p_values: &[f64], n_tests: usize) -> Result<()> {
    if p_values.is_empty() {
        return Err(anyhow!("Empty p-value array"));
    }
    if n_tests < p_values.len() {
        return Err(anyhow!(
            "Number of tests ({}) is smaller than the number of p-values ({})",
            n_tests,
            p_values.len()
        ));
    }
    for (i, &p) in p_values.iter().enumerate() {
        if !(0.0..=1.0).contains(&p) {
            return Err(anyhow!("Invalid p-value at index {}: {}", i, p));
        }
    }
    Ok(())
}

/// Apply Bonferroni correction to p-values
///
/// Each p-value is multiplied by the number of tests and capped at 1.
///
/// # Arguments
/// * `p_values` - A slice of p-values to adjust
/// * `n_tests` - Number of hypotheses, at least `p_values.len()`
///
/// # Returns
/// * `Result<Vec<f64>>` - Vector of adjusted p-values
pub fn bonferroni_correction(p_values: &[f64], n_tests: usize) -> Result<Vec<f64>> {
    validate(p_values, n_tests)?;
    let adjusted = p_values
        .iter()
        .map(|&p| (p * n_tests as f64).min(1.0))
        .collect();
    Ok(adjusted)
}

/// Step-up adjustment shared by BH and BY: `p_(i) * n * factor / i`, made monotone
/// from the largest p-value downwards.
fn step_up(p_values: &[f64], n_tests: usize, factor: f64) -> Vec<f64> {
    let m = p_values.len();
    let mut indexed_p_values: Vec<(usize, f64)> =
        p_values.iter().enumerate().map(|(i, &p)| (i, p)).collect();
    indexed_p_values.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    let mut adjusted_p_values = vec![0.0; m];
    let mut current_min = 1.0;

    for i in (0..m).rev() {
        let (orig_idx, p_val) = indexed_p_values[i];
        let rank = i + 1;
        let adjustment = (p_val * factor * n_tests as f64 / rank as f64).min(1.0);
        current_min = adjustment.min(current_min);
        adjusted_p_values[orig_idx] = current_min;
    }

    adjusted_p_values
}

/// Apply Benjamini-Hochberg (BH) procedure for controlling false discovery rate
///
/// # Arguments
/// * `p_values` - A slice of p-values to adjust
/// * `n_tests` - Number of hypotheses, at least `p_values.len()`
///
/// # Returns
/// * `Result<Vec<f64>>` - Vector of adjusted p-values, in input order
pub fn benjamini_hochberg_correction(p_values: &[f64], n_tests: usize) -> Result<Vec<f64>> {
    validate(p_values, n_tests)?;
    Ok(step_up(p_values, n_tests, 1.0))
}

/// Apply Benjamini-Yekutieli (BY) procedure for controlling false discovery rate under dependence
///
/// The BH adjustment scaled by the harmonic sum over the number of tests.
pub fn benjamini_yekutieli_correction(p_values: &[f64], n_tests: usize) -> Result<Vec<f64>> {
    validate(p_values, n_tests)?;
    let c_n: f64 = (1..=n_tests).map(|i| 1.0 / i as f64).sum();
    Ok(step_up(p_values, n_tests, c_n))
}
