//! Trimmed mean of M-values normalisation factors.

use crate::testing::utils::{average_ranks, median, quantile};
use ndarray::{Array2, ArrayView1, Axis};

/// Fraction of log-ratios trimmed from each end.
pub const LOGRATIO_TRIM: f64 = 0.3;
/// Fraction of log-abundances trimmed from each end.
pub const SUM_TRIM: f64 = 0.05;

/// Pick the reference sample: the one whose upper quartile of proportions is closest
/// to the mean upper quartile, or the largest sqrt-count sum when the upper quartiles
/// vanish.
pub fn reference_sample(counts: &Array2<f64>, lib_sizes: &[f64]) -> usize {
    let f75: Vec<f64> = counts
        .axis_iter(Axis(1))
        .zip(lib_sizes.iter())
        .map(|(col, &lib)| {
            let props: Vec<f64> = col.iter().map(|&y| y / lib).collect();
            quantile(&props, 0.75)
        })
        .collect();

    if median(&f75) < 1e-20 {
        let sqrt_sums: Vec<f64> = counts
            .axis_iter(Axis(1))
            .map(|col| col.iter().map(|y| y.sqrt()).sum())
            .collect();
        return argmax(&sqrt_sums);
    }

    let mean = f75.iter().sum::<f64>() / f75.len() as f64;
    let distances: Vec<f64> = f75.iter().map(|f| -(f - mean).abs()).collect();
    argmax(&distances)
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv { (i, v) } else { (bi, bv) }
        })
        .0
}

/// Unscaled TMM factor of `obs` against `reference`.
fn tmm_factor(obs: ArrayView1<f64>, n_obs: f64, reference: ArrayView1<f64>, n_ref: f64) -> f64 {
    let mut log_r = Vec::new();
    let mut abs_e = Vec::new();
    let mut variance = Vec::new();

    for (&o, &r) in obs.iter().zip(reference.iter()) {
        let lr = ((o / n_obs) / (r / n_ref)).log2();
        let ae = ((o / n_obs).log2() + (r / n_ref).log2()) / 2.0;
        if lr.is_finite() && ae.is_finite() {
            log_r.push(lr);
            abs_e.push(ae);
            variance.push((n_obs - o) / n_obs / o + (n_ref - r) / n_ref / r);
        }
    }

    if log_r.is_empty() || log_r.iter().all(|v| v.abs() < 1e-6) {
        return 1.0;
    }

    let n = log_r.len() as f64;
    let lo_l = (n * LOGRATIO_TRIM).floor() + 1.0;
    let hi_l = n + 1.0 - lo_l;
    let lo_s = (n * SUM_TRIM).floor() + 1.0;
    let hi_s = n + 1.0 - lo_s;

    let rank_r = average_ranks(&log_r);
    let rank_e = average_ranks(&abs_e);

    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..log_r.len() {
        let keep = rank_r[i] >= lo_l && rank_r[i] <= hi_l && rank_e[i] >= lo_s && rank_e[i] <= hi_s;
        if keep {
            num += log_r[i] / variance[i];
            den += 1.0 / variance[i];
        }
    }

    let f = num / den;
    if f.is_finite() { 2f64.powf(f) } else { 1.0 }
}

/// TMM normalisation factors of a genes × samples count matrix, scaled to a geometric
/// mean of one. Samples must have positive library sizes.
pub fn tmm_factors(counts: &Array2<f64>, lib_sizes: &[f64]) -> Vec<f64> {
    let n_samples = counts.ncols();
    if n_samples == 0 {
        return Vec::new();
    }

    let nonzero: Vec<usize> = (0..counts.nrows())
        .filter(|&g| counts.row(g).iter().any(|&y| y > 0.0))
        .collect();
    let counts = counts.select(Axis(0), &nonzero);
    if counts.nrows() == 0 {
        return vec![1.0; n_samples];
    }

    let ref_idx = reference_sample(&counts, lib_sizes);
    let factors: Vec<f64> = (0..n_samples)
        .map(|s| {
            tmm_factor(
                counts.column(s),
                lib_sizes[s],
                counts.column(ref_idx),
                lib_sizes[ref_idx],
            )
        })
        .collect();

    let log_mean = factors.iter().map(|f| f.ln()).sum::<f64>() / n_samples as f64;
    factors.iter().map(|f| f / log_mean.exp()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn lib_sizes(counts: &Array2<f64>) -> Vec<f64> {
        counts.sum_axis(Axis(0)).to_vec()
    }

    #[test]
    fn test_identical_columns_give_unit_factors() {
        let counts = array![[10.0, 10.0, 10.0], [50.0, 50.0, 50.0], [3.0, 3.0, 3.0]];
        let factors = tmm_factors(&counts, &lib_sizes(&counts));
        for f in factors {
            assert_relative_eq!(f, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_depth_alone_gives_unit_factors() {
        let counts = array![[10.0, 20.0], [50.0, 100.0], [3.0, 6.0], [7.0, 14.0]];
        let factors = tmm_factors(&counts, &lib_sizes(&counts));
        assert_relative_eq!(factors[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(factors[1], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_geometric_mean_is_one() {
        let counts = array![
            [10.0, 25.0, 7.0],
            [50.0, 40.0, 61.0],
            [3.0, 9.0, 1.0],
            [120.0, 80.0, 200.0],
            [15.0, 13.0, 22.0],
            [0.0, 4.0, 2.0]
        ];
        let factors = tmm_factors(&counts, &lib_sizes(&counts));
        let log_sum: f64 = factors.iter().map(|f| f.ln()).sum();
        assert_relative_eq!(log_sum, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_composition_shift_is_corrected() {
        // one gene takes over most of sample 2's library
        let mut counts = Array2::<f64>::zeros((21, 2));
        for g in 0..20 {
            counts[[g, 0]] = 100.0;
            counts[[g, 1]] = 100.0;
        }
        counts[[20, 0]] = 100.0;
        counts[[20, 1]] = 2100.0;
        let factors = tmm_factors(&counts, &lib_sizes(&counts));
        // effective library ratio should match the unchanged genes
        let eff0 = 2100.0 * factors[0];
        let eff1 = 4100.0 * factors[1];
        assert_relative_eq!(eff1 / eff0, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_reference_sample() {
        let counts = array![[10.0, 5.0, 0.0], [20.0, 15.0, 10.0], [30.0, 35.0, 40.0], [40.0, 45.0, 50.0]];
        let lib = lib_sizes(&counts);
        assert_eq!(reference_sample(&counts, &lib), 1);
    }
}
