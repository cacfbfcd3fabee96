//! Empirical-Bayes moderation of quasi-likelihood dispersions.
//!
//! Gene-wise variances are modelled as scaled F-distributed around a prior that trends
//! with abundance; the posterior variance is a df-weighted compromise between the
//! gene's own estimate and the prior.

use crate::testing::utils::{median, to_dmatrix, trigamma, trigamma_inverse};
use ndarray::Array2;
use statrs::function::gamma::digamma;

#[derive(Debug, Clone)]
pub struct SqueezedVariances {
    /// Prior degrees of freedom; infinite when the variances show no excess spread.
    pub df_prior: f64,
    pub var_prior: Vec<f64>,
    pub var_post: Vec<f64>,
}

/// Number of trend basis columns for `n` usable variances.
fn trend_basis_size(n: usize, n_unique_covariate: usize) -> usize {
    let size = 1 + usize::from(n >= 3) + usize::from(n >= 6) + usize::from(n >= 30);
    size.min(n_unique_covariate)
}

/// Fit a scaled F-distribution to the variances `x` with `df1` degrees of freedom.
///
/// Returns the per-gene prior scale and the prior degrees of freedom.
pub fn fit_f_dist(x: &[f64], df1: &[f64], covariate: Option<&[f64]>) -> (Vec<f64>, f64) {
    let n_all = x.len();
    let ok: Vec<usize> = (0..n_all)
        .filter(|&i| df1[i].is_finite() && df1[i] > 1e-15 && x[i].is_finite())
        .collect();
    let n = ok.len();

    if n == 0 {
        return (vec![f64::NAN; n_all], 0.0);
    }
    if n == 1 {
        return (vec![x[ok[0]].max(0.0); n_all], 0.0);
    }

    let mut xs: Vec<f64> = ok.iter().map(|&i| x[i].max(0.0)).collect();
    let mut m = median(&xs);
    if m == 0.0 {
        log::warn!("more than half of the residual variances are exactly zero");
        m = 1.0;
    }
    for v in xs.iter_mut() {
        *v = v.max(1e-5 * m);
    }

    let d1: Vec<f64> = ok.iter().map(|&i| df1[i]).collect();
    let e: Vec<f64> = xs
        .iter()
        .zip(d1.iter())
        .map(|(&v, &d)| v.ln() - digamma(d / 2.0) + (d / 2.0).ln())
        .collect();

    let columns = covariate
        .map(|c| {
            let mut unique: Vec<f64> = ok.iter().map(|&i| c[i]).collect();
            unique.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            unique.dedup();
            trend_basis_size(n, unique.len())
        })
        .unwrap_or(1);

    let trended = covariate.is_some() && columns >= 2;
    let (emean, evar) = match covariate {
        Some(cov) if columns >= 2 => {
            let cov_ok: Vec<f64> = ok.iter().map(|&i| cov[i]).collect();
            let basis = to_dmatrix(&polynomial_basis(&cov_ok, &cov_ok, columns));
            let target = nalgebra::DVector::from_vec(e.clone());
            let coef = basis
                .clone()
                .svd(true, true)
                .solve(&target, 1e-12)
                .unwrap_or_else(|_| nalgebra::DVector::zeros(columns));

            // predict at every gene, including those without residual df
            let full_basis = to_dmatrix(&polynomial_basis(cov, &cov_ok, columns));
            let emean: Vec<f64> = (&full_basis * &coef).iter().copied().collect();
            let fitted = &basis * &coef;
            let rss: f64 = e.iter().zip(fitted.iter()).map(|(a, b)| (a - b).powi(2)).sum();
            (emean, rss / (n - columns) as f64)
        }
        _ => {
            let mean = e.iter().sum::<f64>() / n as f64;
            let var = e.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            (vec![mean; n_all], var)
        }
    };

    let mean_trigamma = d1.iter().map(|&d| trigamma(d / 2.0)).sum::<f64>() / n as f64;
    let excess = evar - mean_trigamma;

    if excess > 0.0 {
        let df2 = 2.0 * trigamma_inverse(excess);
        let shift = digamma(df2 / 2.0) - (df2 / 2.0).ln();
        (emean.iter().map(|&m| (m + shift).exp()).collect(), df2)
    } else if trended {
        (emean.iter().map(|&m| m.exp()).collect(), f64::INFINITY)
    } else {
        let mean_x = xs.iter().sum::<f64>() / n as f64;
        (vec![mean_x; n_all], f64::INFINITY)
    }
}

/// Polynomial basis on `covariate`, standardised with the moments of `reference` so
/// that predictions line up with the fitted basis.
fn polynomial_basis(covariate: &[f64], reference: &[f64], columns: usize) -> Array2<f64> {
    let n = reference.len() as f64;
    let mean = reference.iter().sum::<f64>() / n;
    let sd = (reference.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n).sqrt();
    let scale = if sd > 0.0 { sd } else { 1.0 };
    Array2::from_shape_fn((covariate.len(), columns), |(i, j)| {
        ((covariate[i] - mean) / scale).powi(j as i32)
    })
}

/// Shrink gene-wise variances towards the (trended) prior.
pub fn squeeze_var(var: &[f64], df: &[f64], covariate: Option<&[f64]>) -> SqueezedVariances {
    let (var_prior, df_prior) = fit_f_dist(var, df, covariate);

    let var_post = var
        .iter()
        .zip(df.iter())
        .zip(var_prior.iter())
        .map(|((&v, &d), &s0)| {
            if df_prior.is_infinite() {
                s0
            } else if df_prior <= 0.0 || !s0.is_finite() {
                v
            } else {
                let v = if v.is_finite() { v } else { 0.0 };
                (d * v + df_prior * s0) / (d + df_prior)
            }
        })
        .collect();

    SqueezedVariances {
        df_prior,
        var_prior,
        var_post,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identical_variances_give_infinite_prior_df() {
        let var = vec![0.8; 20];
        let df = vec![4.0; 20];
        let sq = squeeze_var(&var, &df, None);
        assert!(sq.df_prior.is_infinite());
        for &v in &sq.var_post {
            assert_relative_eq!(v, sq.var_prior[0], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_posterior_between_gene_and_prior() {
        let var = vec![0.1, 0.5, 1.0, 2.0, 8.0, 0.3, 1.5, 0.9, 3.0, 0.05];
        let df = vec![3.0; 10];
        let sq = squeeze_var(&var, &df, None);
        assert!(sq.df_prior.is_finite() && sq.df_prior > 0.0);
        for (i, &v) in var.iter().enumerate() {
            let s0 = sq.var_prior[i];
            let lo = v.min(s0);
            let hi = v.max(s0);
            assert!(sq.var_post[i] >= lo - 1e-12 && sq.var_post[i] <= hi + 1e-12);
        }
        // most extreme variance is pulled in the most
        assert!(sq.var_post[4] < 8.0);
    }

    #[test]
    fn test_trend_follows_covariate() {
        let covariate: Vec<f64> = (0..40).map(|i| i as f64 / 4.0).collect();
        let var: Vec<f64> = covariate
            .iter()
            .enumerate()
            .map(|(i, &c)| (1.0 - c / 12.0).max(0.05) * if i % 2 == 0 { 1.3 } else { 0.7 })
            .collect();
        let df = vec![4.0; 40];
        let sq = squeeze_var(&var, &df, Some(&covariate));
        assert!(sq.var_prior[0] > sq.var_prior[39]);
    }

    #[test]
    fn test_zero_df_genes_take_the_prior() {
        let var = vec![1.0, 2.0, 0.5, f64::NAN];
        let df = vec![2.0, 2.0, 2.0, 0.0];
        let sq = squeeze_var(&var, &df, None);
        assert!(sq.var_post[3].is_finite());
    }

    #[test]
    fn test_single_usable_variance() {
        let (scale, df2) = fit_f_dist(&[2.0, f64::NAN], &[3.0, 0.0], None);
        assert_relative_eq!(scale[0], 2.0);
        assert_eq!(df2, 0.0);
    }
}
