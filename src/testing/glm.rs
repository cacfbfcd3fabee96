//! Negative-binomial GLM with log link fitted by iteratively reweighted least squares.

use crate::testing::utils::{floored_log_det_xtwx, weighted_least_squares};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

/// Lower bound on fitted means when forming weights and working responses.
pub const MIN_MU: f64 = 1e-10;

/// Below this dispersion the Poisson limit of the likelihood is used.
const POISSON_DISPERSION: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrlsParams {
    pub max_iter: usize,
    /// Relative change in deviance at which the fit is considered converged.
    pub tolerance: f64,
    pub max_step_halving: usize,
}

impl Default for IrlsParams {
    fn default() -> Self {
        IrlsParams {
            max_iter: 50,
            tolerance: 1e-8,
            max_step_halving: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FitFailure {
    #[error("weighted normal equations are singular")]
    Singular,
    #[error("non-finite deviance")]
    NonFinite,
    #[error("no convergence within the iteration limit")]
    MaxIterations,
}

#[derive(Debug, Clone)]
pub struct GlmFit {
    /// Coefficients on the natural log scale.
    pub coefficients: Vec<f64>,
    pub fitted: Vec<f64>,
    pub deviance: f64,
    pub iterations: usize,
}

/// Unit deviance summed over observations.
pub fn nb_deviance(y: &[f64], mu: &[f64], dispersion: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&y, &mu)| {
            let mu = mu.max(MIN_MU);
            if dispersion < POISSON_DISPERSION {
                let ylogy = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
                2.0 * (ylogy - (y - mu))
            } else {
                let r = 1.0 / dispersion;
                let ylogy = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
                2.0 * (ylogy - (y + r) * ((1.0 + dispersion * y) / (1.0 + dispersion * mu)).ln())
            }
        })
        .map(|d| d.max(0.0))
        .sum()
}

/// Log-likelihood of the counts under NB(mu, dispersion).
pub fn nb_log_likelihood(y: &[f64], mu: &[f64], dispersion: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&y, &mu)| {
            let mu = mu.max(MIN_MU);
            if dispersion < POISSON_DISPERSION {
                y * mu.ln() - mu - ln_gamma(y + 1.0)
            } else {
                let r = 1.0 / dispersion;
                ln_gamma(y + r) - ln_gamma(r) - ln_gamma(y + 1.0)
                    + r * (r / (r + mu)).ln()
                    + y * (mu / (r + mu)).ln()
            }
        })
        .sum()
}

fn linear_predictor(x: &DMatrix<f64>, beta: &[f64], offset: &[f64]) -> Vec<f64> {
    (0..x.nrows())
        .map(|i| offset[i] + (0..x.ncols()).map(|j| x[(i, j)] * beta[j]).sum::<f64>())
        .collect()
}

fn means_from(eta: &[f64]) -> Vec<f64> {
    eta.iter().map(|&e| e.exp().max(MIN_MU)).collect()
}

/// Fit a NB GLM with fixed dispersion and a per-observation log offset.
///
/// `start` gives initial coefficients; without it the fit starts from `mu = y + 0.1`.
/// Step halving is applied whenever an update increases the deviance.
pub fn fit_nb_glm(
    y: &[f64],
    x: &DMatrix<f64>,
    offset: &[f64],
    dispersion: f64,
    start: Option<&[f64]>,
    params: &IrlsParams,
) -> Result<GlmFit, FitFailure> {
    let n = y.len();
    let p = x.ncols();

    if p == 0 {
        let mu = means_from(offset);
        let deviance = nb_deviance(y, &mu, dispersion);
        if !deviance.is_finite() {
            return Err(FitFailure::NonFinite);
        }
        return Ok(GlmFit {
            coefficients: Vec::new(),
            fitted: mu,
            deviance,
            iterations: 0,
        });
    }

    let (mut beta, mut eta, mut mu): (Option<Vec<f64>>, Vec<f64>, Vec<f64>) = match start {
        Some(b) => {
            let eta = linear_predictor(x, b, offset);
            let mu = means_from(&eta);
            (Some(b.to_vec()), eta, mu)
        }
        None => {
            let mu: Vec<f64> = y.iter().map(|&v| v + 0.1).collect();
            let eta = mu.iter().map(|m| m.ln()).collect();
            (None, eta, mu)
        }
    };
    let mut deviance = nb_deviance(y, &mu, dispersion);

    for iter in 1..=params.max_iter {
        let mut w = vec![0.0; n];
        let mut z = vec![0.0; n];
        for i in 0..n {
            let m = mu[i].max(MIN_MU);
            w[i] = m / (1.0 + dispersion * m);
            z[i] = eta[i] - offset[i] + (y[i] - m) / m;
        }

        let mut candidate = weighted_least_squares(x, &w, &z).ok_or(FitFailure::Singular)?;
        let mut new_eta = linear_predictor(x, &candidate, offset);
        let mut new_mu = means_from(&new_eta);
        let mut new_deviance = nb_deviance(y, &new_mu, dispersion);

        if let Some(prev) = &beta {
            let mut halvings = 0;
            while !(new_deviance <= deviance * (1.0 + 1e-10) + 1e-12)
                && halvings < params.max_step_halving
            {
                for (c, b) in candidate.iter_mut().zip(prev.iter()) {
                    *c = 0.5 * (*c + b);
                }
                new_eta = linear_predictor(x, &candidate, offset);
                new_mu = means_from(&new_eta);
                new_deviance = nb_deviance(y, &new_mu, dispersion);
                halvings += 1;
            }
        }

        if !new_deviance.is_finite() || candidate.iter().any(|b| !b.is_finite()) {
            return Err(FitFailure::NonFinite);
        }

        let converged = (new_deviance - deviance).abs() / (new_deviance.abs() + 0.1) < params.tolerance;
        beta = Some(candidate);
        eta = new_eta;
        mu = new_mu;
        deviance = new_deviance;

        if converged {
            return Ok(GlmFit {
                coefficients: beta.unwrap_or_default(),
                fitted: mu,
                deviance,
                iterations: iter,
            });
        }
    }

    Err(FitFailure::MaxIterations)
}

/// Cox-Reid adjusted profile log-likelihood at a given dispersion.
pub fn adjusted_profile_likelihood(
    y: &[f64],
    x: &DMatrix<f64>,
    offset: &[f64],
    dispersion: f64,
    params: &IrlsParams,
) -> Result<f64, FitFailure> {
    let fit = fit_nb_glm(y, x, offset, dispersion, None, params)?;
    let loglik = nb_log_likelihood(y, &fit.fitted, dispersion);
    let w: Vec<f64> = fit
        .fitted
        .iter()
        .map(|&m| m / (1.0 + dispersion * m))
        .collect();
    Ok(loglik - 0.5 * floored_log_det_xtwx(x, &w))
}

/// Residual degrees of freedom, discounting observations fitted exactly at zero.
pub fn residual_df(y: &[f64], fitted: &[f64], x: &DMatrix<f64>) -> f64 {
    const ZERO_FIT: f64 = 1e-4;
    let nonzero: Vec<usize> = (0..y.len())
        .filter(|&i| !(y[i] < ZERO_FIT && fitted[i] < ZERO_FIT))
        .collect();
    if nonzero.len() == y.len() {
        return (y.len() as f64 - x.ncols() as f64).max(0.0);
    }
    if nonzero.is_empty() {
        return 0.0;
    }
    let sub = ndarray::Array2::from_shape_fn((nonzero.len(), x.ncols()), |(i, j)| x[(nonzero[i], j)]);
    let rank = crate::design::matrix_rank(&sub);
    (nonzero.len() as f64 - rank as f64).max(0.0)
}

/// Design of the null model: the design re-expressed in an orthonormal basis whose
/// first direction is the contrast, with that direction removed.
pub fn null_design(x: &DMatrix<f64>, contrast: &[f64]) -> DMatrix<f64> {
    let p = x.ncols();
    let norm = contrast.iter().map(|c| c * c).sum::<f64>().sqrt();
    let mut basis: Vec<Vec<f64>> = vec![contrast.iter().map(|c| c / norm).collect()];

    for k in 0..p {
        if basis.len() == p {
            break;
        }
        let mut v = vec![0.0; p];
        v[k] = 1.0;
        for b in &basis {
            let dot: f64 = v.iter().zip(b.iter()).map(|(a, c)| a * c).sum();
            for (vi, bi) in v.iter_mut().zip(b.iter()) {
                *vi -= dot * bi;
            }
        }
        let len = v.iter().map(|a| a * a).sum::<f64>().sqrt();
        if len > 1e-8 {
            basis.push(v.into_iter().map(|a| a / len).collect());
        }
    }

    let q = DMatrix::from_fn(p, basis.len() - 1, |i, j| basis[j + 1][i]);
    x * q
}
