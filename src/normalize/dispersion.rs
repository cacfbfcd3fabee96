//! Negative-binomial dispersion estimation by weighted likelihood on a grid.
//!
//! The Cox-Reid adjusted profile likelihood of every gene is evaluated on a fixed grid
//! of log2-spaced dispersions. Summing over genes gives the common dispersion, a moving
//! average over abundance-ordered genes gives the trend, and adding the trend to each
//! gene's own likelihood with weight `prior_n` gives the tagwise (shrunken) values.

use crate::testing::glm::{IrlsParams, adjusted_profile_likelihood};
use nalgebra::DMatrix;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Dispersion estimates for the genes of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispersions {
    pub common: f64,
    pub trended: Vec<f64>,
    pub tagwise: Vec<f64>,
}

/// Grid of dispersion values, `base * 2^p` for `length` points `p` evenly spaced on
/// `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispersionGrid {
    pub base: f64,
    pub lower: f64,
    pub upper: f64,
    pub length: usize,
}

impl Default for DispersionGrid {
    fn default() -> Self {
        DispersionGrid {
            base: 0.1,
            lower: -10.0,
            upper: 10.0,
            length: 11,
        }
    }
}

impl DispersionGrid {
    /// Grid positions on the log2 scale.
    pub fn points(&self) -> Vec<f64> {
        if self.length < 2 {
            return vec![self.lower];
        }
        let step = (self.upper - self.lower) / (self.length - 1) as f64;
        (0..self.length).map(|i| self.lower + step * i as f64).collect()
    }

    pub fn dispersion_at(&self, point: f64) -> f64 {
        self.base * point.exp2()
    }
}

/// Span of the moving-average trend for `n_genes` genes.
pub fn trend_span(n_genes: usize) -> f64 {
    if n_genes <= 50 {
        1.0
    } else {
        0.25 + 0.75 * (50.0 / n_genes as f64).sqrt()
    }
}

/// Adjusted profile log-likelihoods, genes × grid points.
pub fn profile_likelihood_grid(
    counts: &Array2<f64>,
    design: &DMatrix<f64>,
    offset: &[f64],
    grid: &DispersionGrid,
    params: &IrlsParams,
) -> Array2<f64> {
    let dispersions: Vec<f64> = grid
        .points()
        .iter()
        .map(|&p| grid.dispersion_at(p))
        .collect();

    let rows: Vec<Vec<f64>> = (0..counts.nrows())
        .into_par_iter()
        .map(|g| {
            let y = counts.row(g).to_vec();
            let mut apl: Vec<f64> = dispersions
                .iter()
                .map(|&d| adjusted_profile_likelihood(&y, design, offset, d, params).unwrap_or(f64::NAN))
                .collect();
            fill_failed_points(&mut apl);
            apl
        })
        .collect();

    let mut out = Array2::zeros((rows.len(), dispersions.len()));
    for (g, row) in rows.iter().enumerate() {
        for (k, &v) in row.iter().enumerate() {
            out[[g, k]] = v;
        }
    }
    out
}

/// Grid points where the fit failed take the gene's lowest likelihood, so they never
/// win the maximisation. A gene with no usable point gets a flat profile.
fn fill_failed_points(apl: &mut [f64]) {
    let worst = apl
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::INFINITY, f64::min);
    let fill = if worst.is_finite() { worst } else { 0.0 };
    for v in apl.iter_mut() {
        if !v.is_finite() {
            *v = fill;
        }
    }
}

/// Centred moving average down the rows of `x` with window `width`, shrinking the
/// window at both ends.
pub fn moving_average_by_col(x: &Array2<f64>, width: usize) -> Array2<f64> {
    let n = x.nrows();
    let width = width.min(n);
    if width <= 1 {
        return x.clone();
    }
    let half1 = width.div_ceil(2);
    let half2 = width / 2;

    let mut out = Array2::zeros(x.dim());
    for (k, col) in x.columns().into_iter().enumerate() {
        let mut cumsum = vec![0.0; n + 1];
        for (i, &v) in col.iter().enumerate() {
            cumsum[i + 1] = cumsum[i] + v;
        }
        for i in 0..n {
            let lower = (i + 1).saturating_sub(half1);
            let upper = (i + half2 + 1).min(n);
            out[[i, k]] = (cumsum[upper] - cumsum[lower]) / (upper - lower) as f64;
        }
    }
    out
}

/// Location of the maximum of `y` over equally spaced `x`, refined by the parabola
/// through the best point and its two neighbours.
pub fn maximize_interpolant(x: &[f64], y: &[f64]) -> f64 {
    let best = y
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);

    if best == 0 || best + 1 >= y.len() {
        return x[best];
    }

    let (y0, y1, y2) = (y[best - 1], y[best], y[best + 1]);
    let curvature = y0 - 2.0 * y1 + y2;
    if curvature >= 0.0 {
        return x[best];
    }
    let h = x[best + 1] - x[best];
    let shift = (h * (y0 - y2) / (2.0 * curvature)).clamp(-h, h);
    x[best] + shift
}

/// Estimate common, trended and tagwise dispersions.
///
/// `abundance` orders the genes for the trend; `residual_df` must be positive.
#[allow(clippy::too_many_arguments)]
pub fn estimate_dispersions(
    counts: &Array2<f64>,
    design: &DMatrix<f64>,
    offset: &[f64],
    abundance: &[f64],
    residual_df: f64,
    prior_df: f64,
    grid: &DispersionGrid,
    params: &IrlsParams,
) -> Dispersions {
    let n_genes = counts.nrows();
    let points = grid.points();
    let apl = profile_likelihood_grid(counts, design, offset, grid, params);

    let summed: Vec<f64> = apl.columns().into_iter().map(|c| c.sum()).collect();
    let common = grid.dispersion_at(maximize_interpolant(&points, &summed));

    let mut order: Vec<usize> = (0..n_genes).collect();
    order.sort_by(|&a, &b| abundance[a].partial_cmp(&abundance[b]).unwrap_or(Ordering::Equal));
    let sorted = apl.select(ndarray::Axis(0), &order);
    let width = ((trend_span(n_genes) * n_genes as f64).floor() as usize).max(1);
    let smoothed_sorted = moving_average_by_col(&sorted, width);
    let mut trend_apl = Array2::zeros(apl.dim());
    for (rank, &g) in order.iter().enumerate() {
        trend_apl.row_mut(g).assign(&smoothed_sorted.row(rank));
    }

    let prior_n = prior_df / residual_df;
    let (trended, tagwise): (Vec<f64>, Vec<f64>) = (0..n_genes)
        .map(|g| {
            let m0 = trend_apl.row(g).to_vec();
            let trended = grid.dispersion_at(maximize_interpolant(&points, &m0));
            let shrunk: Vec<f64> = apl
                .row(g)
                .iter()
                .zip(m0.iter())
                .map(|(l, m)| l + prior_n * m)
                .collect();
            let tagwise = grid.dispersion_at(maximize_interpolant(&points, &shrunk));
            (trended, tagwise)
        })
        .unzip();

    log::debug!(
        "common dispersion {:.4} over {} genes (prior_n {:.2})",
        common,
        n_genes,
        prior_n
    );

    Dispersions {
        common,
        trended,
        tagwise,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_default_grid() {
        let grid = DispersionGrid::default();
        let points = grid.points();
        assert_eq!(points.len(), 11);
        assert_relative_eq!(points[0], -10.0);
        assert_relative_eq!(points[5], 0.0);
        assert_relative_eq!(grid.dispersion_at(points[5]), 0.1);
    }

    #[test]
    fn test_trend_span() {
        assert_relative_eq!(trend_span(20), 1.0);
        assert_relative_eq!(trend_span(200), 0.25 + 0.75 * 0.5);
    }

    #[test]
    fn test_moving_average_shrinks_at_edges() {
        let x = array![[1.0], [2.0], [3.0], [4.0], [5.0]];
        let avg = moving_average_by_col(&x, 3);
        assert_relative_eq!(avg[[0, 0]], 1.5);
        assert_relative_eq!(avg[[2, 0]], 3.0);
        assert_relative_eq!(avg[[4, 0]], 4.5);
        assert_eq!(moving_average_by_col(&x, 1), x);
    }

    #[test]
    fn test_maximize_interpolant_parabola() {
        let x = [0.0, 1.0, 2.0, 3.0];
        // y = -(x - 1.3)^2
        let y: Vec<f64> = x.iter().map(|v: &f64| -(v - 1.3).powi(2)).collect();
        assert_relative_eq!(maximize_interpolant(&x, &y), 1.3, epsilon = 1e-12);
        // maximum at the boundary is not extrapolated
        assert_relative_eq!(maximize_interpolant(&x, &[4.0, 3.0, 2.0, 1.0]), 0.0);
    }

    #[test]
    fn test_overdispersed_counts_raise_dispersion() {
        let design = DMatrix::from_element(6, 1, 1.0);
        let offset = vec![0.0; 6];
        let flat = array![[100.0, 101.0, 99.0, 100.0, 102.0, 98.0]];
        let wild = array![[10.0, 300.0, 40.0, 5.0, 250.0, 60.0]];
        let params = IrlsParams::default();
        let grid = DispersionGrid::default();
        let a = estimate_dispersions(&flat, &design, &offset, &[1.0], 5.0, 10.0, &grid, &params);
        let b = estimate_dispersions(&wild, &design, &offset, &[1.0], 5.0, 10.0, &grid, &params);
        assert!(b.common > a.common);
        assert!(b.common > 0.1);
        assert_eq!(a.trended.len(), 1);
        assert_eq!(b.tagwise.len(), 1);
    }
}
