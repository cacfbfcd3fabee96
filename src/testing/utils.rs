use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use std::cmp::Ordering;

/// Convert an ndarray design to nalgebra for the dense solves.
pub fn to_dmatrix(matrix: &Array2<f64>) -> DMatrix<f64> {
    let (n, p) = matrix.dim();
    DMatrix::from_fn(n, p, |i, j| matrix[[i, j]])
}

/// Solve the weighted normal equations `X'WX b = X'Wz` by Cholesky.
pub fn weighted_least_squares(x: &DMatrix<f64>, w: &[f64], z: &[f64]) -> Option<Vec<f64>> {
    let p = x.ncols();
    let mut xtwx = DMatrix::<f64>::zeros(p, p);
    let mut xtwz = DVector::<f64>::zeros(p);
    for i in 0..x.nrows() {
        for a in 0..p {
            let xa = x[(i, a)] * w[i];
            if xa == 0.0 {
                continue;
            }
            xtwz[a] += xa * z[i];
            for b in 0..p {
                xtwx[(a, b)] += xa * x[(i, b)];
            }
        }
    }
    let chol = xtwx.cholesky()?;
    let beta = chol.solve(&xtwz);
    if beta.iter().all(|b| b.is_finite()) {
        Some(beta.iter().copied().collect())
    } else {
        None
    }
}

/// Log-determinant of `X'WX` from an LDL' factorisation whose pivots are floored at
/// `1e-10`, so that all-zero groups do not send the Cox-Reid term to infinity.
pub fn floored_log_det_xtwx(x: &DMatrix<f64>, w: &[f64]) -> f64 {
    const LOW_VALUE: f64 = 1e-10;
    let p = x.ncols();
    let mut a = vec![vec![0.0; p]; p];
    for i in 0..x.nrows() {
        for r in 0..p {
            for c in 0..=r {
                a[r][c] += x[(i, r)] * w[i] * x[(i, c)];
            }
        }
    }

    let mut l = vec![vec![0.0; p]; p];
    let mut d = vec![0.0; p];
    let mut log_det = 0.0;
    for j in 0..p {
        let mut dj = a[j][j];
        for k in 0..j {
            dj -= l[j][k] * l[j][k] * d[k];
        }
        if dj < LOW_VALUE {
            dj = LOW_VALUE;
        }
        d[j] = dj;
        log_det += dj.ln();
        for i in (j + 1)..p {
            let mut v = a[i][j];
            for k in 0..j {
                v -= l[i][k] * l[j][k] * d[k];
            }
            l[i][j] = v / dj;
        }
    }
    log_det
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Sample quantile with linear interpolation between order statistics.
pub fn quantile(values: &[f64], prob: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let h = (sorted.len() - 1) as f64 * prob;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// 1-based ranks with ties given their average rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Trigamma function, by recurrence up to x >= 10 and the asymptotic series.
pub fn trigamma(x: f64) -> f64 {
    if x <= 0.0 && x == x.floor() {
        return f64::INFINITY;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 10.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc + 1.0 / x
        + x2 / 2.0
        + x2 / x * (1.0 / 6.0 - x2 * (1.0 / 30.0 - x2 * (1.0 / 42.0 - x2 / 30.0)))
}

/// Tetragamma (second derivative of digamma).
pub fn tetragamma(x: f64) -> f64 {
    let mut x = x;
    let mut acc = 0.0;
    while x < 10.0 {
        acc -= 2.0 / (x * x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc - x2
        - x2 / x
        - x2 * x2 * (0.5 - x2 * (1.0 / 6.0 - x2 * (1.0 / 6.0 - x2 * 3.0 / 10.0)))
}

/// Inverse of the trigamma function by Newton iteration.
pub fn trigamma_inverse(x: f64) -> f64 {
    if !x.is_finite() || x <= 0.0 {
        return f64::NAN;
    }
    if x > 1e7 {
        return 1.0 / x.sqrt();
    }
    if x < 1e-6 {
        return 1.0 / x;
    }
    let mut y = 0.5 + 1.0 / x;
    for _ in 0..50 {
        let tri = trigamma(y);
        let dif = tri * (1.0 - tri / x) / tetragamma(y);
        y += dif;
        if -dif / y < 1e-8 {
            break;
        }
    }
    y
}
