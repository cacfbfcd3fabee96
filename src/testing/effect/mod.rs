//! Abundance and effect-size helpers on pseudobulk counts.

use ndarray::Array2;

/// Prior count per sample, scaled by the sample's library size relative to the mean
/// library size.
pub fn scaled_prior_counts(lib_sizes: &[f64], prior_count: f64) -> Vec<f64> {
    if lib_sizes.is_empty() {
        return Vec::new();
    }
    let mean_lib = lib_sizes.iter().sum::<f64>() / lib_sizes.len() as f64;
    lib_sizes
        .iter()
        .map(|&l| {
            if mean_lib > 0.0 {
                prior_count * l / mean_lib
            } else {
                prior_count
            }
        })
        .collect()
}

/// Average log2-CPM of every gene, pooled over samples.
pub fn ave_log_cpm(counts: &Array2<f64>, lib_sizes: &[f64], prior_count: f64) -> Vec<f64> {
    let priors = scaled_prior_counts(lib_sizes, prior_count);
    let total_lib: f64 = lib_sizes
        .iter()
        .zip(priors.iter())
        .map(|(l, p)| l + 2.0 * p)
        .sum();
    counts
        .rows()
        .into_iter()
        .map(|row| {
            let total: f64 = row.iter().zip(priors.iter()).map(|(y, p)| y + p).sum();
            (total / total_lib * 1e6).log2()
        })
        .collect()
}

/// Counts with the scaled prior added, and the matching library sizes, used to
/// stabilise fold changes of genes with zero counts in a group.
pub fn add_prior_count(
    counts: &[f64],
    lib_sizes: &[f64],
    prior_count: f64,
) -> (Vec<f64>, Vec<f64>) {
    let priors = scaled_prior_counts(lib_sizes, prior_count);
    let y = counts.iter().zip(priors.iter()).map(|(c, p)| c + p).collect();
    let libs = lib_sizes
        .iter()
        .zip(priors.iter())
        .map(|(l, p)| l + 2.0 * p)
        .collect();
    (y, libs)
}
