//! Per-cluster preparation for testing: zero-gene filtering, normalisation factors,
//! abundance and NB dispersions.

use crate::aggregate::{Aggregation, PseudobulkMatrix};
use crate::design::ExperimentDesign;
use crate::error::{PseudobulkError, Result};
use crate::grouping::LabelOrder;
use crate::testing::effect::ave_log_cpm;
use crate::testing::glm::IrlsParams;
use crate::testing::utils::to_dmatrix;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

pub mod dispersion;
pub mod tmm;

pub use dispersion::{DispersionGrid, Dispersions};

/// Library-size normalisation applied before dispersion estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NormMethod {
    /// Trimmed mean of M-values.
    #[default]
    Tmm,
    /// Raw library sizes.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub norm_method: NormMethod,
    /// Prior degrees of freedom for tagwise dispersion shrinkage.
    pub prior_df: f64,
    pub grid: DispersionGrid,
    /// Prior count of the average log-CPM abundance.
    pub abundance_prior_count: f64,
    pub irls: IrlsParams,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        NormalizerConfig {
            norm_method: NormMethod::Tmm,
            prior_df: 10.0,
            grid: DispersionGrid::default(),
            abundance_prior_count: 2.0,
            irls: IrlsParams::default(),
        }
    }
}

impl NormalizerConfig {
    pub fn with_norm_method(mut self, norm_method: NormMethod) -> Self {
        self.norm_method = norm_method;
        self
    }

    pub fn with_prior_df(mut self, prior_df: f64) -> Self {
        self.prior_df = prior_df;
        self
    }

    pub fn with_grid(mut self, grid: DispersionGrid) -> Self {
        self.grid = grid;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.prior_df.is_nan() || self.prior_df < 0.0 {
            return Err(PseudobulkError::InvalidConfig(format!(
                "prior_df must be non-negative, got {}",
                self.prior_df
            )));
        }
        let grid = &self.grid;
        let range_ok = grid.upper > grid.lower && grid.base > 0.0 && grid.base.is_finite();
        if grid.length < 3 || !range_ok {
            return Err(PseudobulkError::InvalidConfig(
                "dispersion grid needs at least 3 points over a non-empty positive range".to_string(),
            ));
        }
        if self.abundance_prior_count.is_nan() || self.abundance_prior_count < 0.0 {
            return Err(PseudobulkError::InvalidConfig(format!(
                "abundance_prior_count must be non-negative, got {}",
                self.abundance_prior_count
            )));
        }
        if self.irls.max_iter == 0 || self.irls.tolerance.is_nan() || self.irls.tolerance <= 0.0 {
            return Err(PseudobulkError::InvalidConfig(
                "IRLS needs at least one iteration and a positive tolerance".to_string(),
            ));
        }
        Ok(())
    }
}

/// A cluster's pseudobulk counts restricted to testable genes and samples, with
/// everything the tester needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedCluster {
    pub cluster: String,
    /// Genes with a positive total count, in input order.
    pub genes: Vec<String>,
    /// Row of every kept gene in the input matrix.
    pub gene_rows: Vec<usize>,
    /// Genes dropped for having no counts in any sample.
    pub zero_genes: Vec<String>,
    /// Samples with a positive library size, in input order.
    pub samples: LabelOrder,
    /// Kept genes × kept samples.
    pub counts: Array2<f64>,
    pub lib_sizes: Vec<f64>,
    pub norm_factors: Vec<f64>,
    pub ave_log_cpm: Vec<f64>,
    pub dispersions: Dispersions,
    /// Design restricted to the kept samples.
    pub design: ExperimentDesign,
}

impl NormalizedCluster {
    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn effective_lib_sizes(&self) -> Vec<f64> {
        self.lib_sizes
            .iter()
            .zip(self.norm_factors.iter())
            .map(|(l, f)| l * f)
            .collect()
    }

    /// GLM offsets: log effective library sizes.
    pub fn offsets(&self) -> Vec<f64> {
        self.effective_lib_sizes().iter().map(|l| l.ln()).collect()
    }

    pub fn residual_df(&self) -> usize {
        self.design.n_samples() - self.design.n_coefficients()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispersionNormalizer {
    config: NormalizerConfig,
}

impl DispersionNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        DispersionNormalizer { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalise one cluster's pseudobulk sums against the global design.
    ///
    /// The design rows must follow the matrix's sample order. Samples with zero library
    /// size are dropped first; fewer than two remaining samples or no residual degrees
    /// of freedom is `InsufficientSamples`, and a design that loses rank on the
    /// remaining samples is `DesignDegenerate`.
    pub fn run(&self, sums: &PseudobulkMatrix, design: &ExperimentDesign) -> Result<NormalizedCluster> {
        if sums.aggregation != Aggregation::Sum {
            return Err(PseudobulkError::DimensionMismatch(format!(
                "cluster '{}': dispersion estimation needs summed counts",
                sums.cluster
            )));
        }
        if design.samples.as_slice() != sums.samples.labels() {
            return Err(PseudobulkError::DimensionMismatch(format!(
                "cluster '{}': design rows do not follow the pseudobulk sample order",
                sums.cluster
            )));
        }

        let cluster = sums.cluster.as_str();
        let lib_all = sums.library_sizes();
        let kept_samples: Vec<usize> = (0..sums.n_samples()).filter(|&s| lib_all[s] > 0.0).collect();
        if kept_samples.len() < 2 {
            return Err(PseudobulkError::InsufficientSamples {
                cluster: cluster.to_string(),
                usable: kept_samples.len(),
                required: 2,
            });
        }
        let design = design.subset(&kept_samples).map_err(|e| e.in_cluster(cluster))?;
        if design.n_samples() <= design.n_coefficients() {
            return Err(PseudobulkError::InsufficientSamples {
                cluster: cluster.to_string(),
                usable: design.n_samples(),
                required: design.n_coefficients() + 1,
            });
        }

        let kept = sums.subset_samples(&kept_samples)?;
        let values = &kept.values;
        let (gene_rows, zero_rows): (Vec<usize>, Vec<usize>) =
            (0..sums.n_genes()).partition(|&g| values.row(g).sum() > 0.0);
        let counts = values.select(Axis(0), &gene_rows);
        let lib_sizes: Vec<f64> = kept_samples.iter().map(|&s| lib_all[s]).collect();

        let norm_factors = match self.config.norm_method {
            NormMethod::Tmm => tmm::tmm_factors(&counts, &lib_sizes),
            NormMethod::None => vec![1.0; lib_sizes.len()],
        };
        let effective: Vec<f64> = lib_sizes
            .iter()
            .zip(norm_factors.iter())
            .map(|(l, f)| l * f)
            .collect();
        let offset: Vec<f64> = effective.iter().map(|l| l.ln()).collect();

        let abundance = ave_log_cpm(&counts, &effective, self.config.abundance_prior_count);
        let residual_df = (design.n_samples() - design.n_coefficients()) as f64;
        let dispersions = dispersion::estimate_dispersions(
            &counts,
            &to_dmatrix(&design.matrix),
            &offset,
            &abundance,
            residual_df,
            self.config.prior_df,
            &self.config.grid,
            &self.config.irls,
        );

        log::debug!(
            "cluster '{}': {} genes kept, {} zero genes, {} of {} samples, factors {:?}",
            cluster,
            gene_rows.len(),
            zero_rows.len(),
            kept_samples.len(),
            sums.n_samples(),
            norm_factors
        );

        Ok(NormalizedCluster {
            cluster: cluster.to_string(),
            genes: gene_rows.iter().map(|&g| sums.genes[g].clone()).collect(),
            zero_genes: zero_rows.iter().map(|&g| sums.genes[g].clone()).collect(),
            gene_rows,
            samples: kept.samples.clone(),
            counts,
            lib_sizes,
            norm_factors,
            ave_log_cpm: abundance,
            dispersions,
            design,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Comparison;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn sums(values: Array2<f64>, samples: &[&str]) -> PseudobulkMatrix {
        let n_genes = values.nrows();
        PseudobulkMatrix {
            cluster: "T".to_string(),
            genes: (0..n_genes).map(|g| format!("g{}", g)).collect(),
            samples: LabelOrder::new(labels(samples)).unwrap(),
            aggregation: Aggregation::Sum,
            n_cells: vec![5; values.ncols()],
            values,
        }
    }

    fn design(samples: &[&str], groups: &[&str]) -> ExperimentDesign {
        ExperimentDesign::one_hot(&labels(samples), &labels(groups), &Comparison::new("b", "a"))
            .unwrap()
    }

    #[test]
    fn test_zero_genes_and_empty_samples_are_dropped() {
        let values = array![
            [10.0, 12.0, 0.0, 30.0, 28.0],
            [0.0, 0.0, 0.0, 0.0, 0.0],
            [50.0, 45.0, 0.0, 52.0, 60.0],
            [5.0, 7.0, 0.0, 6.0, 4.0]
        ];
        let samples = ["s1", "s2", "s3", "s4", "s5"];
        let d = design(&samples, &["a", "a", "a", "b", "b"]);
        let out = DispersionNormalizer::default().run(&sums(values, &samples), &d).unwrap();
        assert_eq!(out.genes, vec!["g0", "g2", "g3"]);
        assert_eq!(out.zero_genes, vec!["g1"]);
        assert_eq!(out.samples.labels(), &["s1", "s2", "s4", "s5"]);
        assert_eq!(out.design.n_samples(), 4);
        assert_eq!(out.residual_df(), 2);
        assert_eq!(out.dispersions.tagwise.len(), 3);
        let log_sum: f64 = out.norm_factors.iter().map(|f| f.ln()).sum();
        assert_relative_eq!(log_sum, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_insufficient_samples() {
        let values = array![[10.0, 0.0, 0.0], [3.0, 0.0, 0.0]];
        let samples = ["s1", "s2", "s3"];
        let d = design(&samples, &["a", "b", "b"]);
        let err = DispersionNormalizer::default().run(&sums(values, &samples), &d).unwrap_err();
        assert!(matches!(
            err,
            PseudobulkError::InsufficientSamples { usable: 1, required: 2, .. }
        ));
    }

    #[test]
    fn test_group_lost_to_empty_samples_is_degenerate() {
        let values = array![[10.0, 11.0, 0.0], [3.0, 4.0, 0.0]];
        let samples = ["s1", "s2", "s3"];
        let d = design(&samples, &["a", "a", "b"]);
        let err = DispersionNormalizer::default().run(&sums(values, &samples), &d).unwrap_err();
        match err {
            PseudobulkError::DesignDegenerate { cluster, .. } => assert_eq!(cluster, "T"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_no_residual_df() {
        let values = array![[10.0, 20.0], [3.0, 4.0]];
        let samples = ["s1", "s2"];
        let d = design(&samples, &["a", "b"]);
        let err = DispersionNormalizer::default().run(&sums(values, &samples), &d).unwrap_err();
        assert!(matches!(
            err,
            PseudobulkError::InsufficientSamples { usable: 2, required: 3, .. }
        ));
    }

    #[test]
    fn test_no_normalisation() {
        let values = array![[10.0, 20.0, 30.0, 5.0], [3.0, 4.0, 1.0, 9.0]];
        let samples = ["s1", "s2", "s3", "s4"];
        let d = design(&samples, &["a", "a", "b", "b"]);
        let normalizer =
            DispersionNormalizer::new(NormalizerConfig::default().with_norm_method(NormMethod::None));
        let out = normalizer.run(&sums(values, &samples), &d).unwrap();
        assert_eq!(out.norm_factors, vec![1.0; 4]);
        assert_eq!(out.effective_lib_sizes(), vec![13.0, 24.0, 31.0, 14.0]);
    }

    #[test]
    fn test_invalid_config() {
        let config = NormalizerConfig::default().with_prior_df(-1.0);
        assert!(matches!(config.validate(), Err(PseudobulkError::InvalidConfig(_))));
        assert!(NormalizerConfig::default().validate().is_ok());
    }
}
