use crate::error::{PseudobulkError, Result};
use crate::normalize::NormalizedCluster;
use correction::Correction;
use glm::{FitFailure, IrlsParams, fit_nb_glm, null_design, residual_df};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use std::f64::consts::LN_2;

pub mod correction;
pub mod effect;
pub mod glm;
pub mod quasi;

pub mod utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TestMethod {
    /// Quasi-likelihood F-test with empirical-Bayes moderated quasi-dispersions.
    #[default]
    QuasiLikelihood,
    /// Likelihood ratio test on the NB deviance, chi-squared with one df.
    LikelihoodRatio,
}

/// Which dispersion estimate the per-gene GLMs are fitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DispersionKind {
    #[default]
    Trended,
    Tagwise,
    Common,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub cluster: String,
    pub gene: String,
    /// Contrast effect on the log2 scale.
    pub log2_fc: f64,
    /// Average log2 counts-per-million.
    pub log_cpm: f64,
    /// F statistic, or the deviance difference for the likelihood ratio test.
    pub statistic: f64,
    pub p_value: f64,
    pub p_adj: f64,
}

impl TestResult {
    /// Check if the result is significant at the given adjusted threshold
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_adj < alpha
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotTestedReason {
    /// No counts in any usable sample of the cluster.
    ZeroCounts,
    /// The GLM fit failed or did not converge.
    NotConverged,
    /// No residual degrees of freedom to estimate the quasi-dispersion from.
    NoResidualDf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotTestedGene {
    pub gene: String,
    pub reason: NotTestedReason,
}

/// Everything the tester produced for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResults {
    pub cluster: String,
    /// One row per tested gene, in input gene order.
    pub table: Vec<TestResult>,
    pub not_tested: Vec<NotTestedGene>,
    /// Prior degrees of freedom of the quasi-dispersion moderation; `None` for the
    /// likelihood ratio test.
    pub df_prior: Option<f64>,
    pub common_dispersion: f64,
}

impl ClusterResults {
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, gene: &str) -> Option<&TestResult> {
        self.table.iter().find(|r| r.gene == gene)
    }

    /// Get indices of genes significant at the given adjusted threshold
    pub fn significant_indices(&self, alpha: f64) -> Vec<usize> {
        self.table
            .iter()
            .enumerate()
            .filter_map(|(i, r)| if r.is_significant(alpha) { Some(i) } else { None })
            .collect()
    }

    /// Get the number of significant genes at the given threshold
    pub fn num_significant(&self, alpha: f64) -> usize {
        self.significant_indices(alpha).len()
    }

    /// Get the top n genes by adjusted p-value
    pub fn top_genes(&self, n: usize) -> Vec<&TestResult> {
        let mut rows: Vec<&TestResult> = self.table.iter().collect();
        rows.sort_by(|a, b| {
            a.p_adj
                .partial_cmp(&b.p_adj)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.gene.cmp(&b.gene))
        });
        rows.truncate(n);
        rows
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterConfig {
    pub method: TestMethod,
    pub dispersion: DispersionKind,
    pub correction: Correction,
    /// Prior count added before estimating fold changes.
    pub fc_prior_count: f64,
    pub irls: IrlsParams,
}

impl Default for TesterConfig {
    fn default() -> Self {
        TesterConfig {
            method: TestMethod::QuasiLikelihood,
            dispersion: DispersionKind::Trended,
            correction: Correction::BenjaminiHochberg,
            fc_prior_count: 0.125,
            irls: IrlsParams::default(),
        }
    }
}

impl TesterConfig {
    pub fn with_method(mut self, method: TestMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_dispersion(mut self, dispersion: DispersionKind) -> Self {
        self.dispersion = dispersion;
        self
    }

    pub fn with_correction(mut self, correction: Correction) -> Self {
        self.correction = correction;
        self
    }

    pub fn with_fc_prior_count(mut self, prior_count: f64) -> Self {
        self.fc_prior_count = prior_count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fc_prior_count.is_nan() || self.fc_prior_count < 0.0 {
            return Err(PseudobulkError::InvalidConfig(format!(
                "fc_prior_count must be non-negative, got {}",
                self.fc_prior_count
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

/// Per-gene quantities from the full and null fits.
#[derive(Debug, Clone, Copy)]
struct GeneFit {
    deviance: f64,
    lr: f64,
    df: f64,
    log2_fc: f64,
}

/// Per-gene NB GLM differential expression within one cluster.
#[derive(Debug, Clone, Default)]
pub struct DifferentialTester {
    config: TesterConfig,
}

impl DifferentialTester {
    pub fn new(config: TesterConfig) -> Self {
        DifferentialTester { config }
    }

    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    /// Test every kept gene of a normalised cluster for the design's contrast.
    pub fn test(&self, cluster: &NormalizedCluster) -> Result<ClusterResults> {
        let x = utils::to_dmatrix(&cluster.design.matrix);
        let contrast = cluster.design.contrast.to_vec();
        let x0 = null_design(&x, &contrast);
        let offset = cluster.offsets();
        let effective = cluster.effective_lib_sizes();
        let dispersions = match self.config.dispersion {
            DispersionKind::Trended => cluster.dispersions.trended.clone(),
            DispersionKind::Tagwise => cluster.dispersions.tagwise.clone(),
            DispersionKind::Common => vec![cluster.dispersions.common; cluster.n_genes()],
        };

        let fits: Vec<std::result::Result<GeneFit, FitFailure>> = (0..cluster.n_genes())
            .into_par_iter()
            .map(|g| {
                let y = cluster.counts.row(g).to_vec();
                self.fit_gene(&y, &x, &x0, &offset, &effective, &contrast, dispersions[g])
            })
            .collect();

        let mut not_tested: Vec<NotTestedGene> = cluster
            .zero_genes
            .iter()
            .map(|gene| NotTestedGene {
                gene: gene.clone(),
                reason: NotTestedReason::ZeroCounts,
            })
            .collect();

        let mut converged: Vec<(usize, GeneFit)> = Vec::with_capacity(fits.len());
        for (g, fit) in fits.into_iter().enumerate() {
            match fit {
                Ok(f) => converged.push((g, f)),
                Err(failure) => {
                    log::debug!("cluster '{}', gene '{}': {}", cluster.cluster, cluster.genes[g], failure);
                    not_tested.push(NotTestedGene {
                        gene: cluster.genes[g].clone(),
                        reason: NotTestedReason::NotConverged,
                    });
                }
            }
        }
        let n_failed = cluster.n_genes() - converged.len();
        if n_failed > 0 {
            log::warn!(
                "cluster '{}': {} of {} genes did not converge",
                cluster.cluster,
                n_failed,
                cluster.n_genes()
            );
        }

        let (statistics, df_prior) = match self.config.method {
            TestMethod::QuasiLikelihood => {
                let (stats, df_prior) = quasi_likelihood_tests(&converged, &cluster.ave_log_cpm);
                (stats, Some(df_prior))
            }
            TestMethod::LikelihoodRatio => (likelihood_ratio_tests(&converged), None),
        };

        let mut tested: Vec<(usize, f64, f64, f64)> = Vec::with_capacity(converged.len());
        for ((g, fit), stat) in converged.iter().zip(statistics) {
            match stat {
                Some((statistic, p_value)) => tested.push((*g, fit.log2_fc, statistic, p_value)),
                None => not_tested.push(NotTestedGene {
                    gene: cluster.genes[*g].clone(),
                    reason: NotTestedReason::NoResidualDf,
                }),
            }
        }

        // genes that were fitted or attempted but got no p-value still count as hypotheses
        let n_no_df = converged.len() - tested.len();
        let n_tests = tested.len() + n_failed + n_no_df;
        let p_values: Vec<f64> = tested.iter().map(|t| t.3).collect();
        let p_adj = if p_values.is_empty() {
            Vec::new()
        } else {
            self.config.correction.adjust(&p_values, n_tests)?
        };

        let table = tested
            .iter()
            .zip(p_adj)
            .map(|(&(g, log2_fc, statistic, p_value), p_adj)| TestResult {
                cluster: cluster.cluster.clone(),
                gene: cluster.genes[g].clone(),
                log2_fc,
                log_cpm: cluster.ave_log_cpm[g],
                statistic,
                p_value,
                p_adj,
            })
            .collect();

        log::debug!(
            "cluster '{}': {} genes tested, {} not tested",
            cluster.cluster,
            tested.len(),
            not_tested.len()
        );

        Ok(ClusterResults {
            cluster: cluster.cluster.clone(),
            table,
            not_tested,
            df_prior,
            common_dispersion: cluster.dispersions.common,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_gene(
        &self,
        y: &[f64],
        x: &DMatrix<f64>,
        x0: &DMatrix<f64>,
        offset: &[f64],
        effective: &[f64],
        contrast: &[f64],
        dispersion: f64,
    ) -> std::result::Result<GeneFit, FitFailure> {
        let irls = &self.config.irls;
        let full = fit_nb_glm(y, x, offset, dispersion, None, irls)?;
        let null = fit_nb_glm(y, x0, offset, dispersion, None, irls)?;
        let lr = (null.deviance - full.deviance).max(0.0);
        let df = residual_df(y, &full.fitted, x);

        let (y_prior, lib_prior) = effect::add_prior_count(y, effective, self.config.fc_prior_count);
        let offset_prior: Vec<f64> = lib_prior.iter().map(|l| l.ln()).collect();
        let coefficients = fit_nb_glm(&y_prior, x, &offset_prior, dispersion, None, irls)
            .map(|fit| fit.coefficients)
            .unwrap_or(full.coefficients);
        let log2_fc = contrast
            .iter()
            .zip(coefficients.iter())
            .map(|(c, b)| c * b)
            .sum::<f64>()
            / LN_2;

        Ok(GeneFit {
            deviance: full.deviance,
            lr,
            df,
            log2_fc,
        })
    }
}

/// QL F-tests for the converged genes: `(F, p)` per gene, `None` where no p-value
/// can be formed, plus the prior df of the moderation.
fn quasi_likelihood_tests(
    converged: &[(usize, GeneFit)],
    ave_log_cpm: &[f64],
) -> (Vec<Option<(f64, f64)>>, f64) {
    let df: Vec<f64> = converged.iter().map(|(_, f)| f.df).collect();
    let s2: Vec<f64> = converged
        .iter()
        .map(|(_, f)| if f.df > 0.0 { f.deviance / f.df } else { f64::NAN })
        .collect();
    let abundance: Vec<f64> = converged.iter().map(|(g, _)| ave_log_cpm[*g]).collect();

    let squeezed = quasi::squeeze_var(&s2, &df, Some(&abundance));
    let df_pooled: f64 = df.iter().sum();

    let stats = converged
        .iter()
        .enumerate()
        .map(|(i, (_, fit))| {
            let df_total = (df[i] + squeezed.df_prior).min(df_pooled);
            let s2_post = squeezed.var_post[i];
            let f_stat = fit.lr / s2_post;
            if df_total > 0.0 && f_stat.is_finite() {
                Some((f_stat, f_test_p_value(f_stat, df_total)))
            } else {
                None
            }
        })
        .collect();

    (stats, squeezed.df_prior)
}

fn likelihood_ratio_tests(converged: &[(usize, GeneFit)]) -> Vec<Option<(f64, f64)>> {
    converged
        .iter()
        .map(|(_, fit)| Some((fit.lr, chi_squared_p_value(fit.lr))))
        .collect()
}

/// Upper tail of F(1, df2).
fn f_test_p_value(f_stat: f64, df2: f64) -> f64 {
    match FisherSnedecor::new(1.0, df2) {
        Ok(dist) => dist.sf(f_stat).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

/// Upper tail of chi-squared with one df.
fn chi_squared_p_value(stat: f64) -> f64 {
    match ChiSquared::new(1.0) {
        Ok(dist) => dist.sf(stat).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}
