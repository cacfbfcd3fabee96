//! Significance and effect-size thresholds on per-cluster result tables.

use crate::error::{PseudobulkError, Result};
use crate::testing::{ClusterResults, TestResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Keeps genes with `p_adj < alpha` and `|log2_fc| > min_abs_log2_fc`.
///
/// A threshold at its trivial bound (`alpha >= 1` or `min_abs_log2_fc <= 0`) switches that
/// criterion off, so the loosest filter returns every tested gene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultFilter {
    pub alpha: f64,
    pub min_abs_log2_fc: f64,
}

impl Default for ResultFilter {
    fn default() -> Self {
        ResultFilter {
            alpha: 0.05,
            min_abs_log2_fc: 1.0,
        }
    }
}

impl ResultFilter {
    pub fn new(alpha: f64, min_abs_log2_fc: f64) -> Self {
        ResultFilter {
            alpha,
            min_abs_log2_fc,
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_min_abs_log2_fc(mut self, min_abs_log2_fc: f64) -> Self {
        self.min_abs_log2_fc = min_abs_log2_fc;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.alpha.is_nan() || self.alpha < 0.0 {
            return Err(PseudobulkError::InvalidConfig(format!(
                "alpha must be non-negative, got {}",
                self.alpha
            )));
        }
        if self.min_abs_log2_fc.is_nan() {
            return Err(PseudobulkError::InvalidConfig(
                "min_abs_log2_fc is NaN".to_string(),
            ));
        }
        Ok(())
    }

    pub fn passes(&self, result: &TestResult) -> bool {
        let significant = self.alpha >= 1.0 || result.p_adj < self.alpha;
        let large = self.min_abs_log2_fc <= 0.0 || result.log2_fc.abs() > self.min_abs_log2_fc;
        significant && large
    }

    /// Passing rows, sorted by adjusted p-value with ties broken by gene id.
    pub fn apply<'a>(&self, results: &'a ClusterResults) -> Vec<&'a TestResult> {
        self.apply_rows(&results.table)
    }

    /// Same as [`ResultFilter::apply`] on a bare slice of rows.
    pub fn apply_rows<'a>(&self, rows: &'a [TestResult]) -> Vec<&'a TestResult> {
        let mut kept: Vec<&TestResult> = rows.iter().filter(|r| self.passes(r)).collect();
        kept.sort_by(|a, b| {
            a.p_adj
                .partial_cmp(&b.p_adj)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.gene.cmp(&b.gene))
        });
        kept
    }

    pub fn significant_genes(&self, results: &ClusterResults) -> BTreeSet<String> {
        self.apply(results).into_iter().map(|r| r.gene.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(gene: &str, log2_fc: f64, p_adj: f64) -> TestResult {
        TestResult {
            cluster: "A".to_string(),
            gene: gene.to_string(),
            log2_fc,
            log_cpm: 5.0,
            statistic: 1.0,
            p_value: p_adj / 2.0,
            p_adj,
        }
    }

    fn results() -> ClusterResults {
        ClusterResults {
            cluster: "A".to_string(),
            table: vec![
                row("g4", 2.0, 0.01),
                row("g2", -1.5, 0.001),
                row("g3", 0.5, 0.001),
                row("g1", 3.0, 0.01),
                row("g5", 1.2, 0.2),
                row("g6", 1.0, 1.0),
            ],
            not_tested: Vec::new(),
            df_prior: None,
            common_dispersion: 0.1,
        }
    }

    #[test]
    fn test_default_thresholds() {
        let res = results();
        let kept: Vec<&str> = ResultFilter::default()
            .apply(&res)
            .iter()
            .map(|r| r.gene.as_str())
            .collect();
        assert_eq!(kept, vec!["g2", "g1", "g4"]);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let res = results();
        let kept = ResultFilter::new(0.01, 1.0).apply(&res);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].gene, "g2");
        // |log2FC| exactly at the threshold is excluded
        assert!(!ResultFilter::new(1.0, 1.0).passes(&row("g6", 1.0, 0.5)));
    }

    #[test]
    fn test_trivial_thresholds_keep_everything() {
        let res = results();
        let kept = ResultFilter::new(1.0, 0.0).apply(&res);
        assert_eq!(kept.len(), res.len());
        let p: Vec<f64> = kept.iter().map(|r| r.p_adj).collect();
        assert!(p.windows(2).all(|w| w[0] <= w[1]));
        let genes: Vec<&str> = kept.iter().map(|r| r.gene.as_str()).collect();
        assert_eq!(genes, vec!["g2", "g3", "g1", "g4", "g5", "g6"]);
    }

    #[test]
    fn test_filter_is_idempotent_and_pure() {
        let res = results();
        let filter = ResultFilter::default();
        let once: Vec<TestResult> = filter.apply(&res).into_iter().cloned().collect();
        let twice: Vec<TestResult> = filter.apply_rows(&once).into_iter().cloned().collect();
        assert_eq!(once, twice);
        assert_eq!(res.table[0].gene, "g4");
    }

    #[test]
    fn test_significant_genes() {
        let genes = ResultFilter::default().significant_genes(&results());
        assert_eq!(genes.into_iter().collect::<Vec<_>>(), vec!["g1", "g2", "g4"]);
    }

    #[test]
    fn test_validate() {
        assert!(ResultFilter::new(-0.1, 1.0).validate().is_err());
        assert!(ResultFilter::new(0.1, f64::NAN).validate().is_err());
        assert!(ResultFilter::default().validate().is_ok());
    }
}
