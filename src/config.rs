use crate::error::{PseudobulkError, Result};
use crate::filter::ResultFilter;
use crate::normalize::NormalizerConfig;
use crate::testing::TesterConfig;
use serde::{Deserialize, Serialize};

/// Settings for a full pseudobulk run. Every field has a default, so a partial
/// serialized config fills in the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub normalizer: NormalizerConfig,
    pub tester: TesterConfig,
    pub filter: ResultFilter,
    /// Clusters with fewer samples holding cells are not tested.
    pub min_samples: usize,
    /// Also aggregate per-sample means for reporting.
    pub keep_means: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            normalizer: NormalizerConfig::default(),
            tester: TesterConfig::default(),
            filter: ResultFilter::default(),
            min_samples: 2,
            keep_means: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_tester(mut self, tester: TesterConfig) -> Self {
        self.tester = tester;
        self
    }

    pub fn with_filter(mut self, filter: ResultFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    pub fn with_keep_means(mut self, keep_means: bool) -> Self {
        self.keep_means = keep_means;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_samples < 2 {
            return Err(PseudobulkError::InvalidConfig(format!(
                "min_samples must be at least 2, got {}",
                self.min_samples
            )));
        }
        self.normalizer.validate()?;
        self.tester.validate()?;
        self.filter.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DispersionKind, TestMethod};

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.filter.alpha, 0.05);
        assert_eq!(config.filter.min_abs_log2_fc, 1.0);
        assert_eq!(config.tester.dispersion, DispersionKind::Trended);
    }

    #[test]
    fn test_min_samples_bound() {
        let config = PipelineConfig::default().with_min_samples(1);
        assert!(matches!(config.validate(), Err(PseudobulkError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "filter": { "alpha": 0.1 }, "tester": { "method": "LikelihoodRatio" } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.filter.alpha, 0.1);
        assert_eq!(config.filter.min_abs_log2_fc, 1.0);
        assert_eq!(config.tester.method, TestMethod::LikelihoodRatio);
        assert_eq!(config.tester.fc_prior_count, 0.125);
        assert_eq!(config.min_samples, 2);
    }
}
