//! End-to-end pseudobulk differential expression over every cluster.
//!
//! Clusters are tested independently and in parallel. A cluster that cannot be tested
//! yields a structured failure in its outcome slot while the others proceed, so every
//! attempted cluster ends up with either a result table or a reason.

use crate::aggregate::{Aggregation, PseudobulkMatrix, PseudobulkOps};
use crate::concordance::ConcordanceTable;
use crate::config::PipelineConfig;
use crate::design::{Comparison, ExperimentDesign};
use crate::error::{PseudobulkError, Result};
use crate::grouping::{GroupIndex, SampleSheet};
use crate::normalize::DispersionNormalizer;
use crate::testing::{ClusterResults, DifferentialTester, TestResult};
use rayon::prelude::*;
use single_utilities::traits::FloatOpsTS;
use std::collections::BTreeSet;

/// What happened to one cluster.
#[derive(Debug)]
pub struct ClusterOutcome {
    pub cluster: String,
    pub result: Result<ClusterResults>,
}

impl ClusterOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn results(&self) -> Option<&ClusterResults> {
        self.result.as_ref().ok()
    }
}

#[derive(Debug)]
pub struct PipelineOutput {
    /// Per-cluster pseudobulk sums, in cluster order.
    pub sums: Vec<PseudobulkMatrix>,
    /// Per-cluster pseudobulk means; empty unless requested.
    pub means: Vec<PseudobulkMatrix>,
    /// One outcome per cluster, in cluster order.
    pub outcomes: Vec<ClusterOutcome>,
    /// Filtered and sorted rows of every successfully tested cluster.
    pub filtered: Vec<(String, Vec<TestResult>)>,
    pub concordance: ConcordanceTable,
}

impl PipelineOutput {
    /// Clusters that could not be tested, with the reason.
    pub fn failures(&self) -> Vec<(&str, &PseudobulkError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.cluster.as_str(), e)))
            .collect()
    }

    pub fn results(&self, cluster: &str) -> Option<&ClusterResults> {
        self.outcomes
            .iter()
            .find(|o| o.cluster == cluster)
            .and_then(|o| o.results())
    }

    pub fn filtered_for(&self, cluster: &str) -> Option<&[TestResult]> {
        self.filtered
            .iter()
            .find(|(c, _)| c == cluster)
            .map(|(_, rows)| rows.as_slice())
    }

    pub fn sums_for(&self, cluster: &str) -> Option<&PseudobulkMatrix> {
        self.sums.iter().find(|m| m.cluster == cluster)
    }
}

/// Design over all samples of the index, groups taken from the sample sheet.
pub fn global_design(
    index: &GroupIndex,
    sheet: &SampleSheet,
    comparison: &Comparison,
) -> Result<ExperimentDesign> {
    let groups = sheet.groups_for(index.samples())?;
    ExperimentDesign::one_hot(index.samples().labels(), &groups, comparison)
}

/// Normalise and test one cluster's pseudobulk sums.
pub fn test_cluster(
    sums: &PseudobulkMatrix,
    design: &ExperimentDesign,
    config: &PipelineConfig,
) -> Result<ClusterResults> {
    let usable = sums.n_cells.iter().filter(|&&n| n > 0).count();
    if usable < config.min_samples {
        return Err(PseudobulkError::InsufficientSamples {
            cluster: sums.cluster.clone(),
            usable,
            required: config.min_samples,
        });
    }
    let normalized = DispersionNormalizer::new(config.normalizer.clone()).run(sums, design)?;
    DifferentialTester::new(config.tester.clone()).test(&normalized)
}

/// Run aggregation, testing, filtering and concordance for every cluster of `index`.
///
/// Errors affecting all clusters (dimension mismatches, a sample without a group, an
/// invalid comparison or config) are returned directly; per-cluster failures land in
/// [`PipelineOutput::outcomes`].
pub fn run_pipeline<T, M>(
    matrix: &M,
    genes: &[String],
    index: &GroupIndex,
    sheet: &SampleSheet,
    comparison: &Comparison,
    config: &PipelineConfig,
) -> Result<PipelineOutput>
where
    T: FloatOpsTS,
    M: PseudobulkOps<T>,
{
    config.validate()?;
    log::info!(
        "pseudobulk: {} genes, {} cells, {} clusters, {} samples",
        genes.len(),
        index.n_cells(),
        index.clusters().len(),
        index.samples().len()
    );

    let design = global_design(index, sheet, comparison)?;
    let sums = matrix.pseudobulk(genes, index, Aggregation::Sum)?;
    let means = if config.keep_means {
        matrix.pseudobulk(genes, index, Aggregation::Mean)?
    } else {
        Vec::new()
    };

    log::info!(
        "testing {} vs {} in {} clusters",
        comparison.treatment,
        comparison.reference,
        sums.len()
    );
    let outcomes: Vec<ClusterOutcome> = sums
        .par_iter()
        .map(|pb| ClusterOutcome {
            cluster: pb.cluster.clone(),
            result: test_cluster(pb, &design, config),
        })
        .collect();

    for outcome in &outcomes {
        if let Err(e) = &outcome.result {
            log::warn!("cluster '{}' not tested: {}", outcome.cluster, e);
        }
    }

    let filtered: Vec<(String, Vec<TestResult>)> = outcomes
        .iter()
        .filter_map(|o| {
            o.results().map(|r| {
                let rows = config.filter.apply(r).into_iter().cloned().collect();
                (o.cluster.clone(), rows)
            })
        })
        .collect();

    let sets: Vec<(String, Option<BTreeSet<String>>)> = outcomes
        .iter()
        .map(|o| {
            let set = o.results().map(|r| config.filter.significant_genes(r));
            (o.cluster.clone(), set)
        })
        .collect();
    let concordance = ConcordanceTable::from_sets(&sets);

    log::info!(
        "{} of {} clusters tested",
        filtered.len(),
        outcomes.len()
    );

    Ok(PipelineOutput {
        sums,
        means,
        outcomes,
        filtered,
        concordance,
    })
}

/// Test for changes in cluster abundance: the cluster × sample cell-count table goes
/// through the same normalisation and testing, with clusters in place of genes.
pub fn differential_abundance(
    index: &GroupIndex,
    sheet: &SampleSheet,
    comparison: &Comparison,
    config: &PipelineConfig,
) -> Result<ClusterResults> {
    config.validate()?;
    let design = global_design(index, sheet, comparison)?;
    let counts = PseudobulkMatrix::from_cell_counts(index);
    test_cluster(&counts, &design, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::CellAnnotation;
    use nalgebra_sparse::{CooMatrix, CscMatrix};

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_min_samples_failure_is_isolated() {
        // cluster B only has cells in one sample
        let cells = vec![
            CellAnnotation::new("c1", "A", "s1", "ctrl"),
            CellAnnotation::new("c2", "A", "s2", "ctrl"),
            CellAnnotation::new("c3", "A", "s3", "stim"),
            CellAnnotation::new("c4", "A", "s4", "stim"),
            CellAnnotation::new("c5", "B", "s1", "ctrl"),
        ];
        let mut coo = CooMatrix::new(2, 5);
        for c in 0..5 {
            coo.push(0, c, 10.0 + c as f64);
            coo.push(1, c, 20.0);
        }
        let matrix = CscMatrix::from(&coo);
        let index = GroupIndex::from_cells(&cells);
        let sheet = SampleSheet::from_cells(&cells);
        let output = run_pipeline(
            &matrix,
            &labels(&["g1", "g2"]),
            &index,
            &sheet,
            &Comparison::new("stim", "ctrl"),
            &PipelineConfig::default(),
        )
        .unwrap();

        assert_eq!(output.outcomes.len(), 2);
        assert!(output.outcomes[0].is_ok());
        let failures = output.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "B");
        assert!(matches!(
            failures[0].1,
            PseudobulkError::InsufficientSamples { usable: 1, required: 2, .. }
        ));
        assert_eq!(output.concordance.get("B", "B"), Some(None));
        assert_eq!(output.means.len(), 2);
        assert!(output.filtered_for("B").is_none());
    }

    #[test]
    fn test_sample_without_group_is_fatal() {
        let cells = vec![
            CellAnnotation::new("c1", "A", "s1", "ctrl"),
            CellAnnotation::new("c2", "A", "s2", "stim"),
        ];
        let index = GroupIndex::from_cells(&cells);
        let sheet = SampleSheet::new([("s1", "ctrl")]);
        let err = global_design(&index, &sheet, &Comparison::new("stim", "ctrl")).unwrap_err();
        assert!(matches!(err, PseudobulkError::MissingMetadata(_)));
    }
}
