//! Partitioning of cells into (cluster, sample) buckets.
//!
//! Every downstream matrix is assembled positionally, so the cluster and sample
//! orderings are explicit [`LabelOrder`] values handed to each component rather than
//! being recomputed from whatever labels a particular cluster happens to contain.

use crate::error::{PseudobulkError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Per-cell metadata, aligned with the count matrix column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellAnnotation {
    pub cell_id: String,
    pub cluster_id: Option<String>,
    pub sample_id: Option<String>,
    pub group_id: Option<String>,
}

impl CellAnnotation {
    pub fn new(cell_id: &str, cluster_id: &str, sample_id: &str, group_id: &str) -> Self {
        CellAnnotation {
            cell_id: cell_id.to_string(),
            cluster_id: Some(cluster_id.to_string()),
            sample_id: Some(sample_id.to_string()),
            group_id: Some(group_id.to_string()),
        }
    }
}

/// A fixed, de-duplicated ordering of labels shared by every consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelOrder {
    labels: Vec<String>,
    positions: HashMap<String, usize>,
}

impl LabelOrder {
    /// Use the labels exactly in the given order. Duplicates are rejected.
    pub fn new(labels: Vec<String>) -> Result<Self> {
        let mut positions = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if positions.insert(label.clone(), i).is_some() {
                return Err(PseudobulkError::InvalidConfig(format!(
                    "duplicate label '{}' in label order",
                    label
                )));
            }
        }
        Ok(LabelOrder { labels, positions })
    }

    /// Sorted, de-duplicated order of the given labels.
    pub fn lexical<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unique: BTreeSet<String> = labels.into_iter().map(|s| s.as_ref().to_string()).collect();
        let labels: Vec<String> = unique.into_iter().collect();
        let positions = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        LabelOrder { labels, positions }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.positions.get(label).copied()
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|s| s.as_str())
    }

    /// Keep only the labels at the given positions, preserving their relative order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let labels: Vec<String> = indices
            .iter()
            .filter_map(|&i| self.labels.get(i).cloned())
            .collect();
        let positions = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        LabelOrder { labels, positions }
    }
}

impl TryFrom<Vec<String>> for LabelOrder {
    type Error = PseudobulkError;

    fn try_from(labels: Vec<String>) -> Result<Self> {
        LabelOrder::new(labels)
    }
}

impl From<LabelOrder> for Vec<String> {
    fn from(order: LabelOrder) -> Self {
        order.labels
    }
}

/// Composite key of a bucket: positions in the cluster and sample orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub cluster: usize,
    pub sample: usize,
}

/// Mapping from every (cluster, sample) pair to the matrix columns of its cells.
///
/// All K×S pairs are present; unobserved pairs hold an empty bucket.
#[derive(Debug, Clone)]
pub struct GroupIndex {
    clusters: LabelOrder,
    samples: LabelOrder,
    buckets: BTreeMap<BucketKey, Vec<usize>>,
    cell_ids: Vec<String>,
    dropped: usize,
    unmatched: usize,
}

impl GroupIndex {
    /// Build the index with lexical cluster and sample orders derived from the cells.
    pub fn from_cells(cells: &[CellAnnotation]) -> Self {
        let clusters = LabelOrder::lexical(cells.iter().filter_map(|c| c.cluster_id.as_deref()));
        let samples = LabelOrder::lexical(cells.iter().filter_map(|c| c.sample_id.as_deref()));
        Self::with_orders(cells, clusters, samples)
    }

    /// Build the index against caller-supplied orders.
    ///
    /// Cells whose cluster or sample label is absent from the orders are dropped and
    /// counted as unmatched.
    pub fn with_orders(cells: &[CellAnnotation], clusters: LabelOrder, samples: LabelOrder) -> Self {
        let mut buckets = BTreeMap::new();
        for cluster in 0..clusters.len() {
            for sample in 0..samples.len() {
                buckets.insert(BucketKey { cluster, sample }, Vec::new());
            }
        }

        let mut dropped = 0;
        let mut unmatched = 0;
        for (col, cell) in cells.iter().enumerate() {
            let (Some(cluster_id), Some(sample_id)) = (&cell.cluster_id, &cell.sample_id) else {
                dropped += 1;
                continue;
            };
            match (clusters.position(cluster_id), samples.position(sample_id)) {
                (Some(cluster), Some(sample)) => {
                    if let Some(bucket) = buckets.get_mut(&BucketKey { cluster, sample }) {
                        bucket.push(col);
                    }
                }
                _ => unmatched += 1,
            }
        }

        if dropped > 0 {
            log::warn!("dropped {} cells with missing cluster or sample labels", dropped);
        }
        if unmatched > 0 {
            log::warn!("dropped {} cells with labels outside the supplied orders", unmatched);
        }

        GroupIndex {
            clusters,
            samples,
            buckets,
            cell_ids: cells.iter().map(|c| c.cell_id.clone()).collect(),
            dropped,
            unmatched,
        }
    }

    pub fn clusters(&self) -> &LabelOrder {
        &self.clusters
    }

    pub fn samples(&self) -> &LabelOrder {
        &self.samples
    }

    /// Number of annotated cells, i.e. the expected number of matrix columns.
    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Cells dropped for missing cluster or sample labels.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Cells dropped because their labels were not part of the supplied orders.
    pub fn unmatched(&self) -> usize {
        self.unmatched
    }

    pub fn bucket(&self, key: BucketKey) -> &[usize] {
        self.buckets.get(&key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn get(&self, cluster_id: &str, sample_id: &str) -> Option<&[usize]> {
        let cluster = self.clusters.position(cluster_id)?;
        let sample = self.samples.position(sample_id)?;
        Some(self.bucket(BucketKey { cluster, sample }))
    }

    /// Cell identifiers of a bucket, in matrix column order.
    pub fn cell_ids(&self, cluster_id: &str, sample_id: &str) -> Option<Vec<&str>> {
        self.get(cluster_id, sample_id)
            .map(|cols| cols.iter().map(|&c| self.cell_ids[c].as_str()).collect())
    }

    pub fn buckets(&self) -> impl Iterator<Item = (BucketKey, &[usize])> {
        self.buckets.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Bucket of each matrix column, `None` for dropped cells.
    pub fn column_assignment(&self) -> Vec<Option<BucketKey>> {
        let mut assignment = vec![None; self.cell_ids.len()];
        for (key, cols) in &self.buckets {
            for &c in cols {
                assignment[c] = Some(*key);
            }
        }
        assignment
    }

    /// Cluster × sample table of cell counts.
    pub fn cell_counts(&self) -> Array2<f64> {
        let mut counts = Array2::zeros((self.clusters.len(), self.samples.len()));
        for (key, cols) in &self.buckets {
            counts[[key.cluster, key.sample]] = cols.len() as f64;
        }
        counts
    }
}

/// Sample-level metadata: the experimental group of every sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSheet {
    groups: BTreeMap<String, String>,
}

impl SampleSheet {
    pub fn new<I, S, G>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, G)>,
        S: Into<String>,
        G: Into<String>,
    {
        SampleSheet {
            groups: entries.into_iter().map(|(s, g)| (s.into(), g.into())).collect(),
        }
    }

    /// Derive the sheet from per-cell labels; the first group seen for a sample wins.
    pub fn from_cells(cells: &[CellAnnotation]) -> Self {
        let mut groups: BTreeMap<String, String> = BTreeMap::new();
        for cell in cells {
            let (Some(sample), Some(group)) = (&cell.sample_id, &cell.group_id) else {
                continue;
            };
            match groups.get(sample) {
                Some(existing) if existing != group => {
                    log::warn!(
                        "sample '{}' has cells in groups '{}' and '{}', keeping '{}'",
                        sample, existing, group, existing
                    );
                }
                Some(_) => {}
                None => {
                    groups.insert(sample.clone(), group.clone());
                }
            }
        }
        SampleSheet { groups }
    }

    pub fn insert(&mut self, sample_id: &str, group_id: &str) {
        self.groups.insert(sample_id.to_string(), group_id.to_string());
    }

    pub fn group_of(&self, sample_id: &str) -> Option<&str> {
        self.groups.get(sample_id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group labels aligned to `samples`.
    pub fn groups_for(&self, samples: &LabelOrder) -> Result<Vec<String>> {
        samples
            .iter()
            .map(|s| {
                self.group_of(s).map(|g| g.to_string()).ok_or_else(|| {
                    PseudobulkError::MissingMetadata(format!("sample '{}' has no group", s))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells() -> Vec<CellAnnotation> {
        vec![
            CellAnnotation::new("c1", "B", "s2", "stim"),
            CellAnnotation::new("c2", "A", "s1", "ctrl"),
            CellAnnotation::new("c3", "A", "s2", "stim"),
            CellAnnotation {
                cell_id: "c4".to_string(),
                cluster_id: None,
                sample_id: Some("s1".to_string()),
                group_id: Some("ctrl".to_string()),
            },
            CellAnnotation::new("c5", "A", "s1", "ctrl"),
        ]
    }

    #[test]
    fn test_all_pairs_enumerated() {
        let index = GroupIndex::from_cells(&cells());
        assert_eq!(index.clusters().labels(), &["A", "B"]);
        assert_eq!(index.samples().labels(), &["s1", "s2"]);
        assert_eq!(index.buckets().count(), 4);
        assert_eq!(index.get("A", "s1").unwrap(), &[1, 4]);
        assert_eq!(index.get("B", "s1").unwrap(), &[] as &[usize]);
        assert_eq!(index.cell_ids("A", "s2").unwrap(), vec!["c3"]);
        assert_eq!(index.dropped(), 1);
    }

    #[test]
    fn test_every_cell_in_one_bucket() {
        let index = GroupIndex::from_cells(&cells());
        let mut seen: Vec<usize> = index.buckets().flat_map(|(_, c)| c.to_vec()).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 4]);
        let counts = index.cell_counts();
        assert_eq!(counts.sum(), 4.0);
        assert_eq!(counts[[1, 0]], 0.0);
    }

    #[test]
    fn test_supplied_orders() {
        let clusters = LabelOrder::new(vec!["B".to_string(), "A".to_string()]).unwrap();
        let samples = LabelOrder::new(vec!["s2".to_string()]).unwrap();
        let index = GroupIndex::with_orders(&cells(), clusters, samples);
        assert_eq!(index.get("B", "s2").unwrap(), &[0]);
        assert_eq!(index.unmatched(), 2);
        assert_eq!(index.dropped(), 1);
        assert!(index.get("A", "s1").is_none());
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        assert!(LabelOrder::new(vec!["a".to_string(), "a".to_string()]).is_err());
    }

    #[test]
    fn test_sample_sheet() {
        let sheet = SampleSheet::from_cells(&cells());
        let order = LabelOrder::lexical(["s2", "s1"]);
        assert_eq!(sheet.groups_for(&order).unwrap(), vec!["ctrl", "stim"]);
        let missing = LabelOrder::lexical(["s3"]);
        assert!(matches!(
            sheet.groups_for(&missing),
            Err(PseudobulkError::MissingMetadata(_))
        ));
    }
}
