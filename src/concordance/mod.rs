//! Pairwise overlap of per-cluster significant gene sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcordanceEntry {
    pub cluster_a: String,
    pub cluster_b: String,
    /// `|A ∩ B| / |A|`; `None` when A has no significant genes or either cluster failed.
    pub fraction: Option<f64>,
}

/// K × K concordance fractions, rows and columns in cluster order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcordanceTable {
    labels: Vec<String>,
    values: Vec<Vec<Option<f64>>>,
}

impl ConcordanceTable {
    /// Build the table from ordered `(cluster, significant genes)` pairs. A cluster whose
    /// testing failed is passed as `None` and yields NA in its row and column.
    pub fn from_sets(sets: &[(String, Option<BTreeSet<String>>)]) -> Self {
        let labels = sets.iter().map(|(label, _)| label.clone()).collect();
        let values = sets
            .iter()
            .map(|(_, a)| {
                sets.iter()
                    .map(|(_, b)| match (a, b) {
                        (Some(a), Some(b)) => overlap_fraction(a, b),
                        _ => None,
                    })
                    .collect()
            })
            .collect();
        ConcordanceTable { labels, values }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Fraction of `cluster_a`'s significant genes also significant in `cluster_b`.
    /// Outer `None` for unknown labels, inner `None` for NA.
    pub fn get(&self, cluster_a: &str, cluster_b: &str) -> Option<Option<f64>> {
        let a = self.labels.iter().position(|l| l == cluster_a)?;
        let b = self.labels.iter().position(|l| l == cluster_b)?;
        Some(self.values[a][b])
    }

    /// Fractions of one cluster's row; `None` when `cluster` is not in the table.
    pub fn row(&self, cluster: &str) -> Option<&[Option<f64>]> {
        let a = self.labels.iter().position(|l| l == cluster)?;
        Some(&self.values[a])
    }

    /// Every ordered pair, row-major.
    pub fn entries(&self) -> Vec<ConcordanceEntry> {
        self.labels
            .iter()
            .enumerate()
            .flat_map(|(a, label_a)| {
                self.labels
                    .iter()
                    .enumerate()
                    .map(move |(b, label_b)| ConcordanceEntry {
                        cluster_a: label_a.clone(),
                        cluster_b: label_b.clone(),
                        fraction: self.values[a][b],
                    })
            })
            .collect()
    }
}

pub fn overlap_fraction(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<f64> {
    if a.is_empty() {
        return None;
    }
    Some(a.intersection(b).count() as f64 / a.len() as f64)
}
