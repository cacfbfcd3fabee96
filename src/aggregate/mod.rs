//! Pseudobulk aggregation of a genes × cells count matrix.
//!
//! Each cluster gets a genes × samples matrix whose columns always follow the global
//! sample order of the [`GroupIndex`], so matrices of different clusters are directly
//! column-comparable.

use crate::error::{PseudobulkError, Result};
use crate::grouping::{BucketKey, GroupIndex, LabelOrder};
use nalgebra_sparse::{CscMatrix, CsrMatrix};
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

/// Reduction applied to the cells of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    /// Column sums; input to differential testing. Empty buckets give zeros.
    Sum,
    /// Column means; for visualisation. Empty buckets give NaN.
    Mean,
}

/// Genes × samples aggregate of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudobulkMatrix {
    pub cluster: String,
    pub genes: Vec<String>,
    pub samples: LabelOrder,
    pub aggregation: Aggregation,
    pub values: Array2<f64>,
    /// Number of cells behind every column.
    pub n_cells: Vec<usize>,
}

impl PseudobulkMatrix {
    pub fn n_genes(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, sample_id: &str) -> Option<ArrayView1<'_, f64>> {
        self.samples
            .position(sample_id)
            .map(|s| self.values.column(s))
    }

    /// Samples without any cell in this cluster.
    pub fn empty_samples(&self) -> Vec<&str> {
        self.n_cells
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n == 0)
            .filter_map(|(s, _)| self.samples.label(s))
            .collect()
    }

    /// Column totals (library sizes for the sum variant).
    pub fn library_sizes(&self) -> Vec<f64> {
        self.values.sum_axis(Axis(0)).to_vec()
    }

    /// Keep the given sample columns, in the given order. An index past the last
    /// sample is a `DimensionMismatch`.
    pub fn subset_samples(&self, indices: &[usize]) -> Result<PseudobulkMatrix> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.n_samples()) {
            return Err(PseudobulkError::DimensionMismatch(format!(
                "cluster '{}': sample index {} out of range for {} samples",
                self.cluster,
                bad,
                self.n_samples()
            )));
        }
        Ok(PseudobulkMatrix {
            cluster: self.cluster.clone(),
            genes: self.genes.clone(),
            samples: self.samples.subset(indices),
            aggregation: self.aggregation,
            values: self.values.select(Axis(1), indices),
            n_cells: indices.iter().map(|&i| self.n_cells[i]).collect(),
        })
    }

    /// Cluster × sample cell counts laid out as a pseudobulk matrix, so that
    /// differential abundance can reuse the expression machinery with clusters in
    /// place of genes.
    pub fn from_cell_counts(index: &GroupIndex) -> PseudobulkMatrix {
        let values = index.cell_counts();
        let n_cells = values
            .sum_axis(Axis(0))
            .iter()
            .map(|&n| n as usize)
            .collect();
        PseudobulkMatrix {
            cluster: "cell-counts".to_string(),
            genes: index.clusters().labels().to_vec(),
            samples: index.samples().clone(),
            aggregation: Aggregation::Sum,
            values,
            n_cells,
        }
    }
}

pub trait PseudobulkOps<T>
where
    T: FloatOpsTS,
{
    /// One genes × samples matrix per cluster, in the index's cluster order.
    fn pseudobulk(
        &self,
        genes: &[String],
        index: &GroupIndex,
        aggregation: Aggregation,
    ) -> Result<Vec<PseudobulkMatrix>>;
}

fn check_dimensions(n_rows: usize, n_cols: usize, genes: &[String], index: &GroupIndex) -> Result<()> {
    if genes.len() != n_rows {
        return Err(PseudobulkError::DimensionMismatch(format!(
            "{} gene names for a matrix with {} rows",
            genes.len(),
            n_rows
        )));
    }
    if index.n_cells() != n_cols {
        return Err(PseudobulkError::DimensionMismatch(format!(
            "{} annotated cells for a matrix with {} columns",
            index.n_cells(),
            n_cols
        )));
    }
    Ok(())
}

/// Turn accumulated sums into the requested aggregate and wrap them up.
fn finish(
    cluster: usize,
    genes: &[String],
    index: &GroupIndex,
    mut values: Array2<f64>,
    aggregation: Aggregation,
) -> PseudobulkMatrix {
    let n_samples = index.samples().len();
    let n_cells: Vec<usize> = (0..n_samples)
        .map(|sample| index.bucket(BucketKey { cluster, sample }).len())
        .collect();

    if aggregation == Aggregation::Mean {
        for (s, &n) in n_cells.iter().enumerate() {
            let mut col = values.column_mut(s);
            if n == 0 {
                col.fill(f64::NAN);
            } else {
                col.mapv_inplace(|v| v / n as f64);
            }
        }
    }

    let cluster_id = index.clusters().label(cluster).unwrap_or_default().to_string();
    let empty = n_cells.iter().filter(|&&n| n == 0).count();
    if empty > 0 {
        log::warn!(
            "cluster '{}' has {} of {} samples without cells",
            cluster_id,
            empty,
            n_samples
        );
    }

    PseudobulkMatrix {
        cluster: cluster_id,
        genes: genes.to_vec(),
        samples: index.samples().clone(),
        aggregation,
        values,
        n_cells,
    }
}

impl<T> PseudobulkOps<T> for CscMatrix<T>
where
    T: FloatOpsTS,
{
    fn pseudobulk(
        &self,
        genes: &[String],
        index: &GroupIndex,
        aggregation: Aggregation,
    ) -> Result<Vec<PseudobulkMatrix>> {
        check_dimensions(self.nrows(), self.ncols(), genes, index)?;

        let n_genes = self.nrows();
        let n_samples = index.samples().len();

        let matrices = (0..index.clusters().len())
            .into_par_iter()
            .map(|cluster| {
                let mut values = Array2::<f64>::zeros((n_genes, n_samples));
                for sample in 0..n_samples {
                    for &cell in index.bucket(BucketKey { cluster, sample }) {
                        let col = self.col(cell);
                        for (&g, v) in col.row_indices().iter().zip(col.values().iter()) {
                            values[[g, sample]] += v.to_f64().unwrap_or(0.0);
                        }
                    }
                }
                finish(cluster, genes, index, values, aggregation)
            })
            .collect();

        Ok(matrices)
    }
}

impl<T> PseudobulkOps<T> for CsrMatrix<T>
where
    T: FloatOpsTS,
{
    fn pseudobulk(
        &self,
        genes: &[String],
        index: &GroupIndex,
        aggregation: Aggregation,
    ) -> Result<Vec<PseudobulkMatrix>> {
        check_dimensions(self.nrows(), self.ncols(), genes, index)?;

        let n_clusters = index.clusters().len();
        let n_samples = index.samples().len();
        let assignment = index.column_assignment();

        // one pass over each gene row, scattering into cluster-major bucket slots
        let rows: Vec<Vec<f64>> = (0..self.nrows())
            .into_par_iter()
            .map(|g| {
                let mut acc = vec![0.0; n_clusters * n_samples];
                let row = self.row(g);
                for (&cell, v) in row.col_indices().iter().zip(row.values().iter()) {
                    if let Some(key) = assignment[cell] {
                        acc[key.cluster * n_samples + key.sample] += v.to_f64().unwrap_or(0.0);
                    }
                }
                acc
            })
            .collect();

        let matrices = (0..n_clusters)
            .into_par_iter()
            .map(|cluster| {
                let mut values = Array2::<f64>::zeros((self.nrows(), n_samples));
                for (g, acc) in rows.iter().enumerate() {
                    for sample in 0..n_samples {
                        values[[g, sample]] = acc[cluster * n_samples + sample];
                    }
                }
                finish(cluster, genes, index, values, aggregation)
            })
            .collect();

        Ok(matrices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::CellAnnotation;
    use nalgebra_sparse::CooMatrix;

    // genes × cells
    fn test_matrix() -> (CooMatrix<f64>, Vec<String>, Vec<CellAnnotation>) {
        let mut coo = CooMatrix::new(2, 4);
        coo.push(0, 0, 1.0);
        coo.push(0, 1, 2.0);
        coo.push(1, 1, 5.0);
        coo.push(0, 2, 4.0);
        coo.push(1, 3, 7.0);
        let genes = vec!["g1".to_string(), "g2".to_string()];
        let cells = vec![
            CellAnnotation::new("c1", "A", "s1", "ctrl"),
            CellAnnotation::new("c2", "A", "s1", "ctrl"),
            CellAnnotation::new("c3", "A", "s2", "stim"),
            CellAnnotation::new("c4", "B", "s2", "stim"),
        ];
        (coo, genes, cells)
    }

    #[test]
    fn test_csc_sum_and_mean() {
        let (coo, genes, cells) = test_matrix();
        let index = GroupIndex::from_cells(&cells);
        let csc = CscMatrix::from(&coo);

        let sums = csc.pseudobulk(&genes, &index, Aggregation::Sum).unwrap();
        assert_eq!(sums.len(), 2);
        assert_eq!(sums[0].values, ndarray::array![[3.0, 4.0], [5.0, 0.0]]);
        assert_eq!(sums[1].values, ndarray::array![[0.0, 0.0], [0.0, 7.0]]);
        assert_eq!(sums[1].empty_samples(), vec!["s1"]);

        let means = csc.pseudobulk(&genes, &index, Aggregation::Mean).unwrap();
        assert_eq!(means[0].values[[0, 0]], 1.5);
        assert!(means[1].values[[0, 0]].is_nan());
        assert_eq!(means[1].values[[1, 1]], 7.0);
    }

    #[test]
    fn test_csr_matches_csc() {
        let (coo, genes, cells) = test_matrix();
        let index = GroupIndex::from_cells(&cells);
        let csc = CscMatrix::from(&coo);
        let csr = CsrMatrix::from(&coo);
        let a = csc.pseudobulk(&genes, &index, Aggregation::Sum).unwrap();
        let b = csr.pseudobulk(&genes, &index, Aggregation::Sum).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.values, y.values);
            assert_eq!(x.n_cells, y.n_cells);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let (coo, _, cells) = test_matrix();
        let index = GroupIndex::from_cells(&cells);
        let csc = CscMatrix::from(&coo);
        let result = csc.pseudobulk(&["g1".to_string()], &index, Aggregation::Sum);
        assert!(matches!(result, Err(PseudobulkError::DimensionMismatch(_))));
    }

    #[test]
    fn test_subset_samples() {
        let (coo, genes, cells) = test_matrix();
        let index = GroupIndex::from_cells(&cells);
        let sums = CscMatrix::from(&coo)
            .pseudobulk(&genes, &index, Aggregation::Sum)
            .unwrap();
        let b = sums[1].subset_samples(&[1]).unwrap();
        assert_eq!(b.samples.labels(), &["s2"]);
        assert_eq!(b.values, ndarray::array![[0.0], [7.0]]);
        assert_eq!(b.n_cells, vec![1]);
        assert!(b.empty_samples().is_empty());

        let result = sums[1].subset_samples(&[0, 2]);
        assert!(matches!(result, Err(PseudobulkError::DimensionMismatch(_))));
    }

    #[test]
    fn test_cell_count_matrix() {
        let (_, _, cells) = test_matrix();
        let index = GroupIndex::from_cells(&cells);
        let counts = PseudobulkMatrix::from_cell_counts(&index);
        assert_eq!(counts.genes, vec!["A", "B"]);
        assert_eq!(counts.values, ndarray::array![[2.0, 1.0], [0.0, 1.0]]);
        assert_eq!(counts.n_cells, vec![2, 2]);
    }
}
