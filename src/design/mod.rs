//! One-hot (no intercept) design matrices and contrasts.

use crate::error::{PseudobulkError, Result};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The group comparison under test: `treatment - reference`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub treatment: String,
    pub reference: String,
}

impl Comparison {
    pub fn new(treatment: &str, reference: &str) -> Self {
        Comparison {
            treatment: treatment.to_string(),
            reference: reference.to_string(),
        }
    }
}

/// Samples × groups design matrix with its contrast vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDesign {
    /// Row labels, in pseudobulk column order.
    pub samples: Vec<String>,
    /// Column labels, lexical.
    pub groups: Vec<String>,
    pub matrix: Array2<f64>,
    pub contrast: Array1<f64>,
    pub comparison: Comparison,
}

impl ExperimentDesign {
    /// Build the one-hot design for `group_ids` (aligned with `sample_ids`) and the
    /// `+1 treatment / -1 reference` contrast.
    pub fn one_hot(
        sample_ids: &[String],
        group_ids: &[String],
        comparison: &Comparison,
    ) -> Result<Self> {
        if sample_ids.len() != group_ids.len() {
            return Err(PseudobulkError::DimensionMismatch(format!(
                "{} samples but {} group labels",
                sample_ids.len(),
                group_ids.len()
            )));
        }
        if comparison.treatment == comparison.reference {
            return Err(PseudobulkError::InvalidContrast(format!(
                "treatment and reference are both '{}'",
                comparison.treatment
            )));
        }

        let groups: Vec<String> = group_ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let position = |label: &str| groups.iter().position(|g| g == label);
        let treatment = position(&comparison.treatment).ok_or_else(|| {
            PseudobulkError::InvalidContrast(format!(
                "treatment group '{}' has no samples",
                comparison.treatment
            ))
        })?;
        let reference = position(&comparison.reference).ok_or_else(|| {
            PseudobulkError::InvalidContrast(format!(
                "reference group '{}' has no samples",
                comparison.reference
            ))
        })?;

        let mut matrix = Array2::zeros((sample_ids.len(), groups.len()));
        for (i, g) in group_ids.iter().enumerate() {
            if let Some(j) = position(g) {
                matrix[[i, j]] = 1.0;
            }
        }

        let mut contrast = Array1::zeros(groups.len());
        contrast[treatment] = 1.0;
        contrast[reference] = -1.0;

        let design = ExperimentDesign {
            samples: sample_ids.to_vec(),
            groups,
            matrix,
            contrast,
            comparison: comparison.clone(),
        };
        design.check_full_rank()?;
        Ok(design)
    }

    /// Replace the contrast with an arbitrary linear combination of group coefficients.
    pub fn with_contrast(mut self, contrast: Vec<f64>) -> Result<Self> {
        if contrast.len() != self.groups.len() {
            return Err(PseudobulkError::InvalidContrast(format!(
                "contrast has {} entries for {} groups",
                contrast.len(),
                self.groups.len()
            )));
        }
        if contrast.iter().all(|&c| c == 0.0) {
            return Err(PseudobulkError::InvalidContrast("contrast is all zero".to_string()));
        }
        self.contrast = Array1::from_vec(contrast);
        Ok(self)
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Restrict to the given sample rows and re-check the rank.
    pub fn subset(&self, rows: &[usize]) -> Result<Self> {
        let design = ExperimentDesign {
            samples: rows.iter().map(|&r| self.samples[r].clone()).collect(),
            groups: self.groups.clone(),
            matrix: self.matrix.select(ndarray::Axis(0), rows),
            contrast: self.contrast.clone(),
            comparison: self.comparison.clone(),
        };
        design.check_full_rank()?;
        Ok(design)
    }

    /// Fail with `DesignDegenerate` unless the design has full column rank.
    pub fn check_full_rank(&self) -> Result<()> {
        let rank = matrix_rank(&self.matrix);
        if rank < self.n_coefficients() {
            let empty: Vec<&str> = (0..self.n_coefficients())
                .filter(|&j| self.matrix.column(j).iter().all(|&v| v == 0.0))
                .map(|j| self.groups[j].as_str())
                .collect();
            let reason = if empty.is_empty() {
                format!("rank {} for {} coefficients", rank, self.n_coefficients())
            } else {
                format!("groups without samples: {}", empty.join(", "))
            };
            return Err(PseudobulkError::DesignDegenerate {
                cluster: String::new(),
                reason,
            });
        }
        Ok(())
    }
}

/// Numerical rank from the singular values.
pub fn matrix_rank(matrix: &Array2<f64>) -> usize {
    let (n, p) = matrix.dim();
    if n == 0 || p == 0 {
        return 0;
    }
    let m = DMatrix::from_fn(n, p, |i, j| matrix[[i, j]]);
    let svd = m.svd(false, false);
    let max_sv = svd.singular_values.max();
    let tol = n.max(p) as f64 * f64::EPSILON * max_sv.max(1.0);
    svd.singular_values.iter().filter(|&&s| s > tol).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_one_hot_design() {
        let design = ExperimentDesign::one_hot(
            &labels(&["s1", "s2", "s3", "s4"]),
            &labels(&["ctrl", "ctrl", "stim", "stim"]),
            &Comparison::new("stim", "ctrl"),
        )
        .unwrap();
        assert_eq!(design.groups, vec!["ctrl", "stim"]);
        assert_eq!(
            design.matrix,
            ndarray::array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]]
        );
        assert_eq!(design.contrast, ndarray::array![-1.0, 1.0]);
    }

    #[test]
    fn test_three_groups_contrast() {
        let design = ExperimentDesign::one_hot(
            &labels(&["s1", "s2", "s3"]),
            &labels(&["b", "a", "c"]),
            &Comparison::new("c", "a"),
        )
        .unwrap();
        assert_eq!(design.contrast, ndarray::array![-1.0, 0.0, 1.0]);
        assert_eq!(design.matrix[[0, 1]], 1.0);
    }

    #[test]
    fn test_custom_contrast() {
        let design = ExperimentDesign::one_hot(
            &labels(&["s1", "s2", "s3"]),
            &labels(&["a", "b", "c"]),
            &Comparison::new("c", "a"),
        )
        .unwrap();

        let wrong_length = design.clone().with_contrast(vec![1.0, -1.0]);
        assert!(matches!(wrong_length, Err(PseudobulkError::InvalidContrast(_))));
        let all_zero = design.clone().with_contrast(vec![0.0; 3]);
        assert!(matches!(all_zero, Err(PseudobulkError::InvalidContrast(_))));

        let averaged = design.with_contrast(vec![0.5, 0.5, -1.0]).unwrap();
        assert_eq!(averaged.contrast, ndarray::array![0.5, 0.5, -1.0]);
        assert_eq!(averaged.subset(&[0, 1, 2]).unwrap().contrast, averaged.contrast);
    }

    #[test]
    fn test_unknown_group() {
        let result = ExperimentDesign::one_hot(
            &labels(&["s1", "s2"]),
            &labels(&["ctrl", "ctrl"]),
            &Comparison::new("stim", "ctrl"),
        );
        assert!(matches!(result, Err(PseudobulkError::InvalidContrast(_))));
    }

    #[test]
    fn test_subset_becomes_degenerate() {
        let design = ExperimentDesign::one_hot(
            &labels(&["s1", "s2", "s3"]),
            &labels(&["ctrl", "ctrl", "stim"]),
            &Comparison::new("stim", "ctrl"),
        )
        .unwrap();
        let err = design.subset(&[0, 1]).unwrap_err();
        match err {
            PseudobulkError::DesignDegenerate { reason, .. } => assert!(reason.contains("stim")),
            other => panic!("unexpected error {other}"),
        }
        assert!(design.subset(&[0, 2]).is_ok());
    }

    #[test]
    fn test_matrix_rank() {
        let m = ndarray::array![[1.0, 0.0, 1.0], [1.0, 0.0, 1.0], [1.0, 1.0, 2.0]];
        assert_eq!(matrix_rank(&m), 2);
        let id = Array2::<f64>::eye(3);
        assert_eq!(matrix_rank(&id), 3);
    }
}
