//! # pseudobulk-de
//!
//! Cluster-specific pseudobulk differential expression for multi-sample, multi-group
//! single-cell data, part of the single-rust ecosystem.
//!
//! Per-cell counts are collapsed into per-cluster, per-sample profiles, each cluster is
//! tested independently with a negative-binomial GLM and a quasi-likelihood F-test with
//! empirical-Bayes moderated dispersions, and the resulting hit lists are compared
//! across clusters.
//!
//! ## Core Features
//!
//! - **Pseudobulk Aggregation**: sums and means per (cluster, sample) bucket from sparse
//!   `CscMatrix` or `CsrMatrix` input, with a fixed global sample order
//! - **Normalisation and Dispersion**: TMM factors and common, trended and tagwise NB
//!   dispersions
//! - **Differential Testing**: IRLS-fitted NB GLMs, QL F-tests or likelihood ratio tests,
//!   and FDR correction
//! - **Concordance**: asymmetric overlap of significant genes between clusters
//!
//! ## Quick Start
//!
//! Build a [`grouping::GroupIndex`] and [`grouping::SampleSheet`] from the cell
//! annotations, then call [`pipeline::run_pipeline`] with the count matrix and the
//! comparison of interest. Every cluster ends up either with a result table or with a
//! failure reason in [`pipeline::PipelineOutput::failures`].
//!
//! ## Module Organization
//!
//! - **[`grouping`]**: cell partition by (cluster, sample) and label orders
//! - **[`aggregate`]**: pseudobulk matrices
//! - **[`design`]**: one-hot design matrices and contrasts
//! - **[`normalize`]**: zero-gene filtering, TMM and dispersion estimation
//! - **[`testing`]**: GLM fitting, quasi-likelihood moderation and multiple testing correction
//! - **[`filter`]** and **[`concordance`]**: hit lists and their cross-cluster overlap
//! - **[`pipeline`]**: orchestration with per-cluster failure isolation

pub mod aggregate;
pub mod concordance;
pub mod config;
pub mod design;
pub mod error;
pub mod filter;
pub mod grouping;
pub mod normalize;
pub mod pipeline;
pub mod testing;

pub use config::PipelineConfig;
pub use error::{PseudobulkError, Result};
