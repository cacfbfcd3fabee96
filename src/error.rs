use thiserror::Error;

/// Errors raised by the pseudobulk pipeline.
///
/// Per-cluster variants (`DesignDegenerate`, `InsufficientSamples`) are captured in
/// the pipeline's failure manifest instead of aborting the other clusters.
#[derive(Debug, Error)]
pub enum PseudobulkError {
    #[error("missing metadata: {0}")]
    MissingMetadata(String),

    #[error("design matrix is not full rank for cluster '{cluster}': {reason}")]
    DesignDegenerate { cluster: String, reason: String },

    #[error("cluster '{cluster}' has {usable} usable samples, at least {required} required")]
    InsufficientSamples {
        cluster: String,
        usable: usize,
        required: usize,
    },

    #[error("invalid contrast: {0}")]
    InvalidContrast(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("unknown label '{label}' in {kind} order")]
    UnknownLabel { kind: &'static str, label: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PseudobulkError {
    /// Attach a cluster label to cluster-scoped errors raised before the cluster was known.
    pub(crate) fn in_cluster(self, cluster: &str) -> Self {
        match self {
            PseudobulkError::DesignDegenerate { reason, .. } => PseudobulkError::DesignDegenerate {
                cluster: cluster.to_string(),
                reason,
            },
            PseudobulkError::InsufficientSamples {
                usable, required, ..
            } => PseudobulkError::InsufficientSamples {
                cluster: cluster.to_string(),
                usable,
                required,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PseudobulkError>;
