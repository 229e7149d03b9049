//! Error types for clustio.

use thiserror::Error;

use crate::element::ClusterId;

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClustioError>;

/// Errors surfaced by the clustering engines.
///
/// Every operation is deterministic and side-effect free at the engine
/// boundary: a returned error leaves the engine state unchanged.
#[derive(Debug, Error)]
pub enum ClustioError {
    /// A construction parameter or input coordinate was rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A query was issued before the index was loaded.
    #[error("index has not been loaded")]
    NotLoaded,

    /// The given cluster identifier is unknown to this engine instance.
    #[error("unknown cluster: {0}")]
    ClusterNotFound(ClusterId),

    /// The given point is not present in the index.
    #[error("point not found in index")]
    PointNotFound,
}
