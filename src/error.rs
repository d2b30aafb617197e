//! Error types for layer operations.
//!
//! Faults from collaborators (the storage driver and the metadata store) are `std::io::Error`s
//! and are passed through unchanged as [`LayerError::Io`].  Content corruption is not reported
//! here: it surfaces as the final read error of a [`VerifiedReader`], carrying a
//! [`VerificationError`].
//!
//! [`VerifiedReader`]: crate::verify::VerifiedReader
//! [`VerificationError`]: crate::verify::VerificationError

use std::io;

use crate::digest::{ChainId, DigestError};

/// Result type alias for operations that may return a [`LayerError`].
pub type Result<T> = std::result::Result<T, LayerError>;

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// A diff was requested against a layer that is not an ancestor.
    #[error(
        "layer ID '{ancestor}' is not a parent of layer '{layer}': cannot provide diff to \
         non-parent"
    )]
    InvalidAncestor { layer: ChainId, ancestor: ChainId },

    /// The layer is not present in the store.
    #[error("layer not found: {0}")]
    UnknownLayer(ChainId),

    /// The layer still has outstanding references and can't be deleted.
    #[error("layer {chain_id} is in use by {references} references")]
    InUse { chain_id: ChainId, references: usize },

    /// Persisted metadata is inconsistent.
    #[error("invalid metadata for layer {chain_id}: {reason}")]
    InvalidMetadata { chain_id: ChainId, reason: String },

    #[error("invalid digest: {0}")]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
