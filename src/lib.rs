//! Content-addressed, reference-counted image layers.
//!
//! An image is a stack of layers, each one the result of applying a diff archive on top of its
//! parent.  This crate models those layers as immutable nodes:
//!
//! - a layer's content is identified by its [`DiffId`], the digest of its uncompressed diff
//! - a layer together with all of its ancestors is identified by its [`ChainId`]
//! - every consumer of a layer holds a counted [`LayerRef`], and a layer is only removed once
//!   nothing references it any more
//! - the diff of a layer can be read back through a [`VerifiedReader`], which fails the final read
//!   if the stored content no longer matches the diff id
//!
//! Layer content is kept by a storage [`Driver`], and the facts about each layer are persisted in
//! a [`MetadataStore`].  The [`LayerStore`] ties these together.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use layerdb::{FileMetadataStore, Layer, LayerStore, MemoryDriver};
//!
//! let metadata = FileMetadataStore::open("/var/lib/layerdb")?;
//! let mut store = LayerStore::load(Arc::new(MemoryDriver::new()), metadata)?;
//!
//! let base = store.register(&mut std::fs::File::open("base.tar")?, None, None)?;
//! let app = store.register(&mut std::fs::File::open("app.tar")?, Some(base.chain_id()), None)?;
//! println!("{} ({} bytes)", app.chain_id(), app.size()?);
//!
//! store.release(base)?;
//! store.release(app)?;
//! # Ok::<(), layerdb::LayerError>(())
//! ```

pub mod digest;
pub mod driver;
pub mod error;
pub mod layer;
pub mod metadata;
pub mod store;
pub mod verify;


pub use digest::{Algorithm, CacheId, ChainId, DiffId, Digest, DigestError};
pub use driver::{DiffStream, Driver, MemoryDriver};
pub use error::{LayerError, Result};
pub use layer::{Layer, LayerMetadata, LayerRef, ReferenceId, RoLayer};
pub use metadata::{FileMetadataStore, FileMetadataTransaction, MetadataStore, MetadataTransaction};
pub use store::LayerStore;
pub use verify::{HashingReader, VerificationError, VerifiedReader};
