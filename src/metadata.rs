//! Persistent layer metadata.
//!
//! Layers write themselves into a [`MetadataTransaction`]; nothing is visible until the
//! transaction is committed under the layer's chain id.  A [`MetadataStore`] hands out
//! transactions and reads back what was committed.
//!
//! [`FileMetadataStore`] uses one directory per layer:
//!
//! ```text
//! <root>/sha256/<hex>/
//! +-- diff              # diff id
//! +-- size              # size of the layer's own diff, decimal
//! +-- cache-id          # driver locator
//! +-- descriptor.json   # OCI descriptor of the source blob (optional)
//! +-- parent            # chain id of the parent (absent for base layers)
//! ```

use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, trace};
use oci_spec::image::Descriptor;
use tempfile::TempDir;

use crate::digest::{Algorithm, CacheId, ChainId, DiffId};

/// A write-once record of one layer's metadata.
///
/// Dropping a transaction without committing it discards it.
pub trait MetadataTransaction {
    fn set_diff_id(&mut self, diff_id: &DiffId) -> io::Result<()>;
    fn set_size(&mut self, size: u64) -> io::Result<()>;
    fn set_cache_id(&mut self, cache_id: &CacheId) -> io::Result<()>;
    fn set_descriptor(&mut self, descriptor: &Descriptor) -> io::Result<()>;
    fn set_parent(&mut self, parent: &ChainId) -> io::Result<()>;

    /// Makes the recorded metadata visible under `chain_id`.
    fn commit(self, chain_id: &ChainId) -> io::Result<()>
    where
        Self: Sized;

    fn cancel(self) -> io::Result<()>
    where
        Self: Sized;
}

pub trait MetadataStore {
    type Transaction: MetadataTransaction;

    fn start_transaction(&self) -> io::Result<Self::Transaction>;

    fn diff_id(&self, chain_id: &ChainId) -> io::Result<DiffId>;
    fn size(&self, chain_id: &ChainId) -> io::Result<u64>;
    fn cache_id(&self, chain_id: &ChainId) -> io::Result<CacheId>;
    fn descriptor(&self, chain_id: &ChainId) -> io::Result<Option<Descriptor>>;
    fn parent(&self, chain_id: &ChainId) -> io::Result<Option<ChainId>>;

    /// All chain ids with committed metadata.
    fn list(&self) -> io::Result<Vec<ChainId>>;

    fn remove(&self, chain_id: &ChainId) -> io::Result<()>;
}

const DIFF: &str = "diff";
const SIZE: &str = "size";
const CACHE_ID: &str = "cache-id";
const DESCRIPTOR: &str = "descriptor.json";
const PARENT: &str = "parent";

fn invalid_data(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, source)
}

fn optional<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Layer metadata kept in a directory tree.
#[derive(Debug)]
pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    /// Opens (creating if necessary) a metadata store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FileMetadataStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, chain_id: &ChainId) -> PathBuf {
        let digest = chain_id.digest();
        self.root
            .join(digest.algorithm().id())
            .join(digest.hex())
    }

    fn read(&self, chain_id: &ChainId, name: &str) -> io::Result<String> {
        fs::read_to_string(self.layer_dir(chain_id).join(name))
    }

    fn read_digest<T>(&self, chain_id: &ChainId, name: &str) -> io::Result<T>
    where
        T: FromStr<Err = crate::digest::DigestError>,
    {
        self.read(chain_id, name)?.parse().map_err(invalid_data)
    }
}

impl MetadataStore for FileMetadataStore {
    type Transaction = FileMetadataTransaction;

    fn start_transaction(&self) -> io::Result<FileMetadataTransaction> {
        let staging = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(&self.root)?;
        Ok(FileMetadataTransaction {
            root: self.root.clone(),
            staging,
        })
    }

    fn diff_id(&self, chain_id: &ChainId) -> io::Result<DiffId> {
        self.read_digest(chain_id, DIFF)
    }

    fn size(&self, chain_id: &ChainId) -> io::Result<u64> {
        self.read(chain_id, SIZE)?.trim().parse().map_err(invalid_data)
    }

    fn cache_id(&self, chain_id: &ChainId) -> io::Result<CacheId> {
        let cache_id = self.read(chain_id, CACHE_ID)?;
        if cache_id.is_empty() {
            return Err(invalid_data(format!("empty cache id for layer {chain_id}")));
        }
        Ok(CacheId::from(cache_id))
    }

    fn descriptor(&self, chain_id: &ChainId) -> io::Result<Option<Descriptor>> {
        let Some(data) = optional(fs::read(self.layer_dir(chain_id).join(DESCRIPTOR)))? else {
            return Ok(None);
        };
        serde_json::from_slice(&data).map(Some).map_err(invalid_data)
    }

    fn parent(&self, chain_id: &ChainId) -> io::Result<Option<ChainId>> {
        optional(self.read_digest(chain_id, PARENT))
    }

    fn list(&self) -> io::Result<Vec<ChainId>> {
        let mut result = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(algorithm) = name.to_str().and_then(Algorithm::from_id) else {
                trace!("skipping {name:?} in layer metadata root");
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }

            for layer in fs::read_dir(entry.path())? {
                let layer = layer?;
                let name = layer.file_name();
                let parsed = name
                    .to_str()
                    .map(|hex| format!("{algorithm}:{hex}").parse::<ChainId>());
                match parsed {
                    Some(Ok(chain_id)) => result.push(chain_id),
                    _ => debug!("ignoring invalid layer metadata directory {name:?}"),
                }
            }
        }
        result.sort();
        Ok(result)
    }

    fn remove(&self, chain_id: &ChainId) -> io::Result<()> {
        fs::remove_dir_all(self.layer_dir(chain_id))
    }
}

/// A transaction staging metadata files in a temporary directory.
///
/// Committing renames the directory into place.
#[derive(Debug)]
pub struct FileMetadataTransaction {
    root: PathBuf,
    staging: TempDir,
}

impl FileMetadataTransaction {
    fn write(&self, name: &str, data: impl AsRef<[u8]>) -> io::Result<()> {
        fs::write(self.staging.path().join(name), data)
    }
}

impl MetadataTransaction for FileMetadataTransaction {
    fn set_diff_id(&mut self, diff_id: &DiffId) -> io::Result<()> {
        self.write(DIFF, diff_id.as_str())
    }

    fn set_size(&mut self, size: u64) -> io::Result<()> {
        self.write(SIZE, size.to_string())
    }

    fn set_cache_id(&mut self, cache_id: &CacheId) -> io::Result<()> {
        self.write(CACHE_ID, cache_id.as_str())
    }

    fn set_descriptor(&mut self, descriptor: &Descriptor) -> io::Result<()> {
        self.write(DESCRIPTOR, serde_json::to_vec(descriptor)?)
    }

    fn set_parent(&mut self, parent: &ChainId) -> io::Result<()> {
        self.write(PARENT, parent.as_str())
    }

    fn commit(self, chain_id: &ChainId) -> io::Result<()> {
        let digest = chain_id.digest();
        let algorithm_dir = self.root.join(digest.algorithm().id());
        fs::create_dir_all(&algorithm_dir)?;
        fs::rename(self.staging.path(), algorithm_dir.join(digest.hex()))
        // the TempDir drop finds nothing left to clean up
    }

    fn cancel(self) -> io::Result<()> {
        self.staging.close()
    }
}
