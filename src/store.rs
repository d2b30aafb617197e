//! The registry of all read-only layers.
//!
//! [`LayerStore`] owns every [`RoLayer`], keyed by chain id, so that a given chain of content
//! exists exactly once in memory.  It creates layers from diff archives, persists them via a
//! [`MetadataStore`], hands out references, and removes layers once their last reference is
//! released.  All mutation goes through `&mut self`: checking that a layer is unreferenced and
//! deleting it can't interleave with acquiring a new reference.

use std::{
    collections::{HashMap, HashSet},
    io::{self, Read},
    sync::Arc,
};

use log::{debug, trace};
use oci_spec::image::Descriptor;

use crate::{
    digest::{Algorithm, CacheId, ChainId, DiffId},
    driver::Driver,
    error::{LayerError, Result},
    layer::{Layer, LayerMetadata, LayerRef, RoLayer},
    metadata::{MetadataStore, MetadataTransaction},
    verify::HashingReader,
};

/// The algorithm used for the diff ids of newly registered layers.
pub const DIFF_ID_ALGORITHM: Algorithm = Algorithm::Sha256;

pub struct LayerStore<M: MetadataStore> {
    driver: Arc<dyn Driver>,
    metadata: M,
    layers: HashMap<ChainId, Arc<RoLayer>>,
}

impl<M: MetadataStore + std::fmt::Debug> std::fmt::Debug for LayerStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStore")
            .field("metadata", &self.metadata)
            .field("layers", &self.layers)
            .finish()
    }
}

impl<M: MetadataStore> LayerStore<M> {
    /// Creates an empty store.  Nothing already present in `metadata` is loaded.
    pub fn new(driver: Arc<dyn Driver>, metadata: M) -> Self {
        LayerStore {
            driver,
            metadata,
            layers: HashMap::new(),
        }
    }

    /// Creates a store holding every layer recorded in `metadata`.
    ///
    /// Loaded layers start out with no references other than those held by their children.
    pub fn load(driver: Arc<dyn Driver>, metadata: M) -> Result<Self> {
        let mut store = Self::new(driver, metadata);
        for chain_id in store.metadata.list()? {
            store.load_layer(&chain_id, &mut HashSet::new())?;
        }
        debug!("loaded {} layers", store.layers.len());
        Ok(store)
    }

    fn load_layer(
        &mut self,
        chain_id: &ChainId,
        loading: &mut HashSet<ChainId>,
    ) -> Result<Arc<RoLayer>> {
        if let Some(layer) = self.layers.get(chain_id) {
            return Ok(Arc::clone(layer));
        }
        if !loading.insert(chain_id.clone()) {
            return Err(LayerError::InvalidMetadata {
                chain_id: chain_id.clone(),
                reason: "layer is its own ancestor".to_string(),
            });
        }

        let diff_id = self.metadata.diff_id(chain_id)?;
        let size = self.metadata.size(chain_id)?;
        let cache_id = self.metadata.cache_id(chain_id)?;
        let descriptor = self.metadata.descriptor(chain_id)?;
        let parent = match self.metadata.parent(chain_id)? {
            Some(parent) => Some(self.load_layer(&parent, loading)?.acquire()),
            None => None,
        };

        let expected = ChainId::compute(parent.as_ref().map(|p| p.chain_id()), &diff_id);
        if expected != *chain_id {
            return Err(LayerError::InvalidMetadata {
                chain_id: chain_id.clone(),
                reason: format!("parent and diff id give chain id {expected}"),
            });
        }

        trace!("loaded layer {chain_id} (cache {cache_id})");
        let layer = RoLayer::new(
            chain_id.clone(),
            diff_id,
            size,
            cache_id,
            descriptor,
            parent,
            Arc::clone(&self.driver),
        );
        self.layers.insert(chain_id.clone(), Arc::clone(&layer));
        Ok(layer)
    }

    pub fn metadata_store(&self) -> &M {
        &self.metadata
    }

    pub fn contains(&self, chain_id: &ChainId) -> bool {
        self.layers.contains_key(chain_id)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The chain ids of all layers, sorted.
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut result: Vec<ChainId> = self.layers.keys().cloned().collect();
        result.sort();
        result
    }

    /// Returns a new reference to a layer.
    pub fn get(&self, chain_id: &ChainId) -> Option<LayerRef> {
        self.layers.get(chain_id).map(RoLayer::acquire)
    }

    /// Registers a diff archive as a new layer on top of `parent`.
    ///
    /// If a layer with the same content and ancestry already exists, the new data is dropped and
    /// a reference to the existing layer is returned instead.  On failure nothing is left behind.
    pub fn register(
        &mut self,
        diff: &mut dyn Read,
        parent: Option<&ChainId>,
        descriptor: Option<Descriptor>,
    ) -> Result<LayerRef> {
        let parent = match parent {
            Some(chain_id) => Some(Arc::clone(
                self.layers
                    .get(chain_id)
                    .ok_or_else(|| LayerError::UnknownLayer(chain_id.clone()))?,
            )),
            None => None,
        };
        let parent_cache_id = parent.as_ref().map(|p| p.cache_id());

        let cache_id = CacheId::generate();
        self.driver.create(&cache_id, parent_cache_id)?;

        let mut reader = HashingReader::new(diff, DIFF_ID_ALGORITHM);
        let applied = self
            .driver
            .apply_diff(&cache_id, parent_cache_id, &mut reader)
            // the driver may stop at the end-of-archive marker; the diff id covers everything
            .and_then(|size| io::copy(&mut reader, &mut io::sink()).map(|_| size));
        let size = match applied {
            Ok(size) => size,
            Err(err) => {
                self.remove_driver_data(&cache_id);
                return Err(err.into());
            }
        };
        let diff_id: DiffId = reader.digest().into();
        let chain_id = ChainId::compute(parent.as_ref().map(|p| p.chain_id()), &diff_id);

        if let Some(existing) = self.layers.get(&chain_id) {
            debug!("layer {chain_id} is already registered");
            let reference = existing.acquire();
            self.remove_driver_data(&cache_id);
            return Ok(reference);
        }

        let layer = RoLayer::new(
            chain_id.clone(),
            diff_id,
            size,
            cache_id,
            descriptor,
            parent.as_ref().map(RoLayer::acquire),
            Arc::clone(&self.driver),
        );

        if let Err(err) = self.persist(&layer) {
            self.discard(layer);
            return Err(err);
        }

        debug!(
            "registered layer {chain_id} (diff {}, {size} bytes, cache {})",
            layer.diff_id(),
            layer.cache_id()
        );
        let reference = layer.acquire();
        self.layers.insert(chain_id, layer);
        Ok(reference)
    }

    fn persist(&self, layer: &RoLayer) -> Result<()> {
        let mut tx = self.metadata.start_transaction()?;
        if let Err(err) = layer.store(&mut tx) {
            if let Err(cancel_err) = tx.cancel() {
                debug!("failed to cancel metadata transaction: {cancel_err}");
            }
            return Err(err);
        }
        tx.commit(layer.chain_id())?;
        Ok(())
    }

    /// Throws away a layer that never made it into the store.
    fn discard(&self, layer: Arc<RoLayer>) {
        self.remove_driver_data(layer.cache_id());
        if let Some(parent) = layer.parent_ref() {
            parent.layer().release(parent);
        }
    }

    fn remove_driver_data(&self, cache_id: &CacheId) {
        if let Err(err) = self.driver.remove(cache_id) {
            debug!("failed to remove driver data {cache_id}: {err}");
        }
    }

    /// Releases a reference.
    ///
    /// If that was the last reference to the layer, the layer is removed, which in turn releases
    /// its parent, and so on.  Returns the layers that were removed, topmost first.
    pub fn release(&mut self, reference: LayerRef) -> Result<Vec<LayerMetadata>> {
        let layer = Arc::clone(reference.layer_arc());
        layer.release(&reference);
        drop(reference);

        let mut removed = vec![];
        self.remove_unreferenced(Some(layer), &mut removed)?;
        Ok(removed)
    }

    fn remove_unreferenced(
        &mut self,
        mut next: Option<Arc<RoLayer>>,
        removed: &mut Vec<LayerMetadata>,
    ) -> Result<()> {
        while let Some(layer) = next.take() {
            if layer.has_references() {
                trace!(
                    "layer {} still has {} references",
                    layer.chain_id(),
                    layer.reference_count()
                );
                break;
            }
            match self.layers.get(layer.chain_id()) {
                Some(ours) if Arc::ptr_eq(ours, &layer) => {}
                _ => break,
            }

            removed.push(layer.summary()?);
            next = self.remove_layer(&layer)?;
        }
        Ok(())
    }

    /// Removes a layer, releasing the reference it held on its parent.
    ///
    /// Returns the parent, which may have become unreferenced.
    fn remove_layer(&mut self, layer: &RoLayer) -> Result<Option<Arc<RoLayer>>> {
        self.driver.remove(layer.cache_id())?;
        self.metadata.remove(layer.chain_id())?;
        self.layers.remove(layer.chain_id());
        debug!("removed layer {}", layer.chain_id());

        Ok(layer.parent_ref().map(|parent| {
            parent.layer().release(parent);
            Arc::clone(parent.layer_arc())
        }))
    }

    /// Deletes a layer which nothing references.
    ///
    /// Fails with [`LayerError::InUse`] if the layer still has references, including those held
    /// by child layers.  Ancestors left unreferenced by the deletion are removed as well.
    pub fn delete(&mut self, chain_id: &ChainId) -> Result<Vec<LayerMetadata>> {
        let layer = Arc::clone(
            self.layers
                .get(chain_id)
                .ok_or_else(|| LayerError::UnknownLayer(chain_id.clone()))?,
        );
        if layer.has_references() {
            return Err(LayerError::InUse {
                chain_id: chain_id.clone(),
                references: layer.reference_count(),
            });
        }

        let mut removed = vec![layer.summary()?];
        let parent = self.remove_layer(&layer)?;
        self.remove_unreferenced(parent, &mut removed)?;
        Ok(removed)
    }
}
