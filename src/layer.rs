//! Read-only layers and references to them.
//!
//! A [`RoLayer`] is one immutable layer of an image, linked to its parent.  The link is itself a
//! [`LayerRef`]: as long as a child exists, its parent is referenced and can't be deleted.
//!
//! Every consumer of a layer (an image, a container, a child layer) holds its own [`LayerRef`],
//! obtained from [`RoLayer::acquire()`].  Two references to the same layer are distinct: each is
//! tracked and released on its own, and releasing one twice has no further effect.  A layer may
//! only be removed once it has no references left.
//!
//! Layers don't synchronize anything beyond their own reference set: the owning store is expected
//! to serialize acquiring, releasing and deleting.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use oci_spec::image::Descriptor;

use crate::{
    digest::{CacheId, ChainId, DiffId},
    driver::{DiffStream, Driver},
    error::{LayerError, Result},
    metadata::MetadataTransaction,
    verify::VerifiedReader,
};

/// The operations shared by layers and references to them.
pub trait Layer: fmt::Debug + Send + Sync {
    fn chain_id(&self) -> &ChainId;

    fn diff_id(&self) -> &DiffId;

    /// The parent layer, or None for a base layer.
    fn parent(&self) -> Option<&dyn Layer>;

    /// The size of this layer plus all of its ancestors.
    fn size(&self) -> Result<u64>;

    /// The size of this layer's own diff.
    fn diff_size(&self) -> Result<u64>;

    /// The descriptor of the blob this layer was pulled from, if any.
    fn descriptor(&self) -> Option<&Descriptor>;

    /// Driver-specific information about this layer.
    fn metadata(&self) -> Result<HashMap<String, String>>;

    /// Returns the diff archive of this layer alone.
    ///
    /// The data is guaranteed to be exactly what the layer was registered with: if it was modified
    /// in storage, the final read of the stream fails with a verification error.
    fn tar_stream(&self) -> Result<VerifiedReader<DiffStream>>;

    /// Returns the changes of this layer relative to one of its ancestors, or its full content if
    /// `ancestor` is None.
    ///
    /// This makes no promise about the exact bytes produced and must not be used where the content
    /// needs to match the registered diff id.
    fn tar_stream_from(&self, ancestor: Option<&ChainId>) -> Result<DiffStream>;
}

/// Identity of one reference to a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceId(u64);

#[derive(Debug, Default)]
struct References {
    next: u64,
    live: HashSet<ReferenceId>,
}

/// An immutable layer.
pub struct RoLayer {
    chain_id: ChainId,
    diff_id: DiffId,
    size: u64,
    cache_id: CacheId,
    descriptor: Option<Descriptor>,
    parent: Option<LayerRef>,
    driver: Arc<dyn Driver>,
    references: Mutex<References>,
}

impl fmt::Debug for RoLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // driver doesn't impl Debug
        f.debug_struct("RoLayer")
            .field("chain_id", &self.chain_id)
            .field("diff_id", &self.diff_id)
            .field("size", &self.size)
            .field("cache_id", &self.cache_id)
            .field("descriptor", &self.descriptor)
            .field("parent", &self.parent.as_ref().map(|p| p.chain_id()))
            .field("references", &self.reference_count())
            .finish()
    }
}

impl RoLayer {
    /// Creates a layer from already known values.
    ///
    /// The chain id must have been computed from `parent` and `diff_id` by the caller.  The layer
    /// takes over `parent`, which stays referenced until the layer is dropped.
    pub fn new(
        chain_id: ChainId,
        diff_id: DiffId,
        size: u64,
        cache_id: CacheId,
        descriptor: Option<Descriptor>,
        parent: Option<LayerRef>,
        driver: Arc<dyn Driver>,
    ) -> Arc<Self> {
        Arc::new(RoLayer {
            chain_id,
            diff_id,
            size,
            cache_id,
            descriptor,
            parent,
            driver,
            references: Mutex::default(),
        })
    }

    pub fn cache_id(&self) -> &CacheId {
        &self.cache_id
    }

    /// The reference this layer holds on its parent.
    pub fn parent_ref(&self) -> Option<&LayerRef> {
        self.parent.as_ref()
    }

    /// Iterates over the ancestors of this layer, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = &RoLayer> {
        std::iter::successors(self.parent.as_ref().map(LayerRef::layer), |layer| {
            layer.parent.as_ref().map(LayerRef::layer)
        })
    }

    /// The number of layers in the chain ending at this layer: 1 for a base layer.
    pub fn depth(&self) -> usize {
        match &self.parent {
            None => 1,
            Some(parent) => parent.layer().depth() + 1,
        }
    }

    fn references(&self) -> MutexGuard<'_, References> {
        self.references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a new, distinct reference to this layer.
    pub fn acquire(self: &Arc<Self>) -> LayerRef {
        let mut references = self.references();
        let id = ReferenceId(references.next);
        references.next += 1;
        references.live.insert(id);

        LayerRef {
            layer: Arc::clone(self),
            id,
        }
    }

    /// Whether `reference` is a live reference to this layer.
    pub fn has_reference(&self, reference: &LayerRef) -> bool {
        std::ptr::eq(reference.layer(), self) && self.references().live.contains(&reference.id)
    }

    /// Whether any reference to this layer is live.
    ///
    /// A layer must not be deleted while this is true.
    pub fn has_references(&self) -> bool {
        !self.references().live.is_empty()
    }

    pub fn reference_count(&self) -> usize {
        self.references().live.len()
    }

    /// Releases `reference`.
    ///
    /// Releasing a reference which was already released, or which belongs to another layer, does
    /// nothing.
    pub fn release(&self, reference: &LayerRef) {
        if std::ptr::eq(reference.layer(), self) {
            self.references().live.remove(&reference.id);
        }
    }

    /// Writes the metadata of this layer into `tx`.
    ///
    /// Stops at the first failure.  The descriptor is only written if there is one, and the
    /// parent only for layers that have one.
    pub fn store(&self, tx: &mut dyn MetadataTransaction) -> Result<()> {
        tx.set_diff_id(&self.diff_id)?;
        tx.set_size(self.size)?;
        tx.set_cache_id(&self.cache_id)?;
        if let Some(descriptor) = &self.descriptor {
            tx.set_descriptor(descriptor)?;
        }
        if let Some(parent) = &self.parent {
            tx.set_parent(parent.chain_id())?;
        }
        Ok(())
    }

    /// A summary of this layer, as reported when it is removed.
    pub fn summary(&self) -> Result<LayerMetadata> {
        Ok(LayerMetadata {
            chain_id: self.chain_id.clone(),
            diff_id: self.diff_id.clone(),
            size: self.size()?,
            diff_size: self.size,
        })
    }
}

impl Layer for RoLayer {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn diff_id(&self) -> &DiffId {
        &self.diff_id
    }

    fn parent(&self) -> Option<&dyn Layer> {
        self.parent.as_ref().map(|parent| parent as &dyn Layer)
    }

    fn size(&self) -> Result<u64> {
        let parent_size = match &self.parent {
            Some(parent) => parent.size()?,
            None => 0,
        };
        Ok(parent_size + self.size)
    }

    fn diff_size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    fn metadata(&self) -> Result<HashMap<String, String>> {
        Ok(self.driver.metadata(&self.cache_id)?)
    }

    fn tar_stream(&self) -> Result<VerifiedReader<DiffStream>> {
        let stream = self.driver.diff_stream(&self.cache_id)?;
        Ok(VerifiedReader::new(stream, self.diff_id.digest().clone()))
    }

    fn tar_stream_from(&self, ancestor: Option<&ChainId>) -> Result<DiffStream> {
        let base = match ancestor {
            None => None,
            Some(ancestor) => Some(
                self.ancestors()
                    .find(|layer| layer.chain_id == *ancestor)
                    .map(RoLayer::cache_id)
                    .ok_or_else(|| LayerError::InvalidAncestor {
                        layer: self.chain_id.clone(),
                        ancestor: ancestor.clone(),
                    })?,
            ),
        };
        Ok(self.driver.diff(&self.cache_id, base)?)
    }
}

/// One reference to a layer.
///
/// References forward all [`Layer`] operations to the layer they point to.  They are not
/// `Clone`: every reference has to be obtained with [`RoLayer::acquire()`] so that it is counted.
#[derive(Debug)]
pub struct LayerRef {
    layer: Arc<RoLayer>,
    id: ReferenceId,
}

impl LayerRef {
    pub fn id(&self) -> ReferenceId {
        self.id
    }

    pub fn layer(&self) -> &RoLayer {
        &self.layer
    }

    pub fn layer_arc(&self) -> &Arc<RoLayer> {
        &self.layer
    }

    /// Whether this reference is still counted by its layer.
    pub fn is_live(&self) -> bool {
        self.layer.has_reference(self)
    }

    /// Creates another, independent reference to the same layer.
    pub fn acquire(&self) -> LayerRef {
        self.layer.acquire()
    }
}

impl Layer for LayerRef {
    fn chain_id(&self) -> &ChainId {
        self.layer.chain_id()
    }

    fn diff_id(&self) -> &DiffId {
        self.layer.diff_id()
    }

    fn parent(&self) -> Option<&dyn Layer> {
        self.layer.parent()
    }

    fn size(&self) -> Result<u64> {
        self.layer.size()
    }

    fn diff_size(&self) -> Result<u64> {
        self.layer.diff_size()
    }

    fn descriptor(&self) -> Option<&Descriptor> {
        self.layer.descriptor()
    }

    fn metadata(&self) -> Result<HashMap<String, String>> {
        self.layer.metadata()
    }

    fn tar_stream(&self) -> Result<VerifiedReader<DiffStream>> {
        self.layer.tar_stream()
    }

    fn tar_stream_from(&self, ancestor: Option<&ChainId>) -> Result<DiffStream> {
        self.layer.tar_stream_from(ancestor)
    }
}

/// Summary of a layer, as reported when it is removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerMetadata {
    pub chain_id: ChainId,
    pub diff_id: DiffId,
    /// Size including all ancestors.
    pub size: u64,
    pub diff_size: u64,
}

#[cfg(test)]
mod test {
    use std::io::{ErrorKind, Read};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        digest::{Algorithm, Digest},
        test::{Call, RecordingDriver, RecordingTransaction},
    };

    fn diff_id(data: &[u8]) -> DiffId {
        Digest::from_bytes(Algorithm::Sha256, data).into()
    }

    /// Builds a chain of layers on top of each other, returning references to all of them.
    fn chain(driver: &Arc<RecordingDriver>, diffs: &[&[u8]]) -> Vec<LayerRef> {
        let mut result: Vec<LayerRef> = vec![];
        for (i, data) in diffs.iter().enumerate() {
            let parent = result.last();
            let cache_id = CacheId::from(format!("cache{i}"));
            driver.add(&cache_id, parent.map(|p| p.layer().cache_id()), data);

            let diff_id = diff_id(data);
            let chain_id = ChainId::compute(parent.map(|p| p.chain_id()), &diff_id);
            let layer = RoLayer::new(
                chain_id,
                diff_id,
                data.len() as u64,
                cache_id,
                None,
                parent.map(LayerRef::acquire),
                driver.clone(),
            );
            result.push(layer.acquire());
        }
        driver.clear_calls();
        result
    }

    #[test]
    fn test_identity() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"base", b"child"]);

        assert_eq!(layers[0].chain_id().digest(), layers[0].diff_id().digest());
        assert_eq!(
            *layers[1].chain_id(),
            ChainId::compute(Some(layers[0].chain_id()), &diff_id(b"child"))
        );
    }

    #[test]
    fn test_parent() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"base", b"child"]);

        assert!(layers[0].parent().is_none());
        let parent = layers[1].parent().unwrap();
        assert_eq!(parent.chain_id(), layers[0].chain_id());
    }

    #[test]
    fn test_size_and_depth() {
        let driver = Arc::new(RecordingDriver::default());
        let diffs: [&[u8]; 5] = [b"a", b"bb", b"ccc", b"dddd", b"eeeee"];

        for len in [1, 2, 5] {
            let layers = chain(&driver, &diffs[..len]);
            let top = layers.last().unwrap();
            let expected: u64 = diffs[..len].iter().map(|d| d.len() as u64).sum();
            assert_eq!(top.size().unwrap(), expected);
            assert_eq!(top.diff_size().unwrap(), len as u64);
            assert_eq!(top.layer().depth(), len);
            driver.reset();
        }

        let layers = chain(&driver, &diffs);
        for (i, layer) in layers.iter().enumerate() {
            assert_eq!(layer.layer().depth(), i + 1);
            assert_eq!(layer.layer().ancestors().count(), i);
        }
    }

    #[test]
    fn test_references() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"base"]);
        let layer = layers[0].layer_arc().clone();
        layer.release(&layers[0]);
        assert!(!layer.has_references());

        let handles: Vec<LayerRef> = (0..4).map(|_| layer.acquire()).collect();
        assert_eq!(layer.reference_count(), 4);

        // all distinct
        let ids: HashSet<ReferenceId> = handles.iter().map(LayerRef::id).collect();
        assert_eq!(ids.len(), 4);

        // release out of order, some twice
        for i in [2, 0, 2, 3, 0] {
            layer.release(&handles[i]);
            assert!(layer.has_references());
            assert!(!layer.has_reference(&handles[i]));
        }
        assert_eq!(layer.reference_count(), 1);
        assert!(layer.has_reference(&handles[1]));

        layer.release(&handles[1]);
        assert!(!layer.has_references());
        assert_eq!(layer.reference_count(), 0);

        // and once more
        layer.release(&handles[1]);
        assert_eq!(layer.reference_count(), 0);
    }

    #[test]
    fn test_release_unknown_reference() {
        let driver = Arc::new(RecordingDriver::default());
        let a = chain(&driver, &[b"a"]);
        let b = chain(&driver, &[b"b", b"c"]);

        let layer = a[0].layer();
        layer.release(&b[0]);
        layer.release(&b[1]);
        assert!(layer.has_reference(&a[0]));
        assert!(!layer.has_reference(&b[0]));
        assert_eq!(layer.reference_count(), 1);
    }

    #[test]
    fn test_child_references_parent() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"base", b"child"]);

        let base = layers[0].layer();
        base.release(&layers[0]);
        // the child still holds it
        assert!(base.has_references());
        assert!(layers[1].layer().parent_ref().unwrap().is_live());
    }

    #[test]
    fn test_tar_stream() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"base", b"child"]);

        let mut data = vec![];
        layers[1].tar_stream().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"child");
        assert_eq!(
            driver.calls(),
            vec![Call::DiffStream(CacheId::from("cache1"))]
        );
    }

    #[test]
    fn test_tar_stream_corrupted() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"base", b"child"]);
        driver.corrupt(&CacheId::from("cache1"));

        let mut data = vec![];
        let err = layers[1]
            .tar_stream()
            .unwrap()
            .read_to_end(&mut data)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains(layers[1].diff_id().as_str()));
        // the corrupted bytes were delivered as read
        assert_eq!(data.len(), 5);
        assert!(data != b"child");
    }

    #[test]
    fn test_tar_stream_from() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"a", b"b", b"c"]);
        let top = &layers[2];

        let mut data = vec![];
        top.tar_stream_from(None)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"abc");

        let mut data = vec![];
        top.tar_stream_from(Some(layers[0].chain_id()))
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"bc");

        assert_eq!(
            driver.calls(),
            vec![
                Call::Diff(CacheId::from("cache2"), None),
                Call::Diff(CacheId::from("cache2"), Some(CacheId::from("cache0"))),
            ]
        );
    }

    #[test]
    fn test_tar_stream_from_non_ancestor() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"a", b"b"]);
        let stranger = ChainId::compute(None, &diff_id(b"z"));

        for ancestor in [&stranger, layers[1].chain_id()] {
            let err = layers[1].tar_stream_from(Some(ancestor)).err().unwrap();
            let LayerError::InvalidAncestor { layer, ancestor: a } = &err else {
                panic!("unexpected error {err:?}");
            };
            assert_eq!(layer, layers[1].chain_id());
            assert_eq!(a, ancestor);
            assert!(err.to_string().contains(ancestor.as_str()));
        }
        assert_eq!(driver.calls(), Vec::<Call>::new());
    }

    #[test]
    fn test_metadata() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"a"]);
        assert_eq!(layers[0].metadata().unwrap()["Driver"], "memory");

        driver.fail_metadata();
        match layers[0].metadata().unwrap_err() {
            LayerError::Io(err) => assert_eq!(err.kind(), ErrorKind::PermissionDenied),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_store() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"a", b"b"]);

        let mut tx = RecordingTransaction::default();
        layers[0].layer().store(&mut tx).unwrap();
        assert_eq!(
            tx.fields(),
            vec![
                ("diff", diff_id(b"a").to_string()),
                ("size", "1".to_string()),
                ("cache-id", "cache0".to_string()),
            ]
        );

        let mut tx = RecordingTransaction::default();
        layers[1].layer().store(&mut tx).unwrap();
        assert_eq!(
            tx.fields().last(),
            Some(&("parent", layers[0].chain_id().to_string()))
        );
    }

    #[test]
    fn test_store_descriptor() {
        let driver = Arc::new(RecordingDriver::default());
        driver.add(&CacheId::from("x"), None, b"x");

        let blob: oci_spec::image::Digest = diff_id(b"blob").as_str().parse().unwrap();
        let descriptor =
            Descriptor::new(oci_spec::image::MediaType::ImageLayerGzip, 10, blob);
        let layer = RoLayer::new(
            ChainId::compute(None, &diff_id(b"x")),
            diff_id(b"x"),
            1,
            CacheId::from("x"),
            Some(descriptor.clone()),
            None,
            driver,
        );
        assert_eq!(layer.descriptor(), Some(&descriptor));

        let mut tx = RecordingTransaction::default();
        layer.store(&mut tx).unwrap();
        assert_eq!(tx.fields()[3].0, "descriptor");
    }

    #[test]
    fn test_store_aborts_on_failure() {
        let driver = Arc::new(RecordingDriver::default());
        let layers = chain(&driver, &[b"a", b"b"]);

        let mut tx = RecordingTransaction::failing_on("size");
        let err = layers[1].layer().store(&mut tx).unwrap_err();
        assert!(matches!(err, LayerError::Io(_)));
        assert_eq!(tx.fields().len(), 1);
    }
}
