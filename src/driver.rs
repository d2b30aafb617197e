//! The storage driver interface.
//!
//! A driver physically keeps the content of layers, addressed by [`CacheId`].  Layer nodes only
//! ever need to read from it; the store additionally creates, fills and removes entries.
//!
//! [`MemoryDriver`] keeps everything in memory, storing each layer's raw diff bytes.

use std::{
    collections::HashMap,
    io::{self, Cursor, ErrorKind, Read},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::digest::CacheId;

/// A stream of layer content, as produced by a driver.
pub type DiffStream = Box<dyn Read + Send>;

pub trait Driver: Send + Sync {
    /// Creates an empty entry for a new layer on top of `parent`.
    fn create(&self, cache_id: &CacheId, parent: Option<&CacheId>) -> io::Result<()>;

    /// Applies a diff archive to a freshly created entry, returning the size of the diff.
    fn apply_diff(
        &self,
        cache_id: &CacheId,
        parent: Option<&CacheId>,
        diff: &mut dyn Read,
    ) -> io::Result<u64>;

    /// Removes all data kept for the entry.
    fn remove(&self, cache_id: &CacheId) -> io::Result<()>;

    /// Returns the exact diff archive this layer was built from.
    fn diff_stream(&self, cache_id: &CacheId) -> io::Result<DiffStream>;

    /// Computes the changes between `cache_id` and `base`, or the full content if there's no base.
    ///
    /// The result is not required to be byte-identical to any registered diff.
    fn diff(&self, cache_id: &CacheId, base: Option<&CacheId>) -> io::Result<DiffStream>;

    /// Driver-specific key/value information about an entry.
    fn metadata(&self, _cache_id: &CacheId) -> io::Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

#[derive(Debug)]
struct MemoryLayer {
    parent: Option<CacheId>,
    data: Vec<u8>,
}

/// A driver which keeps the raw diff of each layer in memory.
///
/// A diff against a base is the concatenation of the raw diffs above that base, oldest first.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    layers: Mutex<HashMap<CacheId, MemoryLayer>>,
}

fn not_found(cache_id: &CacheId) -> io::Error {
    io::Error::new(ErrorKind::NotFound, format!("no driver entry {cache_id}"))
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn layers(&self) -> MutexGuard<'_, HashMap<CacheId, MemoryLayer>> {
        self.layers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, cache_id: &CacheId) -> bool {
        self.layers().contains_key(cache_id)
    }

    pub fn len(&self) -> usize {
        self.layers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers().is_empty()
    }
}

impl Driver for MemoryDriver {
    fn create(&self, cache_id: &CacheId, parent: Option<&CacheId>) -> io::Result<()> {
        let mut layers = self.layers();
        if layers.contains_key(cache_id) {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("driver entry {cache_id} already exists"),
            ));
        }
        if let Some(parent) = parent {
            if !layers.contains_key(parent) {
                return Err(not_found(parent));
            }
        }
        layers.insert(
            cache_id.clone(),
            MemoryLayer {
                parent: parent.cloned(),
                data: vec![],
            },
        );
        Ok(())
    }

    fn apply_diff(
        &self,
        cache_id: &CacheId,
        _parent: Option<&CacheId>,
        diff: &mut dyn Read,
    ) -> io::Result<u64> {
        let mut data = vec![];
        diff.read_to_end(&mut data)?;
        let size = data.len() as u64;
        self.layers()
            .get_mut(cache_id)
            .ok_or_else(|| not_found(cache_id))?
            .data = data;
        Ok(size)
    }

    fn remove(&self, cache_id: &CacheId) -> io::Result<()> {
        self.layers()
            .remove(cache_id)
            .map(drop)
            .ok_or_else(|| not_found(cache_id))
    }

    fn diff_stream(&self, cache_id: &CacheId) -> io::Result<DiffStream> {
        let layers = self.layers();
        let layer = layers.get(cache_id).ok_or_else(|| not_found(cache_id))?;
        Ok(Box::new(Cursor::new(layer.data.clone())))
    }

    fn diff(&self, cache_id: &CacheId, base: Option<&CacheId>) -> io::Result<DiffStream> {
        let layers = self.layers();

        let mut chain = vec![];
        let mut current = Some(cache_id);
        while current != base {
            let Some(id) = current else {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("{} is not below {cache_id}", base.map_or("-", CacheId::as_str)),
                ));
            };
            let layer = layers.get(id).ok_or_else(|| not_found(id))?;
            chain.push(&layer.data);
            current = layer.parent.as_ref();
        }

        let data = chain.iter().rev().flat_map(|data| data.iter().copied());
        Ok(Box::new(Cursor::new(data.collect::<Vec<u8>>())))
    }

    fn metadata(&self, cache_id: &CacheId) -> io::Result<HashMap<String, String>> {
        let layers = self.layers();
        let layer = layers.get(cache_id).ok_or_else(|| not_found(cache_id))?;
        Ok(HashMap::from([
            ("Driver".to_string(), "memory".to_string()),
            ("Size".to_string(), layer.data.len().to_string()),
        ]))
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn read_all(mut stream: DiffStream) -> Vec<u8> {
        let mut data = vec![];
        stream.read_to_end(&mut data).unwrap();
        data
    }

    fn driver_with_chain() -> (MemoryDriver, [CacheId; 3]) {
        let driver = MemoryDriver::new();
        let ids = [CacheId::from("a"), CacheId::from("b"), CacheId::from("c")];
        let mut parent = None;
        for (id, data) in ids.iter().zip([b"AAA", b"BBB", b"CCC"]) {
            driver.create(id, parent).unwrap();
            assert_eq!(driver.apply_diff(id, parent, &mut &data[..]).unwrap(), 3);
            parent = Some(id);
        }
        (driver, ids)
    }

    #[test]
    fn test_diff_stream() {
        let (driver, [a, b, _]) = driver_with_chain();
        assert_eq!(read_all(driver.diff_stream(&a).unwrap()), b"AAA");
        assert_eq!(read_all(driver.diff_stream(&b).unwrap()), b"BBB");
    }

    #[test]
    fn test_diff() {
        let (driver, [a, b, c]) = driver_with_chain();
        assert_eq!(read_all(driver.diff(&c, None).unwrap()), b"AAABBBCCC");
        assert_eq!(read_all(driver.diff(&c, Some(&a)).unwrap()), b"BBBCCC");
        assert_eq!(read_all(driver.diff(&c, Some(&b)).unwrap()), b"CCC");
        assert_eq!(read_all(driver.diff(&c, Some(&c)).unwrap()), b"");

        assert_eq!(
            driver.diff(&a, Some(&c)).err().unwrap().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_create_remove() {
        let (driver, [a, _, _]) = driver_with_chain();
        assert_eq!(driver.len(), 3);
        assert_eq!(
            driver.create(&a, None).unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            driver
                .create(&CacheId::from("d"), Some(&CacheId::from("nope")))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );

        driver.remove(&a).unwrap();
        assert!(!driver.contains(&a));
        assert_eq!(driver.remove(&a).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            driver.diff_stream(&a).err().unwrap().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_default_metadata_is_empty() {
        // a driver which only forwards the required operations
        struct Plain(MemoryDriver);
        impl Driver for Plain {
            fn create(&self, cache_id: &CacheId, parent: Option<&CacheId>) -> io::Result<()> {
                self.0.create(cache_id, parent)
            }
            fn apply_diff(
                &self,
                cache_id: &CacheId,
                parent: Option<&CacheId>,
                diff: &mut dyn Read,
            ) -> io::Result<u64> {
                self.0.apply_diff(cache_id, parent, diff)
            }
            fn remove(&self, cache_id: &CacheId) -> io::Result<()> {
                self.0.remove(cache_id)
            }
            fn diff_stream(&self, cache_id: &CacheId) -> io::Result<DiffStream> {
                self.0.diff_stream(cache_id)
            }
            fn diff(&self, cache_id: &CacheId, base: Option<&CacheId>) -> io::Result<DiffStream> {
                self.0.diff(cache_id, base)
            }
        }

        let (inner, [a, _, _]) = driver_with_chain();
        let driver = Plain(inner);
        assert!(driver.metadata(&a).unwrap().is_empty());
        assert_eq!(read_all(driver.diff_stream(&a).unwrap()), b"AAA");
    }

    #[test]
    fn test_metadata() {
        let (driver, [a, _, _]) = driver_with_chain();
        let metadata = driver.metadata(&a).unwrap();
        assert_eq!(metadata["Driver"], "memory");
        assert_eq!(metadata["Size"], "3");
    }
}
