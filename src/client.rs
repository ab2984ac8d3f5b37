//! Blob store client
//!
//! A thin namespace-scoped facade over any [`NvsApi`]. Blob reads follow a
//! two-phase handshake: probe the stored length, allocate exactly that much
//! (refusing anything above the caller's bound), then fetch.

use crate::nvs::{Handle, NvsApi, OpenMode};
use crate::{Error, Result};
use tracing::debug;

/// Client bound to one namespace of a store
pub struct BlobStoreClient<'s, S: NvsApi + ?Sized> {
    store: &'s S,
    namespace: String,
}

impl<'s, S: NvsApi + ?Sized> BlobStoreClient<'s, S> {
    pub fn new(store: &'s S, namespace: impl Into<String>) -> Self {
        BlobStoreClient {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Open the namespace; the handle is closed when the guard drops
    pub fn open(&self, mode: OpenMode) -> Result<Namespace<'s, S>> {
        let handle = self.store.open(&self.namespace, mode)?;
        Ok(Namespace {
            store: self.store,
            handle: Some(handle),
        })
    }
}

/// An open namespace handle
pub struct Namespace<'s, S: NvsApi + ?Sized> {
    store: &'s S,
    /// `None` once closed
    handle: Option<Handle>,
}

impl<'s, S: NvsApi + ?Sized> Namespace<'s, S> {
    fn handle(&self) -> Result<Handle> {
        // close() consumes self, so a live guard always has a handle
        self.handle.ok_or(Error::InvalidHandle(0))
    }

    /// Stored blob length, 0 when the key is absent
    pub fn blob_size(&self, key: &str) -> Result<usize> {
        self.find_blob_size(key).map(|size| size.unwrap_or(0))
    }

    /// Stored blob length, `None` when the key is absent
    ///
    /// Tells an empty stored blob apart from a missing one.
    pub fn find_blob_size(&self, key: &str) -> Result<Option<usize>> {
        match self.store.get_blob(self.handle()?, key, None) {
            Ok(size) => Ok(Some(size)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a blob of at most `max_len` bytes
    ///
    /// Returns `None` without allocating when nothing is stored.
    pub fn read_blob(&self, key: &str, max_len: usize) -> Result<Option<Vec<u8>>> {
        let size = self.blob_size(key)?;
        if size == 0 {
            return Ok(None);
        }
        if size > max_len {
            return Err(Error::ValueTooLong {
                len: size,
                max: max_len,
            });
        }

        let mut buf = vec![0u8; size];
        let read = self.store.get_blob(self.handle()?, key, Some(&mut buf))?;
        buf.truncate(read);
        debug!(key, size = read, "read blob");
        Ok(Some(buf))
    }

    /// Create or overwrite a blob; durable after [`Namespace::commit`]
    pub fn set_blob(&self, key: &str, data: &[u8]) -> Result<()> {
        self.store.set_blob(self.handle()?, key, data)
    }

    /// Read a scalar, `default` when absent
    pub fn get_i32_or(&self, key: &str, default: i32) -> Result<i32> {
        match self.store.get_i32(self.handle()?, key) {
            Ok(v) => Ok(v),
            Err(e) if e.is_not_found() => Ok(default),
            Err(e) => Err(e),
        }
    }

    pub fn set_i32(&self, key: &str, value: i32) -> Result<()> {
        self.store.set_i32(self.handle()?, key, value)
    }

    /// Remove a key; removing an absent key is not an error here
    pub fn remove(&self, key: &str) -> Result<bool> {
        match self.store.erase_key(self.handle()?, key) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.store.erase_all(self.handle()?)
    }

    pub fn commit(&self) -> Result<()> {
        self.store.commit(self.handle()?)
    }

    /// Release the handle, dropping uncommitted writes
    pub fn close(mut self) {
        if let Some(handle) = self.handle.take() {
            self.store.close(handle);
        }
    }
}

impl<S: NvsApi + ?Sized> Drop for Namespace<'_, S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.store.close(handle);
        }
    }
}
