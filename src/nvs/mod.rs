//! Namespaced non-volatile key-value store
//!
//! [`Nvs`] is the explicit storage context: it owns the live handle table and
//! the committed [`Image`] of one [`Flash`] partition. Callers talk to it
//! through the [`NvsApi`] trait so the context can be replaced in tests.
//!
//! Writes made through a handle are pending until [`NvsApi::commit`]. The
//! handle sees its own pending writes; everyone else sees the committed image.
//! Closing a handle, or losing the context, drops what was not committed.

mod value;

pub use value::{entry_cost, validate_name, Image, Value, ENTRY_OVERHEAD, MAX_NAME_LEN};

use crate::flash::Flash;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Largest blob accepted by default
pub const DEFAULT_MAX_BLOB_SIZE: usize = 508_000;

/// Access mode for a namespace handle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Opaque handle to an open namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Usage figures for the partition
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub namespaces: usize,
    pub entries: usize,
    pub used_bytes: usize,
    pub capacity: usize,
    pub free_bytes: usize,
    pub open_handles: usize,
}

/// Operations of a persistent namespaced key-value store
pub trait NvsApi: Send + Sync {
    /// Mount the partition, loading its committed image
    fn init(&self) -> Result<()>;

    /// Wipe the partition and unmount it; all handles become invalid
    fn erase(&self) -> Result<()>;

    /// Open a namespace; read-only opens of a missing namespace fail
    fn open(&self, namespace: &str, mode: OpenMode) -> Result<Handle>;

    fn get_i32(&self, handle: Handle, key: &str) -> Result<i32>;

    fn set_i32(&self, handle: Handle, key: &str, value: i32) -> Result<()>;

    /// Read a blob
    ///
    /// With `out = None` only the stored length is returned. With a buffer,
    /// the blob is copied into its front and the length is returned; a buffer
    /// shorter than the blob is `InvalidLength`.
    fn get_blob(&self, handle: Handle, key: &str, out: Option<&mut [u8]>) -> Result<usize>;

    fn set_blob(&self, handle: Handle, key: &str, data: &[u8]) -> Result<()>;

    fn erase_key(&self, handle: Handle, key: &str) -> Result<()>;

    /// Remove every key of the handle's namespace
    fn erase_all(&self, handle: Handle) -> Result<()>;

    /// Make the handle's pending writes durable
    fn commit(&self, handle: Handle) -> Result<()>;

    /// Release a handle, dropping uncommitted writes
    fn close(&self, handle: Handle);

    fn stats(&self) -> Result<Stats>;
}

struct OpenHandle {
    namespace: String,
    mode: OpenMode,
    /// key -> new value, or `None` for a removal
    pending: BTreeMap<String, Option<Value>>,
    /// `erase_all` was called since the last commit
    cleared: bool,
}

impl OpenHandle {
    fn is_dirty(&self) -> bool {
        self.cleared || !self.pending.is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(Error::ReadOnly(self.namespace.clone())),
        }
    }
}

struct Inner {
    /// `None` until init
    image: Option<Image>,
    handles: HashMap<u32, OpenHandle>,
    next_handle: u32,
}

impl Inner {
    fn image(&self) -> Result<&Image> {
        self.image.as_ref().ok_or(Error::NotInitialized)
    }

    fn handle(&self, handle: Handle) -> Result<&OpenHandle> {
        self.handles
            .get(&handle.0)
            .ok_or(Error::InvalidHandle(handle.0))
    }

    fn handle_mut(&mut self, handle: Handle) -> Result<&mut OpenHandle> {
        self.handles
            .get_mut(&handle.0)
            .ok_or(Error::InvalidHandle(handle.0))
    }

    /// Resolve a key as seen through a handle
    fn lookup(&self, handle: Handle, key: &str) -> Result<Value> {
        let open = self.handle(handle)?;
        let found = match open.pending.get(key) {
            Some(pending) => pending.clone(),
            None if open.cleared => None,
            None => self.image()?.get(&open.namespace, key).cloned(),
        };
        found.ok_or_else(|| Error::NotFound(format!("{}/{}", open.namespace, key)))
    }

    fn stage(&mut self, handle: Handle, key: &str, value: Option<Value>) -> Result<()> {
        validate_name(key)?;
        let open = self.handle_mut(handle)?;
        open.check_writable()?;
        open.pending.insert(key.to_string(), value);
        Ok(())
    }
}

/// Storage context over one partition
pub struct Nvs<F: Flash> {
    flash: F,
    max_blob_size: usize,
    inner: Mutex<Inner>,
}

impl<F: Flash> Nvs<F> {
    /// Create an unmounted context; call [`NvsApi::init`] before use
    pub fn new(flash: F) -> Self {
        Nvs {
            flash,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            inner: Mutex::new(Inner {
                image: None,
                handles: HashMap::new(),
                next_handle: 1,
            }),
        }
    }

    /// Override the largest accepted blob
    pub fn with_max_blob_size(mut self, max_blob_size: usize) -> Self {
        self.max_blob_size = max_blob_size;
        self
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn max_blob_size(&self) -> usize {
        self.max_blob_size
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().image.is_some()
    }

    /// Names of all committed namespaces
    pub fn namespaces(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner.image()?.namespaces.keys().cloned().collect())
    }
}

impl<F: Flash> NvsApi for Nvs<F> {
    fn init(&self) -> Result<()> {
        let image = self.flash.load()?.unwrap_or_default();
        let used = image.used_bytes();
        if used > self.flash.capacity() {
            return Err(Error::NoFreePages);
        }

        info!(
            entries = image.entry_count(),
            used,
            capacity = self.flash.capacity(),
            "NVS partition mounted"
        );
        let mut inner = self.inner.lock();
        inner.image = Some(image);
        inner.handles.clear();
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flash.erase()?;
        inner.image = None;
        inner.handles.clear();
        info!("NVS partition erased");
        Ok(())
    }

    fn open(&self, namespace: &str, mode: OpenMode) -> Result<Handle> {
        validate_name(namespace)?;
        let mut inner = self.inner.lock();
        let image = inner.image()?;
        if mode == OpenMode::ReadOnly && !image.has_namespace(namespace) {
            return Err(Error::NotFound(namespace.to_string()));
        }

        // Ids skip 0 and any id still open after a wrap
        let mut id = inner.next_handle;
        while inner.handles.contains_key(&id) {
            id = id.wrapping_add(1).max(1);
        }
        inner.next_handle = id.wrapping_add(1).max(1);
        inner.handles.insert(
            id,
            OpenHandle {
                namespace: namespace.to_string(),
                mode,
                pending: BTreeMap::new(),
                cleared: false,
            },
        );
        debug!(handle = id, namespace, ?mode, "opened namespace");
        Ok(Handle(id))
    }

    fn get_i32(&self, handle: Handle, key: &str) -> Result<i32> {
        let inner = self.inner.lock();
        match inner.lookup(handle, key)? {
            Value::I32(v) => Ok(v),
            other => Err(Error::TypeMismatch(format!(
                "{} holds {}, not i32",
                key,
                other.type_name()
            ))),
        }
    }

    fn set_i32(&self, handle: Handle, key: &str, value: i32) -> Result<()> {
        self.inner
            .lock()
            .stage(handle, key, Some(Value::I32(value)))
    }

    fn get_blob(&self, handle: Handle, key: &str, out: Option<&mut [u8]>) -> Result<usize> {
        let inner = self.inner.lock();
        let data = match inner.lookup(handle, key)? {
            Value::Blob(data) => data,
            other => {
                return Err(Error::TypeMismatch(format!(
                    "{} holds {}, not blob",
                    key,
                    other.type_name()
                )))
            }
        };

        if let Some(buf) = out {
            if buf.len() < data.len() {
                return Err(Error::InvalidLength {
                    required: data.len(),
                    provided: buf.len(),
                });
            }
            buf[..data.len()].copy_from_slice(&data);
        }
        Ok(data.len())
    }

    fn set_blob(&self, handle: Handle, key: &str, data: &[u8]) -> Result<()> {
        if data.len() > self.max_blob_size {
            return Err(Error::ValueTooLong {
                len: data.len(),
                max: self.max_blob_size,
            });
        }
        let value = Value::Blob(data.to_vec());
        let cost = entry_cost(key, &value);
        if cost > self.flash.capacity() {
            return Err(Error::NotEnoughSpace {
                required: cost,
                available: self.flash.capacity(),
            });
        }
        self.inner.lock().stage(handle, key, Some(value))
    }

    fn erase_key(&self, handle: Handle, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        // Removing an absent key is reported, not ignored
        inner.lookup(handle, key)?;
        inner.stage(handle, key, None)
    }

    fn erase_all(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        let open = inner.handle_mut(handle)?;
        open.check_writable()?;
        open.pending.clear();
        open.cleared = true;
        Ok(())
    }

    fn commit(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        let open = inner.handle(handle)?;
        if !open.is_dirty() {
            return Ok(());
        }

        let mut next = inner.image()?.clone();
        let keys = next.namespaces.entry(open.namespace.clone()).or_default();
        if open.cleared {
            keys.clear();
        }
        for (key, value) in &open.pending {
            match value {
                Some(value) => {
                    keys.insert(key.clone(), value.clone());
                }
                None => {
                    keys.remove(key);
                }
            }
        }

        let required = next.used_bytes();
        let available = self.flash.capacity();
        if required > available {
            return Err(Error::NotEnoughSpace {
                required,
                available,
            });
        }

        self.flash.store(&next)?;
        debug!(
            handle = handle.0,
            writes = open.pending.len(),
            used = required,
            "committed"
        );

        inner.image = Some(next);
        let open = inner.handle_mut(handle)?;
        open.pending.clear();
        open.cleared = false;
        Ok(())
    }

    fn close(&self, handle: Handle) {
        let mut inner = self.inner.lock();
        if let Some(open) = inner.handles.remove(&handle.0) {
            if open.is_dirty() {
                debug!(
                    handle = handle.0,
                    dropped = open.pending.len(),
                    "closed with uncommitted writes"
                );
            }
        }
    }

    fn stats(&self) -> Result<Stats> {
        let inner = self.inner.lock();
        let image = inner.image()?;
        let used_bytes = image.used_bytes();
        let capacity = self.flash.capacity();
        Ok(Stats {
            namespaces: image.namespaces.len(),
            entries: image.entry_count(),
            used_bytes,
            capacity,
            free_bytes: capacity.saturating_sub(used_bytes),
            open_handles: inner.handles.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    fn mounted() -> Nvs<MemFlash> {
        let nvs = Nvs::new(MemFlash::new(64 * 1024));
        nvs.init().unwrap();
        nvs
    }

    #[test]
    fn test_open_requires_init() {
        let nvs = Nvs::new(MemFlash::default());
        assert!(matches!(
            nvs.open("storage", OpenMode::ReadWrite),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_read_only_open_of_missing_namespace() {
        let nvs = mounted();
        let err = nvs.open("storage", OpenMode::ReadOnly).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_size_probe_then_read() {
        let nvs = mounted();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.set_blob(h, "blob", b"hello").unwrap();

        let size = nvs.get_blob(h, "blob", None).unwrap();
        assert_eq!(size, 5);

        let mut buf = vec![0u8; size];
        assert_eq!(nvs.get_blob(h, "blob", Some(&mut buf)).unwrap(), 5);
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_short_buffer_reports_required_length() {
        let nvs = mounted();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.set_blob(h, "blob", &[1; 10]).unwrap();

        let mut buf = [0u8; 4];
        match nvs.get_blob(h, "blob", Some(&mut buf)) {
            Err(Error::InvalidLength { required, provided }) => {
                assert_eq!(required, 10);
                assert_eq!(provided, 4);
            }
            other => panic!("expected InvalidLength, got {:?}", other),
        }
    }

    #[test]
    fn test_pending_writes_invisible_to_other_handles() {
        let nvs = mounted();
        let writer = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        let reader = nvs.open("storage", OpenMode::ReadWrite).unwrap();

        nvs.set_i32(writer, "counter", 5).unwrap();
        assert_eq!(nvs.get_i32(writer, "counter").unwrap(), 5);
        assert!(nvs.get_i32(reader, "counter").unwrap_err().is_not_found());

        nvs.commit(writer).unwrap();
        assert_eq!(nvs.get_i32(reader, "counter").unwrap(), 5);
    }

    #[test]
    fn test_close_drops_uncommitted() {
        let nvs = mounted();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.set_i32(h, "counter", 1).unwrap();
        nvs.close(h);

        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        assert!(nvs.get_i32(h, "counter").unwrap_err().is_not_found());
        assert!(matches!(
            nvs.get_i32(Handle(999), "counter"),
            Err(Error::InvalidHandle(999))
        ));
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let nvs = mounted();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.set_i32(h, "counter", 1).unwrap();
        nvs.commit(h).unwrap();

        let ro = nvs.open("storage", OpenMode::ReadOnly).unwrap();
        assert_eq!(nvs.get_i32(ro, "counter").unwrap(), 1);
        assert!(matches!(
            nvs.set_i32(ro, "counter", 2),
            Err(Error::ReadOnly(_))
        ));
        assert!(matches!(nvs.erase_all(ro), Err(Error::ReadOnly(_))));
    }

    #[test]
    fn test_type_mismatch() {
        let nvs = mounted();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.set_i32(h, "counter", 1).unwrap();
        assert!(matches!(
            nvs.get_blob(h, "counter", None),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_erase_key_and_erase_all() {
        let nvs = mounted();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.set_i32(h, "a", 1).unwrap();
        nvs.set_i32(h, "b", 2).unwrap();
        nvs.commit(h).unwrap();

        nvs.erase_key(h, "a").unwrap();
        assert!(nvs.erase_key(h, "a").unwrap_err().is_not_found());
        nvs.commit(h).unwrap();
        assert_eq!(nvs.stats().unwrap().entries, 1);

        nvs.erase_all(h).unwrap();
        assert!(nvs.get_i32(h, "b").unwrap_err().is_not_found());
        nvs.commit(h).unwrap();
        assert_eq!(nvs.stats().unwrap().entries, 0);
    }

    #[test]
    fn test_blob_size_limit() {
        let nvs = Nvs::new(MemFlash::new(64 * 1024)).with_max_blob_size(16);
        nvs.init().unwrap();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        assert!(matches!(
            nvs.set_blob(h, "blob", &[0; 17]),
            Err(Error::ValueTooLong { len: 17, max: 16 })
        ));
    }

    #[test]
    fn test_commit_over_capacity_keeps_pending() {
        let nvs = Nvs::new(MemFlash::new(1024));
        nvs.init().unwrap();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.set_blob(h, "a", &[0; 600]).unwrap();
        nvs.set_blob(h, "b", &[0; 600]).unwrap();

        assert!(matches!(
            nvs.commit(h),
            Err(Error::NotEnoughSpace { .. })
        ));
        // Still readable through the handle, nothing stored
        assert_eq!(nvs.get_blob(h, "a", None).unwrap(), 600);
        assert_eq!(nvs.flash().store_count(), 0);

        nvs.erase_key(h, "b").unwrap();
        nvs.commit(h).unwrap();
        assert_eq!(nvs.flash().store_count(), 1);
    }

    #[test]
    fn test_init_rejects_oversized_image() {
        let flash = MemFlash::new(1 << 20);
        {
            let nvs = Nvs::new(flash.clone());
            nvs.init().unwrap();
            let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
            nvs.set_blob(h, "blob", &[0; 4096]).unwrap();
            nvs.commit(h).unwrap();
        }

        let nvs = Nvs::new(flash.resized(1024));
        assert!(matches!(nvs.init(), Err(Error::NoFreePages)));
    }

    #[test]
    fn test_erase_invalidates_handles() {
        let nvs = mounted();
        let h = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.erase().unwrap();
        assert!(!nvs.is_initialized());
        assert!(matches!(nvs.commit(h), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_handle_ids_skip_open_handles_on_wrap() {
        let nvs = mounted();
        let first = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        nvs.set_i32(first, "counter", 1).unwrap();

        nvs.inner.lock().next_handle = u32::MAX;
        let last = nvs.open("storage", OpenMode::ReadWrite).unwrap();
        let wrapped = nvs.open("other", OpenMode::ReadWrite).unwrap();
        assert_eq!(last.id(), u32::MAX);
        assert_ne!(wrapped.id(), first.id());
        assert_eq!(wrapped.id(), 2);

        // The first handle still sees its own pending write
        assert_eq!(nvs.get_i32(first, "counter").unwrap(), 1);
        assert!(nvs.get_i32(wrapped, "counter").unwrap_err().is_not_found());
    }
}
