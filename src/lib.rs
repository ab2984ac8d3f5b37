//! # nvs_blob
//!
//! Persist binary blobs in a namespaced non-volatile key-value store and read
//! them back across restarts.
//!
//! ## Core Concepts
//!
//! - **Partition**: a [`Flash`] medium holding one committed image
//! - **Nvs**: the storage context owning open handles over a partition
//! - **Namespace**: a named group of keys, opened per operation cycle
//! - **Commit**: makes a handle's pending writes durable
//!
//! ## Example
//!
//! ```ignore
//! use nvs_blob::{BlobStoreClient, FileFlash, Nvs, OpenMode};
//!
//! let nvs = Nvs::new(FileFlash::new("nvs.bin", 0x6000));
//! nvs_blob::boot::init_storage(&nvs, false)?;
//!
//! let client = BlobStoreClient::new(&nvs, "storage");
//! let ns = client.open(OpenMode::ReadWrite)?;
//! ns.set_blob("storage_blob_1", &[0u8; 6000])?;
//! ns.commit()?;
//! ```

pub mod boot;
pub mod cancel;
pub mod client;
pub mod config;
pub mod cycle;
pub mod flash;
pub mod nvs;

mod error;

pub use boot::{init_storage, InitState, StorageInit};
pub use cancel::CancelToken;
pub use client::{BlobStoreClient, Namespace};
pub use config::{BlobSpec, Config, CycleConfig, Fill, StorageConfig};
pub use cycle::{BlobCycle, PassOutcome, ProbeReport, RunSummary, SaveReport};
pub use error::{Error, Result};
pub use flash::{FileFlash, Flash, MemFlash};
pub use nvs::{Handle, Nvs, NvsApi, OpenMode, Stats, Value};

/// Partition format version
pub const VERSION: u32 = 1;

/// Magic bytes for file identification
pub const MAGIC: &[u8; 8] = b"NVSBLOB\0";
