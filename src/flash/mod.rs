//! Flash media backing an NVS partition
//!
//! A medium holds at most one committed [`Image`]. It knows nothing about
//! handles or pending writes; those live in [`crate::nvs::Nvs`].

mod file;
mod mem;

pub use file::FileFlash;
pub use mem::MemFlash;

use crate::nvs::Image;
use crate::Result;

/// Default partition capacity (24 KiB, the size of a stock NVS partition)
pub const DEFAULT_CAPACITY: usize = 0x6000;

/// A persistent medium for a partition image
pub trait Flash: Send + Sync {
    /// Load the committed image, `None` if the medium is erased
    fn load(&self) -> Result<Option<Image>>;

    /// Durably replace the committed image
    fn store(&self, image: &Image) -> Result<()>;

    /// Wipe the medium
    fn erase(&self) -> Result<()>;

    /// Usable bytes
    fn capacity(&self) -> usize;
}
