//! In-memory partition for testing
//!
//! Clones share the same image, so dropping an [`crate::nvs::Nvs`] and building
//! a new one over a clone behaves like a power cycle.

use super::{Flash, DEFAULT_CAPACITY};
use crate::nvs::Image;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct State {
    image: Option<Image>,
    /// Errors returned by upcoming `load` calls, front first
    load_faults: VecDeque<Error>,
    loads: usize,
    stores: usize,
    erases: usize,
}

/// A shared in-memory medium with fault injection
#[derive(Clone)]
pub struct MemFlash {
    state: Arc<Mutex<State>>,
    capacity: usize,
}

impl MemFlash {
    /// Create an erased medium with the given capacity
    pub fn new(capacity: usize) -> Self {
        MemFlash {
            state: Arc::new(Mutex::new(State::default())),
            capacity,
        }
    }

    /// Share this medium's image under a different capacity
    pub fn resized(&self, capacity: usize) -> Self {
        MemFlash {
            state: Arc::clone(&self.state),
            capacity,
        }
    }

    /// Make the next `load` fail with `error`
    ///
    /// Calls queue up: injecting twice fails the next two loads.
    pub fn fail_next_load(&self, error: Error) {
        self.state.lock().load_faults.push_back(error);
    }

    /// Number of `load` calls so far
    pub fn load_count(&self) -> usize {
        self.state.lock().loads
    }

    /// Number of `store` calls so far
    pub fn store_count(&self) -> usize {
        self.state.lock().stores
    }

    /// Number of `erase` calls so far
    pub fn erase_count(&self) -> usize {
        self.state.lock().erases
    }

    /// Snapshot of the committed image
    pub fn image(&self) -> Option<Image> {
        self.state.lock().image.clone()
    }
}

impl Default for MemFlash {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Flash for MemFlash {
    fn load(&self) -> Result<Option<Image>> {
        let mut state = self.state.lock();
        state.loads += 1;
        if let Some(err) = state.load_faults.pop_front() {
            return Err(err);
        }
        Ok(state.image.clone())
    }

    fn store(&self, image: &Image) -> Result<()> {
        let mut state = self.state.lock();
        state.stores += 1;
        state.image = Some(image.clone());
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.erases += 1;
        state.image = None;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
