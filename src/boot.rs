//! Storage initialization state machine
//!
//! ```text
//! Uninitialized -> Erasing -> Initializing -> Ready
//!                                 |   ^
//!     NoFreePages / version error |   | (once)
//!                                 v   |
//!                               Erasing
//! ```
//!
//! The leading erase is skipped when `erase_on_boot` is off. Any other init
//! error, or a recoverable one that survives the retry, is fatal.

use crate::nvs::NvsApi;
use crate::Result;
use serde::Serialize;
use tracing::{error, info, warn};

/// Phase of storage bring-up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Uninitialized,
    Erasing,
    Initializing,
    Ready,
}

/// Drives a store from `Uninitialized` to `Ready`
pub struct StorageInit {
    erase_on_boot: bool,
    state: InitState,
    history: Vec<InitState>,
    retried: bool,
}

impl StorageInit {
    pub fn new(erase_on_boot: bool) -> Self {
        StorageInit {
            erase_on_boot,
            state: InitState::Uninitialized,
            history: vec![InitState::Uninitialized],
            retried: false,
        }
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[InitState] {
        &self.history
    }

    /// Whether the erase-and-retry edge was taken
    pub fn retried(&self) -> bool {
        self.retried
    }

    fn enter(&mut self, state: InitState) {
        self.state = state;
        self.history.push(state);
    }

    /// Run the machine; `Err` means the program must not proceed
    pub fn run<S: NvsApi + ?Sized>(&mut self, store: &S) -> Result<()> {
        if self.erase_on_boot {
            self.enter(InitState::Erasing);
            store.erase()?;
        }

        self.enter(InitState::Initializing);
        match store.init() {
            Ok(()) => {}
            Err(e) if e.is_recoverable_init() => {
                warn!(error = %e, "partition needs erasing, retrying init");
                self.retried = true;
                self.enter(InitState::Erasing);
                store.erase()?;
                self.enter(InitState::Initializing);
                store.init().map_err(|e| {
                    error!(error = %e, "init failed after erase");
                    e
                })?;
            }
            Err(e) => {
                error!(error = %e, "init failed");
                return Err(e);
            }
        }

        self.enter(InitState::Ready);
        info!(retried = self.retried, "storage ready");
        Ok(())
    }
}

/// Bring a store up, returning the finished machine
pub fn init_storage<S: NvsApi + ?Sized>(store: &S, erase_on_boot: bool) -> Result<StorageInit> {
    let mut machine = StorageInit::new(erase_on_boot);
    machine.run(store)?;
    Ok(machine)
}
