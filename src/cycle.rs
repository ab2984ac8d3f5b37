//! The read-probe / save loop
//!
//! Each pass reads back every configured blob, then writes them all and
//! commits. Read failures are logged as errors, save failures as warnings;
//! neither stops the loop. Passes are paced by a [`CancelToken`] wait, so a
//! cancel ends the loop without waiting out the interval.

use crate::cancel::CancelToken;
use crate::client::BlobStoreClient;
use crate::config::{CycleConfig, Fill};
use crate::nvs::{NvsApi, OpenMode};
use crate::Result;
use serde::Serialize;
use tracing::{error, info, warn};

/// Size of one blob as seen by a read probe
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlobReading {
    pub key: String,
    /// 0 when nothing is stored
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub blobs: Vec<BlobReading>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub pass: u64,
    pub bytes_written: usize,
}

/// Result of one pass
#[derive(Debug)]
pub struct PassOutcome {
    pub pass: u64,
    pub probe: Result<ProbeReport>,
    pub save: Result<SaveReport>,
}

/// Totals for a finished run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub passes: u64,
    pub read_errors: u64,
    pub save_errors: u64,
}

/// Drives the blob loop against a store
pub struct BlobCycle<'s, S: NvsApi + ?Sized> {
    client: BlobStoreClient<'s, S>,
    config: CycleConfig,
    /// Upper bound on a single blob read
    max_read: usize,
}

impl<'s, S: NvsApi + ?Sized> BlobCycle<'s, S> {
    pub fn new(store: &'s S, config: CycleConfig, max_read: usize) -> Self {
        BlobCycle {
            client: BlobStoreClient::new(store, config.namespace.clone()),
            config,
            max_read,
        }
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Increment and commit the restart counter, returning the new value
    pub fn bump_restart_counter(&self) -> Result<i32> {
        let ns = self.client.open(OpenMode::ReadWrite)?;
        let previous = ns.get_i32_or(&self.config.counter_key, 0)?;
        let current = previous.wrapping_add(1);
        ns.set_i32(&self.config.counter_key, current)?;
        ns.commit()?;
        ns.close();
        info!(restarts = current, "restart counter updated");
        Ok(current)
    }

    /// Read the restart counter without changing it
    pub fn restart_counter(&self) -> Result<i32> {
        let ns = self.client.open(OpenMode::ReadWrite)?;
        ns.get_i32_or(&self.config.counter_key, 0)
    }

    /// Size-probe and read back every configured blob
    pub fn read_probe(&self) -> Result<ProbeReport> {
        let ns = self.client.open(OpenMode::ReadWrite)?;
        let mut blobs = Vec::with_capacity(self.config.blobs.len());

        for spec in &self.config.blobs {
            let size = match ns.read_blob(&spec.key, self.max_read)? {
                Some(data) => {
                    info!(key = %spec.key, size = data.len(), "blob size");
                    data.len()
                }
                None => {
                    info!(key = %spec.key, "nothing saved yet");
                    0
                }
            };
            blobs.push(BlobReading {
                key: spec.key.clone(),
                size,
            });
        }

        ns.close();
        Ok(ProbeReport { blobs })
    }

    /// Write every configured blob and commit
    pub fn save_blobs(&self, pass: u64) -> Result<SaveReport> {
        let ns = self.client.open(OpenMode::ReadWrite)?;
        let byte = match self.config.fill {
            Fill::Zeros => 0,
            Fill::Pass => pass as u8,
        };

        let mut buf = Vec::new();
        let mut bytes_written = 0;
        for spec in &self.config.blobs {
            buf.clear();
            buf.resize(spec.len, byte);
            info!(key = %spec.key, len = spec.len, "writing blob");
            ns.set_blob(&spec.key, &buf)?;
            bytes_written += spec.len;
        }

        ns.commit()?;
        ns.close();
        Ok(SaveReport {
            pass,
            bytes_written,
        })
    }

    /// One full pass: read probe, then save regardless of the probe outcome
    pub fn run_pass(&self, pass: u64) -> PassOutcome {
        let probe = self.read_probe();
        info!(pass, "saving blobs");
        if let Err(e) = &probe {
            error!(error = %e, code = e.name(), "error reading data from NVS");
        }

        let save = self.save_blobs(pass);
        if let Err(e) = &save {
            warn!(error = %e, code = e.name(), "error saving blobs to NVS");
        }

        PassOutcome { pass, probe, save }
    }

    /// Run passes until cancelled or `max_passes` is reached
    pub fn run(&self, cancel: &CancelToken, max_passes: Option<u64>) -> RunSummary {
        let mut summary = RunSummary::default();
        let interval = self.config.interval();

        while !cancel.is_cancelled() {
            let pass = summary.passes + 1;
            let outcome = self.run_pass(pass);
            summary.passes = pass;
            if outcome.probe.is_err() {
                summary.read_errors += 1;
            }
            if outcome.save.is_err() {
                summary.save_errors += 1;
            }

            if max_passes.is_some_and(|max| pass >= max) {
                break;
            }
            if cancel.wait(interval) {
                break;
            }
        }

        info!(
            passes = summary.passes,
            read_errors = summary.read_errors,
            save_errors = summary.save_errors,
            "blob loop stopped"
        );
        summary
    }
}
