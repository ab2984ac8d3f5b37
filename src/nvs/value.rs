//! Stored values and the committed image

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum length of a namespace or key name, in bytes
pub const MAX_NAME_LEN: usize = 15;

/// Fixed bookkeeping cost charged per stored entry
pub const ENTRY_OVERHEAD: usize = 32;

/// A typed value stored under a key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Signed 32-bit scalar
    I32(i32),
    /// Opaque byte payload
    Blob(Vec<u8>),
}

impl Value {
    /// Short type label for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::I32(_) => "i32",
            Value::Blob(_) => "blob",
        }
    }

    /// Payload size in bytes
    pub fn payload_len(&self) -> usize {
        match self {
            Value::I32(_) => 4,
            Value::Blob(data) => data.len(),
        }
    }
}

/// Storage cost of one entry
pub fn entry_cost(key: &str, value: &Value) -> usize {
    ENTRY_OVERHEAD + key.len() + value.payload_len()
}

/// Check a namespace or key name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("name is empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "'{}' is {} bytes (max {})",
            name,
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(Error::InvalidName(format!(
            "'{}' has control characters",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// The committed contents of a partition
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub namespaces: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all namespaces
    pub fn entry_count(&self) -> usize {
        self.namespaces.values().map(|keys| keys.len()).sum()
    }

    /// Bytes used, including per-namespace and per-entry overhead
    pub fn used_bytes(&self) -> usize {
        self.namespaces
            .iter()
            .map(|(ns, keys)| {
                ENTRY_OVERHEAD
                    + ns.len()
                    + keys.iter().map(|(k, v)| entry_cost(k, v)).sum::<usize>()
            })
            .sum()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.namespaces.get(namespace).and_then(|keys| keys.get(key))
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }
}
