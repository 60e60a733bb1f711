//! Holder registry access.
//!
//! The registry (address → last qualifying balance) is written by the
//! upstream holder tracker. The cycle engine only reads its key set: it is
//! the universe of candidate addresses for each new snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use gen_common::Address;
use serde_json::Value;
use tracing::warn;

/// Default registry filename inside the data directory.
pub const REGISTRY_FILENAME: &str = "dividend-users.json";

/// Read-only view of the holder registry.
pub trait HolderRegistry: Send + Sync {
    /// Candidate addresses, sorted and deduplicated.
    fn addresses(&self) -> Vec<Address>;
}

// ════════════════════════════════════════════════════════════════════════════════
// JSON FILE REGISTRY
// ════════════════════════════════════════════════════════════════════════════════

/// Registry backed by the tracker's JSON document, re-read on every call.
///
/// A missing or malformed document yields an empty candidate set; entries
/// whose key is not a valid address are skipped.
#[derive(Debug, Clone)]
pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HolderRegistry for JsonFileRegistry {
    fn addresses(&self) -> Vec<Address> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "holder registry unreadable");
                return Vec::new();
            }
        };

        let doc: BTreeMap<String, Value> = match serde_json::from_slice(&bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "holder registry malformed");
                return Vec::new();
            }
        };

        let mut out = BTreeSet::new();
        for key in doc.keys() {
            match key.parse::<Address>() {
                Ok(a) => {
                    out.insert(a);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping invalid registry address"),
            }
        }
        out.into_iter().collect()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// STATIC REGISTRY
// ════════════════════════════════════════════════════════════════════════════════

/// Fixed candidate list.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    addresses: BTreeSet<Address>,
}

impl StaticRegistry {
    #[must_use]
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self { addresses: addresses.into_iter().collect() }
    }
}

impl HolderRegistry for StaticRegistry {
    fn addresses(&self) -> Vec<Address> {
        self.addresses.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_tracker_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REGISTRY_FILENAME);
        std::fs::write(
            &path,
            r#"{
                "0xBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB": { "balance": "10", "lastUpdated": 1 },
                "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa": { "balance": "20", "lastUpdated": 2 },
                "not-an-address": { "balance": "1" }
            }"#,
        )
        .unwrap();

        let reg = JsonFileRegistry::new(&path);
        assert_eq!(reg.addresses(), vec![Address([0xAA; 20]), Address([0xBB; 20])]);
    }

    #[test]
    fn missing_or_malformed_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REGISTRY_FILENAME);
        assert!(JsonFileRegistry::new(&path).addresses().is_empty());

        std::fs::write(&path, b"[1,2,3]").unwrap();
        assert!(JsonFileRegistry::new(&path).addresses().is_empty());
    }

    #[test]
    fn static_registry_sorts_and_dedups() {
        let reg = StaticRegistry::new([Address([2; 20]), Address([1; 20]), Address([2; 20])]);
        assert_eq!(reg.addresses(), vec![Address([1; 20]), Address([2; 20])]);
    }
}
