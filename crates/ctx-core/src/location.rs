// SPDX-License-Identifier: MIT OR Apache-2.0
//! Storage location descriptors (spec §3 "Storage location").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one of the three storage tiers (spec §2 C3/C4/C5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    /// The hot, TTL-bounded in-memory cache (C3).
    Memory,
    /// The durable relational/FTS-indexed store (C4).
    Indexed,
    /// The durable file-per-record archive (C5).
    Archive,
}

impl Service {
    /// All three backends, in the fixed retrieval/fallback order mandated by
    /// spec §4.7/§4.9/§5.2 (`Memory → Indexed → Archive`).
    pub const FALLBACK_ORDER: [Service; 3] = [Service::Memory, Service::Indexed, Service::Archive];
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Service::Memory => "memory",
            Service::Indexed => "indexed",
            Service::Archive => "archive",
        };
        f.write_str(s)
    }
}

/// Returned by every successful backend `store`/`storeCompressed` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Id of the stored record.
    pub context_id: String,
    /// Backend that accepted the write.
    pub service: Service,
    /// Backend-local path or key the record was written under.
    pub path: String,
    /// When the write completed.
    pub stored_at: DateTime<Utc>,
    /// Serialized size in bytes, as written.
    pub storage_size: u64,
    /// Whether the stored form is compressed.
    pub compressed: bool,
    /// Whether the stored form is encrypted.
    pub encrypted: bool,
    /// Snapshot of the record's access count at write time.
    pub access_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_order_is_memory_indexed_archive() {
        assert_eq!(
            Service::FALLBACK_ORDER,
            [Service::Memory, Service::Indexed, Service::Archive]
        );
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(Service::Memory.to_string(), "memory");
        assert_eq!(Service::Indexed.to_string(), "indexed");
        assert_eq!(Service::Archive.to_string(), "archive");
    }
}
