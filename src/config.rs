// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Configuration for the session manager and pathfinder, loaded from a JSON file with
//! a `Default` fallback.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MeshCoreError, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Session lifetime since last keep-alive, in milliseconds.
    pub session_timeout_ms: i64,
    /// How long a maintained session can go without a search, in milliseconds.
    pub session_search_after_ms: i64,
    /// Hard cap on simultaneously buffered outbound messages awaiting a session.
    pub max_buffered_messages: usize,
    /// Capacity of the pathfinder's rumor mill.
    pub rumor_mill_capacity: usize,
    /// Interval between local-scope maintenance searches, in milliseconds.
    pub local_maintenance_search_ms: i64,
    /// Interval between global-scope maintenance searches, in milliseconds.
    pub global_maintenance_search_ms: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session_timeout_ms: 60_000,
            // Not specified by name in the source; chosen well inside the 60s session
            // timeout so a maintained session gets several search attempts before it
            // would otherwise expire.
            session_search_after_ms: 20_000,
            // Not given a numeric default upstream either; generous enough to absorb
            // a burst of cold-start lookups without unbounded memory growth.
            max_buffered_messages: 256,
            rumor_mill_capacity: 64,
            local_maintenance_search_ms: 1_000,
            global_maintenance_search_ms: 30_000,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file, falling back to `Default::default()` if the
    /// file does not exist. A malformed file is a hard configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| MeshCoreError::InvalidConfig(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(MeshCoreError::InvalidConfig(e.to_string())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| MeshCoreError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| MeshCoreError::InvalidConfig(e.to_string()))
    }
}
