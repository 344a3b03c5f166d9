//! Persistence for statistics counters
//!
//! Counters are keyed by session and statistic id. The engine loads a
//! counter lazily on first touch and writes coalesced snapshots, never
//! one write per increment.

use crate::error::{Error, Result};
use crate::stats::StatId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Key-value store for statistics counters
pub trait StatStore {
    /// Load a counter, `None` if never persisted.
    fn load(&mut self, session: u16, stat: StatId) -> Result<Option<u32>>;

    /// Persist a batch of counters for one session.
    fn save(&mut self, session: u16, entries: &[(StatId, u32)]) -> Result<()>;
}

/// Volatile store for hosts without persistence and for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: HashMap<(u16, StatId), u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatStore for MemoryStore {
    fn load(&mut self, session: u16, stat: StatId) -> Result<Option<u32>> {
        Ok(self.map.get(&(session, stat)).copied())
    }

    fn save(&mut self, session: u16, entries: &[(StatId, u32)]) -> Result<()> {
        for (stat, value) in entries {
            self.map.insert((session, *stat), *value);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct FileRecords {
    records: Vec<(u16, StatId, u32)>,
}

/// File-backed store serialized with postcard
pub struct FileStore {
    path: PathBuf,
    map: HashMap<(u16, StatId), u32>,
    loaded: bool,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            map: HashMap::new(),
            loaded: false,
        }
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        if self.path.exists() {
            let bytes = std::fs::read(&self.path)?;
            let records: FileRecords = postcard::from_bytes(&bytes)?;
            for (session, stat, value) in records.records {
                self.map.insert((session, stat), value);
            }
        }
        self.loaded = true;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let records = FileRecords {
            records: self
                .map
                .iter()
                .map(|((session, stat), value)| (*session, *stat, *value))
                .collect(),
        };
        let bytes = postcard::to_allocvec(&records)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, bytes)
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", self.path.display(), e)))
    }

    /// Snapshot of all persisted counters, for the export tooling.
    pub fn snapshot(&mut self) -> Result<Vec<(u16, StatId, u32)>> {
        self.ensure_loaded()?;
        let mut records: Vec<_> = self
            .map
            .iter()
            .map(|((session, stat), value)| (*session, *stat, *value))
            .collect();
        records.sort();
        Ok(records)
    }
}

impl StatStore for FileStore {
    fn load(&mut self, session: u16, stat: StatId) -> Result<Option<u32>> {
        self.ensure_loaded()?;
        Ok(self.map.get(&(session, stat)).copied())
    }

    fn save(&mut self, session: u16, entries: &[(StatId, u32)]) -> Result<()> {
        self.ensure_loaded()?;
        for (stat, value) in entries {
            self.map.insert((session, *stat), *value);
        }
        self.persist()
    }
}
