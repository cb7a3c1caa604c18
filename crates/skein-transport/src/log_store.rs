//! Per-transport packet accounting.
//!
//! Each managed transport keeps running sent/received packet counters.
//! The store persists them keyed by transport id; the `file` backend
//! writes one JSON file per transport, the `memory` backend is used in
//! tests and throwaway deployments.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use uuid::Uuid;

/// Counters for one transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportLogEntry {
    /// Packets written to the wire
    pub sent: u64,
    /// Packets read off the wire
    pub received: u64,
}

/// Persistent counter store.
pub trait LogStore: Send + Sync {
    /// Current counters for `id`; zeroes if never recorded.
    fn entry(&self, id: Uuid) -> io::Result<TransportLogEntry>;

    /// Persist counters for `id`.
    fn record(&self, id: Uuid, entry: TransportLogEntry) -> io::Result<()>;
}

/// In-memory counter store.
#[derive(Default)]
pub struct MemoryLogStore {
    entries: DashMap<Uuid, TransportLogEntry>,
}

impl MemoryLogStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn entry(&self, id: Uuid) -> io::Result<TransportLogEntry> {
        Ok(self.entries.get(&id).map(|e| *e).unwrap_or_default())
    }

    fn record(&self, id: Uuid, entry: TransportLogEntry) -> io::Result<()> {
        self.entries.insert(id, entry);
        Ok(())
    }
}

/// File-backed counter store: one JSON file per transport id.
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    /// Store rooted at `dir`, created if absent.
    ///
    /// # Errors
    ///
    /// Propagates directory creation failures.
    pub fn new(dir: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl LogStore for FileLogStore {
    fn entry(&self, id: Uuid) -> io::Result<TransportLogEntry> {
        match std::fs::read(self.path(id)) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(TransportLogEntry::default())
            }
            Err(err) => Err(err),
        }
    }

    fn record(&self, id: Uuid, entry: TransportLogEntry) -> io::Result<()> {
        let raw = serde_json::to_vec(&entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(self.path(id), raw)
    }
}
