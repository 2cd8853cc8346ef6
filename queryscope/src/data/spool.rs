//! Disk-backed FIFO of serialized payloads.
//!
//! One file per envelope under the agent data directory. Filenames are
//! zero-padded monotone sequence numbers, so lexical order is write order
//! and the sequence survives restarts (the next id is recovered by
//! scanning the directory). Writes land in a temp name first and are
//! renamed into place, so a crash never leaves a half-written envelope
//! visible.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use super::serializer::{JsonSerializer, Serializer};
use super::Envelope;

/// Spool entry identifier; doubles as the on-disk filename.
pub type SpoolId = String;

/// Errors from spool operations. Producers treat write failures as
/// drop-with-warn; the sender stops its pass on read failures.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O: {0}")]
    Io(#[from] io::Error),
    #[error("spool encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("data service not running")]
    NotRunning,
}

/// Persistent FIFO of envelopes.
pub trait Spooler: Send + Sync + 'static {
    /// Durably persists one payload; returns its id on success.
    fn write(&self, service: &str, data: Value) -> Result<SpoolId, SpoolError>;

    /// All ids in write order.
    fn files(&self) -> Vec<SpoolId>;

    /// Raw encoded bytes of one entry.
    fn read(&self, id: &str) -> Result<Vec<u8>, SpoolError>;

    /// Deletes one entry. Removing an absent id is not an error.
    fn remove(&self, id: &str) -> Result<(), SpoolError>;

    /// Serializer tag forwarded with the bytes.
    fn content_type(&self) -> &'static str;
}

/// The production spool.
pub struct DiskSpool {
    dir: PathBuf,
    serializer: Box<dyn Serializer>,
    next: AtomicU64,
}

impl DiskSpool {
    /// Opens (or creates) the spool directory and recovers the sequence.
    pub fn new(dir: impl Into<PathBuf>, serializer: Box<dyn Serializer>) -> Result<Self, SpoolError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut max_seq = 0u64;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(seq) = parse_id(&entry.file_name().to_string_lossy()) {
                max_seq = max_seq.max(seq + 1);
            }
        }

        Ok(Self {
            dir,
            serializer,
            next: AtomicU64::new(max_seq),
        })
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

fn parse_id(name: &str) -> Option<u64> {
    if name.len() != 9 {
        return None;
    }
    name.parse().ok()
}

impl Spooler for DiskSpool {
    fn write(&self, service: &str, data: Value) -> Result<SpoolId, SpoolError> {
        let envelope = Envelope {
            ts: Utc::now(),
            service: service.to_string(),
            data,
        };
        let bytes = self.serializer.encode(&envelope)?;

        let id = format!("{:09}", self.next.fetch_add(1, Ordering::SeqCst));
        let tmp = self.dir.join(format!(".tmp-{}", id));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.entry_path(&id))?;
        Ok(id)
    }

    fn files(&self) -> Vec<SpoolId> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut ids: Vec<(u64, SpoolId)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                parse_id(&name).map(|seq| (seq, name))
            })
            .collect();
        ids.sort_unstable_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, name)| name).collect()
    }

    fn read(&self, id: &str) -> Result<Vec<u8>, SpoolError> {
        Ok(fs::read(self.entry_path(id))?)
    }

    fn remove(&self, id: &str) -> Result<(), SpoolError> {
        match fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }
}

/// In-memory spool for tests: same contract, no disk, plus accessors to
/// inspect what was written.
#[derive(Default)]
pub struct MemorySpool {
    entries: Mutex<Vec<(SpoolId, Vec<u8>)>>,
    next: AtomicU64,
}

impl MemorySpool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded envelopes in write order.
    pub fn envelopes(&self) -> Vec<Envelope> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(bytes).ok())
            .collect()
    }
}

impl Spooler for MemorySpool {
    fn write(&self, service: &str, data: Value) -> Result<SpoolId, SpoolError> {
        let envelope = Envelope {
            ts: Utc::now(),
            service: service.to_string(),
            data,
        };
        let bytes = JsonSerializer.encode(&envelope)?;
        let id = format!("{:09}", self.next.fetch_add(1, Ordering::SeqCst));
        self.entries
            .lock()
            .map_err(|_| SpoolError::NotRunning)?
            .push((id.clone(), bytes));
        Ok(id)
    }

    fn files(&self) -> Vec<SpoolId> {
        self.entries
            .lock()
            .map(|e| e.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    fn read(&self, id: &str) -> Result<Vec<u8>, SpoolError> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| {
                e.iter()
                    .find(|(entry_id, _)| entry_id == id)
                    .map(|(_, bytes)| bytes.clone())
            })
            .ok_or_else(|| {
                SpoolError::Io(io::Error::new(io::ErrorKind::NotFound, id.to_string()))
            })
    }

    fn remove(&self, id: &str) -> Result<(), SpoolError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(entry_id, _)| entry_id != id);
        }
        Ok(())
    }

    fn content_type(&self) -> &'static str {
        "json"
    }
}
