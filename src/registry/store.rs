//! Durable node table.
//!
//! Stores are synchronous; the session calls them on the blocking pool so a slow disk never
//! stalls frame dispatch.
use super::NodeRecord;
use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait NodeStore: Send + Sync + 'static {
    /// Read the whole table. A store that has never been written returns an empty table.
    fn load(&self) -> Result<Vec<NodeRecord>, PersistenceError>;

    /// Replace the stored table with `nodes`.
    fn save(&self, nodes: &[NodeRecord]) -> Result<(), PersistenceError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeTable {
    nodes: Vec<NodeRecord>,
    last_updated: DateTime<Utc>,
}

/// JSON file store, written atomically (temp file, rename, directory fsync).
#[derive(Debug, Clone)]
pub struct JsonNodeStore {
    path: PathBuf,
}

impl JsonNodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NodeStore for JsonNodeStore {
    fn load(&self) -> Result<Vec<NodeRecord>, PersistenceError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        // leading NULs are left behind by a write interrupted on some filesystems
        let cleaned = content.trim_start_matches('\0');
        if cleaned.trim().is_empty() {
            return Ok(Vec::new());
        }
        let table: NodeTable = serde_json::from_str(cleaned)?;
        Ok(table.nodes)
    }

    fn save(&self, nodes: &[NodeRecord]) -> Result<(), PersistenceError> {
        let table = NodeTable {
            nodes: nodes.to_vec(),
            last_updated: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&table)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let base = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("nodes.json");

        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(mut tmp) => {
                    tmp.write_all(content.as_bytes())?;
                    tmp.flush()?;
                    let _ = tmp.sync_all();
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                    if counter > 1000 {
                        return Err(PersistenceError::Internal(format!(
                            "no free temp file name in {}",
                            dir.display()
                        )));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        if let Ok(dir_file) = File::open(&dir) {
            let _ = dir_file.sync_all();
        }
        Ok(())
    }
}

/// Volatile store, used when persistence is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<Vec<NodeRecord>>,
    saves: Mutex<usize>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: Vec<NodeRecord>) -> Self {
        Self {
            nodes: Mutex::new(nodes),
            saves: Mutex::new(0),
        }
    }

    /// Number of completed `save` calls.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.nodes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl NodeStore for MemoryNodeStore {
    fn load(&self) -> Result<Vec<NodeRecord>, PersistenceError> {
        Ok(self.nodes())
    }

    fn save(&self, nodes: &[NodeRecord]) -> Result<(), PersistenceError> {
        *self.nodes.lock().unwrap_or_else(|p| p.into_inner()) = nodes.to_vec();
        *self.saves.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }
}
