//! # Node Registry
//!
//! In-memory table of every mesh node observed, keyed by [`NodeId`]. Records are created on
//! the first sighting, merged on every later one and never removed.
//!
//! Invariants:
//! - at most one record per id;
//! - `last_seen` never moves backwards for an id, even when the radio replays an older
//!   `last_heard` from its node database;
//! - our own radio is never listed.
//!
//! The registry is owned by the session actor and mutated only there. Persistence is handled
//! by the owner: it asks for a [`NodeRegistry::take_dirty_snapshot`] and hands it to a
//! [`NodeStore`] off the dispatch path.

pub mod store;

use crate::error::PersistenceError;
use crate::meshtastic::{NodeId, NodeSighting, SignalQuality};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use store::{JsonNodeStore, MemoryNodeStore, NodeStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub signal: Option<SignalQuality>,
    #[serde(default)]
    pub hops_away: Option<u32>,
}

impl NodeRecord {
    fn from_sighting(s: &NodeSighting, seen: DateTime<Utc>) -> Self {
        Self {
            id: s.id,
            display_name: s.long_name.clone(),
            short_name: s.short_name.clone(),
            first_seen: seen,
            last_seen: seen,
            signal: s.signal,
            hops_away: s.hops_away,
        }
    }

    fn merge(&mut self, s: &NodeSighting, seen: DateTime<Utc>) {
        if seen > self.last_seen {
            self.last_seen = seen;
        }
        if seen < self.first_seen {
            self.first_seen = seen;
        }
        if s.long_name.is_some() {
            self.display_name = s.long_name.clone();
        }
        if s.short_name.is_some() {
            self.short_name = s.short_name.clone();
        }
        if s.signal.is_some() {
            self.signal = s.signal;
        }
        if s.hops_away.is_some() {
            self.hops_away = s.hops_away;
        }
    }

    /// Long name, else short name, else the `!hex` id.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.short_name.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// What an [`NodeRegistry::observe`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Discovered,
    Updated,
    /// Sighting of our own radio; nothing recorded.
    Ignored,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, NodeRecord>,
    local: Option<NodeId>,
    dirty: bool,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate from durable storage. Existing entries win over stored ones.
    pub fn load(&mut self, store: &dyn NodeStore) -> Result<usize, PersistenceError> {
        Ok(self.restore(store.load()?))
    }

    /// Insert previously stored records without treating them as discoveries.
    pub fn restore(&mut self, records: Vec<NodeRecord>) -> usize {
        let mut loaded = 0;
        for rec in records {
            if Some(rec.id) == self.local {
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(slot) = self.nodes.entry(rec.id) {
                slot.insert(rec);
                loaded += 1;
            }
        }
        debug!("registry restored {} stored nodes", loaded);
        loaded
    }

    /// Record our own node number; any record of it is dropped.
    pub fn set_local_node(&mut self, id: NodeId) {
        self.local = Some(id);
        if self.nodes.remove(&id).is_some() {
            self.dirty = true;
        }
    }

    pub fn local_node(&self) -> Option<NodeId> {
        self.local
    }

    /// Upsert from a sighting heard at `at`. Returns true when the id was not known before.
    ///
    /// A sighting carrying its own `heard_at` (node database replay) uses that time, capped
    /// at `at` so a skewed radio clock cannot push `last_seen` into the future.
    pub fn observe(&mut self, sighting: &NodeSighting, at: DateTime<Utc>) -> bool {
        self.observe_detailed(sighting, at) == Observation::Discovered
    }

    pub fn observe_detailed(&mut self, sighting: &NodeSighting, at: DateTime<Utc>) -> Observation {
        if Some(sighting.id) == self.local {
            return Observation::Ignored;
        }
        let seen = sighting.heard_at.map(|t| t.min(at)).unwrap_or(at);
        self.dirty = true;
        match self.nodes.get_mut(&sighting.id) {
            Some(rec) => {
                rec.merge(sighting, seen);
                Observation::Updated
            }
            None => {
                self.nodes
                    .insert(sighting.id, NodeRecord::from_sighting(sighting, seen));
                Observation::Discovered
            }
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&id)
    }

    /// All records, most recently seen first.
    pub fn list(&self) -> Vec<NodeRecord> {
        let mut out: Vec<NodeRecord> = self.nodes.values().cloned().collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Snapshot for persistence if anything changed since the last one; clears the flag.
    pub fn take_dirty_snapshot(&mut self) -> Option<Vec<NodeRecord>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.list())
    }

    /// Flag the table for another write, e.g. after a failed save.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}
