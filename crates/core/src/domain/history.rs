//! Undo/redo history of committed (buffer, parameters) snapshots
//!
//! The timeline is linear: pushing a snapshot after an undo discards every
//! redo entry. The oldest snapshot (the state right after load) is never
//! undone past.

use super::audio::SampleBuffer;
use super::params::EffectParams;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// What produced a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    Load,
    Cut,
    Apply,
}

/// A committed result buffer with the parameters that produced it
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub buffer: Arc<SampleBuffer>,
    pub params: EffectParams,
    pub kind: SnapshotKind,
}

impl HistorySnapshot {
    pub fn new(buffer: Arc<SampleBuffer>, params: EffectParams, kind: SnapshotKind) -> Self {
        Self {
            buffer,
            params,
            kind,
        }
    }
}

/// Undo and redo stacks with an optional depth bound
#[derive(Debug, Clone, Default)]
pub struct EditHistory {
    undo: VecDeque<HistorySnapshot>,
    redo: Vec<HistorySnapshot>,
    /// Maximum undo depth; 0 means unbounded
    limit: usize,
}

impl EditHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            limit,
        }
    }

    /// Commit a snapshot; clears the redo stack
    pub fn push(&mut self, snapshot: HistorySnapshot) {
        self.redo.clear();
        self.undo.push_back(snapshot);
        if self.limit > 0 {
            while self.undo.len() > self.limit {
                self.undo.pop_front();
            }
        }
    }

    /// Step back one snapshot and return the new current one
    ///
    /// Returns `None` (and changes nothing) when fewer than two snapshots exist.
    pub fn undo(&mut self) -> Option<&HistorySnapshot> {
        if self.undo.len() < 2 {
            return None;
        }
        let popped = self.undo.pop_back()?;
        self.redo.push(popped);
        self.undo.back()
    }

    /// Re-apply the most recently undone snapshot and return it
    pub fn redo(&mut self) -> Option<&HistorySnapshot> {
        let snapshot = self.redo.pop()?;
        self.undo.push_back(snapshot);
        self.undo.back()
    }

    pub fn current(&self) -> Option<&HistorySnapshot> {
        self.undo.back()
    }

    pub fn can_undo(&self) -> bool {
        self.undo.len() >= 2
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
