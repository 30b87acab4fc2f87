//! The recolor queue: FIFO with per-path coalescing.
//!
//! Re-queueing a path merges the incoming brush slots into the existing
//! entry, replaces its captured stats snapshot, and moves it to the tail:
//! a tile impacted many times is repainted once, against the most recent
//! aggregate.

use std::collections::VecDeque;

use brushes::SerializedBrush;
use point_protocol::{BufferStats, TreePath};

#[derive(Debug)]
pub struct RecolorEntry {
    pub path: TreePath,
    /// Aligned with the target tile's brush slots; only the slots to
    /// repaint are occupied.
    pub slots: Vec<Option<SerializedBrush>>,
    /// Aggregate stats snapshot from the latest impacting push.
    pub captured_stats: BufferStats,
}

#[derive(Debug, Default)]
pub struct RecolorQueue {
    entries: VecDeque<RecolorEntry>,
}

impl RecolorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &TreePath) -> bool {
        self.entries.iter().any(|entry| entry.path == *path)
    }

    pub fn paths(&self) -> Vec<TreePath> {
        self.entries.iter().map(|entry| entry.path.clone()).collect()
    }

    pub fn enqueue(
        &mut self,
        path: TreePath,
        slot: usize,
        brush: SerializedBrush,
        slot_count: usize,
        captured_stats: &BufferStats,
    ) {
        if slot >= slot_count {
            panic!("recolor slot {slot} out of range for {slot_count} slots");
        }
        let mut entry = match self.entries.iter().position(|entry| entry.path == path) {
            Some(position) => self
                .entries
                .remove(position)
                .expect("recolor entry vanished while coalescing"),
            None => RecolorEntry {
                path,
                slots: vec![None; slot_count],
                captured_stats: BufferStats::new(),
            },
        };
        if entry.slots.len() < slot_count {
            entry.slots.resize(slot_count, None);
        }
        entry.slots[slot] = Some(brush);
        entry.captured_stats = captured_stats.clone();
        self.entries.push_back(entry);
    }

    pub fn pop_front(&mut self) -> Option<RecolorEntry> {
        self.entries.pop_front()
    }

    /// Scrub every entry for `path` (there is at most one).
    pub fn remove_path(&mut self, path: &TreePath) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.path != *path);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
