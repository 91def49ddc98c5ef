//! Tabular Value Store
//!
//! Holds the intermediate tables of one job, keyed by the id of the block
//! that produced them. The store is owned by the job's scheduler and is
//! never shared between jobs.
//!
//! A table stays resident while any of its consumers has yet to run.
//! Once all consumers have executed it becomes evictable, and it is
//! evicted (oldest first) only when a new table would exceed the byte
//! budget.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use super::table::Table;

/// Errors returned by the table store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("no table stored for block '{0}'")]
    NotFound(String),

    #[error(
        "table store exhausted: block '{block_id}' needs {requested} bytes but only {available} of {budget} can be freed"
    )]
    Exhausted {
        block_id: String,
        requested: usize,
        available: usize,
        budget: usize,
    },
}

#[derive(Debug)]
struct StoredTable {
    table: Arc<Table>,
    bytes: usize,
    produced_seq: u64,
    pending_consumers: usize,
}

/// Per-job table storage with a resident byte budget.
#[derive(Debug)]
pub struct TableStore {
    budget_bytes: usize,
    resident_bytes: usize,
    next_seq: u64,
    entries: HashMap<String, StoredTable>,
}

impl TableStore {
    /// Creates a store that keeps at most `budget_bytes` resident.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            resident_bytes: 0,
            next_seq: 0,
            entries: HashMap::new(),
        }
    }

    /// Stores the output of `block_id`, to be read by `consumers` blocks.
    ///
    /// Evicts tables with no remaining consumers (oldest first) when the
    /// budget would otherwise be exceeded. Fails without evicting anything
    /// if not enough space can be freed.
    pub fn put(
        &mut self,
        block_id: &str,
        table: Table,
        consumers: usize,
    ) -> Result<Arc<Table>, StoreError> {
        // Replacing an entry frees its space first
        self.release(block_id);

        let requested = table.estimated_bytes();
        let free = self.budget_bytes.saturating_sub(self.resident_bytes);

        if requested > free {
            let mut evictable: Vec<(&String, u64, usize)> = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.pending_consumers == 0)
                .map(|(id, entry)| (id, entry.produced_seq, entry.bytes))
                .collect();
            evictable.sort_by_key(|(_, seq, _)| *seq);

            let reclaimable: usize = evictable.iter().map(|(_, _, bytes)| bytes).sum();
            if requested > free + reclaimable {
                return Err(StoreError::Exhausted {
                    block_id: block_id.to_string(),
                    requested,
                    available: free + reclaimable,
                    budget: self.budget_bytes,
                });
            }

            let mut freed = free;
            let mut victims = Vec::new();
            for (id, _, bytes) in evictable {
                if freed >= requested {
                    break;
                }
                freed += bytes;
                victims.push(id.clone());
            }

            for id in victims {
                info!("Evicting table '{}' to make room for '{}'", id, block_id);
                self.release(&id);
            }
        }

        let table = Arc::new(table);
        self.entries.insert(
            block_id.to_string(),
            StoredTable {
                table: Arc::clone(&table),
                bytes: requested,
                produced_seq: self.next_seq,
                pending_consumers: consumers,
            },
        );
        self.next_seq += 1;
        self.resident_bytes += requested;

        debug!(
            "Stored table '{}' ({} rows, {} bytes, {} consumers, {}/{} bytes resident)",
            block_id,
            table.len(),
            requested,
            consumers,
            self.resident_bytes,
            self.budget_bytes
        );

        Ok(table)
    }

    /// Returns the table produced by `block_id`.
    pub fn get(&self, block_id: &str) -> Result<Arc<Table>, StoreError> {
        self.entries
            .get(block_id)
            .map(|entry| Arc::clone(&entry.table))
            .ok_or_else(|| StoreError::NotFound(block_id.to_string()))
    }

    /// Records that one consumer of `block_id` has executed.
    pub fn mark_consumed(&mut self, block_id: &str) {
        if let Some(entry) = self.entries.get_mut(block_id) {
            entry.pending_consumers = entry.pending_consumers.saturating_sub(1);
            if entry.pending_consumers == 0 {
                debug!("Table '{}' has no pending consumers", block_id);
            }
        }
    }

    /// Drops the table produced by `block_id`. Returns whether one existed.
    pub fn release(&mut self, block_id: &str) -> bool {
        match self.entries.remove(block_id) {
            Some(entry) => {
                self.resident_bytes -= entry.bytes;
                true
            }
            None => false,
        }
    }

    /// Drops every table. Called when the job ends.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.resident_bytes = 0;
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.entries.contains_key(block_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }
}
