//! Writes mitigation decisions into the kernel-visible `flow_to_rwnd` table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{Decision, FlowKey};

/// Key→value table shared with the kernel: flow → advertised window in bytes.
pub trait RwndTable: Send + Sync {
    fn set(&self, key: &FlowKey, rwnd_bytes: u32) -> Result<()>;

    /// Remove `key`. Missing entries are not an error.
    fn remove(&self, key: &FlowKey) -> Result<()>;
}

/// Process-local table, used when no datapath is attached and in tests.
#[derive(Debug, Default)]
pub struct MemoryRwndTable {
    entries: Mutex<HashMap<FlowKey, u32>>,
    writes: AtomicUsize,
}

impl MemoryRwndTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &FlowKey) -> Option<u32> {
        self.entries.lock().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of `set` and `remove` calls observed.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl RwndTable for MemoryRwndTable {
    fn set(&self, key: &FlowKey, rwnd_bytes: u32) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(*key, rwnd_bytes);
        Ok(())
    }

    fn remove(&self, key: &FlowKey) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Applies decisions to the shared table.
#[derive(Clone)]
pub struct Actuator {
    table: Arc<dyn RwndTable>,
}

impl Actuator {
    pub fn new(table: Arc<dyn RwndTable>) -> Self {
        Self { table }
    }

    pub fn apply(&self, key: &FlowKey, decision: Decision) -> Result<()> {
        match decision {
            Decision::NotPaced => {
                debug!("Flow {}: clearing RWND", key);
                self.table.remove(key)
            }
            Decision::Paced(rwnd) => {
                info!("Flow {}: setting RWND to {} B", key, rwnd);
                self.table.set(key, rwnd)
            }
        }
    }

    pub fn table(&self) -> &dyn RwndTable {
        self.table.as_ref()
    }
}

impl std::fmt::Debug for Actuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actuator").finish_non_exhaustive()
    }
}
