use super::state::{Flow, FlowKey};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

/// Active flows by key. The only state shared across flows.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: Mutex<FxHashMap<FlowKey, Arc<Flow>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `flow` unless its key is taken, in which case the flow
    /// already registered is returned.
    pub fn insert_new(&self, flow: Arc<Flow>) -> Result<(), Arc<Flow>> {
        match self.flows.lock().entry(flow.key()) {
            Entry::Occupied(existing) => Err(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(flow);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.lock().get(key).cloned()
    }

    /// Removes the entry for `flow`'s key only if it is this very flow.
    pub fn remove(&self, flow: &Flow) -> bool {
        let mut flows = self.flows.lock();
        match flows.get(&flow.key()) {
            Some(existing) if std::ptr::eq(Arc::as_ptr(existing), flow) => {
                flows.remove(&flow.key());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Flow>> {
        self.flows.lock().values().cloned().collect()
    }
}
