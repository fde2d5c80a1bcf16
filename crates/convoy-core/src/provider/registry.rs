//! Registry of in-flight execution units.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ExecutionId, ExecutionProvider};
use crate::state::{ExecutionRecord, ExecutionUnitStatus, WorkerType};

/// Tracks units between open and teardown so a shutdown can sweep them.
#[derive(Default)]
pub struct ExecutionRegistry {
    units: Mutex<HashMap<ExecutionId, ExecutionRecord>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly opened unit.
    pub fn register(&self, id: &ExecutionId, worker_type: WorkerType, work_item_id: &str) -> ExecutionRecord {
        let record = ExecutionRecord::opened(id.as_str(), worker_type, work_item_id);
        if let Ok(mut units) = self.units.lock() {
            units.insert(id.clone(), record.clone());
        }
        record
    }

    /// Mark a unit finished and stop tracking it.
    pub fn finish(&self, id: &ExecutionId, status: ExecutionUnitStatus) -> Option<ExecutionRecord> {
        let mut record = self.units.lock().ok()?.remove(id)?;
        record.finish(status);
        Some(record)
    }

    pub fn in_flight(&self) -> Vec<ExecutionRecord> {
        self.units
            .lock()
            .map(|units| units.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Tear down every tracked unit without waiting. Returns how many were swept.
    pub fn shutdown_sweep(&self, provider: Arc<dyn ExecutionProvider>) -> usize {
        let drained: Vec<ExecutionId> = match self.units.lock() {
            Ok(mut units) => units.drain().map(|(id, _)| id).collect(),
            Err(_) => return 0,
        };

        for id in &drained {
            tracing::info!(execution_id = %id, "Tearing down in-flight unit");
            let provider = Arc::clone(&provider);
            let id = id.clone();
            tokio::spawn(async move {
                provider.teardown(&id).await;
            });
        }

        drained.len()
    }
}
