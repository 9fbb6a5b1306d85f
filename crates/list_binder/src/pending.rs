use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::RecordId;

use crate::error::BinderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub record_id: RecordId,
    pub kind: PendingKind,
    pub started_at: DateTime<Utc>,
}

/// In-flight mutations, at most one per record id. Overlapping requests are
/// rejected rather than queued or coalesced.
#[derive(Debug, Default)]
pub struct PendingActions {
    inflight: HashMap<RecordId, PendingAction>,
}

impl PendingActions {
    pub fn begin(&mut self, record_id: &RecordId, kind: PendingKind) -> Result<(), BinderError> {
        if self.inflight.contains_key(record_id) {
            return Err(BinderError::ActionInFlight {
                record_id: record_id.clone(),
            });
        }

        self.inflight.insert(
            record_id.clone(),
            PendingAction {
                record_id: record_id.clone(),
                kind,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn finish(&mut self, record_id: &RecordId) -> Option<PendingAction> {
        self.inflight.remove(record_id)
    }

    pub fn get(&self, record_id: &RecordId) -> Option<&PendingAction> {
        self.inflight.get(record_id)
    }

    pub fn snapshot(&self) -> Vec<PendingAction> {
        let mut actions: Vec<_> = self.inflight.values().cloned().collect();
        actions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        actions
    }
}

#[cfg(test)]
#[path = "tests/pending_tests.rs"]
mod tests;
