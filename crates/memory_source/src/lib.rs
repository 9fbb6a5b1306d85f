//! In-memory related-list source and record API.
//!
//! Backs the demo app and the binder acceptance tests. Every mutation is
//! re-emitted to the live subscriptions of the affected parent, the way the
//! record platform pushes changes to matching wires.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{future, StreamExt};
use list_binder::{RecordApi, RelatedListSource, SourceSubscription};
use serde_json::Value;
use shared::{
    domain::{RecordId, RelatedListKind, SubscriptionHandle},
    error::{ErrorCode, FetchFailure, RecordApiError},
    protocol::{Emission, FieldValue, RawRecord, RecordUpdate, RelatedListQuery},
};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub parent_id: RecordId,
    pub related_list: RelatedListKind,
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub subscribes: usize,
    pub refreshes: usize,
    pub unsubscribes: usize,
    pub updates: usize,
    pub deletes: usize,
}

#[derive(Default)]
struct Faults {
    fetch: Option<String>,
    next_refresh: Option<String>,
    next_update: Option<String>,
    next_delete: Option<String>,
}

struct LiveSubscription {
    query: RelatedListQuery,
    tx: broadcast::Sender<Emission>,
}

#[derive(Default)]
struct StoreState {
    records: Vec<StoredRecord>,
    subscriptions: HashMap<SubscriptionHandle, LiveSubscription>,
    faults: Faults,
    calls: CallCounts,
    next_id: u64,
}

impl StoreState {
    fn snapshot(&self, query: &RelatedListQuery) -> Emission {
        if let Some(message) = &self.faults.fetch {
            return Emission::Error(FetchFailure::with_code(ErrorCode::Unavailable, message));
        }

        let records = self
            .records
            .iter()
            .filter(|record| {
                record.parent_id == query.parent_record_id
                    && record.related_list == query.related_list_id
            })
            .map(|record| project_requested(record, &query.fields))
            .collect();
        Emission::records(records)
    }

    fn publish(&self, parent_id: &RecordId, related_list: &RelatedListKind) {
        for (handle, live) in &self.subscriptions {
            if &live.query.parent_record_id != parent_id
                || &live.query.related_list_id != related_list
            {
                continue;
            }
            if live.tx.send(self.snapshot(&live.query)).is_err() {
                debug!(handle = %handle, "subscription has no listener");
            }
        }
    }

    fn publish_insert(&mut self, record: StoredRecord) {
        let parent_id = record.parent_id.clone();
        let related_list = record.related_list.clone();
        debug!(record_id = %record.id, parent_id = %parent_id, "record inserted");
        self.records.push(record);
        self.publish(&parent_id, &related_list);
    }

    fn position(&self, record_id: &RecordId) -> Result<usize> {
        self.records
            .iter()
            .position(|record| &record.id == record_id)
            .ok_or_else(|| {
                RecordApiError::new(
                    ErrorCode::EntityIsDeleted,
                    format!("entity is deleted: {record_id}"),
                )
                .into()
            })
    }
}

/// Keeps only the requested `Object.Field` names, keyed by bare field name.
fn project_requested(record: &StoredRecord, requested: &[String]) -> RawRecord {
    let fields = requested
        .iter()
        .map(|qualified| {
            qualified
                .rsplit_once('.')
                .map_or(qualified.as_str(), |(_, field)| field)
        })
        .filter_map(|field| {
            record.fields.get(field).map(|value| {
                (
                    field.to_string(),
                    FieldValue {
                        value: Some(value.clone()),
                        display_value: None,
                    },
                )
            })
        })
        .collect();

    RawRecord {
        id: record.id.clone(),
        fields,
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<StoreState>,
}

impl MemoryRecordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts a child record with a generated id and pushes the change to
    /// live subscriptions.
    pub async fn insert(
        &self,
        parent_id: impl Into<RecordId>,
        related_list: impl Into<RelatedListKind>,
        fields: BTreeMap<String, Value>,
    ) -> RecordId {
        let mut state = self.inner.lock().await;
        state.next_id += 1;
        let id = RecordId::new(format!("REC{:012}", state.next_id));
        let record = StoredRecord {
            id: id.clone(),
            parent_id: parent_id.into(),
            related_list: related_list.into(),
            fields,
        };
        state.publish_insert(record);
        id
    }

    pub async fn record(&self, record_id: &RecordId) -> Option<StoredRecord> {
        let state = self.inner.lock().await;
        state
            .records
            .iter()
            .find(|record| &record.id == record_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// While set, every emission is a fetch error carrying `message`.
    pub async fn fail_fetches(&self, message: Option<&str>) {
        self.inner.lock().await.faults.fetch = message.map(str::to_string);
    }

    pub async fn fail_next_refresh(&self, message: &str) {
        self.inner.lock().await.faults.next_refresh = Some(message.to_string());
    }

    pub async fn fail_next_update(&self, message: &str) {
        self.inner.lock().await.faults.next_update = Some(message.to_string());
    }

    pub async fn fail_next_delete(&self, message: &str) {
        self.inner.lock().await.faults.next_delete = Some(message.to_string());
    }

    pub async fn calls(&self) -> CallCounts {
        self.inner.lock().await.calls.clone()
    }

    pub async fn live_subscriptions(&self) -> usize {
        self.inner.lock().await.subscriptions.len()
    }
}

#[async_trait]
impl RelatedListSource for MemoryRecordStore {
    async fn subscribe(&self, query: RelatedListQuery) -> Result<SourceSubscription> {
        let mut state = self.inner.lock().await;
        state.calls.subscribes += 1;

        let (tx, rx) = broadcast::channel(SUBSCRIPTION_BUFFER);
        let initial = state.snapshot(&query);
        let handle = SubscriptionHandle::new();
        debug!(
            handle = %handle,
            parent_id = %query.parent_record_id,
            related_list = %query.related_list_id,
            "subscription opened"
        );
        // The receiver is alive, so the initial snapshot is buffered.
        let _ = tx.send(initial);
        state
            .subscriptions
            .insert(handle, LiveSubscription { query, tx });

        let emissions = BroadcastStream::new(rx)
            .filter_map(|item| {
                future::ready(match item {
                    Ok(emission) => Some(emission),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged; older emissions dropped");
                        None
                    }
                })
            })
            .boxed();

        Ok(SourceSubscription { handle, emissions })
    }

    async fn refresh(&self, handle: &SubscriptionHandle) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.calls.refreshes += 1;
        if let Some(message) = state.faults.next_refresh.take() {
            return Err(RecordApiError::new(ErrorCode::Unavailable, message).into());
        }

        let live = state
            .subscriptions
            .get(handle)
            .ok_or_else(|| anyhow!("unknown subscription {handle}"))?;
        let _ = live.tx.send(state.snapshot(&live.query));
        Ok(())
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.calls.unsubscribes += 1;
        if state.subscriptions.remove(handle).is_some() {
            debug!(handle = %handle, "subscription closed");
        }
        Ok(())
    }
}

#[async_trait]
impl RecordApi for MemoryRecordStore {
    async fn update_record(&self, update: RecordUpdate) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.calls.updates += 1;
        if let Some(message) = state.faults.next_update.take() {
            return Err(RecordApiError::new(ErrorCode::InvalidField, message).into());
        }

        let index = state.position(&update.id)?;
        let record = &mut state.records[index];
        for (field, value) in update.fields {
            record.fields.insert(field, value);
        }
        let parent_id = record.parent_id.clone();
        let related_list = record.related_list.clone();
        debug!(record_id = %update.id, "record updated");
        state.publish(&parent_id, &related_list);
        Ok(())
    }

    async fn delete_record(&self, record_id: &RecordId) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.calls.deletes += 1;
        if let Some(message) = state.faults.next_delete.take() {
            return Err(RecordApiError::new(ErrorCode::InsufficientAccess, message).into());
        }

        let index = state.position(record_id)?;
        let removed = state.records.remove(index);
        debug!(record_id = %record_id, "record deleted");
        state.publish(&removed.parent_id, &removed.related_list);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
