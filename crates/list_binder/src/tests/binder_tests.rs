use super::*;
use crate::presets::{opportunity_quotes, quote_line_items_with_flow};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use shared::protocol::{RawRecord, RecordUpdate};
use std::{collections::HashMap, time::Duration};
use tokio::sync::{broadcast::error::TryRecvError, mpsc, oneshot, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct ScriptedState {
    queries: Vec<RelatedListQuery>,
    live: HashMap<SubscriptionHandle, mpsc::UnboundedSender<Emission>>,
    initial: Option<Emission>,
    on_refresh: Option<Emission>,
    refresh_error: Option<String>,
    refreshes: usize,
    unsubscribed: Vec<SubscriptionHandle>,
}

#[derive(Default)]
struct ScriptedSource {
    state: Mutex<ScriptedState>,
}

impl ScriptedSource {
    fn with_initial(initial: Emission) -> Arc<Self> {
        let source = Self::default();
        source
            .state
            .try_lock()
            .expect("fresh source is unlocked")
            .initial = Some(initial);
        Arc::new(source)
    }

    async fn emit(&self, emission: Emission) {
        let state = self.state.lock().await;
        for tx in state.live.values() {
            let _ = tx.send(emission.clone());
        }
    }

    async fn fail_refreshes(&self, message: &str) {
        self.state.lock().await.refresh_error = Some(message.to_string());
    }

    async fn respond_to_refresh(&self, emission: Emission) {
        self.state.lock().await.on_refresh = Some(emission);
    }

    async fn refreshes(&self) -> usize {
        self.state.lock().await.refreshes
    }

    async fn queries(&self) -> Vec<RelatedListQuery> {
        self.state.lock().await.queries.clone()
    }
}

#[async_trait]
impl RelatedListSource for ScriptedSource {
    async fn subscribe(&self, query: RelatedListQuery) -> Result<SourceSubscription> {
        let mut state = self.state.lock().await;
        let handle = SubscriptionHandle::new();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(initial) = &state.initial {
            tx.send(initial.clone()).expect("receiver alive");
        }
        state.queries.push(query);
        state.live.insert(handle, tx);
        Ok(SourceSubscription {
            handle,
            emissions: UnboundedReceiverStream::new(rx).boxed(),
        })
    }

    async fn refresh(&self, handle: &SubscriptionHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        state.refreshes += 1;
        if let Some(err) = &state.refresh_error {
            return Err(anyhow!(err.clone()));
        }
        if let (Some(emission), Some(tx)) = (state.on_refresh.clone(), state.live.get(handle)) {
            let _ = tx.send(emission);
        }
        Ok(())
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        state.live.remove(handle);
        state.unsubscribed.push(*handle);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRecordApi {
    updates: Mutex<Vec<RecordUpdate>>,
    deletes: Mutex<Vec<RecordId>>,
    fail_with: Option<String>,
    gated: bool,
    release: Notify,
}

impl RecordingRecordApi {
    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        })
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gated: true,
            ..Self::default()
        })
    }
}

#[async_trait]
impl RecordApi for RecordingRecordApi {
    async fn update_record(&self, update: RecordUpdate) -> Result<()> {
        if self.gated {
            self.release.notified().await;
        }
        self.updates.lock().await.push(update);
        match &self.fail_with {
            Some(err) => Err(anyhow!(err.clone())),
            None => Ok(()),
        }
    }

    async fn delete_record(&self, record_id: &RecordId) -> Result<()> {
        if self.gated {
            self.release.notified().await;
        }
        self.deletes.lock().await.push(record_id.clone());
        match &self.fail_with {
            Some(err) => Err(anyhow!(err.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct RecordingFlowHost {
    started: Mutex<Vec<(String, Vec<FlowInputVariable>)>>,
    stops: Mutex<u32>,
}

#[async_trait]
impl FlowHost for RecordingFlowHost {
    async fn start(&self, flow_api_name: &str, inputs: Vec<FlowInputVariable>) -> Result<()> {
        self.started
            .lock()
            .await
            .push((flow_api_name.to_string(), inputs));
        Ok(())
    }

    async fn stop(&self) {
        *self.stops.lock().await += 1;
    }
}

fn line_items(ids: &[&str]) -> Emission {
    Emission::records(
        ids.iter()
            .enumerate()
            .map(|(index, id)| {
                RawRecord::new(*id)
                    .with_field("Product_Name__c", format!("Product {index}"))
                    .with_field("Quantity", index as i64 + 1)
                    .with_field("Margin__c", 2550)
            })
            .collect(),
    )
}

struct Harness {
    binder: Arc<ListViewBinder>,
    source: Arc<ScriptedSource>,
    records: Arc<RecordingRecordApi>,
    flow_host: Arc<RecordingFlowHost>,
    events: broadcast::Receiver<BinderEvent>,
}

fn harness_with(
    config: BinderConfig,
    source: Arc<ScriptedSource>,
    records: Arc<RecordingRecordApi>,
) -> Harness {
    let flow_host = Arc::new(RecordingFlowHost::default());
    let binder = ListViewBinder::new_with_flow_host(
        config,
        source.clone(),
        records.clone(),
        flow_host.clone(),
    );
    let events = binder.subscribe_events();
    Harness {
        binder,
        source,
        records,
        flow_host,
        events,
    }
}

fn harness(initial: Emission) -> Harness {
    harness_with(
        quote_line_items_with_flow(),
        ScriptedSource::with_initial(initial),
        Arc::new(RecordingRecordApi::default()),
    )
}

async fn wait_for_phase(events: &mut broadcast::Receiver<BinderEvent>, phase: BinderPhase) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(BinderEvent::PhaseChanged(current)) if current == phase => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for phase change");
}

async fn wait_for_rows(binder: &ListViewBinder, expected: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while binder.rows().await.len() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for rows");
}

fn drain_toasts(events: &mut broadcast::Receiver<BinderEvent>) -> Vec<Toast> {
    let mut toasts = Vec::new();
    loop {
        match events.try_recv() {
            Ok(BinderEvent::Toast(toast)) => toasts.push(toast),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return toasts,
        }
    }
}

async fn attached(initial: Emission) -> Harness {
    let mut h = harness(initial);
    h.binder.attach("0Q0PARENT").await.expect("attach");
    wait_for_phase(&mut h.events, BinderPhase::Ready).await;
    drain_toasts(&mut h.events);
    h
}

#[tokio::test]
async fn attach_projects_the_initial_emission_in_order() {
    let h = attached(line_items(&["0QL2", "0QL1", "0QL3"])).await;

    let rows = h.binder.rows().await;
    let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, vec!["0QL2", "0QL1", "0QL3"]);
    assert_eq!(rows[0].number("Margin__c"), Some(25.5));
    assert!(h.binder.is_table_visible().await);
    assert_eq!(h.binder.phase().await, BinderPhase::Ready);

    let queries = h.source.queries().await;
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].parent_record_id.as_str(), "0Q0PARENT");
    assert_eq!(queries[0].related_list_id.as_str(), "QuoteLineItems");
    assert!(queries[0]
        .fields
        .contains(&"QuoteLineItem.Beschreibung__c".to_string()));
}

#[tokio::test]
async fn attach_without_parent_surfaces_one_error_and_does_not_subscribe() {
    let mut h = harness(line_items(&["0QL1"]));

    let err = h.binder.attach("  ").await.expect_err("blank parent");

    assert_eq!(err, BinderError::MissingParent);
    let toasts = drain_toasts(&mut h.events);
    assert_eq!(toasts.len(), 1);
    assert!(toasts[0].is_error());
    assert!(h.source.queries().await.is_empty());
    assert_eq!(h.binder.phase().await, BinderPhase::Idle);
}

#[tokio::test]
async fn attaching_the_same_parent_twice_keeps_one_subscription() {
    let h = attached(line_items(&["0QL1"])).await;

    h.binder.attach("0Q0PARENT").await.expect("second attach");

    assert_eq!(h.source.queries().await.len(), 1);
    assert!(h.source.state.lock().await.unsubscribed.is_empty());
}

#[tokio::test]
async fn attaching_a_new_parent_replaces_the_subscription() {
    let mut h = attached(line_items(&["0QL1", "0QL2"])).await;
    let first_handle = *h
        .source
        .state
        .lock()
        .await
        .live
        .keys()
        .next()
        .expect("live subscription");

    h.binder.attach("0Q0OTHER").await.expect("rebind");
    wait_for_phase(&mut h.events, BinderPhase::Ready).await;

    let state = h.source.state.lock().await;
    assert_eq!(state.queries.len(), 2);
    assert_eq!(state.queries[1].parent_record_id.as_str(), "0Q0OTHER");
    assert_eq!(state.unsubscribed, vec![first_handle]);
    assert_eq!(state.live.len(), 1);
    drop(state);
    assert_eq!(h.binder.parent_id().await, Some(RecordId::from("0Q0OTHER")));
}

#[tokio::test]
async fn error_emission_keeps_previous_rows_and_reports_once() {
    let mut h = attached(line_items(&["0QL1", "0QL2"])).await;

    h.source.emit(Emission::failure("session expired")).await;
    wait_for_phase(&mut h.events, BinderPhase::Errored).await;

    assert_eq!(h.binder.rows().await.len(), 2);
    assert_eq!(h.binder.last_error().await.as_deref(), Some("session expired"));
    let toasts = drain_toasts(&mut h.events);
    assert_eq!(
        toasts,
        vec![Toast::error("Error fetching related records", "session expired")]
    );
}

#[tokio::test]
async fn error_emission_clears_rows_when_configured() {
    let source = ScriptedSource::with_initial(Emission::records(vec![
        RawRecord::new("0Q01").with_field("Name", "Q-1"),
    ]));
    let mut h = harness_with(
        opportunity_quotes(),
        source,
        Arc::new(RecordingRecordApi::default()),
    );
    h.binder.attach("006OPP").await.expect("attach");
    wait_for_phase(&mut h.events, BinderPhase::Ready).await;

    h.source.emit(Emission::failure("boom")).await;
    wait_for_phase(&mut h.events, BinderPhase::Errored).await;

    assert!(h.binder.rows().await.is_empty());
    assert!(!h.binder.is_table_visible().await);
}

#[tokio::test]
async fn data_after_an_error_clears_the_stored_error() {
    let mut h = attached(line_items(&["0QL1"])).await;

    h.source.emit(Emission::failure("temporary")).await;
    wait_for_phase(&mut h.events, BinderPhase::Errored).await;
    h.source.emit(line_items(&["0QL1", "0QL2"])).await;
    wait_for_phase(&mut h.events, BinderPhase::Ready).await;

    assert_eq!(h.binder.last_error().await, None);
    assert_eq!(h.binder.rows().await.len(), 2);
}

#[tokio::test]
async fn refresh_reenters_subscribed_without_clearing_rows() {
    let mut h = attached(line_items(&["0QL1", "0QL2"])).await;

    h.binder.refresh().await.expect("refresh");

    assert_eq!(h.binder.phase().await, BinderPhase::Subscribed);
    assert_eq!(h.binder.rows().await.len(), 2);
    assert_eq!(h.source.refreshes().await, 1);
    assert!(drain_toasts(&mut h.events).is_empty());
}

#[tokio::test]
async fn failed_refresh_restores_the_previous_phase() {
    let mut h = attached(line_items(&["0QL1"])).await;
    h.source.fail_refreshes("network down").await;

    let err = h.binder.refresh().await.expect_err("refresh fails");

    assert_eq!(
        err,
        BinderError::Mutation {
            message: "network down".to_string()
        }
    );
    assert_eq!(h.binder.phase().await, BinderPhase::Ready);
    assert_eq!(
        drain_toasts(&mut h.events),
        vec![Toast::error("Error refreshing related list", "network down")]
    );
}

#[tokio::test]
async fn launching_the_flow_without_a_parent_only_reports_an_error() {
    let mut h = harness(line_items(&[]));

    let err = h.binder.launch_side_flow().await.expect_err("no parent");

    assert_eq!(err, BinderError::MissingParent);
    let toasts = drain_toasts(&mut h.events);
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].title, "Error");
    assert!(!h.binder.is_flow_visible().await);
    assert!(h.flow_host.started.lock().await.is_empty());
}

#[tokio::test]
async fn launching_the_flow_passes_the_parent_as_record_id() {
    let h = attached(line_items(&["0QL1"])).await;

    h.binder.launch_side_flow().await.expect("launch");

    assert!(h.binder.is_flow_visible().await);
    let started = h.flow_host.started.lock().await;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].0, "Add_Quote_Line_Items");
    assert_eq!(
        started[0].1,
        vec![FlowInputVariable::string("recordId", "0Q0PARENT")]
    );
    assert_eq!(
        serde_json::to_value(&started[0].1[0]).expect("serialize"),
        json!({ "name": "recordId", "type": "String", "value": "0Q0PARENT" })
    );
}

#[tokio::test]
async fn launching_a_showing_flow_does_not_start_it_again() {
    let mut h = attached(line_items(&["0QL1"])).await;
    h.binder.launch_side_flow().await.expect("launch");
    while h.events.try_recv().is_ok() {}

    h.binder.launch_side_flow().await.expect("second launch");

    assert!(h.binder.is_flow_visible().await);
    assert_eq!(h.flow_host.started.lock().await.len(), 1);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn finished_flow_refreshes_once_and_confirms() {
    let mut h = attached(line_items(&["0QL1"])).await;
    h.source.respond_to_refresh(line_items(&["0QL1", "0QL2"])).await;
    h.binder.launch_side_flow().await.expect("launch");

    h.binder
        .on_side_flow_finished(FlowStatus::finished())
        .await
        .expect("finished");

    assert_eq!(h.source.refreshes().await, 1);
    assert!(!h.binder.is_flow_visible().await);
    assert_eq!(*h.flow_host.stops.lock().await, 1);
    assert_eq!(
        drain_toasts(&mut h.events),
        vec![Toast::success("Product added successfully!")]
    );

    wait_for_rows(&h.binder, 2).await;
}

#[tokio::test]
async fn other_flow_statuses_hide_the_flow_without_refreshing() {
    let mut h = attached(line_items(&["0QL1"])).await;
    h.binder.launch_side_flow().await.expect("launch");

    for status in ["STARTED", "PAUSED", "ERROR", "FINISHED_SCREEN"] {
        h.binder
            .on_side_flow_finished(FlowStatus::new(status))
            .await
            .expect("status handled");
    }

    assert_eq!(h.source.refreshes().await, 0);
    assert!(!h.binder.is_flow_visible().await);
    assert!(drain_toasts(&mut h.events).is_empty());
}

#[tokio::test]
async fn finished_flow_with_failed_refresh_reports_the_refresh_error() {
    let mut h = attached(line_items(&["0QL1"])).await;
    h.source.fail_refreshes("refresh rejected").await;

    let err = h
        .binder
        .on_side_flow_finished(FlowStatus::finished())
        .await
        .expect_err("refresh fails");

    assert!(matches!(err, BinderError::Mutation { .. }));
    assert_eq!(
        drain_toasts(&mut h.events),
        vec![Toast::error("Error refreshing related list", "refresh rejected")]
    );
}

#[tokio::test]
async fn edit_cell_saves_then_refreshes() {
    let mut h = attached(line_items(&["0QL1"])).await;

    h.binder
        .edit_cell(EditDraft::new("0QL1").set("Quantity", 7))
        .await
        .expect("edit");

    let updates = h.records.updates.lock().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id.as_str(), "0QL1");
    assert_eq!(updates[0].fields.get("Quantity"), Some(&json!(7.0)));
    drop(updates);

    assert_eq!(h.source.refreshes().await, 1);
    assert_eq!(
        drain_toasts(&mut h.events),
        vec![Toast::success("Record updated successfully!")]
    );
    assert!(h.binder.pending_actions().await.is_empty());
}

#[tokio::test]
async fn failed_edit_reports_the_message_and_leaves_rows_alone() {
    let source = ScriptedSource::with_initial(line_items(&["0QL1"]));
    let mut h = harness_with(
        quote_line_items_with_flow(),
        source,
        RecordingRecordApi::failing("FIELD_CUSTOM_VALIDATION_EXCEPTION: quantity too high"),
    );
    h.binder.attach("0Q0PARENT").await.expect("attach");
    wait_for_phase(&mut h.events, BinderPhase::Ready).await;
    let before = h.binder.rows().await;

    let err = h
        .binder
        .edit_cell(EditDraft::new("0QL1").set("Quantity", 9000))
        .await
        .expect_err("update fails");

    assert!(matches!(err, BinderError::Mutation { .. }));
    assert_eq!(h.binder.rows().await, before);
    assert_eq!(h.source.refreshes().await, 0);
    let toasts = drain_toasts(&mut h.events);
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].title, "Error updating record");
    assert!(toasts[0].message.contains("quantity too high"));
}

#[tokio::test]
async fn edits_to_non_editable_fields_never_reach_the_api() {
    let mut h = attached(line_items(&["0QL1"])).await;

    let err = h
        .binder
        .edit_cell(EditDraft::new("0QL1").set("Quantity", 2).set("Margin__c", 30))
        .await
        .expect_err("margin is not editable");

    assert_eq!(
        err,
        BinderError::NonEditableField {
            field: "Margin__c".to_string()
        }
    );
    assert!(h.records.updates.lock().await.is_empty());
    assert_eq!(drain_toasts(&mut h.events).len(), 1);
}

#[tokio::test]
async fn overlapping_actions_on_one_record_are_rejected() {
    let source = ScriptedSource::with_initial(line_items(&["0QL1"]));
    let records = RecordingRecordApi::gated();
    let mut h = harness_with(quote_line_items_with_flow(), source, records.clone());
    h.binder.attach("0Q0PARENT").await.expect("attach");
    wait_for_phase(&mut h.events, BinderPhase::Ready).await;

    let binder = h.binder.clone();
    let first = tokio::spawn(async move {
        binder
            .edit_cell(EditDraft::new("0QL1").set("Quantity", 2))
            .await
    });
    while h.binder.pending_actions().await.is_empty() {
        tokio::task::yield_now().await;
    }

    let err = h.binder.delete_row("0QL1").await.expect_err("overlap");
    assert_eq!(
        err,
        BinderError::ActionInFlight {
            record_id: RecordId::from("0QL1")
        }
    );

    records.release.notify_one();
    first.await.expect("join").expect("first edit succeeds");
    assert!(records.deletes.lock().await.is_empty());
    assert!(h.binder.pending_actions().await.is_empty());
}

#[tokio::test]
async fn save_drafts_refreshes_once_for_the_whole_batch() {
    let mut h = attached(line_items(&["0QL1", "0QL2"])).await;

    let saved = h
        .binder
        .save_drafts(vec![
            EditDraft::new("0QL1").set("Quantity", 3),
            EditDraft::new("0QL2").set("Beschreibung__c", "Rush order"),
        ])
        .await
        .expect("batch");

    assert_eq!(saved, 2);
    assert_eq!(h.records.updates.lock().await.len(), 2);
    assert_eq!(h.source.refreshes().await, 1);
    assert_eq!(drain_toasts(&mut h.events).len(), 1);
}

#[tokio::test]
async fn deleting_the_last_row_hides_the_table_before_refresh() {
    let mut h = attached(line_items(&["0QL1"])).await;
    assert!(h.binder.is_table_visible().await);

    h.binder.delete_row("0QL1").await.expect("delete");

    assert!(!h.binder.is_table_visible().await);
    // The scripted source has not re-emitted yet; the local row is still there.
    assert_eq!(h.binder.rows().await.len(), 1);
    assert_eq!(h.source.refreshes().await, 1);
    assert_eq!(
        drain_toasts(&mut h.events),
        vec![Toast::success("Record deleted successfully!")]
    );
}

#[tokio::test]
async fn deleting_one_of_many_rows_keeps_the_table() {
    let h = attached(line_items(&["0QL1", "0QL2"])).await;

    h.binder.delete_row("0QL1").await.expect("delete");

    assert!(h.binder.is_table_visible().await);
    assert_eq!(*h.records.deletes.lock().await, vec![RecordId::from("0QL1")]);
}

#[tokio::test]
async fn failed_delete_keeps_rows_and_reports() {
    let source = ScriptedSource::with_initial(line_items(&["0QL1"]));
    let mut h = harness_with(
        quote_line_items_with_flow(),
        source,
        RecordingRecordApi::failing("ENTITY_IS_DELETED"),
    );
    h.binder.attach("0Q0PARENT").await.expect("attach");
    wait_for_phase(&mut h.events, BinderPhase::Ready).await;

    h.binder.delete_row("0QL1").await.expect_err("delete fails");

    assert!(h.binder.is_table_visible().await);
    assert_eq!(h.binder.rows().await.len(), 1);
    assert_eq!(h.source.refreshes().await, 0);
    let toasts = drain_toasts(&mut h.events);
    assert_eq!(
        toasts,
        vec![Toast::error("Error deleting record", "ENTITY_IS_DELETED")]
    );
}

#[tokio::test]
async fn row_actions_are_delivered_asynchronously() {
    let h = attached(line_items(&["0QL1"])).await;
    let row = h.binder.rows().await.remove(0);
    let (tx, rx) = oneshot::channel();

    let task = h.binder.load_row_actions(&row, move |actions| {
        let _ = tx.send(actions);
    });

    let actions = rx.await.expect("callback invoked");
    task.await.expect("task completes");
    assert_eq!(actions, vec![RowAction::delete()]);

    h.binder
        .handle_row_action(&actions[0], &row)
        .await
        .expect("delete action");
    assert_eq!(*h.records.deletes.lock().await, vec![RecordId::from("0QL1")]);
}

#[tokio::test]
async fn detached_binder_ignores_late_emissions_and_completions() {
    let source = ScriptedSource::with_initial(line_items(&["0QL1"]));
    let records = RecordingRecordApi::gated();
    let mut h = harness_with(quote_line_items_with_flow(), source, records.clone());
    h.binder.attach("0Q0PARENT").await.expect("attach");
    wait_for_phase(&mut h.events, BinderPhase::Ready).await;
    drain_toasts(&mut h.events);

    let binder = h.binder.clone();
    let edit = tokio::spawn(async move {
        binder
            .edit_cell(EditDraft::new("0QL1").set("Quantity", 5))
            .await
    });
    while h.binder.pending_actions().await.is_empty() {
        tokio::task::yield_now().await;
    }

    h.binder.detach().await;
    records.release.notify_one();
    edit.await.expect("join").expect("completion is a no-op");

    h.binder.on_emission(line_items(&["0QL1", "0QL2", "0QL3"])).await;

    assert_eq!(h.binder.phase().await, BinderPhase::Detached);
    assert_eq!(h.binder.rows().await.len(), 1);
    assert_eq!(h.source.refreshes().await, 0);
    assert!(drain_toasts(&mut h.events).is_empty());
    assert!(h.source.state.lock().await.live.is_empty());
    assert_eq!(
        h.binder.attach("0Q0PARENT").await,
        Err(BinderError::Detached)
    );
}
