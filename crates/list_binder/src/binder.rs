//! Reactive binding between one related-list subscription and a grid.
//!
//! The binder owns the subscription lifecycle, keeps the projected rows,
//! forwards edits and deletes to the record API and refreshes the
//! subscription once a mutation or side flow has completed. Every failure is
//! surfaced exactly once as an error toast on the event channel; the
//! returned `BinderError` is for the caller's inspection only.

use std::sync::{Arc, Weak};

use futures::{future::join_all, stream::BoxStream, StreamExt};
use shared::{
    domain::{RecordId, SubscriptionHandle},
    error::RecordApiError,
    protocol::{
        ColumnDef, EditDraft, Emission, FlowInputVariable, FlowStatus, RelatedListQuery,
        RowAction, Toast, FLOW_RECORD_ID_INPUT,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::BinderConfig,
    error::BinderError,
    pending::{PendingAction, PendingActions, PendingKind},
    projection::DisplayRow,
    BinderEvent, FlowHost, MissingFlowHost, RecordApi, RelatedListSource, SourceSubscription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinderPhase {
    /// No parent record bound.
    Idle,
    /// Waiting for the first emission or for a requested refresh.
    Subscribed,
    Ready,
    Errored,
    Detached,
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    pump: JoinHandle<()>,
}

struct BinderState {
    phase: BinderPhase,
    parent_id: Option<RecordId>,
    subscription: Option<ActiveSubscription>,
    /// Bumped on every re-bind and on detach; emissions tagged with an older
    /// generation are dropped.
    generation: u64,
    rows: Vec<DisplayRow>,
    last_error: Option<String>,
    table_visible: bool,
    flow_visible: bool,
    pending: PendingActions,
}

pub struct ListViewBinder {
    config: BinderConfig,
    source: Arc<dyn RelatedListSource>,
    records: Arc<dyn RecordApi>,
    flow_host: Arc<dyn FlowHost>,
    inner: Mutex<BinderState>,
    events: broadcast::Sender<BinderEvent>,
}

impl ListViewBinder {
    pub fn new(
        config: BinderConfig,
        source: Arc<dyn RelatedListSource>,
        records: Arc<dyn RecordApi>,
    ) -> Arc<Self> {
        Self::new_with_flow_host(config, source, records, Arc::new(MissingFlowHost))
    }

    pub fn new_with_flow_host(
        config: BinderConfig,
        source: Arc<dyn RelatedListSource>,
        records: Arc<dyn RecordApi>,
        flow_host: Arc<dyn FlowHost>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            config,
            source,
            records,
            flow_host,
            inner: Mutex::new(BinderState {
                phase: BinderPhase::Idle,
                parent_id: None,
                subscription: None,
                generation: 0,
                rows: Vec::new(),
                last_error: None,
                table_visible: false,
                flow_visible: false,
                pending: PendingActions::default(),
            }),
            events,
        })
    }

    pub fn config(&self) -> &BinderConfig {
        &self.config
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.config.columns
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BinderEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> BinderPhase {
        self.inner.lock().await.phase
    }

    pub async fn parent_id(&self) -> Option<RecordId> {
        self.inner.lock().await.parent_id.clone()
    }

    pub async fn rows(&self) -> Vec<DisplayRow> {
        self.inner.lock().await.rows.clone()
    }

    pub async fn has_items(&self) -> bool {
        !self.inner.lock().await.rows.is_empty()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    pub async fn is_table_visible(&self) -> bool {
        self.inner.lock().await.table_visible
    }

    pub async fn is_flow_visible(&self) -> bool {
        self.inner.lock().await.flow_visible
    }

    pub async fn pending_actions(&self) -> Vec<PendingAction> {
        self.inner.lock().await.pending.snapshot()
    }

    /// Inputs handed to the side flow: the bound parent as `recordId`.
    pub async fn flow_input_variables(&self) -> Vec<FlowInputVariable> {
        self.inner
            .lock()
            .await
            .parent_id
            .as_ref()
            .map(flow_inputs)
            .unwrap_or_default()
    }

    /// Binds the binder to `parent_id`, replacing any previous subscription.
    /// Re-attaching to the parent that is already bound is a no-op.
    pub async fn attach(self: &Arc<Self>, parent_id: impl Into<RecordId>) -> Result<(), BinderError> {
        let parent_id = parent_id.into();
        if parent_id.is_blank() {
            self.surface_missing_parent();
            return Err(BinderError::MissingParent);
        }

        let (previous, generation) = {
            let mut state = self.inner.lock().await;
            if state.phase == BinderPhase::Detached {
                return Err(BinderError::Detached);
            }

            let rebinding_same_parent = state.parent_id.as_ref() == Some(&parent_id);
            if rebinding_same_parent
                && (state.subscription.is_some() || state.phase == BinderPhase::Subscribed)
            {
                debug!(parent_id = %parent_id, "parent already bound; attach is a no-op");
                return Ok(());
            }

            state.generation += 1;
            state.parent_id = Some(parent_id.clone());
            if !rebinding_same_parent && !state.rows.is_empty() {
                state.rows.clear();
                self.emit(BinderEvent::RowsReplaced(Vec::new()));
            }
            if !rebinding_same_parent {
                state.last_error = None;
                self.set_table_visible(&mut state, false);
            }
            self.set_phase(&mut state, BinderPhase::Subscribed);
            (state.subscription.take(), state.generation)
        };

        if let Some(previous) = previous {
            self.teardown(previous).await;
        }

        let query = RelatedListQuery {
            parent_record_id: parent_id.clone(),
            related_list_id: self.config.related_list.clone(),
            fields: self.config.requested_fields(),
        };
        debug!(
            parent_id = %parent_id,
            related_list = %self.config.related_list,
            fields = query.fields.len(),
            "subscribing to related list"
        );

        let SourceSubscription { handle, emissions } = match self.source.subscribe(query).await {
            Ok(subscription) => subscription,
            Err(err) => {
                let message = failure_message(&err);
                let mut state = self.inner.lock().await;
                if state.generation == generation {
                    self.fetch_failed(&mut state, message.clone());
                }
                return Err(BinderError::Fetch { message });
            }
        };

        let pump = tokio::spawn(pump_emissions(Arc::downgrade(self), generation, emissions));
        let subscription = ActiveSubscription { handle, pump };

        let mut state = self.inner.lock().await;
        if state.generation != generation {
            let detached = state.phase == BinderPhase::Detached;
            drop(state);
            debug!(handle = %handle, "subscription superseded before it was installed");
            self.teardown(subscription).await;
            return if detached {
                Err(BinderError::Detached)
            } else {
                Ok(())
            };
        }

        state.subscription = Some(subscription);
        Ok(())
    }

    /// Tears the binder down. Later emissions and mutation completions are
    /// ignored.
    pub async fn detach(&self) {
        let (subscription, flow_was_visible) = {
            let mut state = self.inner.lock().await;
            if state.phase == BinderPhase::Detached {
                return;
            }
            state.generation += 1;
            let flow_was_visible = state.flow_visible;
            self.set_flow_visible(&mut state, false);
            self.set_phase(&mut state, BinderPhase::Detached);
            (state.subscription.take(), flow_was_visible)
        };

        if flow_was_visible {
            self.flow_host.stop().await;
        }
        if let Some(subscription) = subscription {
            self.teardown(subscription).await;
        }
        debug!(related_list = %self.config.related_list, "binder detached");
    }

    /// Applies an emission to the current subscription.
    pub async fn on_emission(&self, emission: Emission) {
        let generation = self.inner.lock().await.generation;
        self.deliver(generation, emission).await;
    }

    async fn deliver(&self, generation: u64, emission: Emission) {
        let mut state = self.inner.lock().await;
        if state.generation != generation
            || matches!(state.phase, BinderPhase::Idle | BinderPhase::Detached)
        {
            debug!(generation, "dropping emission for a superseded subscription");
            return;
        }

        match emission {
            Emission::Data(data) => {
                let rows = self.config.projection.project(&data.records);
                debug!(
                    parent_id = ?state.parent_id,
                    rows = rows.len(),
                    "related records received"
                );
                state.rows = rows.clone();
                state.last_error = None;
                self.emit(BinderEvent::RowsReplaced(rows));
                let visible = !state.rows.is_empty();
                self.set_table_visible(&mut state, visible);
                self.set_phase(&mut state, BinderPhase::Ready);
            }
            Emission::Error(failure) => {
                self.fetch_failed(&mut state, failure.message().to_string());
            }
        }
    }

    fn fetch_failed(&self, state: &mut BinderState, message: String) {
        warn!(
            parent_id = ?state.parent_id,
            related_list = %self.config.related_list,
            error = %message,
            "related list fetch failed"
        );
        state.last_error = Some(message.clone());
        if self.config.clear_rows_on_error && !state.rows.is_empty() {
            state.rows.clear();
            self.emit(BinderEvent::RowsReplaced(Vec::new()));
            self.set_table_visible(state, false);
        }
        self.set_phase(state, BinderPhase::Errored);
        self.notify(Toast::error(
            &self.config.messages.fetch_error_title,
            message,
        ));
    }

    /// Re-executes the live subscription without clearing the current rows.
    pub async fn refresh(&self) -> Result<(), BinderError> {
        let result = self.refresh_subscription().await;
        if let Err(err) = &result {
            self.report_refresh_failure(err);
        }
        result
    }

    async fn refresh_subscription(&self) -> Result<(), BinderError> {
        let (handle, previous_phase) = {
            let mut state = self.inner.lock().await;
            if state.phase == BinderPhase::Detached {
                return Err(BinderError::Detached);
            }
            if state.parent_id.is_none() {
                return Err(BinderError::MissingParent);
            }
            let Some(handle) = state.subscription.as_ref().map(|subscription| subscription.handle)
            else {
                return Err(BinderError::NotSubscribed);
            };

            let previous_phase = state.phase;
            if matches!(previous_phase, BinderPhase::Ready | BinderPhase::Errored) {
                self.set_phase(&mut state, BinderPhase::Subscribed);
            }
            (handle, previous_phase)
        };

        debug!(handle = %handle, "refreshing related list");
        if let Err(err) = self.source.refresh(&handle).await {
            let message = failure_message(&err);
            let mut state = self.inner.lock().await;
            let same_subscription =
                state.subscription.as_ref().map(|subscription| subscription.handle) == Some(handle);
            if same_subscription && state.phase == BinderPhase::Subscribed {
                self.set_phase(&mut state, previous_phase);
            }
            return Err(BinderError::Mutation { message });
        }
        Ok(())
    }

    fn report_refresh_failure(&self, err: &BinderError) {
        match err {
            BinderError::Detached => {}
            BinderError::MissingParent => self.surface_missing_parent(),
            BinderError::Mutation { message } => self.notify(Toast::error(
                &self.config.messages.refresh_error_title,
                message.clone(),
            )),
            other => self.notify(Toast::error(
                &self.config.messages.refresh_error_title,
                other.to_string(),
            )),
        }
    }

    async fn refresh_after_mutation(&self) {
        if let Err(err) = self.refresh_subscription().await {
            self.report_refresh_failure(&err);
        }
    }

    /// Shows the side flow for the bound parent record.
    pub async fn launch_side_flow(&self) -> Result<(), BinderError> {
        let parent_id = {
            let state = self.inner.lock().await;
            if state.phase == BinderPhase::Detached {
                return Err(BinderError::Detached);
            }
            state.parent_id.clone()
        };
        let Some(parent_id) = parent_id else {
            self.surface_missing_parent();
            return Err(BinderError::MissingParent);
        };
        let Some(flow) = &self.config.side_flow else {
            self.notify(Toast::error(
                &self.config.messages.flow_error_title,
                BinderError::NoSideFlow.to_string(),
            ));
            return Err(BinderError::NoSideFlow);
        };

        {
            let mut state = self.inner.lock().await;
            if state.flow_visible {
                debug!(flow = %flow.flow_api_name, "side flow already showing");
                return Ok(());
            }
            self.set_flow_visible(&mut state, true);
        }
        info!(flow = %flow.flow_api_name, parent_id = %parent_id, "launching side flow");

        if let Err(err) = self
            .flow_host
            .start(&flow.flow_api_name, flow_inputs(&parent_id))
            .await
        {
            let message = failure_message(&err);
            {
                let mut state = self.inner.lock().await;
                self.set_flow_visible(&mut state, false);
            }
            self.notify(Toast::error(
                &self.config.messages.flow_error_title,
                message.clone(),
            ));
            return Err(BinderError::Flow { message });
        }
        Ok(())
    }

    /// Hides the side flow; a `FINISHED` status additionally refreshes the
    /// related list and confirms with a success toast.
    pub async fn on_side_flow_finished(&self, status: FlowStatus) -> Result<(), BinderError> {
        let flow_was_visible = {
            let mut state = self.inner.lock().await;
            if state.phase == BinderPhase::Detached {
                return Err(BinderError::Detached);
            }
            let visible = state.flow_visible;
            self.set_flow_visible(&mut state, false);
            visible
        };
        if flow_was_visible {
            self.flow_host.stop().await;
        }

        if !status.is_finished() {
            debug!(status = %status.0, "side flow ended without finishing");
            return Ok(());
        }

        match self.refresh_subscription().await {
            Ok(()) => {
                let message = self
                    .config
                    .side_flow
                    .as_ref()
                    .map(|flow| flow.success_message.clone())
                    .unwrap_or_else(|| "Related list refreshed".to_string());
                self.notify(Toast::success(message));
                Ok(())
            }
            Err(err) => {
                self.report_refresh_failure(&err);
                Err(err)
            }
        }
    }

    /// Saves one row's inline edits, then refreshes.
    pub async fn edit_cell(&self, draft: EditDraft) -> Result<(), BinderError> {
        let update = match self.config.projection.prepare_update(&draft) {
            Ok(update) => update,
            Err(err) => {
                self.notify(Toast::error(
                    &self.config.messages.update_error_title,
                    err.to_string(),
                ));
                return Err(err);
            }
        };

        self.begin_action(&draft.id, PendingKind::Update).await?;
        let outcome = self.records.update_record(update).await;
        if !self.finish_action(&draft.id).await {
            return Ok(());
        }

        match outcome {
            Ok(()) => {
                info!(record_id = %draft.id, "record updated");
                self.notify(Toast::success(&self.config.messages.update_success));
                self.refresh_after_mutation().await;
                Ok(())
            }
            Err(err) => {
                let message = failure_message(&err);
                warn!(record_id = %draft.id, error = %message, "record update failed");
                self.notify(Toast::error(
                    &self.config.messages.update_error_title,
                    message.clone(),
                ));
                Err(BinderError::Mutation { message })
            }
        }
    }

    /// Saves a batch of row drafts concurrently. All drafts are validated
    /// before any is sent; one refresh follows if at least one was saved.
    pub async fn save_drafts(&self, drafts: Vec<EditDraft>) -> Result<usize, BinderError> {
        let mut updates = Vec::with_capacity(drafts.len());
        for draft in &drafts {
            match self.config.projection.prepare_update(draft) {
                Ok(update) => updates.push(update),
                Err(err) => {
                    self.notify(Toast::error(
                        &self.config.messages.update_error_title,
                        err.to_string(),
                    ));
                    return Err(err);
                }
            }
        }
        if updates.is_empty() {
            return Ok(0);
        }

        let mut begun: Vec<RecordId> = Vec::with_capacity(updates.len());
        for update in &updates {
            if let Err(err) = self.begin_action(&update.id, PendingKind::Update).await {
                for record_id in &begun {
                    self.finish_action(record_id).await;
                }
                return Err(err);
            }
            begun.push(update.id.clone());
        }

        let outcomes = join_all(updates.into_iter().map(|update| async move {
            let record_id = update.id.clone();
            (record_id, self.records.update_record(update).await)
        }))
        .await;

        let mut attached = true;
        for (record_id, _) in &outcomes {
            attached &= self.finish_action(record_id).await;
        }
        if !attached {
            return Ok(0);
        }

        let mut saved = 0;
        let mut first_failure = None;
        for (record_id, outcome) in outcomes {
            match outcome {
                Ok(()) => saved += 1,
                Err(err) => {
                    let message = failure_message(&err);
                    warn!(record_id = %record_id, error = %message, "record update failed");
                    self.notify(Toast::error(
                        &self.config.messages.update_error_title,
                        message.clone(),
                    ));
                    first_failure.get_or_insert(BinderError::Mutation { message });
                }
            }
        }

        if saved > 0 {
            info!(saved, "record drafts saved");
            self.notify(Toast::success(&self.config.messages.update_success));
            self.refresh_after_mutation().await;
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(saved),
        }
    }

    /// Deletes a record. The table is hidden straight away when no other row
    /// is shown, before the refresh lands.
    pub async fn delete_row(&self, record_id: impl Into<RecordId>) -> Result<(), BinderError> {
        let record_id = record_id.into();
        self.begin_action(&record_id, PendingKind::Delete).await?;
        let outcome = self.records.delete_record(&record_id).await;
        if !self.finish_action(&record_id).await {
            return Ok(());
        }

        match outcome {
            Ok(()) => {
                info!(record_id = %record_id, "record deleted");
                self.notify(Toast::success(&self.config.messages.delete_success));
                {
                    let mut state = self.inner.lock().await;
                    let remaining = state.rows.iter().filter(|row| row.id != record_id).count();
                    if remaining == 0 {
                        self.set_table_visible(&mut state, false);
                    }
                }
                self.refresh_after_mutation().await;
                Ok(())
            }
            Err(err) => {
                let message = failure_message(&err);
                warn!(record_id = %record_id, error = %message, "record delete failed");
                self.notify(Toast::error(
                    &self.config.messages.delete_error_title,
                    message.clone(),
                ));
                Err(BinderError::Mutation { message })
            }
        }
    }

    /// Resolves the row action menu on a spawned task, matching the grid's
    /// asynchronous action-population contract.
    pub fn load_row_actions<F>(&self, row: &DisplayRow, done: F) -> JoinHandle<()>
    where
        F: FnOnce(Vec<RowAction>) + Send + 'static,
    {
        let actions = if self.config.row_actions_enabled {
            vec![RowAction::delete()]
        } else {
            Vec::new()
        };
        let record_id = row.id.clone();
        tokio::spawn(async move {
            debug!(record_id = %record_id, actions = actions.len(), "row actions resolved");
            done(actions);
        })
    }

    pub async fn handle_row_action(
        &self,
        action: &RowAction,
        row: &DisplayRow,
    ) -> Result<(), BinderError> {
        match action.name.as_str() {
            RowAction::DELETE if self.config.row_actions_enabled => {
                self.delete_row(row.id.clone()).await
            }
            other => {
                warn!(action = other, record_id = %row.id, "unsupported row action");
                Err(BinderError::UnknownAction {
                    name: other.to_string(),
                })
            }
        }
    }

    async fn begin_action(&self, record_id: &RecordId, kind: PendingKind) -> Result<(), BinderError> {
        let mut state = self.inner.lock().await;
        if state.phase == BinderPhase::Detached {
            return Err(BinderError::Detached);
        }
        if let Err(err) = state.pending.begin(record_id, kind) {
            drop(state);
            warn!(record_id = %record_id, ?kind, "rejecting overlapping action");
            self.notify(Toast::error(
                &self.config.messages.action_in_flight_title,
                format!("Record {record_id} is still being saved. Try again once it completes."),
            ));
            return Err(err);
        }
        Ok(())
    }

    /// Clears the pending entry; returns whether the binder is still attached.
    async fn finish_action(&self, record_id: &RecordId) -> bool {
        let mut state = self.inner.lock().await;
        state.pending.finish(record_id);
        state.phase != BinderPhase::Detached
    }

    async fn teardown(&self, subscription: ActiveSubscription) {
        subscription.pump.abort();
        if let Err(err) = self.source.unsubscribe(&subscription.handle).await {
            warn!(handle = %subscription.handle, error = %failure_message(&err), "failed to release subscription");
        }
    }

    fn surface_missing_parent(&self) {
        self.notify(Toast::error(
            &self.config.messages.missing_parent_title,
            &self.config.messages.missing_parent_message,
        ));
    }

    fn set_phase(&self, state: &mut BinderState, phase: BinderPhase) {
        if state.phase != phase {
            debug!(from = ?state.phase, to = ?phase, "binder phase changed");
            state.phase = phase;
            self.emit(BinderEvent::PhaseChanged(phase));
        }
    }

    fn set_table_visible(&self, state: &mut BinderState, visible: bool) {
        if state.table_visible != visible {
            state.table_visible = visible;
            self.emit(BinderEvent::TableVisibilityChanged(visible));
        }
    }

    fn set_flow_visible(&self, state: &mut BinderState, visible: bool) {
        if state.flow_visible != visible {
            state.flow_visible = visible;
            self.emit(BinderEvent::FlowVisibilityChanged(visible));
        }
    }

    fn notify(&self, toast: Toast) {
        if toast.is_error() {
            debug!(title = %toast.title, message = %toast.message, "error toast");
        } else {
            debug!(message = %toast.message, "success toast");
        }
        self.emit(BinderEvent::Toast(toast));
    }

    fn emit(&self, event: BinderEvent) {
        // No receivers is not an error; the host may not be listening yet.
        let _ = self.events.send(event);
    }
}

impl Drop for ListViewBinder {
    fn drop(&mut self) {
        if let Some(subscription) = self.inner.get_mut().subscription.take() {
            subscription.pump.abort();
        }
    }
}

/// The platform's own message when the failure carries one.
fn failure_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<RecordApiError>() {
        Some(api_error) => api_error.message.clone(),
        None => format!("{err:#}"),
    }
}

fn flow_inputs(parent_id: &RecordId) -> Vec<FlowInputVariable> {
    vec![FlowInputVariable::string(
        FLOW_RECORD_ID_INPUT,
        parent_id.as_str(),
    )]
}

async fn pump_emissions(
    binder: Weak<ListViewBinder>,
    generation: u64,
    mut emissions: BoxStream<'static, Emission>,
) {
    while let Some(emission) = emissions.next().await {
        let Some(binder) = binder.upgrade() else {
            return;
        };
        binder.deliver(generation, emission).await;
    }
    debug!(generation, "emission stream ended");
}

#[cfg(test)]
#[path = "tests/binder_tests.rs"]
mod tests;
