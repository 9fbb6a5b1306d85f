use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{RecordId, SubscriptionHandle},
    protocol::{Emission, FlowInputVariable, RecordUpdate, RelatedListQuery, Toast},
};

mod binder;
pub mod config;
pub mod error;
pub mod pending;
pub mod presets;
pub mod projection;

pub use binder::{BinderPhase, ListViewBinder};
pub use config::{BinderConfig, BinderMessages, SideFlowConfig};
pub use error::BinderError;
pub use pending::{PendingAction, PendingKind};
pub use presets::Preset;
pub use projection::{CellValue, DerivedColumn, DisplayRow, FieldProjection, ProjectionTable};

/// A live related-list subscription: its handle plus every emission the
/// source produces for it, starting with the initial fetch.
pub struct SourceSubscription {
    pub handle: SubscriptionHandle,
    pub emissions: BoxStream<'static, Emission>,
}

#[async_trait]
pub trait RelatedListSource: Send + Sync {
    async fn subscribe(&self, query: RelatedListQuery) -> Result<SourceSubscription>;
    /// Re-executes the subscription with its last-known parameters.
    async fn refresh(&self, handle: &SubscriptionHandle) -> Result<()>;
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()>;
}

#[async_trait]
pub trait RecordApi: Send + Sync {
    async fn update_record(&self, update: RecordUpdate) -> Result<()>;
    async fn delete_record(&self, record_id: &RecordId) -> Result<()>;
}

/// Embedded guided-flow UI. Completion is reported back through
/// [`ListViewBinder::on_side_flow_finished`].
#[async_trait]
pub trait FlowHost: Send + Sync {
    async fn start(&self, flow_api_name: &str, inputs: Vec<FlowInputVariable>) -> Result<()>;
    async fn stop(&self);
}

pub struct MissingFlowHost;

#[async_trait]
impl FlowHost for MissingFlowHost {
    async fn start(&self, flow_api_name: &str, _inputs: Vec<FlowInputVariable>) -> Result<()> {
        Err(anyhow!("no flow host available to run {flow_api_name}"))
    }

    async fn stop(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum BinderEvent {
    PhaseChanged(BinderPhase),
    RowsReplaced(Vec<DisplayRow>),
    Toast(Toast),
    TableVisibilityChanged(bool),
    FlowVisibilityChanged(bool),
}
