//! Scripted walk through one record page: seed, attach, add a product via
//! the side flow, edit a cell, delete a row, detach.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use list_binder::{
    projection::FieldKind, BinderConfig, BinderEvent, BinderPhase, DisplayRow, FlowHost,
    ListViewBinder,
};
use memory_source::MemoryRecordStore;
use serde_json::{json, Value};
use shared::{
    domain::RelatedListKind,
    protocol::{EditDraft, FlowInputVariable, FlowStatus, FLOW_RECORD_ID_INPUT},
};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use crate::config::Settings;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Completes the add-products flow instantly by inserting one line item.
struct InstantAddProductFlow {
    store: Arc<MemoryRecordStore>,
    related_list: RelatedListKind,
}

#[async_trait]
impl FlowHost for InstantAddProductFlow {
    async fn start(&self, flow_api_name: &str, inputs: Vec<FlowInputVariable>) -> Result<()> {
        let parent = inputs
            .iter()
            .find(|input| input.name == FLOW_RECORD_ID_INPUT)
            .and_then(|input| input.value.as_str())
            .ok_or_else(|| anyhow!("{flow_api_name} started without {FLOW_RECORD_ID_INPUT}"))?;
        let id = self
            .store
            .insert(parent, self.related_list.clone(), line_item(99, "Added via flow"))
            .await;
        info!(flow = flow_api_name, record_id = %id, "flow inserted product");
        Ok(())
    }

    async fn stop(&self) {}
}

fn line_item(index: usize, description: &str) -> BTreeMap<String, Value> {
    let quantity = (index % 4 + 1) as f64;
    let unit_price = 100.0 + 25.0 * index as f64;
    BTreeMap::from([
        ("Product_Name__c".into(), json!(format!("Product {index}"))),
        ("UnitPrice".into(), json!(unit_price)),
        ("Quantity".into(), json!(quantity)),
        ("Beschreibung__c".into(), json!(description)),
        ("Cost_Rate_Per_Hour__c".into(), json!(80.0)),
        ("Total_Sales_Price__c".into(), json!(unit_price * quantity)),
        ("Costs__c".into(), json!(60.0 * quantity)),
        ("Margin__c".into(), json!(2000 + 250 * index as i64)),
    ])
}

fn quote(index: usize) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("Name".into(), json!(format!("Q-{:05}", index + 1))),
        ("Subtotal".into(), json!(1500.0 * (index + 1) as f64)),
        ("Status".into(), json!(if index == 0 { "Draft" } else { "Approved" })),
    ])
}

async fn seed(store: &MemoryRecordStore, settings: &Settings, config: &BinderConfig) {
    for index in 0..settings.seed_rows {
        let fields = match config.object_api_name.as_str() {
            "Quote" => quote(index),
            _ => line_item(index, &format!("Seeded line {}", index + 1)),
        };
        store
            .insert(
                settings.parent_id.as_str(),
                config.related_list.clone(),
                fields,
            )
            .await;
    }
    info!(rows = settings.seed_rows, parent_id = %settings.parent_id, "store seeded");
}

pub async fn run(settings: &Settings, config: BinderConfig) -> Result<()> {
    let store = MemoryRecordStore::new();
    seed(&store, settings, &config).await;

    let flow_host = Arc::new(InstantAddProductFlow {
        store: store.clone(),
        related_list: config.related_list.clone(),
    });
    let binder =
        ListViewBinder::new_with_flow_host(config, store.clone(), store.clone(), flow_host);
    let printer = tokio::spawn(print_events(binder.subscribe_events()));

    println!(
        "columns: {}",
        serde_json::to_string(binder.columns()).context("serialize columns")?
    );

    binder.attach(settings.parent_id.as_str()).await?;
    settle(&binder).await?;
    print_rows("attached", &binder).await?;

    if binder.config().side_flow.is_some() {
        binder.launch_side_flow().await?;
        binder.on_side_flow_finished(FlowStatus::finished()).await?;
        settle(&binder).await?;
        print_rows("after flow", &binder).await?;
    }

    if let Some(draft) = first_numeric_edit(&binder).await {
        binder.edit_cell(draft).await?;
        settle(&binder).await?;
        print_rows("after edit", &binder).await?;
    }

    if let Some(row) = binder.rows().await.last().cloned() {
        let (tx, rx) = oneshot::channel();
        binder.load_row_actions(&row, move |actions| {
            let _ = tx.send(actions);
        });
        let actions = rx.await.context("row actions never resolved")?;
        match actions.first() {
            Some(action) => {
                binder.handle_row_action(action, &row).await?;
                settle(&binder).await?;
                print_rows("after delete", &binder).await?;
            }
            None => info!(record_id = %row.id, "no row actions offered"),
        }
    }

    binder.detach().await;
    drop(binder);
    printer.await.context("event printer panicked")?;
    Ok(())
}

/// Bumps the first editable number cell of the first row by one.
async fn first_numeric_edit(binder: &ListViewBinder) -> Option<EditDraft> {
    let field = binder
        .config()
        .projection
        .fields()
        .iter()
        .find(|field| field.editable && field.kind == FieldKind::Number)?;
    let row = binder.rows().await.into_iter().next()?;
    let current = row.number(&field.column).unwrap_or_default();
    Some(EditDraft::new(row.id.clone()).set(field.column.clone(), current + 1.0))
}

/// Waits until the binder has applied the latest emission.
async fn settle(binder: &ListViewBinder) -> Result<()> {
    let outcome = tokio::time::timeout(SETTLE_TIMEOUT, async {
        loop {
            match binder.phase().await {
                BinderPhase::Ready => return Ok(()),
                BinderPhase::Errored => {
                    bail!(
                        "list failed: {}",
                        binder.last_error().await.unwrap_or_default()
                    )
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await;
    outcome.context("timed out waiting for related records")?
}

async fn print_rows(stage: &str, binder: &ListViewBinder) -> Result<()> {
    let rows: Vec<DisplayRow> = binder.rows().await;
    println!(
        "{stage} ({} rows, table visible: {}):\n{}",
        rows.len(),
        binder.is_table_visible().await,
        serde_json::to_string_pretty(&rows).context("serialize rows")?
    );
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<BinderEvent>) {
    loop {
        match events.recv().await {
            Ok(BinderEvent::Toast(toast)) => {
                println!("[{:?}] {}: {}", toast.variant, toast.title, toast.message);
            }
            Ok(BinderEvent::PhaseChanged(phase)) => info!(?phase, "phase changed"),
            Ok(BinderEvent::RowsReplaced(rows)) => info!(rows = rows.len(), "rows replaced"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
