use shared::{domain::RelatedListKind, protocol::ColumnDef};

use crate::projection::ProjectionTable;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct SideFlowConfig {
    pub flow_api_name: String,
    pub success_message: String,
}

/// User-facing toast wording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinderMessages {
    pub missing_parent_title: String,
    pub missing_parent_message: String,
    pub fetch_error_title: String,
    pub refresh_error_title: String,
    pub update_success: String,
    pub update_error_title: String,
    pub delete_success: String,
    pub delete_error_title: String,
    pub action_in_flight_title: String,
    pub flow_error_title: String,
}

impl Default for BinderMessages {
    fn default() -> Self {
        Self {
            missing_parent_title: "Error".into(),
            missing_parent_message:
                "Record Id is missing. Please make sure the component is placed on a record page."
                    .into(),
            fetch_error_title: "Error fetching related records".into(),
            refresh_error_title: "Error refreshing related list".into(),
            update_success: "Record updated successfully!".into(),
            update_error_title: "Error updating record".into(),
            delete_success: "Record deleted successfully!".into(),
            delete_error_title: "Error deleting record".into(),
            action_in_flight_title: "Action already in progress".into(),
            flow_error_title: "Error launching flow".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinderConfig {
    pub object_api_name: String,
    pub related_list: RelatedListKind,
    pub projection: ProjectionTable,
    pub columns: Vec<ColumnDef>,
    pub side_flow: Option<SideFlowConfig>,
    pub messages: BinderMessages,
    pub row_actions_enabled: bool,
    /// Drop the previous rows when the source reports an error.
    pub clear_rows_on_error: bool,
    pub event_capacity: usize,
}

impl BinderConfig {
    pub fn new(
        object_api_name: impl Into<String>,
        related_list: impl Into<RelatedListKind>,
        projection: ProjectionTable,
    ) -> Self {
        Self {
            object_api_name: object_api_name.into(),
            related_list: related_list.into(),
            projection,
            columns: Vec::new(),
            side_flow: None,
            messages: BinderMessages::default(),
            row_actions_enabled: false,
            clear_rows_on_error: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn requested_fields(&self) -> Vec<String> {
        self.projection.requested_fields(&self.object_api_name)
    }
}
