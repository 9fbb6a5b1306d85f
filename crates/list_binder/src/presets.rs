//! Ready-made binder configurations for the quote record pages.

use std::{fmt, str::FromStr};

use shared::{
    domain::ColumnType,
    protocol::{ColumnDef, FieldRef, TypeAttributes},
};

use crate::{
    config::{BinderConfig, SideFlowConfig},
    projection::{CellValue, DerivedColumn, FieldProjection, ProjectionTable},
};

pub const ADD_PRODUCTS_FLOW: &str = "Add_Quote_Line_Items";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    QuoteLineItemsWithFlow,
    OpportunityQuotes,
    QuoteLineItemTable,
}

impl Preset {
    pub const ALL: [Preset; 3] = [
        Preset::QuoteLineItemsWithFlow,
        Preset::OpportunityQuotes,
        Preset::QuoteLineItemTable,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Preset::QuoteLineItemsWithFlow => "quote-line-items-with-flow",
            Preset::OpportunityQuotes => "opportunity-quotes",
            Preset::QuoteLineItemTable => "quote-line-item-table",
        }
    }

    pub fn config(self) -> BinderConfig {
        match self {
            Preset::QuoteLineItemsWithFlow => quote_line_items_with_flow(),
            Preset::OpportunityQuotes => opportunity_quotes(),
            Preset::QuoteLineItemTable => quote_line_item_table(),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        Preset::ALL
            .into_iter()
            .find(|preset| preset.name() == normalized)
            .ok_or_else(|| {
                let known: Vec<_> = Preset::ALL.iter().map(|preset| preset.name()).collect();
                format!("unknown preset `{value}` (expected one of {})", known.join(", "))
            })
    }
}

/// Quote line items with inline edit, row delete and an add-products flow.
pub fn quote_line_items_with_flow() -> BinderConfig {
    let projection = ProjectionTable::new(vec![
        FieldProjection::text("Product_Name__c"),
        FieldProjection::number("UnitPrice").editable(),
        FieldProjection::number("Quantity").editable(),
        FieldProjection::text("Beschreibung__c").editable(),
        FieldProjection::number("Cost_Rate_Per_Hour__c"),
        FieldProjection::number("Total_Sales_Price__c"),
        FieldProjection::number("Costs__c"),
        FieldProjection::percent("Margin__c"),
    ]);

    let mut config = BinderConfig::new("QuoteLineItem", "QuoteLineItems", projection);
    config.columns = vec![
        ColumnDef::new("Product Name", "Product_Name__c", ColumnType::Text),
        ColumnDef::new("Unit Price", "UnitPrice", ColumnType::Currency).editable(),
        ColumnDef::new("Quantity", "Quantity", ColumnType::Number).editable(),
        ColumnDef::new("Description", "Beschreibung__c", ColumnType::Text).editable(),
        ColumnDef::new("Cost Rate Per Hour", "Cost_Rate_Per_Hour__c", ColumnType::Currency),
        ColumnDef::new("Total Sales Price", "Total_Sales_Price__c", ColumnType::Currency),
        ColumnDef::new("Costs", "Costs__c", ColumnType::Currency),
        ColumnDef::new("Margin", "Margin__c", ColumnType::Percent),
        ColumnDef::new("", "", ColumnType::Action).with_type_attributes(TypeAttributes {
            menu_alignment: Some("auto".into()),
            ..TypeAttributes::default()
        }),
    ];
    config.side_flow = Some(SideFlowConfig {
        flow_api_name: ADD_PRODUCTS_FLOW.into(),
        success_message: "Product added successfully!".into(),
    });
    config.row_actions_enabled = true;
    config
}

/// Quotes of an opportunity, each linking to its record page.
pub fn opportunity_quotes() -> BinderConfig {
    let projection = ProjectionTable::new(vec![
        FieldProjection::text("Name"),
        FieldProjection::number("Subtotal"),
        FieldProjection::text("Status"),
    ])
    .with_derived(DerivedColumn::RecordLink {
        column: "quoteLink".into(),
        object_api_name: "Quote".into(),
    });

    let mut config = BinderConfig::new("Quote", "Quotes", projection);
    config.columns = vec![
        ColumnDef::new("Quote Name", "quoteLink", ColumnType::Url).with_type_attributes(
            TypeAttributes {
                label: Some(FieldRef {
                    field_name: "Name".into(),
                }),
                target: Some("_blank".into()),
                ..TypeAttributes::default()
            },
        ),
        ColumnDef::new("Subtotal", "Subtotal", ColumnType::Currency),
        ColumnDef::new("Status", "Status", ColumnType::Text),
    ];
    config.clear_rows_on_error = true;
    config
}

/// Read-only numbered line item table with `N/A` placeholders.
pub fn quote_line_item_table() -> BinderConfig {
    let not_available = || CellValue::text("N/A");
    let projection = ProjectionTable::new(vec![
        FieldProjection::number("UnitPrice")
            .column("unitPrice")
            .default_value(not_available()),
        FieldProjection::number("Quantity")
            .column("quantity")
            .default_value(not_available()),
        FieldProjection::text("Beschreibung__c")
            .column("beschreibung")
            .default_value(not_available()),
    ])
    .with_derived(DerivedColumn::RowNumber {
        column: "rowNumber".into(),
    });

    let mut config = BinderConfig::new("QuoteLineItem", "QuoteLineItems", projection);
    config.columns = vec![
        ColumnDef::new("#", "rowNumber", ColumnType::Number),
        ColumnDef::new("Unit Price", "unitPrice", ColumnType::Currency),
        ColumnDef::new("Quantity", "quantity", ColumnType::Number),
        ColumnDef::new("Beschreibung", "beschreibung", ColumnType::Text),
    ];
    config.clear_rows_on_error = true;
    config
}

#[cfg(test)]
#[path = "tests/presets_tests.rs"]
mod tests;
