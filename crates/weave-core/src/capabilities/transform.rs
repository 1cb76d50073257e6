//! Data formatting capability.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capability::{Capability, CapabilityError, PreparedInputs, RunContext, RunValue};

/// Reshapes raw data for presentation. Supported format types:
/// `bullet_list`, `comparison_table`, `json` (the fallback).
pub struct DataFormatter;

#[async_trait]
impl Capability for DataFormatter {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let raw = prepared.require("raw_data")?;
        let format_type = prepared
            .get("format_type")
            .and_then(Value::as_str)
            .unwrap_or("json");

        let formatted = match format_type {
            "bullet_list" => {
                let lines: Vec<String> = match raw {
                    Value::Array(items) => items.iter().map(|i| format!("- {}", line(i))).collect(),
                    Value::Object(map) => {
                        map.iter().map(|(k, v)| format!("- {k}: {}", line(v))).collect()
                    }
                    other => vec![format!("- {}", line(other))],
                };
                json!(lines.join("\n"))
            }
            "comparison_table" => {
                let rows = match raw {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                json!({ "columns": column_names(&rows), "rows": rows })
            }
            _ => json!(serde_json::to_string_pretty(raw).unwrap_or_default()),
        };
        Ok(RunValue::data([("formatted_data", formatted)]))
    }
}

fn line(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn column_names(rows: &[Value]) -> Vec<String> {
    rows.first()
        .and_then(Value::as_object)
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default()
}
