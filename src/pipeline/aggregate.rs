//! Translation of recognised field text into the aggregation request, and
//! of the aggregation reply into the gateway's success body.

use crate::error::{FieldWarning, StageFailure};
use crate::stage::{FieldMap, StageKind, StageRequest, StageResult};
use serde_json::{Map, Value};

/// Key under which field warnings are attached to the aggregated document.
pub const WARNINGS_KEY: &str = "warnings";

/// Build the aggregation request from `{field: text}`.
///
/// An empty mapping is valid: whether an empty document is acceptable is
/// the aggregation service's decision.
pub fn to_aggregation_request(texts: &FieldMap<String>) -> StageResult<StageRequest> {
    let mut body = Map::with_capacity(texts.len());
    for (name, text) in texts {
        if name.trim().is_empty() {
            return Err(StageFailure::protocol(
                StageKind::Aggregation,
                "recognised text has an empty field name",
            ));
        }
        body.insert(name.clone(), Value::String(text.clone()));
    }
    Ok(StageRequest::structured(body))
}

/// The success body: the aggregated document with a `warnings` array.
///
/// A `warnings` key produced by the aggregation service is replaced.
pub fn with_warnings(mut aggregated: Map<String, Value>, warnings: &[FieldWarning]) -> Value {
    let warnings = serde_json::to_value(warnings).unwrap_or_else(|_| Value::Array(Vec::new()));
    aggregated.insert(WARNINGS_KEY.to_string(), warnings);
    Value::Object(aggregated)
}
