//! Wire codec: binary payloads ⇄ base64 JSON bodies.
//!
//! Every stage service speaks JSON. Binary content travels as standard
//! base64 under `file`; per-field stages add `field_name`. Aggregation is the
//! exception: its body is the bare `{field: text}` object.
//!
//! | Stage | Request | Response |
//! |-------|---------|----------|
//! | detection | `{file}` | `{cropped_image}` |
//! | extraction | `{file}` | `{fields: {name: b64}}` |
//! | preprocessing | `{file, field_name}` | `{preprocessed_image}` |
//! | recognition | `{file, field_name}` | `{text}` |
//! | aggregation | `{name: text, ...}` | any JSON object |

use crate::error::StageFailure;
use crate::stage::{Cardinality, FieldMap, StageKind, StageOutput, StageRequest, StageResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};
use tracing::debug;

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(stage: StageKind, what: &str, b64: &str) -> StageResult<Vec<u8>> {
    STANDARD
        .decode(b64.trim())
        .map_err(|e| StageFailure::protocol(stage, format!("{what} is not valid base64: {e}")))
}

/// Build the JSON body for a call to `stage`.
pub fn encode_request(stage: StageKind, request: &StageRequest) -> StageResult<Value> {
    if stage == StageKind::Aggregation {
        let body = request.metadata.clone().unwrap_or_default();
        return Ok(Value::Object(body));
    }

    if stage.cardinality() == Cardinality::PerField && request.field_name.is_none() {
        return Err(StageFailure::protocol(
            stage,
            "per-field stage invoked without a field name",
        ));
    }

    let mut body = Map::new();
    if let Some(ref metadata) = request.metadata {
        for (k, v) in metadata {
            body.insert(k.clone(), v.clone());
        }
    }
    let file = encode_payload(&request.payload);
    debug!("{stage}: encoded {} bytes → {} base64 chars", request.payload.len(), file.len());
    body.insert("file".into(), Value::String(file));
    if let Some(ref name) = request.field_name {
        body.insert("field_name".into(), Value::String(name.clone()));
    }
    Ok(Value::Object(body))
}

/// Validate a 2xx response body from `stage` and decode it.
pub fn decode_response(stage: StageKind, body: Value) -> StageResult<StageOutput> {
    let Value::Object(mut body) = body else {
        return Err(StageFailure::protocol(
            stage,
            format!("expected a JSON object, got {}", json_type(&body)),
        ));
    };

    match stage {
        StageKind::Detection => {
            let b64 = required_string(stage, &body, "cropped_image")?;
            if b64.is_empty() {
                return Err(StageFailure::protocol(stage, "cropped_image is empty"));
            }
            decode_payload(stage, "cropped_image", b64).map(StageOutput::Cropped)
        }
        StageKind::Extraction => {
            let fields = match body.remove("fields") {
                Some(Value::Object(fields)) => fields,
                Some(other) => {
                    return Err(StageFailure::protocol(
                        stage,
                        format!("fields must be an object, got {}", json_type(&other)),
                    ))
                }
                None => return Err(StageFailure::protocol(stage, "missing fields")),
            };
            if fields.is_empty() {
                return Err(StageFailure::protocol(stage, "extraction returned no fields"));
            }
            let mut decoded = FieldMap::new();
            for (name, value) in fields {
                if name.trim().is_empty() {
                    return Err(StageFailure::protocol(stage, "extraction returned a blank field name"));
                }
                let Value::String(b64) = value else {
                    return Err(StageFailure::protocol(
                        stage,
                        format!("field '{name}' must be a base64 string, got {}", json_type(&value)),
                    ));
                };
                let bytes = decode_payload(stage, &format!("field '{name}'"), &b64)?;
                decoded.insert(name, bytes);
            }
            Ok(StageOutput::Fields(decoded))
        }
        StageKind::Preprocessing => {
            let b64 = required_string(stage, &body, "preprocessed_image")?;
            if b64.is_empty() {
                return Err(StageFailure::protocol(stage, "preprocessed_image is empty"));
            }
            decode_payload(stage, "preprocessed_image", b64).map(StageOutput::Preprocessed)
        }
        StageKind::Recognition => {
            required_string(stage, &body, "text").map(|t| StageOutput::Text(t.to_string()))
        }
        StageKind::Aggregation => Ok(StageOutput::Aggregated(body)),
    }
}

fn required_string<'a>(stage: StageKind, body: &'a Map<String, Value>, key: &str) -> StageResult<&'a str> {
    match body.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Null) | None => Err(StageFailure::protocol(stage, format!("missing {key}"))),
        Some(other) => Err(StageFailure::protocol(
            stage,
            format!("{key} must be a string, got {}", json_type(other)),
        )),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
