//! Stage definitions: the static table the coordinator consults.
//!
//! The five stages always run in the order of [`StageKind::SEQUENCE`]. What
//! differs between deployments (endpoint, timeout, retry budget) lives in a
//! [`StageDescriptor`] built once from [`crate::GatewayConfig`] and shared
//! read-only across every run.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, StageFailure};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Mapping from field name to a per-field payload.
///
/// Field names are the join key across preprocessing, recognition and
/// aggregation; `BTreeMap` keeps iteration (and therefore output)
/// deterministic between runs.
pub type FieldMap<T> = BTreeMap<String, T>;

/// The outcome of one stage call.
pub type StageResult<T = StageOutput> = Result<T, StageFailure>;

/// One remote processing step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Detection,
    Extraction,
    Preprocessing,
    Recognition,
    Aggregation,
}

impl StageKind {
    /// Execution order of a run.
    pub const SEQUENCE: [StageKind; 5] = [
        StageKind::Detection,
        StageKind::Extraction,
        StageKind::Preprocessing,
        StageKind::Recognition,
        StageKind::Aggregation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Detection => "detection",
            StageKind::Extraction => "extraction",
            StageKind::Preprocessing => "preprocessing",
            StageKind::Recognition => "recognition",
            StageKind::Aggregation => "aggregation",
        }
    }

    /// Whether the stage runs once per document or once per extracted field.
    pub fn cardinality(self) -> Cardinality {
        match self {
            StageKind::Preprocessing | StageKind::Recognition => Cardinality::PerField,
            StageKind::Detection | StageKind::Extraction | StageKind::Aggregation => {
                Cardinality::Single
            }
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::SEQUENCE
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| {
                GatewayError::InvalidConfig(format!(
                    "unknown stage '{s}' (expected one of: detection, extraction, preprocessing, recognition, aggregation)"
                ))
            })
    }
}

/// How many times a stage is invoked per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one call; any failure fails the run.
    Single,
    /// One call per field through the fan-out executor; failures are isolated.
    PerField,
}

/// Everything needed to call one stage.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub kind: StageKind,
    pub endpoint: Url,
    /// Upper bound for a single attempt.
    pub timeout: Duration,
    /// Additional attempts after the first, for `Unreachable` failures only.
    pub max_retries: u32,
    pub cardinality: Cardinality,
}

/// The five descriptors, indexed by [`StageKind`].
#[derive(Debug, Clone)]
pub struct StageTable {
    stages: BTreeMap<StageKind, StageDescriptor>,
}

impl StageTable {
    /// Build the table from configuration, parsing every endpoint URL.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut stages = BTreeMap::new();
        for (name, endpoint) in &config.stages {
            let kind: StageKind = name.parse()?;
            let url = Url::parse(&endpoint.url).map_err(|e| {
                GatewayError::InvalidConfig(format!(
                    "stage '{name}': invalid url '{}': {e}",
                    endpoint.url
                ))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(GatewayError::InvalidConfig(format!(
                    "stage '{name}': url must be http or https, got '{}'",
                    endpoint.url
                )));
            }
            if endpoint.timeout_ms == 0 {
                return Err(GatewayError::InvalidConfig(format!(
                    "stage '{name}': timeout_ms must be > 0"
                )));
            }
            stages.insert(
                kind,
                StageDescriptor {
                    kind,
                    endpoint: url,
                    timeout: Duration::from_millis(endpoint.timeout_ms),
                    max_retries: endpoint.max_retries,
                    cardinality: kind.cardinality(),
                },
            );
        }

        let missing: Vec<&str> = StageKind::SEQUENCE
            .iter()
            .filter(|k| !stages.contains_key(k))
            .map(|k| k.name())
            .collect();
        if !missing.is_empty() {
            return Err(GatewayError::InvalidConfig(format!(
                "no endpoint configured for stage(s): {}",
                missing.join(", ")
            )));
        }

        Ok(Self { stages })
    }

    pub fn get(&self, kind: StageKind) -> &StageDescriptor {
        // from_config guarantees all five entries
        &self.stages[&kind]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.values()
    }
}

/// Input to one stage call. Built fresh per call and never mutated.
#[derive(Debug, Clone, Default)]
pub struct StageRequest {
    /// Binary content, sent base64-encoded as `file`.
    pub payload: Vec<u8>,
    /// Set for per-field stages.
    pub field_name: Option<String>,
    /// Structured content; for aggregation this is the whole request body.
    pub metadata: Option<Map<String, Value>>,
}

impl StageRequest {
    /// A whole-document request (detection, extraction).
    pub fn document(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// A per-field request (preprocessing, recognition).
    pub fn for_field(payload: Vec<u8>, field_name: impl Into<String>) -> Self {
        Self {
            payload,
            field_name: Some(field_name.into()),
            metadata: None,
        }
    }

    /// A structured request with no binary payload (aggregation).
    pub fn structured(metadata: Map<String, Value>) -> Self {
        Self {
            payload: Vec::new(),
            field_name: None,
            metadata: Some(metadata),
        }
    }
}

/// Decoded success payload of a stage call.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Detection: the cropped card image.
    Cropped(Vec<u8>),
    /// Extraction: one image per named field.
    Fields(FieldMap<Vec<u8>>),
    /// Preprocessing: the cleaned-up field image.
    Preprocessed(Vec<u8>),
    /// Recognition: the field's text.
    Text(String),
    /// Aggregation: the final document.
    Aggregated(Map<String, Value>),
}

impl StageOutput {
    fn variant(&self) -> &'static str {
        match self {
            StageOutput::Cropped(_) => "cropped image",
            StageOutput::Fields(_) => "field map",
            StageOutput::Preprocessed(_) => "preprocessed image",
            StageOutput::Text(_) => "text",
            StageOutput::Aggregated(_) => "aggregated document",
        }
    }

    fn mismatch(&self, stage: StageKind, wanted: &str) -> StageFailure {
        StageFailure::protocol(
            stage,
            format!("expected {wanted}, stage produced {}", self.variant()),
        )
    }

    /// The image carried by a detection or preprocessing result.
    pub fn into_image(self, stage: StageKind) -> StageResult<Vec<u8>> {
        match self {
            StageOutput::Cropped(bytes) | StageOutput::Preprocessed(bytes) => Ok(bytes),
            other => Err(other.mismatch(stage, "an image")),
        }
    }

    pub fn into_fields(self, stage: StageKind) -> StageResult<FieldMap<Vec<u8>>> {
        match self {
            StageOutput::Fields(fields) => Ok(fields),
            other => Err(other.mismatch(stage, "a field map")),
        }
    }

    pub fn into_text(self, stage: StageKind) -> StageResult<String> {
        match self {
            StageOutput::Text(text) => Ok(text),
            other => Err(other.mismatch(stage, "text")),
        }
    }

    pub fn into_aggregated(self, stage: StageKind) -> StageResult<Map<String, Value>> {
        match self {
            StageOutput::Aggregated(doc) => Ok(doc),
            other => Err(other.mismatch(stage, "an aggregated document")),
        }
    }
}
