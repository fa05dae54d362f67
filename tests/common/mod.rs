//! Shared fixtures for the integration tests.
//!
//! [`StubTransport`] stands in for the five stage services. By default it
//! behaves like a deterministic, healthy stage set:
//!
//! * detection returns a fixed crop
//! * extraction returns one image per configured field, whose bytes are the
//!   field name
//! * preprocessing echoes the field image back
//! * recognition returns the field name upper-cased
//! * aggregation echoes its `{field: text}` body
//!
//! Any stage can be overridden with [`StubTransport::on`]; every request body
//! is recorded per stage so tests can count calls.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cin_gateway::{
    GatewayConfig, PipelineCoordinator, StageDescriptor, StageFailure, StageKind, StageTransport,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Fixtures ─────────────────────────────────────────────────────────────────

/// Smallest byte string `infer` recognises as a PNG.
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

pub fn b64(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

pub fn unb64(value: &Value) -> Vec<u8> {
    STANDARD
        .decode(value.as_str().unwrap_or_default())
        .unwrap_or_default()
}

/// A config with every stage pointing at a dummy host and fast backoff.
pub fn config() -> GatewayConfig {
    config_builder().build().unwrap()
}

pub fn config_builder() -> cin_gateway::GatewayConfigBuilder {
    let mut builder = GatewayConfig::builder();
    for stage in StageKind::SEQUENCE {
        builder = builder.endpoint(stage, format!("http://stub.test/{stage}"));
    }
    builder
        .retry_backoff(Duration::from_millis(10))
        .max_backoff(Duration::from_millis(40))
        .run_deadline(Duration::from_secs(5))
        .finalize_grace(Duration::from_secs(1))
}

/// Route library logs to the test harness; `RUST_LOG=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn coordinator(transport: &Arc<StubTransport>, config: &GatewayConfig) -> PipelineCoordinator {
    PipelineCoordinator::new(config, transport.clone()).unwrap()
}

// ── Stub transport ───────────────────────────────────────────────────────────

/// What a stage does for one call.
pub enum Step {
    Reply(Result<Value, StageFailure>),
    /// Wait, then reply. The wait is cancellable like a real request.
    After(Duration, Result<Value, StageFailure>),
}

impl Step {
    pub fn ok(body: Value) -> Self {
        Step::Reply(Ok(body))
    }

    pub fn fail(failure: StageFailure) -> Self {
        Step::Reply(Err(failure))
    }
}

/// `(request body, 1-based call number for this stage) -> step`
pub type Handler = Arc<dyn Fn(&Value, usize) -> Step + Send + Sync>;

pub struct StubTransport {
    handlers: HashMap<StageKind, Handler>,
    requests: Mutex<HashMap<StageKind, Vec<Value>>>,
    abandoned: AtomicUsize,
}

impl StubTransport {
    /// Healthy stages; extraction yields `fields`.
    pub fn new(fields: &[&str]) -> Self {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        let mut handlers: HashMap<StageKind, Handler> = HashMap::new();
        handlers.insert(
            StageKind::Detection,
            Arc::new(|_: &Value, _: usize| Step::ok(json!({"cropped_image": b64("cropped card")}))),
        );
        handlers.insert(
            StageKind::Extraction,
            Arc::new(move |_: &Value, _: usize| {
                let map: serde_json::Map<String, Value> = fields
                    .iter()
                    .map(|f| (f.clone(), Value::String(b64(f))))
                    .collect();
                Step::ok(json!({ "fields": map }))
            }),
        );
        handlers.insert(
            StageKind::Preprocessing,
            Arc::new(|body: &Value, _: usize| Step::ok(json!({"preprocessed_image": body["file"].clone()}))),
        );
        handlers.insert(StageKind::Recognition, Arc::new(|body: &Value, _: usize| Step::ok(recognise(body))));
        handlers.insert(StageKind::Aggregation, Arc::new(|body: &Value, _: usize| Step::ok(body.clone())));
        Self {
            handlers,
            requests: Mutex::new(HashMap::new()),
            abandoned: AtomicUsize::new(0),
        }
    }

    /// Replace one stage's behaviour.
    pub fn on(
        mut self,
        stage: StageKind,
        handler: impl Fn(&Value, usize) -> Step + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(stage, Arc::new(handler));
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of calls (attempts included) made to `stage`.
    pub fn calls(&self, stage: StageKind) -> usize {
        self.requests
            .lock()
            .unwrap()
            .get(&stage)
            .map_or(0, Vec::len)
    }

    /// Request bodies sent to `stage`, in arrival order.
    pub fn requests(&self, stage: StageKind) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .get(&stage)
            .cloned()
            .unwrap_or_default()
    }

    /// Delayed calls whose future was dropped before replying.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Field names recognition was invoked for, sorted.
    pub fn recognised_fields(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .requests(StageKind::Recognition)
            .iter()
            .filter_map(|b| b["field_name"].as_str().map(str::to_owned))
            .collect();
        names.sort();
        names
    }
}

/// Default recognition: the field image bytes, upper-cased.
pub fn recognise(body: &Value) -> Value {
    let text = String::from_utf8_lossy(&unb64(&body["file"])).to_uppercase();
    json!({ "text": text })
}

#[async_trait]
impl StageTransport for StubTransport {
    async fn send(&self, stage: &StageDescriptor, body: &Value) -> Result<Value, StageFailure> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            let seen = requests.entry(stage.kind).or_default();
            seen.push(body.clone());
            seen.len()
        };
        let handler = self.handlers[&stage.kind].clone();
        match handler(body, call) {
            Step::Reply(reply) => reply,
            Step::After(delay, reply) => {
                let mut pending = Pending {
                    abandoned: &self.abandoned,
                    replied: false,
                };
                tokio::time::sleep(delay).await;
                pending.replied = true;
                reply
            }
        }
    }
}

/// Counts a delayed call as abandoned if dropped mid-wait.
struct Pending<'a> {
    abandoned: &'a AtomicUsize,
    replied: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.replied {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Multipart ────────────────────────────────────────────────────────────────

pub const BOUNDARY: &str = "cin-test-boundary";

/// One-part `multipart/form-data` body.
pub fn multipart_body(part: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{part}\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}
