//! # cin-gateway
//!
//! An HTTP gateway that reads national identity cards by chaining five
//! remote services: card detection, field extraction, per-field
//! preprocessing, per-field text recognition and aggregation.
//!
//! ## Why a coordinator?
//!
//! Each stage is an independent service with its own failure modes. Calling
//! them in a straight line turns every hiccup into a generic 500 and
//! serialises per-field work that has no reason to wait. This crate drives
//! the stages as a small state machine instead: single-point stages fail the
//! run with a structured `{stage, kind, message}`; per-field stages run
//! concurrently and lose only the fields that fail; transport failures are
//! retried with backoff inside one shared run deadline.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Detection      crop the card out of the photo
//!  ├─ 2. Extraction     cut the crop into named field images
//!  ├─ 3. Preprocessing  clean each field image        (concurrent, per field)
//!  ├─ 4. Recognition    read each field's text         (concurrent, per field)
//!  ├─ 5. Aggregation    assemble the final document
//!  └─ 6. Output         aggregated JSON + per-field warnings
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cin_gateway::{Document, GatewayConfig, PipelineCoordinator, StageKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut builder = GatewayConfig::builder();
//!     for stage in StageKind::SEQUENCE {
//!         builder = builder.endpoint(stage, format!("http://localhost:9000/{stage}"));
//!     }
//!     let config = builder.build()?;
//!
//!     let coordinator = PipelineCoordinator::from_config(&config)?;
//!     let document = Document::from_bytes(std::fs::read("card.jpg")?)?;
//!     let output = coordinator.process(document).await?;
//!     println!("{}", output.into_body());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `cin-gateway` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding the gateway as a library:
//! ```toml
//! cin-gateway = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod observer;
pub mod pipeline;
pub mod stage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use api::{build_router, ApiError, AppState};
pub use config::{GatewayConfig, GatewayConfigBuilder, StageEndpoint};
pub use coordinator::{PipelineCoordinator, RunOutput, RunStats};
pub use error::{FailureKind, FieldWarning, GatewayError, StageFailure};
pub use observer::{NoopObserver, RunObserver};
pub use pipeline::client::{Backoff, HttpTransport, StageClient, StageTransport};
pub use pipeline::fanout::FanOutExecutor;
pub use pipeline::input::Document;
pub use pipeline::run::{PipelineRun, RunBudget, RunState};
pub use stage::{
    Cardinality, FieldMap, StageDescriptor, StageKind, StageOutput, StageRequest, StageResult,
    StageTable,
};
