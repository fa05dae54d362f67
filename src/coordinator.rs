//! The five-stage run driver.
//!
//! [`PipelineCoordinator`] owns everything that is shared between runs (the
//! stage table, the stage client and its connection pool, the fan-out
//! policy, the observer) and nothing that belongs to one run. Each call to
//! [`PipelineCoordinator::process`] creates a fresh [`PipelineRun`] and walks
//! it through
//!
//! ```text
//! Idle → Detecting → Extracting → Preprocessing → Recognizing → Aggregating → Done
//!   └──────────┴────────────┴──────────────┴──────────────┴─────────────┴──→ Failed
//! ```
//!
//! Detection, extraction and aggregation are single points of failure: any
//! failure there ends the run. Preprocessing and recognition fan out per
//! field; a failed field becomes a [`FieldWarning`] and is left out of every
//! later stage, but the run carries on, even with no fields left.

use crate::config::GatewayConfig;
use crate::error::{FieldWarning, GatewayError, StageFailure};
use crate::observer::{NoopObserver, SharedObserver};
use crate::pipeline::aggregate::{to_aggregation_request, with_warnings};
use crate::pipeline::client::{Backoff, HttpTransport, StageClient, StageTransport};
use crate::pipeline::fanout::FanOutExecutor;
use crate::pipeline::input::Document;
use crate::pipeline::run::{PipelineRun, RunState};
use crate::stage::{FieldMap, StageKind, StageOutput, StageRequest, StageResult, StageTable};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Counters and timings for one successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Fields produced by extraction.
    pub fields_total: usize,
    /// Fields that reached aggregation with recognised text.
    pub fields_recognized: usize,
    /// Fields dropped at preprocessing or recognition.
    pub fields_failed: usize,
    pub duration_ms: u64,
    pub stage_durations_ms: BTreeMap<StageKind, u64>,
}

/// The result of a run that reached `Done`.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: Uuid,
    /// The aggregation service's document, as returned.
    pub aggregated: Map<String, Value>,
    /// Per-field failures, sorted by field name.
    pub warnings: Vec<FieldWarning>,
    pub stats: RunStats,
}

impl RunOutput {
    /// The gateway's success body: the aggregated document plus `warnings`.
    pub fn into_body(self) -> Value {
        with_warnings(self.aggregated, &self.warnings)
    }
}

/// Drives documents through the configured stages.
///
/// Cheap to share behind an `Arc`; holds no per-run state.
pub struct PipelineCoordinator {
    stages: Arc<StageTable>,
    client: StageClient,
    fan_out: FanOutExecutor,
    run_deadline: Duration,
    finalize_grace: Duration,
    observer: SharedObserver,
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("stages", &self.stages)
            .field("fan_out", &self.fan_out)
            .field("run_deadline", &self.run_deadline)
            .field("finalize_grace", &self.finalize_grace)
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    /// Build a coordinator that reaches the stages through `transport`.
    pub fn new(
        config: &GatewayConfig,
        transport: Arc<dyn StageTransport>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let stages = StageTable::from_config(config)?;
        Ok(Self {
            stages: Arc::new(stages),
            client: StageClient::new(
                transport,
                Backoff::new(config.retry_backoff(), config.max_backoff()),
            ),
            fan_out: FanOutExecutor::new(config.concurrency),
            run_deadline: config.run_deadline(),
            finalize_grace: config.finalize_grace(),
            observer: Arc::new(NoopObserver),
        })
    }

    /// Build a coordinator over HTTP with one shared connection pool.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config.user_agent)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Run `document` through all five stages.
    pub async fn process(&self, document: Document) -> Result<RunOutput, StageFailure> {
        self.process_with_cancel(document, CancellationToken::new()).await
    }

    /// Like [`process`](Self::process), stopping early once `cancel` fires.
    ///
    /// Dropping the returned future also cancels every in-flight stage call.
    pub async fn process_with_cancel(
        &self,
        document: Document,
        cancel: CancellationToken,
    ) -> Result<RunOutput, StageFailure> {
        let cancel = cancel.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let mut run = PipelineRun::new(self.run_deadline, self.finalize_grace, cancel);
        let run_id = run.id;
        let span = info_span!("run", %run_id);

        let outcome = self.drive(&mut run, document).instrument(span).await;

        match outcome {
            Ok(output) => {
                info!(
                    %run_id,
                    "Run done in {}ms: {}/{} fields recognised, {} warnings",
                    output.stats.duration_ms,
                    output.stats.fields_recognized,
                    output.stats.fields_total,
                    output.warnings.len()
                );
                self.observer.on_run_finished(run_id, Ok(&output.stats));
                Ok(output)
            }
            Err(failure) => {
                let current = run.state();
                if let Ok(from) = run.transition(RunState::Failed, failure.stage) {
                    self.observer.on_state_change(run_id, from, RunState::Failed);
                }
                error!(%run_id, "Run failed in {current} after {}ms: {failure}", run.elapsed().as_millis());
                self.observer.on_run_finished(run_id, Err(&failure));
                Err(failure)
            }
        }
    }

    async fn drive(&self, run: &mut PipelineRun, document: Document) -> StageResult<RunOutput> {
        info!("Starting run: {} bytes ({})", document.len(), document.mime_type());
        let mut timings = BTreeMap::new();

        // ── Step 1: Detection ───────────────────────────────────────────────
        self.enter(run, StageKind::Detection)?;
        let started = Instant::now();
        let cropped = self
            .call_single(run, StageKind::Detection, StageRequest::document(document.into_bytes()))
            .await?
            .into_image(StageKind::Detection)?;
        timings.insert(StageKind::Detection, elapsed_ms(started));
        debug!("Detection returned a {} byte crop", cropped.len());

        // ── Step 2: Extraction ──────────────────────────────────────────────
        self.enter(run, StageKind::Extraction)?;
        let started = Instant::now();
        let fields = self
            .call_single(run, StageKind::Extraction, StageRequest::document(cropped))
            .await?
            .into_fields(StageKind::Extraction)?;
        timings.insert(StageKind::Extraction, elapsed_ms(started));
        let fields_total = fields.len();
        info!("Extracted {fields_total} fields");

        // ── Step 3: Preprocessing (per field) ───────────────────────────────
        self.enter(run, StageKind::Preprocessing)?;
        let started = Instant::now();
        let preprocessed = self.fan_out_stage(run, StageKind::Preprocessing, fields).await?;
        let preprocessed: FieldMap<Vec<u8>> = self.keep_successes(run, preprocessed, |out| {
            out.into_image(StageKind::Preprocessing)
        });
        timings.insert(StageKind::Preprocessing, elapsed_ms(started));

        // ── Step 4: Recognition (per surviving field) ───────────────────────
        self.enter(run, StageKind::Recognition)?;
        let started = Instant::now();
        let recognised = self.fan_out_stage(run, StageKind::Recognition, preprocessed).await?;
        let texts: FieldMap<String> = self.keep_successes(run, recognised, |out| {
            out.into_text(StageKind::Recognition)
        });
        timings.insert(StageKind::Recognition, elapsed_ms(started));

        // ── Step 5: Aggregation ─────────────────────────────────────────────
        self.enter(run, StageKind::Aggregation)?;
        let started = Instant::now();
        let request = to_aggregation_request(&texts)?;
        let stage = self.stages.get(StageKind::Aggregation);
        let aggregated = self
            .client
            .call(stage, request, &run.finalize_budget())
            .await?
            .into_aggregated(StageKind::Aggregation)?;
        timings.insert(StageKind::Aggregation, elapsed_ms(started));

        let from = run.transition(RunState::Done, StageKind::Aggregation)?;
        self.observer.on_state_change(run.id, from, RunState::Done);

        let warnings = run.take_warnings();
        let stats = RunStats {
            fields_total,
            fields_recognized: texts.len(),
            fields_failed: warnings.len(),
            duration_ms: run.elapsed().as_millis() as u64,
            stage_durations_ms: timings,
        };
        Ok(RunOutput {
            run_id: run.id,
            aggregated,
            warnings,
            stats,
        })
    }

    /// Move the run into the state for `stage` and tell the observer.
    fn enter(&self, run: &mut PipelineRun, stage: StageKind) -> StageResult<()> {
        let to = RunState::for_stage(stage);
        let from = run.transition(to, stage)?;
        debug!("{from} → {to}");
        self.observer.on_state_change(run.id, from, to);
        Ok(())
    }

    async fn call_single(
        &self,
        run: &PipelineRun,
        kind: StageKind,
        request: StageRequest,
    ) -> StageResult {
        self.client.call(self.stages.get(kind), request, &run.budget()).await
    }

    /// Call a per-field stage once for every entry of `inputs`.
    ///
    /// Per-field failures stay in the returned map; only cancellation of the
    /// whole run is returned as an error.
    async fn fan_out_stage(
        &self,
        run: &PipelineRun,
        kind: StageKind,
        inputs: FieldMap<Vec<u8>>,
    ) -> StageResult<FieldMap<StageResult>> {
        let stage = self.stages.get(kind);
        let client = &self.client;
        let budget = run.budget();
        let results = self
            .fan_out
            .run(kind, inputs, &budget, |name, payload, budget| async move {
                client
                    .call(stage, StageRequest::for_field(payload, name), &budget)
                    .await
            })
            .await;

        if run.cancel_token().is_cancelled() {
            return Err(StageFailure::cancelled(kind, "run cancelled"));
        }
        Ok(results)
    }

    /// Split fan-out results into successes and warnings.
    fn keep_successes<T>(
        &self,
        run: &mut PipelineRun,
        results: FieldMap<StageResult>,
        unwrap_output: impl Fn(StageOutput) -> StageResult<T>,
    ) -> FieldMap<T> {
        let mut kept = FieldMap::new();
        for (field, result) in results {
            match result.and_then(&unwrap_output) {
                Ok(value) => {
                    kept.insert(field, value);
                }
                Err(failure) => {
                    warn!("Dropping field '{field}': {failure}");
                    let warning = FieldWarning::from_failure(field, failure);
                    self.observer.on_field_failed(run.id, &warning);
                    run.record_warning(warning);
                }
            }
        }
        kept
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
