//! Coordinator behaviour against scripted stage stubs.
//!
//! No sockets: every stage is answered by `common::StubTransport`, which also
//! counts calls so tests can assert which stages were (not) reached.

mod common;

use cin_gateway::{
    Document, FailureKind, FieldWarning, RunObserver, RunState, RunStats, StageFailure, StageKind,
};
use common::{config, config_builder, coordinator, Step, StubTransport, PNG};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn document() -> Document {
    Document::from_bytes(PNG.to_vec()).unwrap()
}

fn downstream_of_detection() -> [StageKind; 4] {
    [
        StageKind::Extraction,
        StageKind::Preprocessing,
        StageKind::Recognition,
        StageKind::Aggregation,
    ]
}

/// Aggregation that refuses an empty mapping, as a strict service would.
fn reject_empty(body: &Value, _: usize) -> Step {
    if body.as_object().map_or(true, |m| m.is_empty()) {
        Step::fail(StageFailure::remote(
            StageKind::Aggregation,
            "HTTP 422: no fields to aggregate",
        ))
    } else {
        Step::ok(body.clone())
    }
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_single_field_document_succeeds_without_warnings() {
    let stub = StubTransport::new(&["cin_number"]).into_arc();
    let output = coordinator(&stub, &config()).process(document()).await.unwrap();

    assert_eq!(output.aggregated["cin_number"], "CIN_NUMBER");
    assert!(output.warnings.is_empty());
    assert_eq!(output.stats.fields_total, 1);
    assert_eq!(output.stats.fields_recognized, 1);
    assert_eq!(output.stats.fields_failed, 0);
    for stage in StageKind::SEQUENCE {
        assert_eq!(stub.calls(stage), 1, "{stage}");
    }
}

#[tokio::test]
async fn test_requests_carry_expected_wire_shapes() {
    let stub = StubTransport::new(&["last_name"]).into_arc();
    coordinator(&stub, &config()).process(document()).await.unwrap();

    let detection = &stub.requests(StageKind::Detection)[0];
    assert_eq!(common::unb64(&detection["file"]), PNG);

    let extraction = &stub.requests(StageKind::Extraction)[0];
    assert_eq!(common::unb64(&extraction["file"]), b"cropped card");

    let preprocessing = &stub.requests(StageKind::Preprocessing)[0];
    assert_eq!(preprocessing["field_name"], "last_name");
    assert_eq!(common::unb64(&preprocessing["file"]), b"last_name");

    let aggregation = &stub.requests(StageKind::Aggregation)[0];
    assert_eq!(aggregation, &json!({"last_name": "LAST_NAME"}));
}

// ── Single-point failures ────────────────────────────────────────────────────

#[tokio::test]
async fn test_detection_failure_of_any_kind_stops_the_run() {
    let failures = [
        StageFailure::remote(StageKind::Detection, "HTTP 500: model crashed"),
        StageFailure::unreachable(StageKind::Detection, "connection refused"),
        StageFailure::protocol(StageKind::Detection, "response is not JSON"),
    ];
    for failure in failures {
        let expected = failure.kind;
        let stub = StubTransport::new(&["a", "b"])
            .on(StageKind::Detection, move |_, _| Step::fail(failure.clone()))
            .into_arc();
        let err = coordinator(&stub, &config()).process(document()).await.unwrap_err();

        assert_eq!(err.stage, StageKind::Detection);
        assert_eq!(err.kind, expected);
        for stage in downstream_of_detection() {
            assert_eq!(stub.calls(stage), 0, "{stage} must not be called after {expected}");
        }
    }
}

#[tokio::test]
async fn test_detection_without_cropped_image_is_protocol_error() {
    let stub = StubTransport::new(&["a"])
        .on(StageKind::Detection, |_, _| Step::ok(json!({"cropped_image": ""})))
        .into_arc();
    let err = coordinator(&stub, &config()).process(document()).await.unwrap_err();
    assert_eq!(err.stage, StageKind::Detection);
    assert_eq!(err.kind, FailureKind::ProtocolError);
    assert_eq!(stub.calls(StageKind::Detection), 1, "protocol errors are not retried");
    assert_eq!(stub.calls(StageKind::Extraction), 0);
}

#[tokio::test]
async fn test_empty_extraction_is_fatal() {
    let stub = StubTransport::new(&[]).into_arc();
    let err = coordinator(&stub, &config()).process(document()).await.unwrap_err();
    assert_eq!(err.stage, StageKind::Extraction);
    assert_eq!(err.kind, FailureKind::ProtocolError);
    assert_eq!(stub.calls(StageKind::Preprocessing), 0);
    assert_eq!(stub.calls(StageKind::Aggregation), 0);
}

#[tokio::test]
async fn test_blank_extracted_field_name_fails_at_extraction() {
    let stub = StubTransport::new(&["cin"])
        .on(StageKind::Extraction, |_, _| {
            Step::ok(json!({"fields": {"": common::b64("a"), "cin": common::b64("cin")}}))
        })
        .into_arc();
    let err = coordinator(&stub, &config()).process(document()).await.unwrap_err();
    assert_eq!(err.stage, StageKind::Extraction);
    assert_eq!(err.kind, FailureKind::ProtocolError);
    assert_eq!(stub.calls(StageKind::Preprocessing), 0);
    assert_eq!(stub.calls(StageKind::Recognition), 0);
    assert_eq!(stub.calls(StageKind::Aggregation), 0);
}

// ── Per-field isolation ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_one_preprocessing_failure_drops_only_that_field() {
    let stub = StubTransport::new(&["address", "birth_date", "first_name"])
        .on(StageKind::Preprocessing, |body, _| {
            if body["field_name"] == "address" {
                Step::fail(StageFailure::remote(StageKind::Preprocessing, "HTTP 500: blurry"))
            } else {
                Step::ok(json!({"preprocessed_image": body["file"].clone()}))
            }
        })
        .into_arc();
    let output = coordinator(&stub, &config()).process(document()).await.unwrap();

    assert_eq!(stub.recognised_fields(), ["birth_date", "first_name"]);
    assert_eq!(output.aggregated.len(), 2);
    assert!(!output.aggregated.contains_key("address"));
    assert_eq!(output.warnings.len(), 1);
    let warning = &output.warnings[0];
    assert_eq!(warning.field, "address");
    assert_eq!(warning.stage, StageKind::Preprocessing);
    assert_eq!(warning.kind, FailureKind::RemoteError);
    assert_eq!(output.stats.fields_failed, 1);
    assert_eq!(output.stats.fields_recognized, 2);
}

#[tokio::test]
async fn test_every_extracted_field_ends_as_text_or_warning() {
    let fields = ["a", "b", "c", "d", "e"];
    let stub = StubTransport::new(&fields)
        .on(StageKind::Preprocessing, |body, _| {
            if body["field_name"] == "b" {
                Step::ok(json!({"preprocessed_image": 42}))
            } else {
                Step::ok(json!({"preprocessed_image": body["file"].clone()}))
            }
        })
        .on(StageKind::Recognition, |body, _| {
            if body["field_name"] == "d" {
                Step::fail(StageFailure::unreachable(StageKind::Recognition, "reset"))
            } else {
                Step::ok(common::recognise(body))
            }
        })
        .into_arc();
    let output = coordinator(&stub, &config()).process(document()).await.unwrap();

    let mut seen: Vec<String> = output.aggregated.keys().cloned().collect();
    seen.extend(output.warnings.iter().map(|w| w.field.clone()));
    seen.sort();
    assert_eq!(seen, fields);

    let warned: Vec<(&str, StageKind, FailureKind)> = output
        .warnings
        .iter()
        .map(|w| (w.field.as_str(), w.stage, w.kind))
        .collect();
    assert_eq!(
        warned,
        [
            ("b", StageKind::Preprocessing, FailureKind::ProtocolError),
            ("d", StageKind::Recognition, FailureKind::Unreachable),
        ]
    );
    // d was retried: 1 + 2 retries, plus one call each for a, c, e
    assert_eq!(stub.calls(StageKind::Recognition), 3 + 3);
}

#[tokio::test]
async fn test_all_recognition_failures_still_reach_aggregation() {
    let stub = StubTransport::new(&["a", "b"])
        .on(StageKind::Recognition, |_, _| {
            Step::fail(StageFailure::remote(StageKind::Recognition, "HTTP 503"))
        })
        .into_arc();
    let output = coordinator(&stub, &config()).process(document()).await.unwrap();

    assert_eq!(stub.calls(StageKind::Aggregation), 1);
    assert_eq!(stub.requests(StageKind::Aggregation)[0], json!({}));
    assert!(output.aggregated.is_empty());
    assert_eq!(output.warnings.len(), 2);
    assert_eq!(output.into_body()["warnings"][1]["field"], "b");
}

#[tokio::test]
async fn test_aggregation_rejecting_empty_mapping_fails_the_run() {
    let stub = StubTransport::new(&["a", "b"])
        .on(StageKind::Recognition, |_, _| {
            Step::fail(StageFailure::remote(StageKind::Recognition, "HTTP 503"))
        })
        .on(StageKind::Aggregation, reject_empty)
        .into_arc();
    let err = coordinator(&stub, &config()).process(document()).await.unwrap_err();
    assert_eq!(err.stage, StageKind::Aggregation);
    assert_eq!(err.kind, FailureKind::RemoteError);
}

#[tokio::test]
async fn test_aggregation_must_return_an_object() {
    let stub = StubTransport::new(&["a"])
        .on(StageKind::Aggregation, |_, _| Step::ok(json!(["not", "an", "object"])))
        .into_arc();
    let err = coordinator(&stub, &config()).process(document()).await.unwrap_err();
    assert_eq!(err.stage, StageKind::Aggregation);
    assert_eq!(err.kind, FailureKind::ProtocolError);
}

// ── Retry ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unreachable_twice_then_success_is_retried_to_success() {
    let stub = StubTransport::new(&["a"])
        .on(StageKind::Detection, |_, call| {
            if call <= 2 {
                Step::fail(StageFailure::unreachable(StageKind::Detection, "connection refused"))
            } else {
                Step::ok(json!({"cropped_image": common::b64("crop")}))
            }
        })
        .into_arc();
    let config = config_builder().max_retries(2).build().unwrap();
    let output = coordinator(&stub, &config).process(document()).await.unwrap();

    assert_eq!(stub.calls(StageKind::Detection), 3);
    assert_eq!(output.aggregated["a"], "A");
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_on_every_attempt_fails_as_unreachable() {
    let stub = StubTransport::new(&["a"])
        .on(StageKind::Extraction, |_, _| {
            Step::fail(StageFailure::unreachable(StageKind::Extraction, "connection reset"))
        })
        .into_arc();
    let config = config_builder().max_retries(2).build().unwrap();
    let err = coordinator(&stub, &config).process(document()).await.unwrap_err();

    assert_eq!(err.stage, StageKind::Extraction);
    assert_eq!(err.kind, FailureKind::Unreachable);
    assert_eq!(stub.calls(StageKind::Extraction), 3);
    assert_eq!(stub.calls(StageKind::Preprocessing), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_errors_are_not_retried() {
    let stub = StubTransport::new(&["a"])
        .on(StageKind::Extraction, |_, _| {
            Step::fail(StageFailure::remote(StageKind::Extraction, "HTTP 500"))
        })
        .into_arc();
    let err = coordinator(&stub, &config()).process(document()).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::RemoteError);
    assert_eq!(stub.calls(StageKind::Extraction), 1);
}

// ── Deadline and cancellation ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_deadline_mid_recognition_times_out_pending_fields() {
    let stub = StubTransport::new(&["done", "stuck_1", "stuck_2"])
        .on(StageKind::Recognition, |body, _| {
            if body["field_name"] == "done" {
                Step::ok(common::recognise(body))
            } else {
                Step::After(Duration::from_secs(600), Ok(common::recognise(body)))
            }
        })
        .into_arc();
    let config = config_builder().run_deadline(Duration::from_secs(2)).build().unwrap();
    let output = coordinator(&stub, &config).process(document()).await.unwrap();

    assert_eq!(output.aggregated.len(), 1);
    assert_eq!(output.aggregated["done"], "DONE");
    assert_eq!(output.warnings.len(), 2);
    for (warning, field) in output.warnings.iter().zip(["stuck_1", "stuck_2"]) {
        assert_eq!(warning.field, field);
        assert_eq!(warning.stage, StageKind::Recognition);
        assert_eq!(warning.kind, FailureKind::Timeout);
    }
    assert_eq!(stub.calls(StageKind::Aggregation), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_with_no_survivors_and_strict_aggregation_fails() {
    let stub = StubTransport::new(&["x", "y"])
        .on(StageKind::Recognition, |body, _| {
            Step::After(Duration::from_secs(600), Ok(common::recognise(body)))
        })
        .on(StageKind::Aggregation, reject_empty)
        .into_arc();
    let config = config_builder().run_deadline(Duration::from_secs(2)).build().unwrap();
    let err = coordinator(&stub, &config).process(document()).await.unwrap_err();
    assert_eq!(err.stage, StageKind::Aggregation);
}

#[tokio::test(start_paused = true)]
async fn test_slow_single_stage_times_out_the_run() {
    let stub = StubTransport::new(&["a"])
        .on(StageKind::Detection, |_, _| {
            Step::After(
                Duration::from_secs(600),
                Ok(json!({"cropped_image": common::b64("late")})),
            )
        })
        .into_arc();
    let config = config_builder()
        .run_deadline(Duration::from_secs(3))
        .stage_timeout(StageKind::Detection, Duration::from_secs(60))
        .build()
        .unwrap();
    let err = coordinator(&stub, &config).process(document()).await.unwrap_err();
    assert_eq!(err.stage, StageKind::Detection);
    assert_eq!(err.kind, FailureKind::Timeout);
    assert_eq!(stub.calls(StageKind::Detection), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_reaches_in_flight_fields() {
    let stub = StubTransport::new(&["a", "b"])
        .on(StageKind::Recognition, |body, _| {
            Step::After(Duration::from_secs(30), Ok(common::recognise(body)))
        })
        .into_arc();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
    }
    let err = coordinator(&stub, &config())
        .process_with_cancel(document(), cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind, FailureKind::Cancelled);
    assert_eq!(err.stage, StageKind::Recognition);
    assert_eq!(stub.calls(StageKind::Aggregation), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_the_run_abandons_in_flight_calls() {
    let stub = StubTransport::new(&["a"])
        .on(StageKind::Detection, |_, _| {
            Step::After(
                Duration::from_secs(60),
                Ok(json!({"cropped_image": common::b64("late")})),
            )
        })
        .into_arc();
    let coordinator = coordinator(&stub, &config());

    let outcome = tokio::time::timeout(Duration::from_secs(1), coordinator.process(document())).await;
    assert!(outcome.is_err(), "run should still be waiting on detection");
    assert_eq!(stub.calls(StageKind::Detection), 1);
    assert_eq!(stub.abandoned(), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    for stage in downstream_of_detection() {
        assert_eq!(stub.calls(stage), 0, "{stage} called after the run was dropped");
    }
}

// ── Isolation between runs ───────────────────────────────────────────────────

#[tokio::test]
async fn test_identical_input_gives_identical_output() {
    let stub = StubTransport::new(&["cin", "name", "birth_place"]).into_arc();
    let coordinator = coordinator(&stub, &config());

    let first = coordinator.process(document()).await.unwrap();
    let second = coordinator.process(document()).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.aggregated, second.aggregated);
    assert_eq!(first.warnings, second.warnings);
    assert_eq!(first.into_body(), second.into_body());
}

#[tokio::test]
async fn test_concurrent_runs_do_not_share_state() {
    let stub = StubTransport::new(&["a", "b"]).into_arc();
    let coordinator = Arc::new(coordinator(&stub, &config()));

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.process(document()).await })
        })
        .collect();
    for run in runs {
        let output = run.await.unwrap().unwrap();
        assert_eq!(output.aggregated.len(), 2);
        assert!(output.warnings.is_empty());
    }
    assert_eq!(stub.calls(StageKind::Aggregation), 4);
}

// ── Observer ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<RunState>>,
    failed_fields: Mutex<Vec<String>>,
    finished: Mutex<Vec<Result<RunStats, StageFailure>>>,
}

impl RunObserver for Recorder {
    fn on_state_change(&self, _run_id: Uuid, _from: RunState, to: RunState) {
        self.states.lock().unwrap().push(to);
    }

    fn on_field_failed(&self, _run_id: Uuid, warning: &FieldWarning) {
        self.failed_fields.lock().unwrap().push(warning.field.clone());
    }

    fn on_run_finished(&self, _run_id: Uuid, outcome: Result<&RunStats, &StageFailure>) {
        self.finished
            .lock()
            .unwrap()
            .push(outcome.map(|stats| stats.clone()).map_err(|failure| failure.clone()));
    }
}

#[tokio::test]
async fn test_observer_sees_field_failures_and_outcome() {
    let stub = StubTransport::new(&["a", "b"])
        .on(StageKind::Recognition, |body, _| {
            if body["field_name"] == "b" {
                Step::fail(StageFailure::protocol(StageKind::Recognition, "missing text"))
            } else {
                Step::ok(common::recognise(body))
            }
        })
        .into_arc();
    let recorder = Arc::new(Recorder::default());
    let coordinator = coordinator(&stub, &config()).with_observer(recorder.clone());
    coordinator.process(document()).await.unwrap();

    assert_eq!(*recorder.failed_fields.lock().unwrap(), ["b"]);
    assert_eq!(recorder.states.lock().unwrap().last(), Some(&RunState::Done));
    let finished = recorder.finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    let stats = finished[0].as_ref().unwrap();
    assert_eq!(stats.fields_total, 2);
    assert_eq!(stats.fields_failed, 1);
}

#[tokio::test]
async fn test_observer_sees_failed_state() {
    let stub = StubTransport::new(&[]).into_arc();
    let recorder = Arc::new(Recorder::default());
    let coordinator = coordinator(&stub, &config()).with_observer(recorder.clone());
    coordinator.process(document()).await.unwrap_err();

    assert_eq!(
        *recorder.states.lock().unwrap(),
        [RunState::Detecting, RunState::Extracting, RunState::Failed]
    );
    let finished = recorder.finished.lock().unwrap();
    assert_eq!(finished[0].as_ref().unwrap_err().stage, StageKind::Extraction);
}
