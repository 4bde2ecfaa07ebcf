//! End-to-end pipelines over files on disk
//!
//! Trace file -> ingest -> statistics -> dashboard and structured exports,
//! and API response + rejection log -> combined document.

use std::fs;
use std::path::Path;

use gramtrace::correlate::{merge_files, NOTE_NOT_REJECTED};
use gramtrace::export::{export_for_dashboard, export_structured};
use gramtrace::ingest::TraceIngestor;
use gramtrace::stats::{decision_points, TraceStatistics};
use gramtrace::TracerError;
use serde_json::Value;

const TRACE: &str = r#"{
  "trace_version": "1.0",
  "events": [
    {"type": "token_filtering", "step": 0, "data": {
      "candidates_before": [
        {"token": 90, "logit": 3.0, "str": "{"},
        {"token": 40, "logit": 3.0, "str": "Sure"},
        {"token": 41, "logit": 1.0, "str": "Here"}
      ],
      "candidates_after": [{"token": 90, "logit": 3.0, "str": "{"}],
      "rejected_count": 2}},
    {"type": "token_accepted", "step": 0, "data": {"token": 90, "token_str": "{"}},
    {"type": "token_filtering", "step": 1, "data": {
      "candidates_before": [
        {"token": 5, "logit": 2.0, "str": "\""},
        {"token": 6, "logit": -inf, "str": "}"}
      ],
      "candidates_after": [
        {"token": 5, "logit": 2.0, "str": "\""},
        {"token": 6, "logit": -inf, "str": "}"}
      ],
      "rejected_count": 0}},
    {"type": "token_accepted", "step": 1, "data": {"token": 5, "token_str": "\""}}
  ]
}"#;

const API_RESPONSE: &str = r#"{
  "id": "chatcmpl-42",
  "model": "qwen2.5-7b",
  "created": 1700000000,
  "choices": [{
    "message": {"role": "assistant", "content": "{\"a\": 1}"},
    "logprobs": {"content": [
      {"id": 90, "token": "{", "bytes": [123], "logprob": -0.01, "top_logprobs": [{"token": "{", "logprob": -0.01}]},
      {"id": 5, "token": "\"", "bytes": [34], "logprob": -0.2, "top_logprobs": []},
      {"id": 64, "token": "a", "bytes": [97], "logprob": -1.5, "top_logprobs": []},
      {"id": 5, "token": "\"", "bytes": [34], "logprob": -0.1, "top_logprobs": []}
    ]}
  }]
}"#;

const REJECTION_LOG: &str = r#"{
  "log_version": "1.0",
  "timestamp": "2026-10-19T12:00:00Z",
  "events": [
    {"step": 2, "task_id": 11, "slot_id": 0,
     "rejected": {"id": 40, "token": "Sure"},
     "pre_masking": [{"id": 40, "logit": 3.1}],
     "post_grammar": [{"id": 40, "logit": -inf}, {"id": 64, "logit": 2.0}],
     "post_chain": [{"id": 64, "p": 1.0}],
     "resampled": {"id": 64, "token": "a"}}
  ]
}"#;

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read output")).expect("valid json")
}

#[test]
fn test_trace_to_exports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let trace_path = dir.path().join("trace.json");
    fs::write(&trace_path, TRACE).expect("write trace");

    let ingestor = TraceIngestor::new();
    let ingested = ingestor.parse_file(&trace_path).expect("parse trace");
    let trace = &ingested.trace;
    assert!(ingested.warnings.is_empty());
    assert!(ingestor.validate(trace).is_empty());
    assert_eq!(trace.generated_text(), "{\"");
    assert_eq!(trace.total_rejections(), 2);

    // Step 0 drops two thirds of the mass ("Sure" ties with "{")
    let points = decision_points(trace, 0.3);
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].step, 0);
    assert_eq!(points[0].top_rejected[0].text, "Sure");

    let stats = TraceStatistics::for_trace(trace);
    assert_eq!(stats.total_filtering_events, 2);
    assert_eq!(stats.max_rejections_in_step, 2);

    let dashboard_path = dir.path().join("dashboard.json");
    export_for_dashboard(trace, &dashboard_path, 0.3).expect("dashboard export");
    let dashboard = read_json(&dashboard_path);
    assert_eq!(dashboard["metadata"]["total_tokens"], 2);
    assert_eq!(dashboard["timeline"].as_array().map(Vec::len), Some(2));
    assert_eq!(dashboard["decision_points"][0]["step"], 0);

    let structured_path = dir.path().join("structured.json");
    export_structured(trace, &structured_path, 2).expect("structured export");
    let structured = read_json(&structured_path);
    assert_eq!(structured[0]["accepted_token"], "{");
    assert_eq!(structured[0]["accepted_probability"], 1.0);
    // The masked candidate at step 1 keeps zero probability
    assert_eq!(structured[1]["all_tokens"][1]["token"], "}");
    assert_eq!(structured[1]["all_tokens"][1]["probability"], 0.0);
}

#[test]
fn test_merge_files_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api_path = dir.path().join("response.json");
    let log_path = dir.path().join("rejection_log.json");
    let out_path = dir.path().join("combined.json");
    fs::write(&api_path, API_RESPONSE).expect("write api");
    fs::write(&log_path, REJECTION_LOG).expect("write log");

    let combined = merge_files(&api_path, &log_path, &out_path).expect("merge");
    assert_eq!(combined.summary.total_steps, 4);
    assert_eq!(combined.summary.rejected_steps, 1);
    assert!((combined.summary.rejection_rate - 0.25).abs() < 1e-12);
    assert_eq!(combined.summary.final_output, "{\"a\": 1}");

    let written = read_json(&out_path);
    assert_eq!(written["metadata"]["request_id"], "chatcmpl-42");
    assert_eq!(written["metadata"]["rejection_log_version"], "1.0");
    assert_eq!(written["steps"][2]["rejection_sampling"]["was_rejected"], true);
    assert_eq!(written["steps"][2]["rejection_sampling"]["resampled"]["token"], "a");
    assert!(written["steps"][2]["rejection_sampling"]["post_grammar"][0]["logit"].is_null());
    assert_eq!(written["steps"][0]["rejection_sampling"]["note"], NOTE_NOT_REJECTED);
    assert_eq!(written["steps"][0]["api_top_logprobs"][0]["token"], "{");
}

#[test]
fn test_merge_files_rejects_garbage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api_path = dir.path().join("response.json");
    let log_path = dir.path().join("rejection_log.json");
    fs::write(&api_path, "not json").expect("write api");
    fs::write(&log_path, REJECTION_LOG).expect("write log");

    let err = merge_files(&api_path, &log_path, dir.path().join("out.json")).unwrap_err();
    assert!(matches!(err, TracerError::MalformedDocument { .. }));
    assert!(!dir.path().join("out.json").exists());
}
