//! Integration test: structured logging contract.
//!
//! Validates that:
//! 1. LogEmitter writes JSONL files that pass validation.
//! 2. LogSink turns real channel lifecycle events into valid entries.
//! 3. File validation reports the offending line numbers.
//!
//! Run: cargo test -p frankennet-harness --test structured_log_test

use std::path::PathBuf;
use std::sync::Arc;

use frankennet_channel::{EventSink, SelectorProvider};
use frankennet_harness::structured_log::{
    LogEmitter, LogEntry, LogLevel, LogSink, Outcome, StreamKind, validate_log_file,
    validate_log_line,
};

fn temp_log(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "frankennet-{name}-{}.jsonl",
        std::process::id()
    ))
}

#[test]
fn emitter_output_validates() {
    let path = temp_log("emitter");
    {
        let mut emitter = LogEmitter::to_file(&path, "frankennet", "run-1").unwrap();
        emitter.emit(LogLevel::Info, "scenario_start").unwrap();
        emitter
            .emit_entry(
                LogEntry::new(String::new(), LogLevel::Info, "scenario_end")
                    .with_stream(StreamKind::E2e)
                    .with_scenario("bind_ephemeral")
                    .with_outcome(Outcome::Pass)
                    .with_duration_ms(4),
            )
            .unwrap();
        emitter.flush().unwrap();
    }

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 2);
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");

    let content = std::fs::read_to_string(&path).unwrap();
    let last = content.lines().last().unwrap();
    let entry = validate_log_line(last, 2).unwrap();
    assert_eq!(entry.trace_id, "frankennet::run-1::002");
    assert_eq!(entry.outcome, Some(Outcome::Pass));
    std::fs::remove_file(&path).ok();
}

#[test]
fn channel_lifecycle_logs_validate() {
    let path = temp_log("lifecycle");
    let sink = Arc::new(LogSink::new(
        LogEmitter::to_file(&path, "frankennet", "run-2").unwrap(),
        StreamKind::Unit,
    ));
    let provider = SelectorProvider::new();
    let events: Arc<dyn EventSink> = sink.clone();
    provider.set_event_sink(Some(events));

    let ch = provider.open_server_socket_channel().unwrap();
    ch.bind(Some("127.0.0.1:0".parse().unwrap()), 0).unwrap();
    ch.close().unwrap();
    sink.flush().unwrap();

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(lines, 4, "open, bind, close, kill");

    let content = std::fs::read_to_string(&path).unwrap();
    let entries: Vec<LogEntry> = content
        .lines()
        .enumerate()
        .map(|(i, l)| validate_log_line(l, i + 1).unwrap())
        .collect();
    let names: Vec<_> = entries.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(names, ["open", "bind", "close", "kill"]);
    assert!(entries.iter().all(|e| e.channel_id == Some(ch.id())));
    assert!(entries.iter().all(|e| e.stream == Some(StreamKind::Unit)));
    let bind = &entries[1];
    assert_eq!(
        bind.local_addr.as_deref(),
        ch.local_address().map(|a| a.to_string()).as_deref()
    );
    std::fs::remove_file(&path).ok();
}

#[test]
fn file_validation_reports_line_numbers() {
    let path = temp_log("invalid");
    let good = LogEntry::new("frankennet::r::001", LogLevel::Info, "scenario_start")
        .to_jsonl()
        .unwrap();
    let bad = r#"{"timestamp":"2026-01-01T00:00:00Z","trace_id":"frankennet::r::002","level":"info","event":"kill"}"#;
    std::fs::write(&path, format!("{good}\n\n{bad}\nnot json\n")).unwrap();

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 3);
    assert!(
        errors
            .iter()
            .any(|e| e.line_number == 3 && e.field == "channel_id")
    );
    assert!(errors.iter().any(|e| e.line_number == 4 && e.field == "<json>"));
    std::fs::remove_file(&path).ok();
}
