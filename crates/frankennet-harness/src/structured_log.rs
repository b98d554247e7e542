//! Structured logging contract for frankennet test/e2e/perf workflows.
//!
//! Provides:
//! - [`LogEntry`]: canonical JSONL log record with required + optional fields.
//! - [`LogEmitter`]: writes JSONL lines to a file, stderr or a buffer.
//! - [`LogSink`]: an [`EventSink`] that turns channel events into log entries.
//! - [`validate_log_line`]: validates a single JSONL line against the schema.
//! - [`validate_log_file`]: validates an entire JSONL file.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use frankennet_channel::{ChannelEvent, EventKind, EventLevel, EventSink};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<EventLevel> for LogLevel {
    fn from(level: EventLevel) -> Self {
        match level {
            EventLevel::Info => Self::Info,
            EventLevel::Warn => Self::Warn,
        }
    }
}

/// Test/verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
    Timeout,
}

/// Workflow the entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Unit,
    E2e,
    Perf,
}

/// Event names channels emit; entries carrying one must name the channel.
const CHANNEL_EVENTS: [&str; 9] = [
    "open",
    "bind",
    "listen_denied",
    "accept",
    "accept_denied",
    "close",
    "kill",
    "pollnval_without_preclose",
    "interrupt",
];

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamKind>,
    /// End-to-end scenario name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    /// Wall-clock duration of a scenario step (milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            stream: None,
            scenario: None,
            channel_id: None,
            fd: None,
            local_addr: None,
            remote_addr: None,
            outcome: None,
            errno: None,
            duration_ms: None,
            details: None,
        }
    }

    /// Entry for a channel lifecycle event. The trace id is left empty for
    /// the emitter to assign.
    #[must_use]
    pub fn from_channel_event(event: &ChannelEvent) -> Self {
        let mut entry = Self::new(String::new(), event.level.into(), event.event.as_str());
        entry.channel_id = Some(event.channel);
        entry.fd = event.fd;
        entry.local_addr = event.local.clone();
        entry.remote_addr = event.remote.clone();
        entry.errno = event.errno;
        if let Some(detail) = &event.detail {
            entry.details = Some(serde_json::json!({ "detail": detail }));
        }
        entry
    }

    #[must_use]
    pub fn with_stream(mut self, stream: StreamKind) -> Self {
        self.stream = Some(stream);
        self
    }

    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel_id: u64) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    /// Set free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Box<dyn Write + Send>,
    seq: u64,
    component: String,
    run_id: String,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, component: &str, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::with_writer(
            Box::new(std::io::BufWriter::new(file)),
            component,
            run_id,
        ))
    }

    /// Create an emitter that writes to stderr.
    #[must_use]
    pub fn to_stderr(component: &str, run_id: &str) -> Self {
        Self::with_writer(Box::new(std::io::stderr()), component, run_id)
    }

    /// Create an emitter that discards into a buffer (for testing).
    #[must_use]
    pub fn to_buffer(component: &str, run_id: &str) -> Self {
        Self::with_writer(Box::new(Vec::new()), component, run_id)
    }

    fn with_writer(writer: Box<dyn Write + Send>, component: &str, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            component: component.to_string(),
            run_id: run_id.to_string(),
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{}::{:03}", self.component, self.run_id, self.seq)
    }

    /// Emit a log entry with an auto-generated trace_id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event);
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(entry)
    }

    /// Emit a fully-populated log entry, assigning a trace_id if it has none.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Channel event sink
// ---------------------------------------------------------------------------

/// Writes channel events through a [`LogEmitter`].
///
/// Write failures are dropped: a channel never fails because its log did.
pub struct LogSink {
    emitter: Mutex<LogEmitter>,
    stream: StreamKind,
    scenario: Mutex<Option<String>>,
}

impl LogSink {
    #[must_use]
    pub fn new(emitter: LogEmitter, stream: StreamKind) -> Self {
        Self {
            emitter: Mutex::new(emitter),
            stream,
            scenario: Mutex::new(None),
        }
    }

    /// Tag subsequent entries with a scenario name.
    pub fn set_scenario(&self, scenario: Option<&str>) {
        if let Ok(mut current) = self.scenario.lock() {
            *current = scenario.map(str::to_string);
        }
    }

    /// Write an entry that did not come from a channel.
    pub fn record(&self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.scenario.is_none() {
            entry.scenario = self.current_scenario();
        }
        match self.emitter.lock() {
            Ok(mut emitter) => emitter.emit_entry(entry),
            Err(_) => Err(std::io::Error::other("log emitter poisoned")),
        }
    }

    pub fn flush(&self) -> std::io::Result<()> {
        match self.emitter.lock() {
            Ok(mut emitter) => emitter.flush(),
            Err(_) => Err(std::io::Error::other("log emitter poisoned")),
        }
    }

    fn current_scenario(&self) -> Option<String> {
        self.scenario.lock().ok().and_then(|s| s.clone())
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: &ChannelEvent) {
        let entry = LogEntry::from_channel_event(event).with_stream(self.stream);
        let _ = self.record(entry);
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

fn check_enum(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &str,
    allowed: &[&str],
    line_number: usize,
    errors: &mut Vec<LogValidationError>,
) {
    let Some(value) = obj.get(field).and_then(|v| v.as_str()) else {
        return;
    };
    if !allowed.contains(&value) {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message: format!("invalid {field}: '{value}'"),
        });
    }
}

/// Validate a single JSONL line against the schema.
///
/// Returns the parsed entry if valid, or every violation found.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            errors.push(LogValidationError {
                line_number,
                field: "<json>".to_string(),
                message: format!("invalid JSON: {e}"),
            });
            return Err(errors);
        }
    };

    let Some(obj) = value.as_object() else {
        errors.push(LogValidationError {
            line_number,
            field: "<root>".to_string(),
            message: "expected JSON object".to_string(),
        });
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(LogValidationError {
                line_number,
                field: field.to_string(),
                message: "required field missing".to_string(),
            });
        }
    }

    check_enum(
        obj,
        "level",
        &["trace", "debug", "info", "warn", "error"],
        line_number,
        &mut errors,
    );
    check_enum(
        obj,
        "outcome",
        &["pass", "fail", "skip", "error", "timeout"],
        line_number,
        &mut errors,
    );
    check_enum(obj, "stream", &["unit", "e2e", "perf"], line_number, &mut errors);

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str()) {
        if !trace_id.contains("::") {
            errors.push(LogValidationError {
                line_number,
                field: "trace_id".to_string(),
                message: format!(
                    "trace_id should follow <component>::<run_id>::<seq> format, got: '{trace_id}'"
                ),
            });
        }
    }

    // Channel events must say which channel they describe.
    let event = obj.get("event").and_then(|v| v.as_str());
    if event.is_some_and(|e| CHANNEL_EVENTS.contains(&e))
        && !obj.get("channel_id").is_some_and(serde_json::Value::is_u64)
    {
        errors.push(LogValidationError {
            line_number,
            field: "channel_id".to_string(),
            message: "channel events must carry an unsigned channel_id".to_string(),
        });
    }

    // Denials and invalid-descriptor reports are warnings, never info.
    if event.is_some_and(|e| {
        [
            EventKind::ListenDenied,
            EventKind::AcceptDenied,
            EventKind::PollnvalWithoutPreclose,
        ]
        .iter()
        .any(|k| k.as_str() == e)
    }) && obj.get("level").and_then(|v| v.as_str()) != Some("warn")
    {
        errors.push(LogValidationError {
            line_number,
            field: "level".to_string(),
            message: "denial and pollnval events must be logged at warn".to_string(),
        });
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    match serde_json::from_value::<LogEntry>(value) {
        Ok(entry) => Ok(entry),
        Err(e) => {
            errors.push(LogValidationError {
                line_number,
                field: "<deserialization>".to_string(),
                message: format!("failed to deserialize: {e}"),
            });
            Err(errors)
        }
    }
}

/// Validate an entire JSONL file.
///
/// Returns the non-empty line count and any validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
