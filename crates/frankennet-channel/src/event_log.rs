//! Structured channel lifecycle events.
//!
//! Channels describe what happened to them as [`ChannelEvent`] records and
//! hand them to the [`EventSink`] installed on their provider. Nothing here
//! formats free text; sinks decide the encoding.

use std::fmt;
use std::io::Write;
use std::net::SocketAddr;

use parking_lot::Mutex;
use serde::Serialize;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Open,
    Bind,
    ListenDenied,
    Accept,
    AcceptDenied,
    Close,
    Kill,
    PollnvalWithoutPreclose,
    Interrupt,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Bind => "bind",
            Self::ListenDenied => "listen_denied",
            Self::Accept => "accept",
            Self::AcceptDenied => "accept_denied",
            Self::Close => "close",
            Self::Kill => "kill",
            Self::PollnvalWithoutPreclose => "pollnval_without_preclose",
            Self::Interrupt => "interrupt",
        }
    }

    /// Severity a sink should attach.
    #[must_use]
    pub const fn level(self) -> EventLevel {
        match self {
            Self::ListenDenied | Self::AcceptDenied | Self::PollnvalWithoutPreclose => {
                EventLevel::Warn
            }
            _ => EventLevel::Info,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
}

/// One lifecycle event of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelEvent {
    pub event: EventKind,
    pub level: EventLevel,
    /// Process-unique channel id.
    pub channel: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ChannelEvent {
    #[must_use]
    pub fn new(event: EventKind, channel: u64) -> Self {
        Self {
            event,
            level: event.level(),
            channel,
            fd: None,
            local: None,
            remote: None,
            errno: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_fd(mut self, fd: i32) -> Self {
        self.fd = Some(fd);
        self
    }

    #[must_use]
    pub fn with_local(mut self, addr: SocketAddr) -> Self {
        self.local = Some(addr.to_string());
        self
    }

    #[must_use]
    pub fn with_remote(mut self, addr: SocketAddr) -> Self {
        self.remote = Some(addr.to_string());
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: Option<i32>) -> Self {
        self.errno = errno;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receiver of channel events. Implementations must not block for long:
/// some events are emitted while a channel lock is held.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ChannelEvent);
}

/// Writes each event as one JSON line.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonlSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    #[must_use]
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &ChannelEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        let mut w = self.writer.lock();
        let _ = writeln!(w, "{line}");
    }
}

impl fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlSink").finish_non_exhaustive()
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ChannelEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    /// Event kinds in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.event).collect()
    }

    /// Events emitted by one channel.
    #[must_use]
    pub fn for_channel(&self, channel: u64) -> Vec<ChannelEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.channel == channel)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &ChannelEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_event() {
        let buf = SharedBuf::default();
        let sink = JsonlSink::new(buf.clone());
        sink.emit(&ChannelEvent::new(EventKind::Open, 7).with_fd(3));
        sink.emit(
            &ChannelEvent::new(EventKind::Bind, 7).with_local("127.0.0.1:9000".parse().unwrap()),
        );
        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "open");
        assert_eq!(first["level"], "info");
        assert_eq!(first["fd"], 3);
        assert!(first.get("local").is_none());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["local"], "127.0.0.1:9000");
    }

    #[test]
    fn warn_level_for_denials_and_pollnval() {
        assert_eq!(EventKind::AcceptDenied.level(), EventLevel::Warn);
        assert_eq!(EventKind::PollnvalWithoutPreclose.level(), EventLevel::Warn);
        assert_eq!(EventKind::Accept.level(), EventLevel::Info);
        let json = serde_json::to_value(ChannelEvent::new(EventKind::PollnvalWithoutPreclose, 1))
            .unwrap();
        assert_eq!(json["event"], "pollnval_without_preclose");
        assert_eq!(json["level"], "warn");
    }

    #[test]
    fn memory_sink_filters_by_channel() {
        let sink = MemorySink::new();
        sink.emit(&ChannelEvent::new(EventKind::Open, 1));
        sink.emit(&ChannelEvent::new(EventKind::Open, 2));
        sink.emit(&ChannelEvent::new(EventKind::Close, 1));
        assert_eq!(sink.kinds(), vec![EventKind::Open, EventKind::Open, EventKind::Close]);
        assert_eq!(sink.for_channel(1).len(), 2);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
