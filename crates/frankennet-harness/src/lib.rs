//! End-to-end harness for frankennet channels.
//!
//! This crate provides:
//! - The structured JSONL log contract shared by tests and the CLI
//! - An [`EventSink`](frankennet_channel::EventSink) that writes channel events in that format
//! - A runner for the loopback end-to-end scenarios

#![forbid(unsafe_code)]

pub mod scenarios;
pub mod structured_log;

pub use scenarios::{ScenarioError, ScenarioReport, ScenarioResult};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, LogSink, Outcome, StreamKind};
