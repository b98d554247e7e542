//! Loopback end-to-end scenarios.
//!
//! Each scenario opens fresh channels on its own [`SelectorProvider`], drives
//! them over `127.0.0.1`, and checks the observable contract. Results are
//! gathered into a [`ScenarioReport`] that serializes to JSON.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use frankennet_channel::{
    ChannelError, EventSink, SelectableChannel, SelectorProvider, ServerSocketChannel,
};
use frankennet_core::poll::{OP_ACCEPT, POLLERR, POLLIN};
use serde::Serialize;

use crate::structured_log::{LogEntry, LogLevel, LogSink, Outcome};

/// Scenario names, in run order.
pub const SCENARIOS: [&str; 6] = [
    "bind_ephemeral",
    "nonblocking_accept_idle",
    "accept_round_trip",
    "close_unblocks_accept",
    "selector_translation",
    "zero_backlog",
];

/// How long a blocked acceptor may take to notice a close.
const CLOSE_DEADLINE: Duration = Duration::from_secs(1);
/// Pending connections opened against a zero-backlog listener.
const BACKLOG_CLIENTS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("unknown scenario '{0}'")]
    Unknown(String),
    #[error("check failed: {0}")]
    Check(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("acceptor thread panicked")]
    Panicked,
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), ScenarioError> {
    if cond {
        Ok(())
    } else {
        Err(ScenarioError::Check(msg()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioResult>,
}

impl ScenarioReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Run every scenario, or just `only`, logging to `sink` when given.
pub fn run(only: Option<&str>, sink: Option<Arc<LogSink>>) -> Result<ScenarioReport, ScenarioError> {
    let names: Vec<&str> = match only {
        Some(name) => {
            let found = SCENARIOS
                .iter()
                .find(|s| **s == name)
                .ok_or_else(|| ScenarioError::Unknown(name.to_string()))?;
            vec![*found]
        }
        None => SCENARIOS.to_vec(),
    };

    let mut results = Vec::with_capacity(names.len());
    for name in names {
        let provider = SelectorProvider::new();
        if let Some(sink) = &sink {
            sink.set_scenario(Some(name));
            let _ = sink.record(LogEntry::new(String::new(), LogLevel::Info, "scenario_start"));
            let events: Arc<dyn EventSink> = sink.clone();
            provider.set_event_sink(Some(events));
        }

        let started = Instant::now();
        let outcome = run_scenario(name, &provider);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = ScenarioResult {
            name: name.to_string(),
            outcome: if outcome.is_ok() {
                Outcome::Pass
            } else {
                Outcome::Fail
            },
            duration_ms,
            error: outcome.err().map(|e| e.to_string()),
        };

        if let Some(sink) = &sink {
            let level = if result.error.is_some() {
                LogLevel::Error
            } else {
                LogLevel::Info
            };
            let mut entry = LogEntry::new(String::new(), level, "scenario_end")
                .with_outcome(result.outcome)
                .with_duration_ms(duration_ms);
            if let Some(error) = &result.error {
                entry = entry.with_details(serde_json::json!({ "error": error }));
            }
            let _ = sink.record(entry);
            sink.set_scenario(None);
        }
        results.push(result);
    }

    if let Some(sink) = &sink {
        sink.flush()?;
    }
    let passed = results.iter().filter(|r| r.outcome == Outcome::Pass).count();
    Ok(ScenarioReport {
        total: results.len(),
        passed,
        failed: results.len() - passed,
        results,
    })
}

/// Run one named scenario on `provider`.
pub fn run_scenario(name: &str, provider: &Arc<SelectorProvider>) -> Result<(), ScenarioError> {
    match name {
        "bind_ephemeral" => bind_ephemeral(provider),
        "nonblocking_accept_idle" => nonblocking_accept_idle(provider),
        "accept_round_trip" => accept_round_trip(provider),
        "close_unblocks_accept" => close_unblocks_accept(provider),
        "selector_translation" => selector_translation(provider),
        "zero_backlog" => zero_backlog(provider),
        other => Err(ScenarioError::Unknown(other.to_string())),
    }
}

fn loopback() -> Option<SocketAddr> {
    Some(SocketAddr::from(([127, 0, 0, 1], 0)))
}

fn bound(
    provider: &Arc<SelectorProvider>,
    backlog: i32,
) -> Result<Arc<ServerSocketChannel>, ScenarioError> {
    let ch = provider.open_server_socket_channel()?;
    ch.bind(loopback(), backlog)?;
    Ok(ch)
}

fn local(ch: &ServerSocketChannel) -> Result<SocketAddr, ScenarioError> {
    ch.local_address()
        .ok_or_else(|| ScenarioError::Check("bound channel has no local address".into()))
}

fn bind_ephemeral(provider: &Arc<SelectorProvider>) -> Result<(), ScenarioError> {
    let ch = bound(provider, 0)?;
    let addr = local(&ch)?;
    ensure(addr.port() != 0, || "ephemeral port was not recorded".into())?;
    ensure(ch.is_bound(), || "is_bound() false after bind".into())?;
    ch.close()?;
    Ok(())
}

fn nonblocking_accept_idle(provider: &Arc<SelectorProvider>) -> Result<(), ScenarioError> {
    let ch = bound(provider, 0)?;
    ch.configure_blocking(false)?;
    let started = Instant::now();
    let accepted = ch.accept()?;
    ensure(accepted.is_none(), || "accept produced a connection nobody made".into())?;
    ensure(started.elapsed() < CLOSE_DEADLINE, || {
        format!("non-blocking accept took {:?}", started.elapsed())
    })?;
    ch.close()?;
    Ok(())
}

fn accept_round_trip(provider: &Arc<SelectorProvider>) -> Result<(), ScenarioError> {
    let ch = bound(provider, 0)?;
    let addr = local(&ch)?;
    let acceptor = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || ch.accept())
    };
    thread::sleep(Duration::from_millis(50));
    let client = TcpStream::connect(addr)?;
    let accepted = acceptor
        .join()
        .map_err(|_| ScenarioError::Panicked)??
        .ok_or_else(|| ScenarioError::Check("blocking accept returned nothing".into()))?;
    let client_addr = client.local_addr()?;
    ensure(accepted.remote_address() == client_addr, || {
        format!(
            "remote {} does not match client {client_addr}",
            accepted.remote_address()
        )
    })?;
    accepted.close()?;
    ch.close()?;
    Ok(())
}

fn close_unblocks_accept(provider: &Arc<SelectorProvider>) -> Result<(), ScenarioError> {
    let ch = bound(provider, 0)?;
    let acceptor = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || ch.accept())
    };
    thread::sleep(Duration::from_millis(100));

    let closed_at = Instant::now();
    ch.close()?;
    let result = acceptor.join().map_err(|_| ScenarioError::Panicked)?;
    let waited = closed_at.elapsed();
    ensure(waited < CLOSE_DEADLINE, || {
        format!("acceptor took {waited:?} to return after close")
    })?;
    match result {
        Ok(None) => {}
        Err(e) if e.is_closed() => {}
        Ok(Some(_)) => return Err(ScenarioError::Check("accept succeeded after close".into())),
        Err(e) => return Err(e.into()),
    }
    ensure(matches!(ch.accept(), Err(ChannelError::Closed)), || {
        "accept after close did not fail with a closed channel".into()
    })
}

fn selector_translation(provider: &Arc<SelectorProvider>) -> Result<(), ScenarioError> {
    let selector = provider.open_selector()?;
    let ch = bound(provider, 0)?;
    ch.configure_blocking(false)?;
    let key = ch.register(&selector.handle(), OP_ACCEPT)?;

    let events = selector.event_ops(&key).unwrap_or(0);
    ensure(events & POLLIN != 0, || {
        format!("accept interest produced native mask {events:#x}")
    })?;

    key.set_ready_ops(0);
    let changed = ch.translate_and_set_ready_ops(POLLIN, &key);
    ensure(changed && key.ready_ops() == OP_ACCEPT, || {
        format!(
            "POLLIN translated to ready {:#x} (changed={changed})",
            key.ready_ops()
        )
    })?;

    key.set_ready_ops(0);
    ch.translate_and_set_ready_ops(POLLERR, &key);
    ensure(key.ready_ops() == key.interest_ops(), || {
        format!("POLLERR translated to ready {:#x}", key.ready_ops())
    })?;

    selector.close()?;
    ch.close()?;
    Ok(())
}

fn zero_backlog(provider: &Arc<SelectorProvider>) -> Result<(), ScenarioError> {
    let ch = bound(provider, 0)?;
    let addr = local(&ch)?;
    let clients = (0..BACKLOG_CLIENTS)
        .map(|_| TcpStream::connect(addr))
        .collect::<Result<Vec<_>, _>>()?;

    ch.configure_blocking(false)?;
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut accepted = 0;
    while accepted < clients.len() && Instant::now() < deadline {
        match ch.accept()? {
            Some(sc) => {
                sc.close()?;
                accepted += 1;
            }
            None => thread::sleep(Duration::from_millis(5)),
        }
    }
    ensure(accepted == clients.len(), || {
        format!("accepted {accepted} of {} pending connections", clients.len())
    })?;
    ch.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scenario_is_rejected() {
        let err = run(Some("nope"), None).unwrap_err();
        assert!(matches!(err, ScenarioError::Unknown(ref n) if n == "nope"));
    }

    #[test]
    fn single_scenario_runs_alone() {
        let report = run(Some("bind_ephemeral"), None).unwrap();
        assert_eq!(report.total, 1);
        assert!(report.all_passed(), "{report:?}");
        assert_eq!(report.results[0].name, "bind_ephemeral");
    }

    #[test]
    fn report_serializes() {
        let report = ScenarioReport {
            total: 1,
            passed: 0,
            failed: 1,
            results: vec![ScenarioResult {
                name: "x".into(),
                outcome: Outcome::Fail,
                duration_ms: 3,
                error: Some("check failed: y".into()),
            }],
        };
        let v: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(v["failed"], 1);
        assert_eq!(v["results"][0]["outcome"], "fail");
        assert_eq!(v["results"][0]["error"], "check failed: y");
    }
}
