//! Runtime configuration.
//!
//! Settings come from the environment and are resolved once per process:
//! - `FRANKENNET_LOG`: where channel lifecycle events go.
//!   - `off` (default): events are dropped unless a sink is installed explicitly.
//!   - `jsonl` / `stderr`: one JSON object per line on stderr.
//! - `FRANKENNET_POLLNVAL`: how a `POLLNVAL` on a still-open channel is treated.
//!   - `lenient` (default): report "no change" and emit a warn event.
//!   - `strict`: additionally invalidate the selection key.

use std::sync::atomic::{AtomicU8, Ordering};

/// Destination for channel lifecycle events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogMode {
    /// No default sink.
    #[default]
    Off,
    /// JSONL on stderr.
    Jsonl,
}

impl LogMode {
    /// Parse from string (case-insensitive). Unknown values fall back to `Off`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "json" | "stderr" | "on" => Self::Jsonl,
            _ => Self::Off,
        }
    }

    #[must_use]
    pub const fn enabled(self) -> bool {
        matches!(self, Self::Jsonl)
    }
}

/// Policy for `POLLNVAL` reported on a channel that was not pre-closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollNvalPolicy {
    #[default]
    Lenient,
    Strict,
}

impl PollNvalPolicy {
    /// Parse from string (case-insensitive). Unknown values fall back to `Lenient`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "error" | "invalidate" => Self::Strict,
            _ => Self::Lenient,
        }
    }

    /// Returns true if the key should be invalidated.
    #[must_use]
    pub const fn invalidates_key(self) -> bool {
        matches!(self, Self::Strict)
    }
}

// Atomic caches: 0=unresolved, 255=resolving, otherwise resolved value + 1.
// A plain state machine instead of OnceLock so a re-entrant read during
// resolution gets the default instead of blocking.
const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

static CACHED_LOG: AtomicU8 = AtomicU8::new(UNRESOLVED);
static CACHED_POLLNVAL: AtomicU8 = AtomicU8::new(UNRESOLVED);

fn log_to_u8(mode: LogMode) -> u8 {
    match mode {
        LogMode::Off => 1,
        LogMode::Jsonl => 2,
    }
}

fn u8_to_log(v: u8) -> LogMode {
    match v {
        2 => LogMode::Jsonl,
        _ => LogMode::Off,
    }
}

fn pollnval_to_u8(policy: PollNvalPolicy) -> u8 {
    match policy {
        PollNvalPolicy::Lenient => 1,
        PollNvalPolicy::Strict => 2,
    }
}

fn u8_to_pollnval(v: u8) -> PollNvalPolicy {
    match v {
        2 => PollNvalPolicy::Strict,
        _ => PollNvalPolicy::Lenient,
    }
}

/// Resolve a cached setting, reading `var` on first use.
fn resolve_cached(cache: &AtomicU8, var: &str, parse: impl FnOnce(Option<String>) -> u8) -> Option<u8> {
    let cached = cache.load(Ordering::Relaxed);
    if cached != UNRESOLVED && cached != RESOLVING {
        return Some(cached);
    }
    if cached == RESOLVING {
        return None;
    }
    if cache
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        let v = cache.load(Ordering::Relaxed);
        return (v != UNRESOLVED && v != RESOLVING).then_some(v);
    }
    let value = parse(std::env::var(var).ok());
    cache.store(value, Ordering::Release);
    Some(value)
}

/// Configured event destination (reads `FRANKENNET_LOG` on first call).
#[must_use]
pub fn log_mode() -> LogMode {
    resolve_cached(&CACHED_LOG, "FRANKENNET_LOG", |raw| {
        log_to_u8(raw.map(|v| LogMode::from_str_loose(&v)).unwrap_or_default())
    })
    .map_or(LogMode::Off, u8_to_log)
}

/// Configured `POLLNVAL` policy (reads `FRANKENNET_POLLNVAL` on first call).
#[must_use]
pub fn pollnval_policy() -> PollNvalPolicy {
    resolve_cached(&CACHED_POLLNVAL, "FRANKENNET_POLLNVAL", |raw| {
        pollnval_to_u8(raw.map(|v| PollNvalPolicy::from_str_loose(&v)).unwrap_or_default())
    })
    .map_or(PollNvalPolicy::Lenient, u8_to_pollnval)
}
