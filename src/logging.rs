use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Installs the global tracing subscriber.
///
/// Priority order:
/// 1) RUST_LOG (standard in the Rust ecosystem)
/// 2) the configured log level
/// 3) default (info)
pub fn init_tracing(config: &Config) {
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| config.general.log_level.clone());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}

#[derive(Debug, Clone, Copy)]
struct WarnThrottleState {
    last: Instant,
    suppressed: u64,
}

/// Returns true when a warning keyed by `key` should be emitted now, at
/// most once per `interval`. Used for failure classes that repeat every
/// reconciliation cycle, like undeletable directories.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    let Some(suppressed) = warn_throttled_with_count(key, interval) else {
        return false;
    };
    if suppressed > 0 {
        tracing::warn!(
            event = "throttled_warning_summary",
            key,
            suppressed,
            "throttled warnings were suppressed"
        );
    }
    true
}

fn warn_throttled_with_count(key: &'static str, interval: Duration) -> Option<u64> {
    static LAST_WARN: OnceLock<Mutex<HashMap<&'static str, WarnThrottleState>>> = OnceLock::new();
    let map = LAST_WARN.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match map.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("warn throttle lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    };
    let now = Instant::now();
    if let Some(state) = guard.get_mut(key) {
        if now.saturating_duration_since(state.last) < interval {
            state.suppressed = state.suppressed.saturating_add(1);
            return None;
        }
        let suppressed = state.suppressed;
        state.last = now;
        state.suppressed = 0;
        return Some(suppressed);
    }
    guard.insert(
        key,
        WarnThrottleState {
            last: now,
            suppressed: 0,
        },
    );
    Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_throttled_suppresses_within_interval() {
        assert!(warn_throttled("test-throttle-key", Duration::from_secs(60)));
        assert!(!warn_throttled("test-throttle-key", Duration::from_secs(60)));
    }

    #[test]
    fn warn_throttled_keys_are_independent() {
        assert!(warn_throttled("test-throttle-a", Duration::from_secs(60)));
        assert!(warn_throttled("test-throttle-b", Duration::from_secs(60)));
    }
}
