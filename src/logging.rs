//! Tracing subscriber setup and log rate limiting.
//!
//! Console output is compact and human oriented; `--json` switches to one
//! JSON object per event, with span fields (`job_id`, `pod`, `step`) attached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::LogSettings;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Default level DEBUG instead of INFO.
    pub verbose: bool,
}

impl From<&LogSettings> for LogConfig {
    fn from(settings: &LogSettings) -> Self {
        Self {
            json: settings.json,
            verbose: settings.verbose,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

fn default_directive(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!("podvault={}", level.as_str().to_lowercase())
}

/// Lets at most one caller through per interval.
///
/// Progress updates arrive once per chunk or part, which for small chunk
/// sizes would flood the log.
pub struct LogThrottle {
    interval_ms: u64,
    /// Millis since `epoch` of the last admitted call; `u64::MAX` before the first.
    last_ms: AtomicU64,
    epoch: Instant,
}

const NEVER: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(NEVER),
            epoch: Instant::now(),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        if last != NEVER && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        // Losing the race means another caller just logged.
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn reset(&self) {
        self.last_ms.store(NEVER, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_follows_verbosity() {
        assert_eq!(default_directive(false), "podvault=info");
        assert_eq!(default_directive(true), "podvault=debug");
    }

    #[test]
    fn throttle_admits_first_then_blocks() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reopens_after_interval() {
        let throttle = LogThrottle::new(Duration::from_millis(20));
        assert!(throttle.should_log());
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttle.should_log());
    }

    #[test]
    fn reset_admits_immediately() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }
}
