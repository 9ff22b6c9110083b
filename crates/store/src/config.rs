#![forbid(unsafe_code)]

use std::time::Duration;

pub const DEFAULT_FLUSH_MS: u64 = 100;
pub const DEFAULT_MIN_FLUSH_MS: u64 = 8;
pub const DEFAULT_QUEUE_CAP: usize = 2048;

/// Ingest tuning for one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Delay between the first buffered event and the flush that folds it in.
    pub flush_interval: Duration,
    /// Lower clamp for `flush_interval`.
    pub min_flush_interval: Duration,
    /// Capacity of the bounded channel feeding the ingest task.
    pub queue_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_MS),
            min_flush_interval: Duration::from_millis(DEFAULT_MIN_FLUSH_MS),
            queue_cap: DEFAULT_QUEUE_CAP,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `KESTREL_FLUSH_MS`, `KESTREL_MIN_FLUSH_MS`, `KESTREL_QUEUE_CAP`.
    pub fn from_env() -> Self {
        let flush = env_parse("KESTREL_FLUSH_MS").unwrap_or(DEFAULT_FLUSH_MS);
        let min = env_parse("KESTREL_MIN_FLUSH_MS").unwrap_or(DEFAULT_MIN_FLUSH_MS);
        let cap = env_parse("KESTREL_QUEUE_CAP").unwrap_or(DEFAULT_QUEUE_CAP as u64) as usize;
        Self {
            flush_interval: Duration::from_millis(flush),
            min_flush_interval: Duration::from_millis(min),
            queue_cap: cap.max(1),
        }
    }

    pub fn effective_interval(&self) -> Duration {
        self.flush_interval.max(self.min_flush_interval)
    }
}

fn env_parse(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_clamped_to_minimum() {
        let cfg = StoreConfig { flush_interval: Duration::from_millis(1), ..StoreConfig::default() };
        assert_eq!(cfg.effective_interval(), Duration::from_millis(DEFAULT_MIN_FLUSH_MS));
        assert_eq!(StoreConfig::default().effective_interval(), Duration::from_millis(100));
    }
}
