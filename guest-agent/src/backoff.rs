use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;

/// Exponential reconnect delay with bounded random jitter.
///
/// Each call to [`Backoff::next_delay`] doubles the base delay up to the
/// ceiling, then adds up to `jitter` of random slack. The returned delay is
/// always clamped to the ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            jitter,
            current: initial,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_initial_ms),
            Duration::from_millis(config.reconnect_max_ms),
            Duration::from_millis(config.reconnect_jitter_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        (base + jitter).min(self.max)
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }

    /// Back to the initial delay after a successful attach.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn ceiling(&self) -> Duration {
        self.max
    }
}
