//! Capped exponential reconnect delay.
//!
//! The first retry after a failure waits `initial`; each further consecutive
//! failure doubles the wait up to `max`. A successful connect resets it.

use crate::config::BackoffConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.initial,
        }
    }

    /// Returns the delay to wait now and advances to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.config.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: ms(100),
            max: ms(500),
        });
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, vec![ms(100), ms(200), ms(400), ms(500), ms(500)]);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: ms(50),
            max: ms(1000),
        });
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), ms(50));
    }

    #[test]
    fn zero_initial_delay_stays_zero() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::ZERO,
            max: ms(10),
        });
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
