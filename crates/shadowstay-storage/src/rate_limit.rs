//! Sliding-window rate limiter shared by every worker of one crawler.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum acquisitions inside any rolling window.
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: Duration::from_secs(60),
        }
    }
}

/// Permits at most `max_requests` acquisitions per rolling `window`. Callers
/// over the limit sleep until the oldest acquisition leaves the window.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            max_requests: config.max_requests.max(1),
            window: config.window,
        };
        Self {
            config,
            issued: Mutex::new(VecDeque::with_capacity(config.max_requests as usize)),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut issued = self.issued.lock().await;
                let now = Instant::now();
                while let Some(front) = issued.front() {
                    if now.duration_since(*front) >= self.config.window {
                        issued.pop_front();
                    } else {
                        break;
                    }
                }

                if issued.len() < self.config.max_requests as usize {
                    issued.push_back(now);
                    return;
                }

                match issued.front() {
                    Some(oldest) => self.config.window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate window full");
            tokio::time::sleep(wait).await;
        }
    }

    /// Acquisitions currently counted against the window.
    pub async fn in_window(&self) -> usize {
        let issued = self.issued.lock().await;
        let now = Instant::now();
        issued
            .iter()
            .filter(|t| now.duration_since(**t) < self.config.window)
            .count()
    }
}
