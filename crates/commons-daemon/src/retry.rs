/// Exponential backoff for failed streams.
///
/// At most one retry is pending at a time.  The timer runs in its own task
/// and reports back through the core event channel as `RetryDue`; the core
/// decides whether the retry is still wanted when it arrives.
use std::time::Duration;

use commons_proto::config::PlaybackConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::DaemonEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base: Duration::from_secs(config.retry_base_secs),
        }
    }

    /// Delay before retry number `attempt + 1`, or `None` once `attempt`
    /// retries have already been spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.base * 2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry fires after `delay`; `attempt` is the new attempt count.
    Scheduled { attempt: u32, delay: Duration },
    Exhausted,
}

struct PendingRetry {
    url: String,
    token: CancellationToken,
}

pub struct RetryManager {
    policy: RetryPolicy,
    events: mpsc::Sender<DaemonEvent>,
    pending: Option<PendingRetry>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy, events: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            policy,
            events,
            pending: None,
        }
    }

    /// Schedule a retry of `url` after `attempts_so_far` failed retries.
    /// Replaces any retry already pending.
    pub fn schedule(&mut self, url: &str, attempts_so_far: u32) -> RetryDecision {
        self.cancel();
        let Some(delay) = self.policy.delay_for(attempts_so_far) else {
            return RetryDecision::Exhausted;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let events = self.events.clone();
        let due_url = url.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!("retry for {} cancelled", due_url);
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(DaemonEvent::RetryDue { url: due_url }).await;
                }
            }
        });

        self.pending = Some(PendingRetry {
            url: url.to_string(),
            token,
        });
        RetryDecision::Scheduled {
            attempt: attempts_so_far + 1,
            delay,
        }
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.token.cancel();
        }
    }

    /// Consume the pending retry if `url` is the one it was scheduled for.
    pub fn take_due(&mut self, url: &str) -> bool {
        match &self.pending {
            Some(p) if p.url == url => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
