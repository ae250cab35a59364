use crate::error::Result;
use crate::processor::QueueProcessor;
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added as random jitter, 0.0 disables it.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1 << exp).min(self.max);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        delay + delay.mul_f64(extra)
    }
}

#[derive(Debug, Clone, Copy)]
struct UserBackoff {
    failures: u32,
    next_attempt: Instant,
}

/// Background re-driver for queues left halted by a failed delivery.
pub struct RetryWorker {
    processor: QueueProcessor,
    policy: BackoffPolicy,
    tick: Duration,
    backoff: HashMap<String, UserBackoff>,
}

impl RetryWorker {
    pub fn new(processor: QueueProcessor, policy: BackoffPolicy, tick: Duration) -> Self {
        Self {
            processor,
            policy,
            tick,
            backoff: HashMap::new(),
        }
    }

    /// One sweep over every user with queued entries whose backoff elapsed.
    /// Returns the users that were driven.
    pub async fn run_once(&mut self, now: Instant) -> Result<Vec<String>> {
        let users = self.processor.store().users_with_pending()?;
        self.backoff.retain(|user, _| users.contains(user));

        let mut driven = Vec::new();
        for user in users {
            if let Some(b) = self.backoff.get(&user) {
                if now < b.next_attempt {
                    continue;
                }
            }

            let clean = match self.processor.drain(&user).await {
                Ok(report) => report.is_clean(),
                Err(err) => {
                    tracing::error!(user_id = %user, error = %err, "re-drive failed");
                    false
                }
            };

            if clean {
                self.backoff.remove(&user);
            } else {
                let failures = self.backoff.get(&user).map_or(0, |b| b.failures) + 1;
                let delay = self.policy.delay(failures);
                tracing::debug!(user_id = %user, failures, delay_ms = delay.as_millis() as u64, "backing off");
                self.backoff.insert(
                    user.clone(),
                    UserBackoff {
                        failures,
                        next_attempt: now + delay,
                    },
                );
            }
            driven.push(user);
        }
        Ok(driven)
    }

    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            tracing::info!(tick_ms = self.tick.as_millis() as u64, "delivery retry worker started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = self.run_once(Instant::now()).await {
                            tracing::error!(error = %err, "retry sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("delivery retry worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(4), Duration::from_secs(40));
        assert_eq!(policy.delay(5), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_secs(5));
            assert!(d < Duration::from_millis(5500));
        }
    }
}
