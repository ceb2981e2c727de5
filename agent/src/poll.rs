//! The agent's main loop: claim one job, run it, ack it, repeat.
//!
//! Nothing in here returns an error. Transport failures are logged and
//! retried with a jittered exponential backoff; an outcome that could not be
//! delivered is re-sent without running the job again.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{event, instrument, Level};

use corral_rs::connector::{JobExecutor, SwitchboardConnector};
use corral_rs::job::{JobId, JobOutcome};

use crate::config::{positive, PollConfig};

const MIN_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Backoff {
            base: base.max(MIN_DELAY),
            max: max.max(MIN_DELAY),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `base * 2^n` capped at `max`, then
    /// jittered.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.base.saturating_mul(factor).min(self.max);
        jittered(delay, self.jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}

/// Sleep for `delay` unless shutdown is requested first. Returns whether to
/// stop.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        // A dropped sender also means stop.
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

pub struct PollLoop {
    connector: Arc<dyn SwitchboardConnector>,
    executor: Arc<dyn JobExecutor>,
    interval: Duration,
    max_backoff: Duration,
    jitter: f64,
}

impl PollLoop {
    pub fn new(
        connector: Arc<dyn SwitchboardConnector>,
        executor: Arc<dyn JobExecutor>,
        config: &PollConfig,
    ) -> Self {
        PollLoop {
            connector,
            executor,
            interval: positive(config.interval).unwrap_or(MIN_DELAY),
            max_backoff: positive(config.max_backoff).unwrap_or(MIN_DELAY),
            jitter: config.jitter,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.interval, self.max_backoff, self.jitter)
    }

    /// Run until `shutdown` flips to `true`. A job already claimed is
    /// finished and acked first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.backoff();
        event!(Level::INFO, interval = ?self.interval, "Starting poll loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.connector.poll().await {
                Ok(Some(job)) => {
                    backoff.reset();
                    event!(Level::INFO, id = job.id.0, kind = %job.kind, "Claimed job");
                    let outcome = self.executor.execute(&job).await;
                    self.deliver(job.id, &outcome, &mut shutdown).await;
                    // More work may be queued; poll again right away.
                    continue;
                }
                Ok(None) => {
                    backoff.reset();
                    jittered(self.interval, self.jitter)
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    event!(Level::WARN, error = %e, ?delay, "Poll failed, backing off");
                    delay
                }
            };

            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        event!(Level::INFO, "Poll loop stopped");
    }

    /// Ack `outcome`, retrying transient failures until it is delivered or
    /// shutdown is requested.
    #[instrument(skip(self, outcome, shutdown), fields(id = job_id.0))]
    async fn deliver(&self, job_id: JobId, outcome: &JobOutcome, shutdown: &mut watch::Receiver<bool>) {
        let mut backoff = self.backoff();
        loop {
            match self.connector.ack(job_id, outcome).await {
                Ok(()) => {
                    event!(Level::DEBUG, status = ?outcome.status, "Acked job");
                    return;
                }
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    event!(Level::WARN, error = %e, ?delay, "Ack failed, retrying");
                    if sleep_or_shutdown(delay, shutdown).await {
                        event!(Level::ERROR, "Shutting down with job outcome undelivered");
                        return;
                    }
                }
                Err(e) => {
                    event!(Level::ERROR, error = %e, "Ack rejected, dropping outcome");
                    return;
                }
            }
        }
    }
}
