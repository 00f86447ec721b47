use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Somewhere to put sync jobs that run outside the current call.
pub trait RetryScheduler: Send + Sync {
    /// Run the member's sync as soon as possible.
    fn queue(&self, oh_id: &str);

    /// Run the member's sync again after `delay`.
    fn retry(&self, oh_id: &str, delay: Duration);
}

/// A queued job for one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledSync {
    pub oh_id: String,
    pub delay: Duration,
    pub due: Instant,
    retry: bool,
}

impl ScheduledSync {
    /// Whether this job re-runs a sync that hit a rate limit.
    pub fn is_retry(&self) -> bool {
        self.retry
    }

    pub async fn wait(&self) {
        tokio::time::sleep_until(self.due).await;
    }
}

/// Sending half, handed to the sync job.
#[derive(Debug, Clone)]
pub struct RetryQueue {
    tx: mpsc::UnboundedSender<ScheduledSync>,
}

/// Receiving half, drained by whoever runs the jobs.
#[derive(Debug)]
pub struct RetryReceiver {
    rx: mpsc::UnboundedReceiver<ScheduledSync>,
    pending: Vec<ScheduledSync>,
}

impl RetryQueue {
    pub fn channel() -> (Self, RetryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            RetryReceiver {
                rx,
                pending: Vec::new(),
            },
        )
    }
}

impl RetryQueue {
    fn send(&self, oh_id: &str, delay: Duration, retry: bool) {
        let job = ScheduledSync {
            oh_id: oh_id.to_string(),
            delay,
            due: Instant::now() + delay,
            retry,
        };
        if self.tx.send(job).is_err() {
            log::warn!("Retry queue closed, dropping sync for member {oh_id}");
        } else if retry {
            log::info!("Retry for member {oh_id} scheduled in {}s", delay.as_secs());
        }
    }
}

impl RetryScheduler for RetryQueue {
    fn queue(&self, oh_id: &str) {
        self.send(oh_id, Duration::ZERO, false);
    }

    fn retry(&self, oh_id: &str, delay: Duration) {
        self.send(oh_id, delay, true);
    }
}

impl RetryReceiver {
    fn drain(&mut self) {
        while let Ok(job) = self.rx.try_recv() {
            match self.pending.iter_mut().find(|p| p.oh_id == job.oh_id) {
                Some(existing) if existing.due <= job.due => {}
                Some(existing) => *existing = job,
                None => self.pending.push(job),
            }
        }
    }

    /// The job due soonest, or `None` once nothing is queued. A member queued
    /// more than once keeps only its earliest entry.
    pub fn next(&mut self) -> Option<ScheduledSync> {
        self.drain();
        let (idx, _) = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, job)| job.due)?;
        Some(self.pending.remove(idx))
    }

    pub fn len(&mut self) -> usize {
        self.drain();
        self.pending.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}
