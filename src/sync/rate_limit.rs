use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// HTTP 429 from the vendor itself, independent of our own realms.
pub fn is_429(status: u16) -> bool {
    status == 429
}

/// Quota for one realm: at most `max_requests` inside any `timespan` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RealmConfig {
    max_requests: u32,
    timespan: Duration,
}

#[derive(Debug)]
struct RealmState {
    config: RealmConfig,
    hits: VecDeque<Instant>,
}

impl RealmState {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) >= self.config.timespan {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn retry_after(&self, now: Instant) -> Duration {
        self.hits
            .front()
            .map(|&oldest| (oldest + self.config.timespan).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

/// Sliding-window limiter over named realms.
///
/// Clones share state, so one instance can be handed to every sync job in the
/// process. Realms that were never registered are unlimited.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    realms: Arc<Mutex<HashMap<String, RealmState>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a realm, or update the quota of an existing one. Requests
    /// already recorded against the realm are kept.
    pub fn register_realm(&self, name: &str, max_requests: u32, timespan: Duration) {
        let config = RealmConfig {
            max_requests,
            timespan,
        };
        let mut realms = self.realms.lock().unwrap_or_else(|e| e.into_inner());
        realms
            .entry(name.to_string())
            .and_modify(|state| state.config = config)
            .or_insert_with(|| RealmState {
                config,
                hits: VecDeque::new(),
            });
    }

    /// Record one request against every listed realm, or fail with
    /// [`Error::RateLimited`] naming the first realm at quota. On failure no
    /// realm is charged.
    pub fn acquire(&self, realms: &[&str]) -> Result<()> {
        self.acquire_at(realms, Instant::now())
    }

    fn acquire_at(&self, names: &[&str], now: Instant) -> Result<()> {
        let mut realms = self.realms.lock().unwrap_or_else(|e| e.into_inner());

        for name in names {
            if let Some(state) = realms.get_mut(*name) {
                state.prune(now);
                if state.hits.len() >= state.config.max_requests as usize {
                    let retry_after = state.retry_after(now);
                    log::debug!("Realm {name} at quota, retry in {}s", retry_after.as_secs());
                    return Err(Error::RateLimited {
                        realm: name.to_string(),
                        retry_after,
                    });
                }
            }
        }

        for name in names {
            if let Some(state) = realms.get_mut(*name) {
                state.hits.push_back(now);
            }
        }
        Ok(())
    }

    /// Requests still available in `realm`'s current window.
    pub fn remaining(&self, realm: &str) -> Option<u32> {
        let mut realms = self.realms.lock().unwrap_or_else(|e| e.into_inner());
        let state = realms.get_mut(realm)?;
        state.prune(Instant::now());
        Some(state.config.max_requests.saturating_sub(state.hits.len() as u32))
    }
}
