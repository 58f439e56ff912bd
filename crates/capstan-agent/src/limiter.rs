//! Sliding-window rate limiter for provider calls.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::errors::{AgentError, AgentResult};

/// Allows at most `rpm` grants per trailing window. Production use is
/// one minute; tests inject shorter windows through [`with_window`].
///
/// [`with_window`]: RateLimiter::with_window
pub struct RateLimiter {
    rpm: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter with the standard one-minute window.
    pub fn new(rpm: u32) -> AgentResult<Self> {
        Self::with_window(rpm, Duration::from_secs(60))
    }

    /// Limiter with a custom window length. `rpm` of 0 would block
    /// every caller forever and is rejected.
    pub fn with_window(rpm: u32, window: Duration) -> AgentResult<Self> {
        if rpm == 0 {
            return Err(AgentError::InvalidConfiguration(
                "rate_limit must be at least 1 request per window".to_string(),
            ));
        }
        Ok(RateLimiter {
            rpm: rpm as usize,
            window,
            grants: Mutex::new(VecDeque::new()),
        })
    }

    fn lock(&self) -> AgentResult<MutexGuard<'_, VecDeque<Instant>>> {
        self.grants
            .lock()
            .map_err(|_| AgentError::Internal("rate limiter mutex poisoned".to_string()))
    }

    fn prune(grants: &mut VecDeque<Instant>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = grants.front() {
            if now.duration_since(*front) >= window {
                grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// Grants inside the current window.
    pub fn current_usage(&self) -> AgentResult<usize> {
        let mut grants = self.lock()?;
        Self::prune(&mut grants, self.window);
        Ok(grants.len())
    }

    /// How long a caller arriving now would wait for a slot.
    pub fn wait_hint(&self) -> AgentResult<Duration> {
        let mut grants = self.lock()?;
        Self::prune(&mut grants, self.window);
        if grants.len() < self.rpm {
            return Ok(Duration::ZERO);
        }
        match grants.front() {
            Some(oldest) => Ok(self.window.saturating_sub(oldest.elapsed())),
            None => Ok(Duration::ZERO),
        }
    }

    /// Waits for a free slot and records the grant. The lock is never
    /// held across the sleep.
    pub async fn acquire(&self) -> AgentResult<()> {
        loop {
            let wait = {
                let mut grants = self.lock()?;
                Self::prune(&mut grants, self.window);
                if grants.len() < self.rpm {
                    grants.push_back(Instant::now());
                    return Ok(());
                }
                match grants.front() {
                    Some(oldest) => self.window.saturating_sub(oldest.elapsed()),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
