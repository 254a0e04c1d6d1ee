// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DealConfig;
use crate::error::VaultResult;

/// Bounded exponential backoff: `base * 2^attempt`, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub deadline: Option<Instant>,
}

impl PollPolicy {
    pub fn from_config(config: &DealConfig) -> Self {
        Self {
            attempts: config.poll_attempts,
            base_delay: Duration::from_millis(config.poll_base_delay_ms),
            max_delay: Duration::from_millis(config.poll_max_delay_ms),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `probe` until it yields a value, the attempts run out, the deadline
/// passes or `cancel` fires. Exhaustion is `Ok(None)`, not an error.
///
/// Retryable (network) errors from a probe count as a failed attempt;
/// anything else is returned immediately.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> VaultResult<Option<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = VaultResult<Option<T>>>,
{
    for attempt in 0..policy.attempts {
        if cancel.is_cancelled() {
            debug!("polling cancelled before attempt {attempt}");
            return Ok(None);
        }
        match probe(attempt).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(e) if e.is_retryable() => warn!("poll attempt {attempt} failed: {e}"),
            Err(e) => return Err(e),
        }
        if attempt + 1 == policy.attempts {
            break;
        }

        let mut wake = Instant::now() + policy.delay_for(attempt);
        if let Some(deadline) = policy.deadline {
            if Instant::now() >= deadline {
                debug!("poll deadline passed after {} attempts", attempt + 1);
                return Ok(None);
            }
            wake = wake.min(deadline);
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("polling cancelled while waiting");
                return Ok(None);
            }
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
    Ok(None)
}
