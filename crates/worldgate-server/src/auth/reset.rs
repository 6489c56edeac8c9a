//! Daily quota-counter reset job.
//!
//! A periodic task that, at most once per UTC day, acquires a TTL lock
//! and bulk-resets every key's daily counter. The lock is a narrow
//! abstraction so a shared store can guarantee one reset per day across
//! processes; the in-process implementation covers single-node deploys.

use super::{current_day, AuthError, CredentialStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Lock TTL: a crashed holder stops blocking resets after this long.
pub const RESET_LOCK_TTL: Duration = Duration::from_secs(300);

/// Cadence at which the job checks whether a reset is due.
const RESET_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Distributed-lock seam guarding the bulk reset.
#[async_trait]
pub trait ResetLock: Send + Sync {
    /// Take the lock as `holder` for `ttl`. Fails while another holder's
    /// un-expired claim stands.
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> bool;

    /// Compare-and-delete: release only while still held by `holder`.
    async fn release(&self, holder: &str);
}

/// Single-process lock with the same acquire/expire semantics.
pub struct MemoryResetLock {
    claim: Mutex<Option<(String, Instant)>>,
}

impl Default for MemoryResetLock {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResetLock {
    pub fn new() -> Self {
        Self {
            claim: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ResetLock for MemoryResetLock {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> bool {
        let mut claim = self.claim.lock().await;
        match claim.as_ref() {
            Some((_, expires)) if *expires > Instant::now() => false,
            _ => {
                *claim = Some((holder.to_string(), Instant::now() + ttl));
                true
            }
        }
    }

    async fn release(&self, holder: &str) {
        let mut claim = self.claim.lock().await;
        if claim.as_ref().is_some_and(|(h, _)| h == holder) {
            *claim = None;
        }
    }
}

/// Perform the reset when `today` has not been handled yet and the lock
/// can be taken. Returns whether this call performed the reset.
pub async fn reset_if_due(
    credentials: &dyn CredentialStore,
    lock: &dyn ResetLock,
    holder: &str,
    today: u64,
    last_done: &AtomicU64,
) -> Result<bool, AuthError> {
    if last_done.load(Ordering::Acquire) >= today {
        return Ok(false);
    }
    if !lock.try_acquire(holder, RESET_LOCK_TTL).await {
        return Ok(false);
    }

    let result = credentials.reset_daily_counters().await;
    lock.release(holder).await;

    let changed = result?;
    last_done.store(today, Ordering::Release);
    info!(changed, "daily quota counters reset");
    Ok(true)
}

/// Long-running reset task; ends when `cancel` fires.
pub async fn run_daily_reset(
    credentials: Arc<dyn CredentialStore>,
    lock: Arc<dyn ResetLock>,
    cancel: CancellationToken,
) {
    let holder = Uuid::new_v4().to_string();
    // Counters start fresh at boot, so today's reset is already covered.
    let last_done = AtomicU64::new(current_day());
    let mut interval = tokio::time::interval(RESET_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = reset_if_due(
                    credentials.as_ref(),
                    lock.as_ref(),
                    &holder,
                    current_day(),
                    &last_done,
                )
                .await
                {
                    warn!(error = %e, "daily counter reset failed");
                }
            }
        }
    }
}
