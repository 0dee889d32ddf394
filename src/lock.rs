use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::RngCore;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::record::{deadline_after, LockInfo, LockOptions, LockRecord};

pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock '{key}' is not held")]
    NotLocked { key: String },

    #[error("Lock '{key}' is owned by {expected:?}, not {actual:?}")]
    OwnerMismatch {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Lock '{key}' is unavailable")]
    Unavailable { key: String },

    #[error("Lock '{key}' was still held after {waited:?}")]
    WaitTimeout { key: String, waited: Duration },
}

/// The lock registry.
///
/// Keeps track of every named lock held in this process. Cloning is cheap
/// and every clone shares the same set of locks; the retry and polling
/// settings are per handle.
#[derive(Debug, Clone)]
pub struct LockRegistry {
    inner: Arc<LockRegistryInner>,
    retry_count: u32,
    retry_delay: Duration,
    poll_interval: Duration,
}

#[derive(Debug, Default)]
struct LockRegistryInner {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    locks: HashMap<String, LockRecord>,
    next_generation: u64,
}

/// Releases its lock when dropped.
///
/// The release is owner-checked, so a guard whose lock already expired and
/// was taken by somebody else leaves the new holder alone.
#[derive(Debug)]
pub struct LockGuard {
    registry: LockRegistry,
    key: String,
    owner: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Release the lock now rather than at the end of scope.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key, Some(&self.owner));
    }
}

impl RegistryState {
    fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        generation
    }

    fn live(&self, key: &str, now: Instant) -> Option<&LockRecord> {
        self.locks.get(key).filter(|record| !record.is_expired(now))
    }

    // Drops a record whose deadline passed before its timer got to run.
    fn evict_expired(&mut self, key: &str, now: Instant) {
        if self.locks.get(key).is_some_and(|record| record.is_expired(now)) {
            if let Some(mut record) = self.locks.remove(key) {
                record.cancel_expiry();
                warn!(key, owner = ?record.owner, "lock expired");
            }
        }
    }
}

impl LockRegistryInner {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the expiry task. Only removes the record it was scheduled for.
    fn expire(&self, key: &str, generation: u64) {
        let mut state = self.state();
        if state.locks.get(key).map(|record| record.generation) != Some(generation) {
            return;
        }
        // The expiry handle belongs to the task running this call.
        if let Some(record) = state.locks.remove(key) {
            warn!(key, owner = ?record.owner, "lock expired");
        }
    }
}

impl Drop for LockRegistryInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for record in state.locks.values_mut() {
            record.cancel_expiry();
        }
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> LockRegistry {
        LockRegistry {
            inner: Arc::new(LockRegistryInner::default()),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Get an owner id made of 20 random bytes, hex encoded.
    pub fn get_unique_owner_id(&self) -> String {
        let mut buf = [0u8; 20];
        rand::rng().fill_bytes(&mut buf);
        hex::encode(buf)
    }

    /// Set retry count and initial retry delay used by `acquire_with_retry`.
    ///
    /// Retry count defaults to `3`.
    /// Retry delay defaults to `200ms`.
    pub fn set_retry(&mut self, count: u32, delay: Duration) {
        self.retry_count = count;
        self.retry_delay = delay;
    }

    /// Set the polling interval used by `wait`.
    ///
    /// Defaults to `100ms`.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    fn schedule_expiry(&self, key: &str, generation: u64, deadline: Instant) -> Option<AbortHandle> {
        let Ok(runtime) = Handle::try_current() else {
            debug!(key, "no tokio runtime, expiry is checked on access");
            return None;
        };

        let inner = Arc::downgrade(&self.inner);
        let key = key.to_owned();
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(&key, generation);
            }
        });

        Some(task.abort_handle())
    }

    /// Try to take the lock for `key`.
    ///
    /// Returns `false` without touching the existing record if the key is
    /// already held. With a non-zero `options.timeout` the lock is released
    /// automatically once the timeout elapses.
    pub fn acquire(&self, key: &str, options: LockOptions) -> bool {
        let mut state = self.inner.state();
        state.evict_expired(key, Instant::now());

        if state.locks.contains_key(key) {
            trace!(key, "lock is busy");
            return false;
        }

        let generation = state.next_generation();
        let mut record = LockRecord::new(options, generation);
        if let Some(deadline) = record.deadline {
            record.expiry = self.schedule_expiry(key, generation, deadline);
        }
        debug!(key, owner = ?record.owner, expires = record.deadline.is_some(), "lock acquired");
        state.locks.insert(key.to_owned(), record);

        true
    }

    /// Like `acquire`, but wraps the lock in a guard that releases it on drop.
    ///
    /// A random owner is assigned when `options` does not name one.
    pub fn acquire_guard(&self, key: &str, mut options: LockOptions) -> Option<LockGuard> {
        let owner = options
            .owner
            .get_or_insert_with(|| self.get_unique_owner_id())
            .clone();

        self.acquire(key, options).then(|| LockGuard {
            registry: self.clone(),
            key: key.to_owned(),
            owner,
        })
    }

    /// Release the lock for `key`, reporting why nothing was released.
    ///
    /// When `owner` is given it has to match the owner the lock was taken with.
    pub fn release_checked(&self, key: &str, owner: Option<&str>) -> Result<(), LockError> {
        let mut state = self.inner.state();
        state.evict_expired(key, Instant::now());

        let record = state.locks.get(key).ok_or_else(|| LockError::NotLocked {
            key: key.to_owned(),
        })?;

        if !record.owned_by(owner) {
            warn!(
                key,
                expected = ?record.owner,
                actual = ?owner,
                "refusing to release lock held by another owner"
            );
            return Err(LockError::OwnerMismatch {
                key: key.to_owned(),
                expected: record.owner.clone(),
                actual: owner.map(str::to_owned),
            });
        }

        if let Some(mut record) = state.locks.remove(key) {
            record.cancel_expiry();
        }
        debug!(key, "lock released");

        Ok(())
    }

    /// Release the lock for `key`.
    ///
    /// Unheld keys are ignored and an owner mismatch only logs a warning.
    /// Use `release_checked` to learn the outcome.
    pub fn release(&self, key: &str, owner: Option<&str>) {
        let _ = self.release_checked(key, owner);
    }

    /// Release the lock for `key` whoever holds it.
    pub fn force_release(&self, key: &str) {
        if let Some(mut record) = self.inner.state().locks.remove(key) {
            record.cancel_expiry();
            debug!(key, owner = ?record.owner, "lock force released");
        }
    }

    /// Re-arm the auto-expiry of a held lock, counting `timeout` from now.
    ///
    /// A zero `timeout`, or one too large to represent, makes the lock
    /// permanent.
    pub fn extend(&self, key: &str, owner: Option<&str>, timeout: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let mut state = self.inner.state();
        state.evict_expired(key, now);
        let generation = state.next_generation();

        let record = state.locks.get_mut(key).ok_or_else(|| LockError::NotLocked {
            key: key.to_owned(),
        })?;

        if !record.owned_by(owner) {
            warn!(
                key,
                expected = ?record.owner,
                actual = ?owner,
                "refusing to extend lock held by another owner"
            );
            return Err(LockError::OwnerMismatch {
                key: key.to_owned(),
                expected: record.owner.clone(),
                actual: owner.map(str::to_owned),
            });
        }

        record.cancel_expiry();
        record.generation = generation;
        record.deadline = deadline_after(now, timeout);
        if let Some(deadline) = record.deadline {
            record.expiry = self.schedule_expiry(key, generation, deadline);
        }
        debug!(key, ?timeout, "lock extended");

        Ok(())
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.inner.state().live(key, Instant::now()).is_some()
    }

    /// A copy of the lock's details, or `None` if `key` is not held.
    pub fn info(&self, key: &str) -> Option<LockInfo> {
        let now = Instant::now();
        self.inner
            .state()
            .live(key, now)
            .map(|record| record.snapshot(key, now))
    }

    /// Number of locks currently held.
    pub fn count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .state()
            .locks
            .values()
            .filter(|record| !record.is_expired(now))
            .count()
    }

    /// Keys of all locks currently held, in no particular order.
    pub fn list_keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .state()
            .locks
            .iter()
            .filter(|(_, record)| !record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop every lock and cancel all pending expiries.
    ///
    /// Holders are not notified, so this is meant for test teardown and
    /// recovery, not for regular use.
    pub fn clear_all(&self) {
        let mut state = self.inner.state();
        warn!(count = state.locks.len(), "clearing all locks");
        for (_, mut record) in state.locks.drain() {
            record.cancel_expiry();
        }
    }

    /// Resolve once `key` is no longer locked, checking every `poll_interval`.
    ///
    /// There is no upper bound on the wait; see `wait_for_release_timeout`.
    pub async fn wait_for_release(&self, key: &str, poll_interval: Duration) {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        while self.is_locked(key) {
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// `wait_for_release` using the interval from `set_poll_interval`.
    pub async fn wait(&self, key: &str) {
        self.wait_for_release(key, self.poll_interval).await
    }

    /// Like `wait_for_release`, but gives up after `limit`.
    pub async fn wait_for_release_timeout(
        &self,
        key: &str,
        poll_interval: Duration,
        limit: Duration,
    ) -> Result<(), LockError> {
        tokio::time::timeout(limit, self.wait_for_release(key, poll_interval))
            .await
            .map_err(|_| LockError::WaitTimeout {
                key: key.to_owned(),
                waited: limit,
            })
    }

    /// Call `acquire` up to `attempts` times.
    ///
    /// After the n-th failed attempt (zero based) it sleeps
    /// `initial_delay * 2^n` before trying again. No delay follows the last
    /// attempt.
    pub async fn retry_acquire(
        &self,
        key: &str,
        attempts: u32,
        initial_delay: Duration,
        options: LockOptions,
    ) -> bool {
        for attempt in 0..attempts {
            if self.acquire(key, options.clone()) {
                return true;
            }
            if attempt + 1 == attempts {
                debug!(key, attempt, "lock busy, no attempts left");
                break;
            }

            let delay = backoff_delay(initial_delay, attempt);
            debug!(key, attempt, ?delay, "lock busy, retrying");
            tokio::time::sleep(delay).await;
        }

        warn!(key, attempts, "could not acquire lock, retries exhausted");
        false
    }

    /// `retry_acquire` using the settings from `set_retry`.
    pub async fn acquire_with_retry(&self, key: &str, options: LockOptions) -> Result<(), LockError> {
        if self
            .retry_acquire(key, self.retry_count, self.retry_delay, options)
            .await
        {
            Ok(())
        } else {
            Err(LockError::Unavailable {
                key: key.to_owned(),
            })
        }
    }
}

fn backoff_delay(initial_delay: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| initial_delay.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}
