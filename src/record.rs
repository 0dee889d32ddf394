use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Caller-supplied context attached to a lock. Never interpreted by the registry.
pub type Metadata = HashMap<String, String>;

/// Parameters for acquiring a lock.
///
/// The default is a lock that never expires, carries no metadata and has no
/// owner (so any caller may release it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Auto-release the lock after this long. `Duration::ZERO` disables expiry.
    pub timeout: Duration,
    pub metadata: Metadata,
    /// Holder identity checked by `LockRegistry::release`.
    pub owner: Option<String>,
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a single metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Snapshot of a held lock, as returned by `LockRegistry::info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: String,
    pub acquired_at: SystemTime,
    pub metadata: Metadata,
    pub owner: Option<String>,
    /// Time left until auto-expiry, `None` if the lock never expires.
    pub expires_in: Option<Duration>,
}

/// A live entry in the registry map.
///
/// The expiry task handle stays private to the registry so nobody else can
/// cancel the timer.
#[derive(Debug)]
pub(crate) struct LockRecord {
    pub(crate) acquired_at: SystemTime,
    pub(crate) metadata: Metadata,
    pub(crate) owner: Option<String>,
    /// Distinguishes successive records under the same key.
    pub(crate) generation: u64,
    pub(crate) deadline: Option<Instant>,
    pub(crate) expiry: Option<AbortHandle>,
}

impl LockRecord {
    pub(crate) fn new(options: LockOptions, generation: u64) -> Self {
        let deadline = deadline_after(Instant::now(), options.timeout);

        LockRecord {
            acquired_at: SystemTime::now(),
            metadata: options.metadata,
            owner: options.owner,
            generation,
            deadline,
            expiry: None,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now)
    }

    /// An owner given at release time must match the stored one.
    /// `None` skips the check.
    pub(crate) fn owned_by(&self, owner: Option<&str>) -> bool {
        match owner {
            None => true,
            Some(owner) => self.owner.as_deref() == Some(owner),
        }
    }

    /// Abort the pending expiry task, if any. Safe to call more than once.
    pub(crate) fn cancel_expiry(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
    }

    pub(crate) fn snapshot(&self, key: &str, now: Instant) -> LockInfo {
        LockInfo {
            key: key.to_owned(),
            acquired_at: self.acquired_at,
            metadata: self.metadata.clone(),
            owner: self.owner.clone(),
            expires_in: self
                .deadline
                .map(|deadline| deadline.saturating_duration_since(now)),
        }
    }
}

/// When a lock taken at `now` with `timeout` expires.
///
/// `None` for a zero timeout, and for one too large to represent, which then
/// never expires.
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        return None;
    }
    now.checked_add(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = LockOptions::new()
            .timeout(Duration::from_secs(10))
            .owner("w1")
            .meta("order", "ORD-1001");

        assert_eq!(Duration::from_secs(10), options.timeout);
        assert_eq!(Some("w1"), options.owner.as_deref());
        assert_eq!(
            Some("ORD-1001"),
            options.metadata.get("order").map(String::as_str)
        );
    }

    #[test]
    fn test_default_options_never_expire() {
        let options = LockOptions::default();
        assert!(options.timeout.is_zero());
        assert!(options.owner.is_none());
        assert!(options.metadata.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_deadline() {
        let permanent = LockRecord::new(LockOptions::default(), 0);
        assert!(permanent.deadline.is_none());
        assert!(!permanent.is_expired(Instant::now() + Duration::from_secs(3600)));

        let timed = LockRecord::new(LockOptions::new().timeout(Duration::from_millis(50)), 1);
        assert!(!timed.is_expired(Instant::now()));
        assert!(timed.is_expired(Instant::now() + Duration::from_millis(50)));
    }

    #[test]
    fn test_deadline_after() {
        let now = Instant::now();

        assert_eq!(None, deadline_after(now, Duration::ZERO));
        assert_eq!(
            Some(now + Duration::from_secs(1)),
            deadline_after(now, Duration::from_secs(1))
        );
        assert_eq!(None, deadline_after(now, Duration::MAX));
        assert_eq!(None, deadline_after(now, Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn test_owned_by() {
        let record = LockRecord::new(LockOptions::new().owner("w1"), 0);
        assert!(record.owned_by(None));
        assert!(record.owned_by(Some("w1")));
        assert!(!record.owned_by(Some("w2")));

        let anonymous = LockRecord::new(LockOptions::default(), 0);
        assert!(anonymous.owned_by(None));
        assert!(!anonymous.owned_by(Some("w1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_remaining_time() {
        let now = Instant::now();
        let record = LockRecord::new(
            LockOptions::new()
                .timeout(Duration::from_millis(500))
                .owner("w1"),
            3,
        );

        let info = record.snapshot("job", now + Duration::from_millis(200));
        assert_eq!("job", info.key);
        assert_eq!(Some("w1"), info.owner.as_deref());
        assert_eq!(Some(Duration::from_millis(300)), info.expires_in);
    }
}
