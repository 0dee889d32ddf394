//! A registry of named, in-process locks.
//!
//! Tasks sharing one process coordinate on string keys: whoever acquires a
//! key first holds it until it releases the lock, the lock's timeout elapses,
//! or somebody force-releases it.
//!
//! # Example
//! ```
//! # use std::time::Duration;
//! use keylock::{LockOptions, LockRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = LockRegistry::new();
//! let options = LockOptions::new()
//!     .timeout(Duration::from_secs(10))
//!     .owner("worker-1");
//!
//! assert!(registry.acquire("invoice:ORD-1001", options));
//! assert!(!registry.acquire("invoice:ORD-1001", LockOptions::default()));
//!
//! // only the owner may release it
//! registry.release("invoice:ORD-1001", Some("worker-2"));
//! assert!(registry.is_locked("invoice:ORD-1001"));
//!
//! registry.release("invoice:ORD-1001", Some("worker-1"));
//! registry.wait_for_release("invoice:ORD-1001", Duration::from_millis(100)).await;
//! # }
//! ```

mod lock;
mod record;

pub use crate::lock::{
    LockError, LockGuard, LockRegistry, DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_DELAY,
};
pub use crate::record::{LockInfo, LockOptions, Metadata};
