//! Lease-based distributed lock protocol.
//!
//! Every adapter expresses one attempt as a closure over its own atomic
//! create-if-absent primitive; [`acquire_with_retry`] supplies the bounded,
//! randomized retry loop around it. State lives only in the backend.

use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::debug;
use rand::Rng;

use crate::config::LockPolicy;
use crate::{DpsError, Result};

/// The result of one lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The caller now owns the lock.
    Acquired,
    /// Someone else holds it; try again after a pause.
    Busy,
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Run `attempt` until it acquires, the attempt budget is spent, or
/// `max_wait` elapses.
pub fn acquire_with_retry<F>(
    what: &str,
    policy: &LockPolicy,
    max_wait: Option<Duration>,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Result<Attempt>,
{
    let started = Instant::now();
    let mut rng = rand::thread_rng();
    let mut tries = 0u32;

    loop {
        if attempt()? == Attempt::Acquired {
            return Ok(());
        }

        tries += 1;
        if tries >= policy.max_attempts {
            return Err(DpsError::LockAcquisition(format!(
                "{what}: gave up after {tries} attempts"
            )));
        }
        if let Some(limit) = max_wait {
            if started.elapsed() > limit {
                return Err(DpsError::LockTimeout(format!(
                    "{what}: not acquired within {:.3}s",
                    limit.as_secs_f64()
                )));
            }
        }

        let pause = rng.gen_range(0..=policy.max_retry_sleep_ms.max(1));
        debug!("{} busy, retry {} in {}ms", what, tries, pause);
        thread::sleep(Duration::from_millis(pause));
    }
}

/// Metadata stored next to a user lock: `useCount_expiry_pid_encodedName`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    #[allow(missing_docs)]
    pub use_count: u32,
    /// Epoch seconds; zero while the lock is not held.
    pub expiry: u64,
    #[allow(missing_docs)]
    pub pid: u32,
    /// Base64 of the lock name.
    pub encoded_name: String,
}

impl LockInfo {
    /// Info for a freshly created, never acquired lock.
    pub fn fresh(encoded_name: impl Into<String>) -> Self {
        LockInfo {
            use_count: 0,
            expiry: 0,
            pid: 0,
            encoded_name: encoded_name.into(),
        }
    }

    #[allow(missing_docs)]
    pub fn format(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.use_count, self.expiry, self.pid, self.encoded_name
        )
    }

    #[allow(missing_docs)]
    pub fn parse(raw: &str) -> Result<Self> {
        let bad = || DpsError::LockInfo(format!("malformed lock info '{raw}'"));
        let mut parts = raw.splitn(4, '_');
        let use_count = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let expiry = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let pid = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let encoded_name = parts.next().ok_or_else(bad)?.to_string();
        Ok(LockInfo {
            use_count,
            expiry,
            pid,
            encoded_name,
        })
    }

    /// True when a recorded lease has run out.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry > 0 && now > self.expiry
    }
}
