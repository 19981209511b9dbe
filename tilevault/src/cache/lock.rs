//! Advisory tile locks.
//!
//! Locks are stored in the backend medium (a lock file, a memcache/redis key,
//! an S3 object) so they coordinate producers across processes and hosts.
//! Each backend only has to say how to *try* an acquisition and how to
//! *break* a lock; the polling loop, stale detection, and the overall wait
//! bound live here.
//!
//! # Lifecycle
//!
//! ```text
//! Unlocked ──lock()──► Locked(token, acquired_at) ──unlock(token)──► Unlocked
//!                          │
//!                          └── held longer than stale_timeout:
//!                              next lock() breaks it ──► Locked(new token)
//! ```
//!
//! # Fencing
//!
//! Every acquisition gets a fresh [`LockToken`] which is stored with the lock.
//! Unlocking compares the stored token first, so a producer whose lock was
//! broken cannot release the lock now held by its successor. Writes are not
//! fenced: a slow producer can still overwrite the tile body after its lock
//! was broken, which is harmless for last-writer-wins tile bodies.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::cache::key::TileKey;
use crate::cache::traits::CacheError;

/// Default stale-lock timeout for a layer.
pub const DEFAULT_STALE_LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default delay between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default wait bound, as a multiple of the stale-lock timeout.
pub const DEFAULT_PATIENCE: u32 = 2;

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifies one lock acquisition.
///
/// Tokens are unique per acquisition within a process and, through the pid
/// and timestamp components, across processes sharing a backend.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LockToken(Arc<str>);

impl LockToken {
    /// Generate a fresh token.
    pub fn generate() -> Self {
        let seq = TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self(format!("{:x}-{:x}-{:x}", std::process::id(), seq, nanos).into())
    }

    /// Rebuild a token from the value stored in a backend.
    pub(crate) fn from_stored(value: &str) -> Self {
        Self(value.trim().into())
    }

    /// Token as stored in the backend.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({})", self.0)
    }
}

/// Polling behavior for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Delay between attempts while the lock is held by someone else.
    pub poll_interval: Duration,
    /// Give up after `patience * stale_timeout` of waiting.
    pub patience: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            patience: DEFAULT_PATIENCE,
        }
    }
}

impl LockPolicy {
    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the patience multiplier (minimum 1).
    pub fn with_patience(mut self, patience: u32) -> Self {
        self.patience = patience.max(1);
        self
    }

    /// Longest time `lock()` waits before failing with `LockTimeout`.
    ///
    /// Always at least one poll interval past the stale timeout, so a stale
    /// lock gets broken before the caller gives up.
    pub fn max_wait(&self, stale_timeout: Duration) -> Duration {
        stale_timeout.saturating_mul(self.patience.max(1)) + self.poll_interval
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone)]
pub(crate) enum LockAttempt {
    /// The lock is now ours.
    Acquired,
    /// Someone else holds it.
    Held {
        /// Token of the current holder, when the backend can report it.
        holder: Option<LockToken>,
        /// Age of the current lock, when the backend can report it.
        age: Option<Duration>,
    },
}

/// Backend-specific lock primitives.
///
/// `try_acquire` must be atomic with respect to other callers where the
/// medium allows it (exclusive create, `add`, `SET NX`). `break_lock` removes
/// the lock, but only if it is still held by `holder` when one is given.
pub(crate) trait LockMedium: Sync {
    fn try_acquire(
        &self,
        key: &TileKey,
        token: &LockToken,
        stale_timeout: Duration,
    ) -> impl Future<Output = Result<LockAttempt, CacheError>> + Send;

    fn break_lock(
        &self,
        key: &TileKey,
        holder: Option<&LockToken>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}

/// Acquire a lock on `key`, polling until it is free or stale.
///
/// A lock is stale once its age exceeds `stale_timeout`. The age is the one
/// the backend reports, or else how long we have watched the same holder.
/// Stale locks are broken once per observation; if a competing caller wins
/// the re-acquisition race we go back to waiting on the new holder. Fails
/// with [`CacheError::LockTimeout`] after [`LockPolicy::max_wait`].
pub(crate) async fn acquire<M: LockMedium>(
    medium: &M,
    key: &TileKey,
    stale_timeout: Duration,
    policy: &LockPolicy,
) -> Result<LockToken, CacheError> {
    let token = LockToken::generate();
    let started = Instant::now();
    let deadline = started + policy.max_wait(stale_timeout);

    // Holder seen on the last poll and when we first saw it; a different
    // holder restarts the observation clock
    let mut observed_holder: Option<Option<LockToken>> = None;
    let mut observing_since = started;
    let mut just_broke = false;

    loop {
        match medium.try_acquire(key, &token, stale_timeout).await? {
            LockAttempt::Acquired => {
                debug!(
                    key = %key,
                    token = %token,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Lock acquired"
                );
                return Ok(token);
            }
            LockAttempt::Held { holder, age } => {
                if observed_holder.as_ref() != Some(&holder) {
                    observing_since = Instant::now();
                    observed_holder = Some(holder.clone());
                }
                let age = age.unwrap_or_else(|| observing_since.elapsed());

                if !just_broke && age > stale_timeout {
                    warn!(
                        key = %key,
                        holder = ?holder,
                        age_ms = age.as_millis() as u64,
                        "Breaking stale lock"
                    );
                    medium.break_lock(key, holder.as_ref()).await?;
                    observed_holder = None;
                    observing_since = Instant::now();
                    just_broke = true;
                    continue;
                }
            }
        }

        just_broke = false;

        if Instant::now() >= deadline {
            return Err(CacheError::LockTimeout {
                key: key.to_string(),
                waited: started.elapsed(),
            });
        }

        tokio::time::sleep(policy.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::TileCoord;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn test_key() -> TileKey {
        TileKey::new("roads", TileCoord::new(12, 656, 1582).unwrap(), "png").unwrap()
    }

    /// Single-slot lock medium recording how often locks were broken.
    #[derive(Default)]
    struct SlotMedium {
        slot: Mutex<Option<(LockToken, Instant)>>,
        breaks: AtomicU64,
        report_age: bool,
    }

    impl LockMedium for SlotMedium {
        fn try_acquire(
            &self,
            _key: &TileKey,
            token: &LockToken,
            _stale_timeout: Duration,
        ) -> impl Future<Output = Result<LockAttempt, CacheError>> + Send {
            let mut slot = self.slot.lock().unwrap();
            let attempt = match slot.as_ref() {
                None => {
                    *slot = Some((token.clone(), Instant::now()));
                    LockAttempt::Acquired
                }
                Some((holder, at)) => LockAttempt::Held {
                    holder: Some(holder.clone()),
                    age: self.report_age.then(|| at.elapsed()),
                },
            };
            std::future::ready(Ok(attempt))
        }

        fn break_lock(
            &self,
            _key: &TileKey,
            holder: Option<&LockToken>,
        ) -> impl Future<Output = Result<(), CacheError>> + Send {
            let mut slot = self.slot.lock().unwrap();
            let matches = match (slot.as_ref(), holder) {
                (Some((current, _)), Some(h)) => current == h,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                *slot = None;
                self.breaks.fetch_add(1, Ordering::Relaxed);
            }
            std::future::ready(Ok(()))
        }
    }

    fn fast_policy() -> LockPolicy {
        LockPolicy::default().with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_tokens_are_unique() {
        let tokens: HashSet<LockToken> = (0..1000).map(|_| LockToken::generate()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_token_from_stored_trims() {
        let token = LockToken::from_stored("abc-1-2\n");
        assert_eq!(token.as_str(), "abc-1-2");
    }

    #[test]
    fn test_policy_max_wait() {
        let policy = LockPolicy::default();
        assert_eq!(
            policy.max_wait(Duration::from_secs(15)),
            Duration::from_secs(30) + DEFAULT_POLL_INTERVAL
        );

        let policy = policy.with_patience(0);
        assert_eq!(policy.patience, 1);
    }

    #[tokio::test]
    async fn test_acquire_free_lock() {
        let medium = SlotMedium::default();
        let token = acquire(&medium, &test_key(), Duration::from_secs(1), &fast_policy())
            .await
            .unwrap();

        let slot = medium.slot.lock().unwrap();
        assert_eq!(slot.as_ref().map(|(t, _)| t.clone()), Some(token));
    }

    #[tokio::test]
    async fn test_acquire_breaks_stale_lock_by_age() {
        let medium = SlotMedium {
            report_age: true,
            ..Default::default()
        };
        let old = LockToken::generate();
        *medium.slot.lock().unwrap() = Some((old.clone(), Instant::now()));
        std::thread::sleep(Duration::from_millis(30));

        let token = acquire(&medium, &test_key(), Duration::from_millis(20), &fast_policy())
            .await
            .unwrap();

        assert_ne!(token, old);
        assert_eq!(medium.breaks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_acquire_breaks_lock_after_observing_stale_timeout() {
        // Backend can't report age, so staleness is measured by waiting
        let medium = SlotMedium::default();
        *medium.slot.lock().unwrap() = Some((LockToken::generate(), Instant::now()));

        let stale = Duration::from_millis(50);
        let started = Instant::now();
        let result = acquire(&medium, &test_key(), stale, &fast_policy()).await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= stale);
        assert_eq!(medium.breaks.load(Ordering::Relaxed), 1);
    }

    /// Hold the lock as `first`, hand it to a fresh holder partway through
    /// a waiter's stale timeout, and return how long after the handoff the
    /// waiter got the lock.
    async fn wait_through_handoff(report_age: bool) -> (Duration, u64) {
        let medium = Arc::new(SlotMedium {
            report_age,
            ..Default::default()
        });
        *medium.slot.lock().unwrap() = Some((LockToken::generate(), Instant::now()));

        let stale = Duration::from_millis(200);
        let waiter = {
            let medium = Arc::clone(&medium);
            tokio::spawn(async move {
                acquire(medium.as_ref(), &test_key(), stale, &fast_policy())
                    .await
                    .map(|_| Instant::now())
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let handoff = Instant::now();
        *medium.slot.lock().unwrap() = Some((LockToken::generate(), handoff));

        let acquired_at = waiter.await.unwrap().unwrap();
        (
            acquired_at.duration_since(handoff),
            medium.breaks.load(Ordering::Relaxed),
        )
    }

    #[tokio::test]
    async fn test_new_holder_restarts_observed_staleness() {
        let (after_handoff, breaks) = wait_through_handoff(false).await;

        assert!(after_handoff >= Duration::from_millis(200));
        assert_eq!(breaks, 1);
    }

    #[tokio::test]
    async fn test_reported_age_of_new_holder_is_trusted() {
        let (after_handoff, breaks) = wait_through_handoff(true).await;

        assert!(after_handoff >= Duration::from_millis(200));
        assert_eq!(breaks, 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_break_is_always_lost() {
        /// Medium whose lock is immediately re-taken by a competitor.
        struct Contended;

        impl LockMedium for Contended {
            fn try_acquire(
                &self,
                _key: &TileKey,
                _token: &LockToken,
                _stale_timeout: Duration,
            ) -> impl Future<Output = Result<LockAttempt, CacheError>> + Send {
                std::future::ready(Ok(LockAttempt::Held {
                    holder: None,
                    age: Some(Duration::ZERO),
                }))
            }

            fn break_lock(
                &self,
                _key: &TileKey,
                _holder: Option<&LockToken>,
            ) -> impl Future<Output = Result<(), CacheError>> + Send {
                std::future::ready(Ok(()))
            }
        }

        let stale = Duration::from_millis(20);
        let policy = fast_policy();
        let result = acquire(&Contended, &test_key(), stale, &policy).await;

        match result {
            Err(CacheError::LockTimeout { waited, .. }) => {
                assert!(waited >= policy.max_wait(stale));
            }
            other => panic!("expected LockTimeout, got {:?}", other),
        }
    }
}
