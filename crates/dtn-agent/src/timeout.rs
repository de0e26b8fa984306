//! Neighbor presence tracking.
//!
//! [`TimeoutHelper`] keeps one timer per key on a task queue. Refreshing a
//! key pushes its deadline out; a key that is not refreshed within the
//! window is removed and reported with how long it was present.
//!
//! [`ContactArbiter`] decides which of two nodes that see each other at the
//! same time opens the routing exchange.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

use crate::clock::Clock;
use crate::task::{TaskHandle, TaskQueue};

/// Default absence window before a neighbor is considered gone.
pub const DEFAULT_ABSENCE: Duration = Duration::from_secs(20);

pub trait TimeoutHandler<K>: Send + Sync {
    /// A key was refreshed for the first time.
    fn on_inserted(&self, _key: &K) {}

    /// A key expired or was reset. `permanence_ms` is the simulated time
    /// since it was inserted.
    fn on_timeout(&self, key: &K, permanence_ms: u64);
}

struct Entry {
    since_ms: u64,
    generation: u64,
    timer: TaskHandle,
}

struct Inner<K> {
    queue: TaskQueue,
    clock: Clock,
    timeout: Duration,
    handler: Arc<dyn TimeoutHandler<K>>,
    entries: Mutex<HashMap<K, Entry>>,
    generation: AtomicU64,
}

pub struct TimeoutHelper<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for TimeoutHelper<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> TimeoutHelper<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(
        queue: TaskQueue,
        clock: Clock,
        timeout: Duration,
        handler: Arc<dyn TimeoutHandler<K>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                clock,
                timeout,
                handler,
                entries: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Inserts `key` or pushes its deadline out by the full window.
    pub fn refresh(&self, key: K) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = self.arm(key.clone(), generation);

        let inserted = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.timer.cancel();
                    entry.timer = timer;
                    entry.generation = generation;
                    false
                }
                None => {
                    entries.insert(
                        key.clone(),
                        Entry {
                            since_ms: self.inner.clock.now_ms(),
                            generation,
                            timer,
                        },
                    );
                    true
                }
            }
        };

        if inserted {
            trace!(?key, "presence started");
            self.inner.handler.on_inserted(&key);
        }
    }

    /// Expires `key` now, reporting it to the handler. Returns its permanence.
    pub fn reset(&self, key: &K) -> Option<u64> {
        let permanence = self.take(key)?;
        self.inner.handler.on_timeout(key, permanence);
        Some(permanence)
    }

    /// Removes `key` without notifying the handler. Returns its permanence.
    pub fn purge(&self, key: &K) -> Option<u64> {
        self.take(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn take(&self, key: &K) -> Option<u64> {
        let entry = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)?;
        entry.timer.cancel();
        Some(self.inner.clock.now_ms().saturating_sub(entry.since_ms))
    }

    fn arm(&self, key: K, generation: u64) -> TaskHandle {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.schedule(self.inner.timeout, move || {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            let since = {
                let mut entries = inner.entries.lock().unwrap_or_else(|e| e.into_inner());
                match entries.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        entries.remove(&key).map(|e| e.since_ms)
                    }
                    _ => None,
                }
            };
            if let Some(since) = since {
                let permanence = inner.clock.now_ms().saturating_sub(since);
                trace!(?key, permanence, "presence timed out");
                inner.handler.on_timeout(&key, permanence);
            }
            Ok(())
        })
    }
}

// ─── Contact arbitration ─────────────────────────────────────────────────────

/// Breaks the symmetry when two neighbors discover each other at once.
///
/// Both sides hash their own and the peer's identity and compare bits from
/// the least significant upwards: the side holding the first `1` initiates.
/// The loser waits an absence window; if the winner never showed up by then
/// the loser is forced to initiate on its next attempt.
pub struct ContactArbiter {
    local_hash: i32,
    pending: TimeoutHelper<String>,
    forced: Arc<Mutex<HashSet<String>>>,
}

struct ForceOnTimeout {
    forced: Arc<Mutex<HashSet<String>>>,
}

impl TimeoutHandler<String> for ForceOnTimeout {
    fn on_timeout(&self, key: &String, _permanence_ms: u64) {
        self.forced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
    }
}

impl ContactArbiter {
    pub fn new(local: &str, queue: TaskQueue, clock: Clock, timeout: Duration) -> Self {
        let forced = Arc::new(Mutex::new(HashSet::new()));
        let handler = Arc::new(ForceOnTimeout {
            forced: forced.clone(),
        });
        Self {
            local_hash: name_hash(local),
            pending: TimeoutHelper::new(queue, clock, timeout, handler),
            forced,
        }
    }

    /// `true` if this node should initiate the exchange with `peer`.
    pub fn update(&self, peer: &str) -> bool {
        if hash_outranks(self.local_hash, name_hash(peer)) {
            return true;
        }

        let key = peer.to_string();
        let was_forced = self
            .forced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        if was_forced {
            self.pending.purge(&key);
            return true;
        }
        if !self.pending.contains(&key) {
            self.pending.refresh(key);
        }
        false
    }

    /// Forget any pending or forced state for `peer`.
    pub fn remove(&self, peer: &str) {
        let key = peer.to_string();
        self.pending.purge(&key);
        self.forced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }
}

/// `true` if `local` initiates against `peer` without waiting. Equal
/// hashes outrank each other.
pub fn outranks(local: &str, peer: &str) -> bool {
    hash_outranks(name_hash(local), name_hash(peer))
}

fn hash_outranks(local: i32, peer: i32) -> bool {
    let (mine, theirs) = (local as u32, peer as u32);
    let diff = mine ^ theirs;
    diff == 0 || mine & (1 << diff.trailing_zeros()) != 0
}

/// 31-multiplier hash over UTF-16 code units with wrapping arithmetic.
pub fn name_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Sender};

    struct Recorder {
        inserted: Sender<String>,
        expired: Sender<(String, u64)>,
    }

    impl TimeoutHandler<String> for Recorder {
        fn on_inserted(&self, key: &String) {
            let _ = self.inserted.send(key.clone());
        }

        fn on_timeout(&self, key: &String, permanence_ms: u64) {
            let _ = self.expired.send((key.clone(), permanence_ms));
        }
    }

    fn helper(timeout_ms: u64) -> (
        TimeoutHelper<String>,
        crossbeam_channel::Receiver<String>,
        crossbeam_channel::Receiver<(String, u64)>,
        TaskQueue,
    ) {
        let (itx, irx) = unbounded();
        let (etx, erx) = unbounded();
        let queue = TaskQueue::new("timeout-test");
        let helper = TimeoutHelper::new(
            queue.clone(),
            Clock::new(1.0),
            Duration::from_millis(timeout_ms),
            Arc::new(Recorder {
                inserted: itx,
                expired: etx,
            }),
        );
        (helper, irx, erx, queue)
    }

    #[test]
    fn expires_after_window() {
        let (helper, inserted, expired, queue) = helper(50);
        helper.refresh("a".into());
        assert_eq!(inserted.try_recv().unwrap(), "a");
        let (key, permanence) = expired.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(key, "a");
        assert!(permanence >= 40);
        assert!(!helper.contains(&"a".to_string()));
        queue.shutdown();
    }

    #[test]
    fn refresh_postpones_expiry() {
        let (helper, inserted, expired, queue) = helper(80);
        helper.refresh("a".into());
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            helper.refresh("a".into());
        }
        assert!(expired.try_recv().is_err());
        assert_eq!(inserted.len(), 1);
        let (_, permanence) = expired.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(permanence >= 160);
        assert!(expired.recv_timeout(Duration::from_millis(150)).is_err());
        queue.shutdown();
    }

    #[test]
    fn reset_fires_now_and_purge_is_silent() {
        let (helper, _inserted, expired, queue) = helper(10_000);
        helper.refresh("a".into());
        helper.refresh("b".into());

        assert!(helper.reset(&"a".to_string()).is_some());
        assert_eq!(expired.try_recv().unwrap().0, "a");

        assert!(helper.purge(&"b".to_string()).is_some());
        assert!(expired.try_recv().is_err());
        assert!(helper.keys().is_empty());
        assert_eq!(helper.reset(&"b".to_string()), None);
        queue.shutdown();
    }

    #[test]
    fn name_hash_matches_string_hash() {
        assert_eq!(name_hash(""), 0);
        assert_eq!(name_hash("a"), 97);
        assert_eq!(name_hash("ab"), 97 * 31 + 98);
        assert_eq!(name_hash("hello"), 99_162_322);
    }

    #[test]
    fn exactly_one_side_wins() {
        let queue = TaskQueue::new("arbiter");
        let clock = Clock::new(1.0);
        let window = Duration::from_secs(60);
        let a = ContactArbiter::new("dtn://alpha", queue.clone(), clock.clone(), window);
        let b = ContactArbiter::new("dtn://beta", queue.clone(), clock, window);
        assert_ne!(a.update("dtn://beta"), b.update("dtn://alpha"));
        assert_eq!(a.update("dtn://beta"), outranks("dtn://alpha", "dtn://beta"));
        queue.shutdown();
    }

    #[test]
    fn loser_is_forced_after_timeout() {
        let queue = TaskQueue::new("arbiter-force");
        let clock = Clock::new(1.0);
        let window = Duration::from_millis(40);
        let a = ContactArbiter::new("dtn://alpha", queue.clone(), clock.clone(), window);
        let b = ContactArbiter::new("dtn://beta", queue.clone(), clock, window);
        let (loser, peer) = if a.update("dtn://beta") {
            (&b, "dtn://alpha")
        } else {
            (&a, "dtn://beta")
        };

        assert!(!loser.update(peer));
        std::thread::sleep(Duration::from_millis(120));
        queue.post_and_wait(|| ()).unwrap();
        assert!(loser.update(peer));
        queue.shutdown();
    }

    #[test]
    fn collision_lets_both_initiate() {
        let queue = TaskQueue::new("arbiter-same");
        let arbiter = ContactArbiter::new("x", queue.clone(), Clock::new(1.0), DEFAULT_ABSENCE);
        assert!(arbiter.update("x"));
        queue.shutdown();
    }
}
