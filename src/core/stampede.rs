use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::error::{CacheError, Result};
use super::types::CacheKey;

/// Per-key mutual exclusion against cache stampedes.
///
/// When many callers miss on the same key at once, `acquire` admits
/// exactly one of them as leader; the rest block on a condition variable
/// until the leader releases. A successful release turns the waiters into
/// followers, who re-read the now-populated entry; a failed release wakes
/// them to contend for leadership of the next generation. There is no
/// fairness guarantee among waiters, only single-leadership per
/// generation.
///
/// The wait queue is scoped to one process: all clones of an open cache
/// handle share it. Handles in other processes stay individually correct
/// through the transactional index, they just cannot join this queue.
#[derive(Default)]
pub struct StampedeBarrier {
    keys: Mutex<HashMap<CacheKey, Arc<KeyBarrier>>>,
}

/// Outcome of a barrier acquisition
pub enum Acquired<'a> {
    /// This caller computes the value and must release the guard
    Leader(LeaderGuard<'a>),
    /// Another caller stored the value; re-read the cache
    Follower,
}

#[derive(Default)]
struct KeyBarrier {
    state: Mutex<KeyState>,
    cond: Condvar,
}

#[derive(Default)]
struct KeyState {
    /// A leader currently holds the barrier
    busy: bool,
    /// Bumped on every release so waiters can tell their leader finished
    generation: u64,
    /// Whether the last release was a successful completion
    last_success: bool,
    waiters: usize,
}

impl StampedeBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until this caller either becomes leader for `key` or a
    /// concurrent leader completes successfully. `timeout` bounds the
    /// total wait; exceeding it yields `Timeout` rather than silent
    /// leadership.
    pub fn acquire(&self, key: &CacheKey, timeout: Option<Duration>) -> Result<Acquired<'_>> {
        let barrier = {
            let mut keys = self.keys.lock();
            Arc::clone(keys.entry(key.clone()).or_default())
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = barrier.state.lock();
        loop {
            if !state.busy {
                state.busy = true;
                drop(state);
                debug!(key = ?key, "acquired stampede barrier as leader");
                return Ok(Acquired::Leader(LeaderGuard {
                    owner: self,
                    key: key.clone(),
                    barrier: Arc::clone(&barrier),
                    done: false,
                }));
            }

            let generation = state.generation;
            state.waiters += 1;
            let mut timed_out = false;
            while state.generation == generation && !timed_out {
                match deadline {
                    Some(deadline) => {
                        timed_out = barrier.cond.wait_until(&mut state, deadline).timed_out();
                    }
                    None => barrier.cond.wait(&mut state),
                }
            }
            state.waiters -= 1;

            if state.generation == generation {
                // Still the same leader after the deadline passed.
                drop(state);
                self.release_slot(key);
                return Err(CacheError::Timeout);
            }
            if state.last_success {
                drop(state);
                self.release_slot(key);
                return Ok(Acquired::Follower);
            }
            // Leader failed; loop around and contend for leadership.
        }
    }

    /// Drop the per-key wait state once nobody holds or waits on it
    fn release_slot(&self, key: &CacheKey) {
        let mut keys = self.keys.lock();
        if let Some(barrier) = keys.get(key) {
            let state = barrier.state.lock();
            if !state.busy && state.waiters == 0 {
                drop(state);
                keys.remove(key);
            }
        }
    }
}

/// Exclusive right to compute and store the value for one key.
///
/// Call `complete` after the value is stored; dropping the guard without
/// completing signals failure and wakes waiters to retry leadership.
pub struct LeaderGuard<'a> {
    owner: &'a StampedeBarrier,
    key: CacheKey,
    barrier: Arc<KeyBarrier>,
    done: bool,
}

impl LeaderGuard<'_> {
    /// Release the barrier, unblocking followers to re-read the entry
    pub fn complete(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, success: bool) {
        if self.done {
            return;
        }
        self.done = true;
        {
            let mut state = self.barrier.state.lock();
            state.busy = false;
            state.generation = state.generation.wrapping_add(1);
            state.last_success = success;
            self.barrier.cond.notify_all();
        }
        self.owner.release_slot(&self.key);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.finish(false);
    }
}
