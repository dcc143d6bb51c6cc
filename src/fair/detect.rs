//! The wait-for cycle detector for the fair deadlock-safe lock.
//!
//! The graph is never materialized. Each sweep takes a snapshot of two maps,
//! `waiters: thread → (lock, episode token)` from the published wait-info
//! slots and `holders: lock → thread` from the observed lock words, and
//! walks them alternately. A snapshot entry is only recorded for threads
//! that are confirmed parked (their node is found in the lock's queue), so
//! threads that announced but never slept, or already resumed, cannot fake
//! an edge.

use core::sync::atomic::Ordering::SeqCst;
use std::collections::HashMap;

use parking_lot_core::{FilterOp, ParkToken, DEFAULT_UNPARK_TOKEN};

use crate::registry::{ThreadId, INVALID_THREAD_ID};

use super::raw::{RawFairDeadlockSafeMutex, WaitNodeData, WAIT_INFO};

/// Scans for deadlocked threads among all [`FairDeadlockSafeMutex`] waiters
/// and unblocks one victim per cycle found.
///
/// Sweeps repeat until a sweep breaks nothing; the return value is the
/// number of cycles broken. Each victim resumes with
/// [`Err(Deadlocked)`](crate::Deadlocked) from its `lock` call; the other
/// cycle participants keep waiting and make progress once the victim's
/// caller releases the locks it still holds.
///
/// The victim of a cycle is the thread whose wait began last. A cycle whose
/// participants moved between snapshot and verification is skipped, and a
/// victim that finished its wait before the break step is left alone (the
/// per-episode token makes the break a no-op), so a sweep never aborts a
/// wait that is not part of a still-standing cycle.
///
/// Sweeping from a dedicated monitor thread and sweeping on demand from a
/// suspicious caller are both fine; concurrent sweeps are safe.
///
/// [`FairDeadlockSafeMutex`]: crate::fair::FairDeadlockSafeMutex
pub fn detect_deadlocks() -> usize {
    let mut detector = DeadlockDetector::new();
    let mut broken = 0;
    while detector.run() {
        broken += 1;
    }
    broken
}

/// A lock-to-holder edge is keyed by lock address; thread-to-lock edges
/// remember the wait episode they were observed in.
#[derive(Clone, Copy)]
struct WaiterInfo {
    lock: *const RawFairDeadlockSafeMutex,
    wait_token: u64,
}

type LockCycle = HashMap<ThreadId, *const RawFairDeadlockSafeMutex>;

struct DeadlockDetector {
    waiters: HashMap<ThreadId, WaiterInfo>,
    holders: HashMap<*const RawFairDeadlockSafeMutex, ThreadId>,
}

impl DeadlockDetector {
    fn new() -> Self {
        Self { waiters: HashMap::new(), holders: HashMap::new() }
    }

    /// One sweep: returns `true` after breaking one cycle, `false` when the
    /// snapshot contains none.
    fn run(&mut self) -> bool {
        self.gather_waiters_and_holders();

        for (&tid, info) in &self.waiters {
            let cycle = self.find_cycle(tid, info.lock);
            if self.verify_and_break(&cycle) {
                return true;
            }
        }
        false
    }

    /// Snapshot phase: record an edge pair per thread that is announced
    /// *and* parked on a lock that is actually held.
    fn gather_waiters_and_holders(&mut self) {
        self.waiters.clear();
        self.holders.clear();

        for (tid, info) in WAIT_INFO.iter().enumerate() {
            let lock = info.waiting_on.load(SeqCst) as *const RawFairDeadlockSafeMutex;
            let wait_token = info.wait_token.load(SeqCst);
            if lock.is_null() {
                continue;
            }
            let tid = tid as ThreadId;

            let filter = |token: ParkToken| {
                // SAFETY: the queue lock is held and the token belongs to
                // this lock family's queue.
                let node = unsafe { WaitNodeData::deref(token) };
                if node.tid != tid {
                    return FilterOp::Skip;
                }
                // SAFETY: a lock published in a wait-info slot is alive for
                // the duration of the episode, and this thread's node is in
                // its queue right now.
                let word = unsafe { (*lock).read_word() };
                if word.is_locked() {
                    self.waiters.insert(tid, WaiterInfo { lock, wait_token });
                    self.holders.insert(lock, word.holder);
                }
                FilterOp::Stop
            };
            // Visit without waking anybody: every node is retained.
            // SAFETY: the callbacks do not panic or re-enter the parking
            // lot.
            unsafe {
                parking_lot_core::unpark_filter(lock as usize, filter, |_| DEFAULT_UNPARK_TOKEN);
            }
        }
    }

    /// Walks holder → waited-on lock → holder… from the seed edge. An edge
    /// leading outside the snapshot means the chain ends at a running
    /// thread; revisiting a thread closes a cycle.
    fn find_cycle(
        &self,
        seed_tid: ThreadId,
        seed_lock: *const RawFairDeadlockSafeMutex,
    ) -> LockCycle {
        let mut cycle = LockCycle::new();
        let mut lock = seed_lock;
        cycle.insert(seed_tid, lock);

        loop {
            let Some(&holder) = self.holders.get(&lock) else {
                return LockCycle::new();
            };
            let Some(info) = self.waiters.get(&holder) else {
                // The holder is not waiting on anything, so no deadlock.
                return LockCycle::new();
            };
            lock = info.lock;
            if cycle.contains_key(&holder) {
                return cycle;
            }
            cycle.insert(holder, lock);
        }
    }

    /// Re-validates the whole cycle, then selects and wakes the victim.
    ///
    /// Verification is a pass of its own, completed before any victim
    /// choice, so the victim is never computed from a partially invalidated
    /// cycle. Returns `true` iff a victim node was flagged and woken.
    fn verify_and_break(&self, cycle: &LockCycle) -> bool {
        if cycle.is_empty() {
            return false;
        }

        for (&tid, &lock) in cycle {
            let current = WAIT_INFO[tid as usize].waiting_on.load(SeqCst);
            if current as *const RawFairDeadlockSafeMutex != lock {
                // A participant moved on; the snapshot is stale.
                return false;
            }
        }

        let victim = select_victim(cycle);
        let victim_info = self.waiters[&victim];

        let mut unparked = false;
        let filter = |token: ParkToken| {
            if unparked {
                return FilterOp::Stop;
            }
            // SAFETY: the queue lock is held and the token belongs to this
            // lock family's queue.
            let node = unsafe { WaitNodeData::deref(token) };
            // Both ids must match: the token pins the verdict to the wait
            // episode the snapshot saw, so a thread that finished that wait
            // and parked again (even on the same lock) is left alone.
            if node.tid == victim && node.wait_token == victim_info.wait_token {
                debug_assert!(!node.is_deadlocked());
                node.mark_deadlocked();
                unparked = true;
                FilterOp::Unpark
            } else {
                FilterOp::Skip
            }
        };
        // SAFETY: the callbacks do not panic or re-enter the parking lot.
        unsafe {
            parking_lot_core::unpark_filter(victim_info.lock as usize, filter, |_| {
                DEFAULT_UNPARK_TOKEN
            });
        }
        unparked
    }
}

/// Picks the cycle participant whose wait began last; ties and the initial
/// sentinel resolve to the first participant seen.
fn select_victim(cycle: &LockCycle) -> ThreadId {
    let mut latest_start = 0;
    let mut victim = INVALID_THREAD_ID;
    for &tid in cycle.keys() {
        let start = WAIT_INFO[tid as usize].wait_start.load(SeqCst);
        if victim == INVALID_THREAD_ID || latest_start < start {
            latest_start = start;
            victim = tid;
        }
    }
    victim
}
