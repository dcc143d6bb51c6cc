//! Parking-lot based mutual exclusion primitives for process-local thread
//! synchronization, with optional deadlock detection.
//!
//! This crate provides two mutex families, each in a plain and in a deadlock
//! detecting flavour:
//!
//! - [`Mutex`] is a compact, contention-sensitive lock. The uncontended path
//!   is a single compare-and-swap on a word-sized state; contended threads
//!   flag the lock word and go to sleep on the process-wide parking lot. The
//!   release path wakes exactly one sleeper, which then races for the lock
//!   again ("wake one, try again"). No ordering is promised among contenders.
//!
//! - [`FairMutex`] is a strictly FIFO lock. A releasing thread does not
//!   reopen the race: it transfers ownership directly to the longest waiting
//!   thread with a single compare-and-swap that simultaneously decrements
//!   the waiter count. Waiters acquire in exactly the order in which they
//!   announced themselves.
//!
//! - [`DeadlockSafeMutex`] and [`FairDeadlockSafeMutex`] additionally record
//!   holder identity and per-thread wait state, allowing cycles in the
//!   wait-for graph to be diagnosed. A thread whose wait is aborted receives
//!   [`Deadlocked`] from `lock` instead of blocking forever. The plain
//!   flavour runs the check in-line from a waiter's own park timeout, while
//!   the fair flavour exposes an explicit [`fair::detect_deadlocks`] sweep.
//!
//! # Thread parking
//!
//! Blocked threads do not spin indefinitely. Both families integrate with
//! [`parking_lot_core`], sleeping on a wait queue keyed by the lock address.
//! The memory cost of a lock is therefore a single word (plus the protected
//! data), no matter how many threads contend on it.
//!
//! # Thread registry
//!
//! Locks that track holder identity (both fair flavours and
//! [`DeadlockSafeMutex`]) identify threads by a small dense integer managed
//! by the [`registry`] module. Ids are claimed on a thread's first
//! acquisition and recycled when it exits. At most [`registry::MAX_THREADS`]
//! threads may hold or wait on such locks concurrently.
//!
//! # Deadlock recovery
//!
//! A [`Deadlocked`] return is a contract, not an exception: the caller does
//! not hold the lock and must not unlock it. The lock that could not be
//! acquired remains held by another cycle participant, and any locks the
//! failed caller already holds remain its own. Recovery (typically releasing
//! held locks and retrying) is the caller's responsibility; `lock` never
//! retries internally after a deadlock verdict.
//!
//! # Examples
//!
//! Plain mutual exclusion:
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use detlock::Mutex;
//!
//! let data: Arc<Mutex<i32>> = Arc::new(Mutex::new(0));
//! let handles: Vec<_> = (0..4)
//!     .map(|_| {
//!         let data = Arc::clone(&data);
//!         thread::spawn(move || *data.lock() += 1)
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! assert_eq!(*data.lock(), 4);
//! ```
//!
//! Surviving a deadlock:
//!
//! ```
//! use detlock::{Deadlocked, FairDeadlockSafeMutex};
//!
//! let mutex = FairDeadlockSafeMutex::new(String::from("shared"));
//! match mutex.lock() {
//!     Ok(guard) => assert_eq!(&*guard, "shared"),
//!     Err(Deadlocked) => unreachable!("a single thread cannot deadlock"),
//! };
//! ```

use core::fmt;

pub mod fair;
pub mod mutex;
pub mod registry;
pub mod relax;

#[cfg(test)]
mod test;

pub use fair::{
    FairDeadlockSafeMutex, FairDeadlockSafeMutexGuard, FairMutex, FairMutexGuard,
    RawFairDeadlockSafeMutex, RawFairMutex,
};
pub use mutex::{
    DeadlockSafeMutex, DeadlockSafeMutexGuard, Mutex, MutexGuard, RawDeadlockSafeMutex, RawMutex,
};

/// The error returned by the `lock` operation of the deadlock detecting
/// mutex flavours when the calling thread was selected as the victim of a
/// wait-for cycle.
///
/// The caller did **not** acquire the lock and must not attempt to unlock
/// it. Locks already held by the caller are unaffected; releasing them is
/// what actually resolves the cycle for the remaining participants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadlocked;

impl fmt::Display for Deadlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("lock acquisition would have deadlocked")
    }
}

impl std::error::Error for Deadlocked {}
