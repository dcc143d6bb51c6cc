//! A strictly FIFO mutex family with direct ownership handoff.
//!
//! The lock word is a `(holder, waiter count)` pair updated as one atomic
//! unit. A contender announces itself by incrementing the waiter count and
//! parks; the releasing thread never reopens the race, it transfers
//! ownership straight to the longest-waiting parked thread with a single
//! compare-and-swap that also consumes that thread's waiter slot. Among
//! threads that successfully announce, acquisition order is exactly
//! announcement order.
//!
//! Two flavours are provided:
//!
//! - [`FairMutex`]: the plain lock, an alias over [`lock_api::Mutex`] with
//!   [`RawFairMutex`] underneath. Infallible `lock`; also implements
//!   [`lock_api::RawMutexFair`].
//! - [`FairDeadlockSafeMutex`]: additionally publishes each wait (lock,
//!   start time, episode token) for the [`detect_deadlocks`] sweep, which
//!   breaks wait-for cycles by waking one victim per cycle with
//!   [`Err(Deadlocked)`](crate::Deadlocked).
//!
//! Beyond FIFO, no starvation-freedom is claimed: a thread that keeps
//! failing to announce (because the lock bounces through unlocked states)
//! is not ordered relative to announced waiters.

use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::relax::Spin;
use crate::Deadlocked;

mod detect;
mod raw;

pub use detect::detect_deadlocks;
pub use raw::{RawFairDeadlockSafeMutex, RawFairMutex};

/// A mutual exclusion primitive that hands ownership to waiting threads in
/// strict FIFO order.
///
/// An alias for [`lock_api::Mutex`] over this crate's [`RawFairMutex`],
/// generic over the [`Relax`] strategy run between compare-and-swap
/// attempts.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use detlock::FairMutex;
///
/// let mutex: Arc<FairMutex<i32>> = Arc::new(FairMutex::new(0));
/// let c_mutex = Arc::clone(&mutex);
///
/// thread::spawn(move || {
///     *c_mutex.lock() = 10;
/// })
/// .join()
/// .expect("thread::spawn failed");
///
/// assert_eq!(*mutex.lock(), 10);
/// ```
///
/// [`Relax`]: crate::relax::Relax
pub type FairMutex<T, R = Spin> = lock_api::Mutex<RawFairMutex<R>, T>;

/// An RAII guard for [`FairMutex`]. The lock is released (and transferred to
/// the oldest waiter, if any) when the guard drops.
pub type FairMutexGuard<'a, T, R = Spin> = lock_api::MutexGuard<'a, RawFairMutex<R>, T>;

/// A [`FairMutex`] alias that signals the processor it is running a
/// busy-wait spin-loop between lock word retries.
pub mod spins {
    use crate::relax::Spin;

    /// A fair mutex retrying under the [`Spin`] relax strategy.
    pub type FairMutex<T> = super::FairMutex<T, Spin>;

    /// An RAII guard for this module's [`FairMutex`].
    pub type FairMutexGuard<'a, T> = super::FairMutexGuard<'a, T, Spin>;
}

/// A [`FairMutex`] alias that yields the current time slice back to the OS
/// scheduler between lock word retries.
pub mod yields {
    use crate::relax::Yield;

    /// A fair mutex retrying under the [`Yield`] relax strategy.
    pub type FairMutex<T> = super::FairMutex<T, Yield>;

    /// An RAII guard for this module's [`FairMutex`].
    pub type FairMutexGuard<'a, T> = super::FairMutexGuard<'a, T, Yield>;
}

/// A strictly FIFO mutex that diagnoses deadlocks instead of hanging
/// forever.
///
/// Behaves like [`FairMutex`], and additionally publishes every wait so that
/// [`detect_deadlocks`] can discover cycles in the process-wide wait-for
/// graph. Unlike [`DeadlockSafeMutex`](crate::DeadlockSafeMutex), nothing is
/// diagnosed spontaneously: some thread (typically a watchdog, or a caller
/// that has been waiting suspiciously long on another lock) must run the
/// sweep. A victim's `lock` returns [`Err(Deadlocked)`](Deadlocked) without
/// acquiring.
///
/// # Example
///
/// ```
/// use detlock::{fair, FairDeadlockSafeMutex};
///
/// let mutex = FairDeadlockSafeMutex::new(0);
/// *mutex.lock().unwrap() += 1;
///
/// // No cycle, so a sweep finds nothing to break.
/// assert_eq!(fair::detect_deadlocks(), 0);
/// assert_eq!(*mutex.lock().unwrap(), 1);
/// ```
pub struct FairDeadlockSafeMutex<T: ?Sized> {
    raw: RawFairDeadlockSafeMutex,
    data: UnsafeCell<T>,
}

// SAFETY: sending the mutex moves the protected data along with it, so `T`
// itself must be sendable.
unsafe impl<T: ?Sized + Send> Send for FairDeadlockSafeMutex<T> {}
// SAFETY: the lock serializes all access to the protected data, so sharing
// the mutex only requires the data to be sendable to whichever thread ends
// up holding the lock.
unsafe impl<T: ?Sized + Send> Sync for FairDeadlockSafeMutex<T> {}

impl<T> FairDeadlockSafeMutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    ///
    /// # Example
    ///
    /// ```
    /// use detlock::FairDeadlockSafeMutex;
    ///
    /// static MUTEX: FairDeadlockSafeMutex<i32> = FairDeadlockSafeMutex::new(0);
    /// let mutex = FairDeadlockSafeMutex::new(0);
    /// ```
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { raw: RawFairDeadlockSafeMutex::new(), data: UnsafeCell::new(value) }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FairDeadlockSafeMutex<T> {
    /// Acquires this mutex, blocking the current thread until ownership is
    /// transferred to it or until a detector sweep picks it as a deadlock
    /// victim.
    ///
    /// On success an RAII guard is returned; the lock is released when the
    /// guard drops. On [`Err(Deadlocked)`](Deadlocked) the lock was **not**
    /// acquired; see [`Deadlocked`] for the recovery contract.
    #[inline]
    pub fn lock(&self) -> Result<FairDeadlockSafeMutexGuard<'_, T>, Deadlocked> {
        self.raw.lock().map(|()| FairDeadlockSafeMutexGuard::new(self))
    }

    /// Attempts to acquire this mutex without blocking.
    ///
    /// Returns [`None`] if the lock is held. A `try_lock` does not announce
    /// as a waiter, so it neither participates in the FIFO order nor in any
    /// deadlock.
    #[inline]
    pub fn try_lock(&self) -> Option<FairDeadlockSafeMutexGuard<'_, T>> {
        self.raw.try_lock().then(|| FairDeadlockSafeMutexGuard::new(self))
    }

    /// Returns `true` if the lock is currently held by any thread.
    ///
    /// Best-effort observation, see [`RawFairDeadlockSafeMutex::is_locked`].
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the mutex mutably, no locking takes place:
    /// the borrow statically guarantees no guards exist.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T: Default> Default for FairDeadlockSafeMutex<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> From<T> for FairDeadlockSafeMutex<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + Debug> Debug for FairDeadlockSafeMutex<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FairDeadlockSafeMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// An RAII implementation of a "scoped lock" for [`FairDeadlockSafeMutex`].
/// When this structure is dropped (falls out of scope), the lock will be
/// released to the oldest announced waiter, or unlocked if there is none.
///
/// The guard is not sendable: the lock word records the holding thread's
/// identity, and release is checked (in debug builds) against the thread
/// that acquired.
#[must_use = "if unused the FairDeadlockSafeMutex will immediately unlock"]
pub struct FairDeadlockSafeMutexGuard<'a, T: ?Sized> {
    lock: &'a FairDeadlockSafeMutex<T>,
    // Keeps the guard on the acquiring thread.
    marker: PhantomData<*mut ()>,
}

// SAFETY: the guard holds exclusive access over the data for its lifetime,
// so shared references to it may travel to other threads whenever the data
// itself is shareable.
unsafe impl<T: ?Sized + Sync> Sync for FairDeadlockSafeMutexGuard<'_, T> {}

impl<'a, T: ?Sized> FairDeadlockSafeMutexGuard<'a, T> {
    fn new(lock: &'a FairDeadlockSafeMutex<T>) -> Self {
        Self { lock, marker: PhantomData }
    }
}

impl<T: ?Sized> Deref for FairDeadlockSafeMutexGuard<'_, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: a live guard means the current thread holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FairDeadlockSafeMutexGuard<'_, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a live guard means the current thread holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + Debug> Debug for FairDeadlockSafeMutexGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: ?Sized + Display> Display for FairDeadlockSafeMutexGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: ?Sized> Drop for FairDeadlockSafeMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: a live guard means the current thread holds the lock.
        unsafe { self.lock.raw.unlock() }
    }
}

#[cfg(test)]
mod test {
    use crate::relax::Yield;
    use crate::test::tests;

    type FairMutex<T> = super::FairMutex<T, Yield>;
    type FairDeadlockSafeMutex<T> = super::FairDeadlockSafeMutex<T>;

    #[test]
    fn smoke() {
        tests::smoke::<FairMutex<_>>();
        tests::smoke::<FairDeadlockSafeMutex<_>>();
    }

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<FairMutex<_>>();
        tests::lots_and_lots::<FairDeadlockSafeMutex<_>>();
    }

    #[test]
    fn try_lock() {
        tests::try_lock::<FairMutex<_>>();
        tests::try_lock::<FairDeadlockSafeMutex<_>>();
    }

    #[test]
    fn is_locked_tracks_guard_scope() {
        tests::is_locked_tracks_guard_scope::<FairDeadlockSafeMutex<_>>();
    }

    #[test]
    fn lock_arc_nested() {
        tests::lock_arc_nested::<FairMutex<_>, FairMutex<_>>();
        tests::lock_arc_nested::<FairDeadlockSafeMutex<_>, FairDeadlockSafeMutex<_>>();
    }

    #[test]
    fn lock_arc_access_in_unwind() {
        tests::lock_arc_access_in_unwind::<FairMutex<_>>();
        tests::lock_arc_access_in_unwind::<FairDeadlockSafeMutex<_>>();
    }

    #[test]
    fn lock_unsized() {
        tests::lock_unsized::<FairMutex<_>>();
    }

    #[test]
    fn sweep_without_waiters_finds_nothing() {
        assert_eq!(super::detect_deadlocks(), 0);
    }

    #[test]
    fn into_inner_and_get_mut() {
        let mut mutex = FairDeadlockSafeMutex::new(10);
        *mutex.get_mut() = 20;
        assert_eq!(mutex.into_inner(), 20);
    }
}
