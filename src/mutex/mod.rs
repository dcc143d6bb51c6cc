//! A compact, contention-sensitive mutex family.
//!
//! The lock word is a single atomic with three states: unlocked, locked and
//! locked-with-contention. Acquisition is one compare-and-swap in the happy
//! path; contenders flag the word and sleep on the parking lot. Release is a
//! single swap plus, when the word was flagged, exactly one wakeup. The
//! woken thread re-races for the lock ("wake one, try again"), so no
//! acquisition order is promised among contenders.
//!
//! Two flavours are provided:
//!
//! - [`Mutex`]: the plain lock, an alias over [`lock_api::Mutex`] with
//!   [`RawMutex`] underneath. Infallible `lock`.
//! - [`DeadlockSafeMutex`]: carries the holder's thread id in the lock word
//!   and diagnoses wait-for cycles in-line, from each waiter's bounded park
//!   timeout. Its `lock` returns [`Err(Deadlocked)`](crate::Deadlocked) to
//!   the one waiter chosen to break a confirmed cycle.

use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::relax::Spin;
use crate::Deadlocked;

mod raw;
pub use raw::{RawDeadlockSafeMutex, RawMutex};

/// A mutual exclusion primitive useful for protecting shared data.
///
/// An alias for [`lock_api::Mutex`] over this crate's [`RawMutex`], generic
/// over the [`Relax`] strategy run between compare-and-swap attempts.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use detlock::Mutex;
///
/// let mutex: Arc<Mutex<i32>> = Arc::new(Mutex::new(0));
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
pub type Mutex<T, R = Spin> = lock_api::Mutex<RawMutex<R>, T>;

/// An RAII guard for [`Mutex`]. The lock is released when the guard drops.
pub type MutexGuard<'a, T, R = Spin> = lock_api::MutexGuard<'a, RawMutex<R>, T>;

/// A [`Mutex`] alias that signals the processor it is running a busy-wait
/// spin-loop between lock word retries.
pub mod spins {
    use crate::relax::Spin;

    /// A plain mutex retrying under the [`Spin`] relax strategy.
    pub type Mutex<T> = super::Mutex<T, Spin>;

    /// An RAII guard for this module's [`Mutex`].
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Spin>;
}

/// A [`Mutex`] alias that yields the current time slice back to the OS
/// scheduler between lock word retries.
pub mod yields {
    use crate::relax::Yield;

    /// A plain mutex retrying under the [`Yield`] relax strategy.
    pub type Mutex<T> = super::Mutex<T, Yield>;

    /// An RAII guard for this module's [`Mutex`].
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Yield>;
}

/// A mutual exclusion primitive that diagnoses deadlocks instead of hanging
/// forever.
///
/// Behaves like [`Mutex`] while the wait-for graph is acyclic. A thread that
/// would complete a cycle (it waits on a lock whose holder transitively
/// waits back on a lock this thread holds) is instead woken with
/// [`Err(Deadlocked)`](Deadlocked): it did not acquire the lock, and
/// releasing the locks it already holds lets the remaining participants make
/// progress.
///
/// Detection is lazy: each parked waiter re-checks the graph after a bounded
/// sleep (nominally one second), so a diagnosis surfaces within roughly that
/// period rather than immediately.
///
/// # Example
///
/// ```
/// use detlock::DeadlockSafeMutex;
///
/// let mutex = DeadlockSafeMutex::new(0);
/// *mutex.lock().unwrap() += 1;
/// assert_eq!(*mutex.lock().unwrap(), 1);
/// ```
pub struct DeadlockSafeMutex<T: ?Sized> {
    raw: RawDeadlockSafeMutex,
    data: UnsafeCell<T>,
}

// SAFETY: sending the mutex moves the protected data along with it, so `T`
// itself must be sendable.
unsafe impl<T: ?Sized + Send> Send for DeadlockSafeMutex<T> {}
// SAFETY: the lock serializes all access to the protected data, so sharing
// the mutex only requires the data to be sendable to whichever thread ends
// up holding the lock.
unsafe impl<T: ?Sized + Send> Sync for DeadlockSafeMutex<T> {}

impl<T> DeadlockSafeMutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    ///
    /// # Example
    ///
    /// ```
    /// use detlock::DeadlockSafeMutex;
    ///
    /// static MUTEX: DeadlockSafeMutex<i32> = DeadlockSafeMutex::new(0);
    /// let mutex = DeadlockSafeMutex::new(0);
    /// ```
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { raw: RawDeadlockSafeMutex::new(), data: UnsafeCell::new(value) }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> DeadlockSafeMutex<T> {
    /// Acquires this mutex, blocking the current thread until it is able to
    /// do so or until waiting is diagnosed as a deadlock.
    ///
    /// On success an RAII guard is returned; the lock is released when the
    /// guard drops. On [`Err(Deadlocked)`](Deadlocked) the lock was **not**
    /// acquired; see [`Deadlocked`] for the recovery contract.
    #[inline]
    pub fn lock(&self) -> Result<DeadlockSafeMutexGuard<'_, T>, Deadlocked> {
        self.raw.lock().map(|()| DeadlockSafeMutexGuard::new(self))
    }

    /// Attempts to acquire this mutex without blocking.
    ///
    /// Returns [`None`] if the lock is held by another thread. This function
    /// never reports a deadlock: a failed `try_lock` does not wait and so
    /// cannot participate in one.
    #[inline]
    pub fn try_lock(&self) -> Option<DeadlockSafeMutexGuard<'_, T>> {
        self.raw.try_lock().then(|| DeadlockSafeMutexGuard::new(self))
    }

    /// Returns `true` if the lock is currently held by any thread.
    ///
    /// Best-effort observation, see [`RawDeadlockSafeMutex::is_locked`].
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

impl<T: Default> Default for DeadlockSafeMutex<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> From<T> for DeadlockSafeMutex<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + Debug> Debug for DeadlockSafeMutex<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("DeadlockSafeMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// An RAII implementation of a "scoped lock" for [`DeadlockSafeMutex`]. When
/// this structure is dropped (falls out of scope), the lock will be
/// unlocked.
///
/// The guard is not sendable: the lock word records the holding thread's
/// identity, and release is checked (in debug builds) against the thread
/// that acquired.
#[must_use = "if unused the DeadlockSafeMutex will immediately unlock"]
pub struct DeadlockSafeMutexGuard<'a, T: ?Sized> {
    lock: &'a DeadlockSafeMutex<T>,
    // Keeps the guard on the acquiring thread.
    marker: PhantomData<*mut ()>,
}

// SAFETY: the guard holds exclusive access over the data for its lifetime,
// so shared references to it may travel to other threads whenever the data
// itself is shareable.
unsafe impl<T: ?Sized + Sync> Sync for DeadlockSafeMutexGuard<'_, T> {}

impl<'a, T: ?Sized> DeadlockSafeMutexGuard<'a, T> {
    fn new(lock: &'a DeadlockSafeMutex<T>) -> Self {
        Self { lock, marker: PhantomData }
    }
}

impl<T: ?Sized> Deref for DeadlockSafeMutexGuard<'_, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: a live guard means the current thread holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for DeadlockSafeMutexGuard<'_, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a live guard means the current thread holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + Debug> Debug for DeadlockSafeMutexGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: ?Sized + Display> Display for DeadlockSafeMutexGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: ?Sized> Drop for DeadlockSafeMutexGuard<'_, T> {
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

    type Mutex<T> = super::Mutex<T, Yield>;
    type DeadlockSafeMutex<T> = super::DeadlockSafeMutex<T>;

    #[test]
    fn smoke() {
        tests::smoke::<Mutex<_>>();
        tests::smoke::<DeadlockSafeMutex<_>>();
    }

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<Mutex<_>>();
        tests::lots_and_lots::<DeadlockSafeMutex<_>>();
    }

    #[test]
    fn try_lock() {
        tests::try_lock::<Mutex<_>>();
        tests::try_lock::<DeadlockSafeMutex<_>>();
    }

    #[test]
    fn is_locked_tracks_guard_scope() {
        tests::is_locked_tracks_guard_scope::<DeadlockSafeMutex<_>>();
    }

    #[test]
    fn lock_arc_nested() {
        tests::lock_arc_nested::<Mutex<_>, Mutex<_>>();
        tests::lock_arc_nested::<DeadlockSafeMutex<_>, DeadlockSafeMutex<_>>();
    }

    #[test]
    fn lock_arc_access_in_unwind() {
        tests::lock_arc_access_in_unwind::<Mutex<_>>();
        tests::lock_arc_access_in_unwind::<DeadlockSafeMutex<_>>();
    }

    #[test]
    fn lock_unsized() {
        tests::lock_unsized::<Mutex<_>>();
    }

    #[test]
    fn into_inner_and_get_mut() {
        let mut mutex = DeadlockSafeMutex::new(10);
        *mutex.get_mut() = 20;
        assert_eq!(mutex.into_inner(), 20);
    }
}
