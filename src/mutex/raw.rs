use core::marker::PhantomData;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8};
use core::time::Duration;
use std::collections::HashMap;
use std::ptr;
use std::time::Instant;

use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

use crate::registry::{current_thread_id, ThreadId, MAX_THREADS};
use crate::relax::{Relax, Spin};
use crate::Deadlocked;

/// A compact lock with three reachable states:
///
/// | State      | Meaning                                                   |
/// |------------|-----------------------------------------------------------|
/// | UNLOCKED   | No holder, nobody waiting.                                |
/// | LOCKED     | Held by exactly one thread, nobody announced contention.  |
/// | CONTENDED  | Held, and at least one thread is parked or about to park. |
///
/// The release path issues a single wakeup only when leaving the CONTENDED
/// state. A woken thread does not receive ownership, it re-enters the race,
/// and it always re-acquires as CONTENDED so a remaining sleeper is never
/// stranded by an intervening fast-path acquisition.
const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
const CONTENDED: u8 = 2;

/// The raw lock behind [`Mutex`], generic over the [`Relax`] strategy run
/// between compare-and-swap attempts.
///
/// This type only manages lock state; pair it with [`lock_api::Mutex`] (as
/// the [`Mutex`] alias does) to protect data. The lock's address is its
/// identity: parked waiters queue under it in the process-wide parking lot.
///
/// [`Mutex`]: crate::mutex::Mutex
pub struct RawMutex<R = Spin> {
    state: AtomicU8,
    relax: PhantomData<R>,
}

impl<R> RawMutex<R> {
    /// Creates a new unlocked raw mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self { state: AtomicU8::new(UNLOCKED), relax: PhantomData }
    }

    /// The parking lot key for this lock.
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn is_contended(&self) -> bool {
        self.state.load(SeqCst) == CONTENDED
    }

    fn try_lock_fast(&self) -> bool {
        self.state.compare_exchange(UNLOCKED, LOCKED, SeqCst, SeqCst).is_ok()
    }

    /// Acquires directly into the CONTENDED state, so that our own release
    /// will wake a sleeper that parked before us.
    fn try_lock_contended(&self) -> bool {
        self.state.compare_exchange(UNLOCKED, CONTENDED, SeqCst, SeqCst).is_ok()
    }
}

impl<R: Relax> RawMutex<R> {
    /// Spins until the lock word settles on one of the two outcomes a
    /// contender cares about: `true` when the lock was observed unlocked
    /// (retry the fast path), `false` once the word is flagged CONTENDED
    /// (this thread flagged it, or somebody else already had).
    fn uncontended_path_available(&self) -> bool {
        let mut relax = R::new();
        loop {
            let state = self.state.load(SeqCst);
            if state == UNLOCKED {
                return true;
            }
            let flagged = state == CONTENDED
                || self.state.compare_exchange(state, CONTENDED, SeqCst, SeqCst).is_ok();
            if flagged {
                return false;
            }
            relax.relax();
        }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut relax = R::new();
        while !self.try_lock_contended() {
            self.park();
            relax.relax();
        }
    }

    /// Parks on this lock's queue. The pre-check re-reads the lock word
    /// under the queue lock: parking only proceeds while the word is still
    /// CONTENDED, so a release that raced ahead of us cannot strand us.
    fn park(&self) {
        let validate = || self.is_contended();
        // SAFETY: neither closure panics, parks or calls into the parking
        // lot, and this thread owns no queue state yet.
        unsafe {
            parking_lot_core::park(
                self.addr(),
                validate,
                || (),
                |_, _| (),
                DEFAULT_PARK_TOKEN,
                None,
            );
        }
        // Unparked, invalidated or (impossible here) timed out: every case
        // goes back to racing for the lock.
    }
}

unsafe impl<R: Relax> lock_api::RawMutex for RawMutex<R> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn try_lock(&self) -> bool {
        self.try_lock_fast()
    }

    #[inline]
    fn lock(&self) {
        let mut relax = R::new();
        while !self.try_lock_fast() {
            if !self.uncontended_path_available() {
                return self.lock_contended();
            }
            relax.relax();
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        let old = self.state.swap(UNLOCKED, SeqCst);
        debug_assert_ne!(old, UNLOCKED, "unlock of an unlocked mutex");
        if old == CONTENDED {
            // Wake exactly one sleeper; it re-enters the race rather than
            // receiving ownership.
            // SAFETY: the callback does not panic or call into the parking
            // lot.
            unsafe {
                parking_lot_core::unpark_one(self.addr(), |_| DEFAULT_UNPARK_TOKEN);
            }
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.state.load(SeqCst) != UNLOCKED
    }
}

/// How long a waiter sleeps before running the in-line wait-for cycle check.
///
/// Purely an internal pacing knob: a timeout that finds no cycle simply
/// re-parks the waiter and is not observable through the public API.
const DEADLOCK_DETECT_TIMEOUT: Duration = Duration::from_secs(1);

/// High bit of the lock word flags contention; the remaining bits hold the
/// holder's thread id. Unlocked is the all-ones-except-flag pattern, which
/// no valid thread id can collide with.
const CONTENDED_MASK: u32 = 1 << 31;
const UNLOCKED_WORD: u32 = !CONTENDED_MASK;

const _: () = assert!((MAX_THREADS as u32) < UNLOCKED_WORD);

#[allow(clippy::declare_interior_mutable_const)]
const NO_LOCK: AtomicPtr<RawDeadlockSafeMutex> = AtomicPtr::new(ptr::null_mut());

/// `waiting_on` slot per thread id: the lock currently blocking that thread,
/// or null. Written only by the owning thread (immediately before parking
/// and immediately after resuming), read by any thread running the cycle
/// check.
static THREAD_WAITING_ON: [AtomicPtr<RawDeadlockSafeMutex>; MAX_THREADS] = [NO_LOCK; MAX_THREADS];

/// Serializes the re-read step of the in-line cycle check, so two concurrent
/// checkers cannot both conclude against views the other is invalidating.
static DEADLOCK_VERIFY_LOCK: super::Mutex<()> = super::Mutex::const_new(RawMutex::new(), ());

/// The raw lock behind [`DeadlockSafeMutex`]: the same three-state protocol
/// as [`RawMutex`], with the holder's thread id carried in the lock word and
/// an in-line wait-for cycle check run from each waiter's park timeout.
///
/// This type is not generic over a relax strategy because waiters of every
/// instance share the process-wide `waiting_on` table; it relaxes with
/// [`Spin`] internally.
///
/// [`DeadlockSafeMutex`]: crate::mutex::DeadlockSafeMutex
pub struct RawDeadlockSafeMutex {
    word: AtomicU32,
}

impl RawDeadlockSafeMutex {
    /// Creates a new unlocked raw mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self { word: AtomicU32::new(UNLOCKED_WORD) }
    }

    /// Attempts to acquire this lock without blocking.
    ///
    /// Returns `true` iff ownership was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let locked = current_thread_id();
        self.word.compare_exchange(UNLOCKED_WORD, locked, SeqCst, SeqCst).is_ok()
    }

    /// Acquires this lock, blocking the current thread until it is able to
    /// do so, or until waiting is diagnosed as a deadlock.
    ///
    /// On [`Err(Deadlocked)`](Deadlocked) the lock was **not** acquired and
    /// must not be unlocked by the caller.
    #[inline]
    pub fn lock(&self) -> Result<(), Deadlocked> {
        let mut relax = Spin::new();
        while !self.try_lock() {
            if !self.uncontended_path_available() {
                return self.lock_contended();
            }
            relax.relax();
        }
        Ok(())
    }

    /// Unlocks this lock, waking one parked waiter if the word was flagged
    /// contended.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        let old = self.word.swap(UNLOCKED_WORD, SeqCst);
        debug_assert_ne!(old, UNLOCKED_WORD, "unlock of an unlocked mutex");
        debug_assert_eq!(
            old & !CONTENDED_MASK,
            current_thread_id(),
            "unlock by a thread that does not hold the lock"
        );
        if old & CONTENDED_MASK != 0 {
            // SAFETY: the callback does not panic or call into the parking
            // lot.
            unsafe {
                parking_lot_core::unpark_one(self.addr(), |_| DEFAULT_UNPARK_TOKEN);
            }
        }
    }

    /// Returns `true` if the lock is currently held by any thread.
    ///
    /// Best-effort observation: without further synchronization the answer
    /// may be stale by the time the caller acts on it.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(SeqCst) != UNLOCKED_WORD
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn is_contended(&self) -> bool {
        self.word.load(SeqCst) & CONTENDED_MASK != 0
    }

    /// See [`RawMutex::uncontended_path_available`]; flagging preserves the
    /// holder id so the cycle check keeps seeing who owns the lock.
    fn uncontended_path_available(&self) -> bool {
        let mut relax = Spin::new();
        loop {
            let word = self.word.load(SeqCst);
            if word == UNLOCKED_WORD {
                return true;
            }
            let flagged = word & CONTENDED_MASK != 0
                || self.word.compare_exchange(word, word | CONTENDED_MASK, SeqCst, SeqCst).is_ok();
            if flagged {
                return false;
            }
            relax.relax();
        }
    }

    fn try_lock_contended(&self) -> bool {
        let contended = current_thread_id() | CONTENDED_MASK;
        self.word.compare_exchange(UNLOCKED_WORD, contended, SeqCst, SeqCst).is_ok()
    }

    #[cold]
    fn lock_contended(&self) -> Result<(), Deadlocked> {
        let mut relax = Spin::new();
        while !self.try_lock_contended() {
            if self.park() {
                return Err(Deadlocked);
            }
            relax.relax();
        }
        Ok(())
    }

    /// Parks with a bounded sleep. Returns `true` iff the wait was diagnosed
    /// as part of a deadlock, in which case this thread's `waiting_on` slot
    /// has already been cleared under the verification lock.
    fn park(&self) -> bool {
        self.announce_wait();
        let deadline = Instant::now() + DEADLOCK_DETECT_TIMEOUT;
        // SAFETY: neither closure panics, parks or calls into the parking
        // lot, and this thread owns no queue state yet.
        let result = unsafe {
            parking_lot_core::park(
                self.addr(),
                || self.is_contended(),
                || (),
                |_, _| (),
                DEFAULT_PARK_TOKEN,
                Some(deadline),
            )
        };
        if matches!(result, ParkResult::TimedOut) && self.check_deadlock() {
            return true;
        }
        self.denounce_wait();
        false
    }

    fn announce_wait(&self) {
        let slot = &THREAD_WAITING_ON[current_thread_id() as usize];
        slot.store(self as *const Self as *mut Self, SeqCst);
    }

    fn denounce_wait(&self) {
        THREAD_WAITING_ON[current_thread_id() as usize].store(ptr::null_mut(), SeqCst);
    }

    /// Walks the wait-for graph seeded at this thread: the holder of each
    /// visited lock is looked up in the `waiting_on` table, until either a
    /// running (non-waiting) holder ends the walk or a repeated thread id
    /// closes a cycle. A closed cycle is then confirmed by `verify_deadlock`
    /// before the caller gives up.
    fn check_deadlock(&self) -> bool {
        let mut waiters: HashMap<ThreadId, *const Self> = HashMap::new();
        let mut waiting_on: *const Self = self;
        waiters.insert(current_thread_id(), waiting_on);

        let cycle_found = loop {
            // SAFETY: a lock published in a `waiting_on` slot is alive for
            // the duration of the wait episode that published it, and lock
            // lifetimes must exceed the threads that use them. A read that
            // races with the episode ending is tolerated: it can only
            // produce a stale view, which the verification pass rejects.
            let word = unsafe { &(*waiting_on).word }.load(SeqCst);
            let holder = word & !CONTENDED_MASK;
            if holder == UNLOCKED_WORD {
                // The lock was just released, so the wait will resolve.
                break false;
            }

            let next = THREAD_WAITING_ON[holder as usize].load(SeqCst);
            if next.is_null() {
                // The holder is running, not waiting: no cycle through us.
                break false;
            }
            if waiters.contains_key(&holder) {
                break true;
            }
            waiters.insert(holder, next);
            waiting_on = next;
        };

        cycle_found && Self::verify_deadlock(&waiters)
    }

    /// Re-reads every participant's `waiting_on` under the global
    /// verification lock; any movement since the walk aborts the diagnosis.
    /// On confirmation the calling thread denounces itself while still
    /// serialized, so no concurrent checker can count it twice.
    fn verify_deadlock(waiters: &HashMap<ThreadId, *const Self>) -> bool {
        let _serialized = DEADLOCK_VERIFY_LOCK.lock();

        for (&tid, &lock) in waiters {
            if THREAD_WAITING_ON[tid as usize].load(SeqCst) != lock as *mut Self {
                return false;
            }
        }

        THREAD_WAITING_ON[current_thread_id() as usize].store(ptr::null_mut(), SeqCst);
        true
    }
}

impl Default for RawDeadlockSafeMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use lock_api::RawMutex as _;

    use super::{RawDeadlockSafeMutex, RawMutex, CONTENDED, CONTENDED_MASK, LOCKED, UNLOCKED};
    use crate::registry::current_thread_id;
    use crate::relax::Spin;

    #[test]
    fn word_transitions() {
        let raw = RawMutex::<Spin>::new();
        assert!(!raw.is_locked());
        assert!(raw.try_lock_fast());
        assert!(raw.is_locked());
        assert_eq!(raw.state.load(core::sync::atomic::Ordering::SeqCst), LOCKED);

        assert!(!raw.try_lock_fast());
        assert!(!raw.uncontended_path_available());
        assert_eq!(raw.state.load(core::sync::atomic::Ordering::SeqCst), CONTENDED);

        unsafe { raw.unlock() };
        assert_eq!(raw.state.load(core::sync::atomic::Ordering::SeqCst), UNLOCKED);
        assert!(raw.uncontended_path_available());
    }

    #[test]
    fn contended_acquisition_stays_contended() {
        let raw = RawMutex::<Spin>::new();
        assert!(raw.try_lock_contended());
        assert_eq!(raw.state.load(core::sync::atomic::Ordering::SeqCst), CONTENDED);
        unsafe { raw.unlock() };
    }

    #[test]
    fn word_carries_holder_id() {
        let raw = RawDeadlockSafeMutex::new();
        assert!(raw.try_lock());
        let word = raw.word.load(core::sync::atomic::Ordering::SeqCst);
        assert_eq!(word, current_thread_id());

        assert!(!raw.uncontended_path_available());
        let word = raw.word.load(core::sync::atomic::Ordering::SeqCst);
        assert_eq!(word & !CONTENDED_MASK, current_thread_id());
        assert_ne!(word & CONTENDED_MASK, 0);

        unsafe { raw.unlock() };
        assert!(!raw.is_locked());
    }

    #[test]
    fn lock_is_uncontended_without_rivals() {
        let raw = RawDeadlockSafeMutex::new();
        assert!(raw.lock().is_ok());
        assert!(raw.is_locked());
        assert!(!raw.try_lock());
        unsafe { raw.unlock() };
        assert!(!raw.is_locked());
    }
}
