use core::marker::PhantomData;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};
use std::ptr;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot_core::{FilterOp, ParkResult, ParkToken, DEFAULT_UNPARK_TOKEN};

use crate::registry::{current_thread_id, ThreadId, INVALID_THREAD_ID, MAX_THREADS};
use crate::relax::{Relax, Spin};
use crate::Deadlocked;

/// The fair lock word: a `(holder, num_waiters)` pair updated by
/// compare-and-swap as a single atomic unit.
///
/// `num_waiters` counts threads that announced intent to park and have
/// neither been transferred ownership nor bailed out yet. It can only grow
/// while the lock is held, which is what lets the release path pick the
/// transfer branch without re-checking the queue first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) struct LockWord {
    pub(super) holder: ThreadId,
    pub(super) num_waiters: u32,
}

impl LockWord {
    const UNLOCKED: Self = Self { holder: INVALID_THREAD_ID, num_waiters: 0 };

    const fn pack(self) -> u64 {
        ((self.holder as u64) << 32) | self.num_waiters as u64
    }

    const fn unpack(raw: u64) -> Self {
        Self { holder: (raw >> 32) as ThreadId, num_waiters: raw as u32 }
    }

    pub(super) const fn is_locked(self) -> bool {
        self.holder != INVALID_THREAD_ID
    }

    const fn is_held_by(self, tid: ThreadId) -> bool {
        self.holder == tid
    }

    const fn has_waiters(self) -> bool {
        self.num_waiters != 0
    }

    /// The release-and-grant step: ownership moves to `tid` and its waiter
    /// slot is consumed, in one new word.
    const fn transfer_to(self, tid: ThreadId) -> Self {
        Self { holder: tid, num_waiters: self.num_waiters - 1 }
    }

    const fn add_waiter(self) -> Self {
        Self { holder: self.holder, num_waiters: self.num_waiters + 1 }
    }

    const fn remove_waiter(self) -> Self {
        Self { holder: self.holder, num_waiters: self.num_waiters - 1 }
    }
}

/// The payload each parked waiter leaves in its queue node, reachable by
/// unparkers through the park token.
///
/// The node lives in the parked thread's stack frame for the duration of the
/// park call; `deadlocked` points at a flag in that same frame, written by
/// the detector (under the queue lock, before the victim is woken) and read
/// by the waiter once it resumes.
pub(super) struct WaitNodeData {
    pub(super) tid: ThreadId,
    pub(super) wait_token: u64,
    deadlocked: *const AtomicBool,
}

impl WaitNodeData {
    fn as_park_token(&self) -> ParkToken {
        ParkToken(self as *const Self as usize)
    }

    /// Recovers the node behind a queued thread's park token.
    ///
    /// # Safety
    ///
    /// Must only be called on tokens taken from this lock family's queue
    /// nodes, while the queue lock is held: a queued node's backing stack
    /// frame stays alive until the owning thread is removed from the queue
    /// and woken, which also requires the queue lock.
    pub(super) unsafe fn deref<'a>(token: ParkToken) -> &'a Self {
        unsafe { &*(token.0 as *const Self) }
    }

    pub(super) fn is_deadlocked(&self) -> bool {
        // SAFETY: the flag outlives the node, see `deref`.
        unsafe { &*self.deadlocked }.load(SeqCst)
    }

    pub(super) fn mark_deadlocked(&self) {
        // SAFETY: the flag outlives the node, see `deref`.
        unsafe { &*self.deadlocked }.store(true, SeqCst);
    }
}

/// What a round of waiting concluded; `lock` loops on `Retry`.
enum ParkOutcome {
    /// The announce step observed the lock unlocked, or the parking lot
    /// pre-check bailed: race for the lock again.
    Retry,
    /// The unparker transferred the lock to this thread.
    Acquired,
    /// The deadlock detector chose this thread as a victim.
    Victim,
}

/// CAS-increments `num_waiters`, but only while the word shows a holder.
/// Returns `false` (without announcing) when the lock was observed unlocked.
fn announce_waiter<R: Relax>(word: &AtomicU64) -> bool {
    let mut relax = R::new();
    loop {
        let old = LockWord::unpack(word.load(SeqCst));
        if !old.is_locked() {
            return false;
        }
        let new = old.add_waiter();
        if word.compare_exchange(old.pack(), new.pack(), SeqCst, SeqCst).is_ok() {
            return true;
        }
        relax.relax();
    }
}

/// CAS-decrements `num_waiters`; used by waiters that announced but will not
/// be woken by a transfer (pre-check bailouts and deadlock victims).
fn renounce_waiter<R: Relax>(word: &AtomicU64) {
    let mut relax = R::new();
    loop {
        let old = LockWord::unpack(word.load(SeqCst));
        debug_assert!(old.num_waiters > 0, "waiter count underflow");
        let new = old.remove_waiter();
        if word.compare_exchange(old.pack(), new.pack(), SeqCst, SeqCst).is_ok() {
            return;
        }
        relax.relax();
    }
}

/// CAS-installs `tid` as the holder while consuming its waiter slot.
/// Retries absorb concurrent `num_waiters` updates by other announcers.
fn transfer_lock<R: Relax>(word: &AtomicU64, tid: ThreadId) {
    let mut relax = R::new();
    loop {
        let old = LockWord::unpack(word.load(SeqCst));
        let new = old.transfer_to(tid);
        if word.compare_exchange(old.pack(), new.pack(), SeqCst, SeqCst).is_ok() {
            return;
        }
        relax.relax();
    }
}

/// The shared release path of both fair flavours.
///
/// With no announced waiters the word is CASed back to unlocked. Otherwise
/// the queue under `addr` is visited in FIFO order and the first
/// non-deadlocked node receives the lock by direct transfer before being
/// removed and woken; the race is never reopened. An announced waiter that
/// has not reached its queue node yet makes the visit come up empty, in
/// which case the whole step is retried.
fn release_fair<R: Relax>(word: &AtomicU64, addr: usize) {
    let mut relax = R::new();
    loop {
        let old = LockWord::unpack(word.load(SeqCst));
        debug_assert!(old.is_held_by(current_thread_id()), "unlock by a non-holder");

        if old.has_waiters() {
            let mut woke_someone = false;
            let filter = |token: ParkToken| {
                if woke_someone {
                    return FilterOp::Stop;
                }
                // SAFETY: the queue lock is held and the token belongs to
                // this lock's queue.
                let node = unsafe { WaitNodeData::deref(token) };
                if node.is_deadlocked() {
                    return FilterOp::Skip;
                }
                transfer_lock::<R>(word, node.tid);
                woke_someone = true;
                FilterOp::Unpark
            };
            // SAFETY: the callbacks do not panic or re-enter the parking
            // lot.
            unsafe {
                parking_lot_core::unpark_filter(addr, filter, |_| DEFAULT_UNPARK_TOKEN);
            }
            if woke_someone {
                return;
            }
        } else if word.compare_exchange(old.pack(), LockWord::UNLOCKED.pack(), SeqCst, SeqCst).is_ok()
        {
            return;
        }
        relax.relax();
    }
}

fn try_lock_word(word: &AtomicU64) -> bool {
    let locked = LockWord { holder: current_thread_id(), num_waiters: 0 };
    word.compare_exchange(LockWord::UNLOCKED.pack(), locked.pack(), SeqCst, SeqCst).is_ok()
}

/// The raw lock behind [`FairMutex`], generic over the [`Relax`] strategy
/// run between compare-and-swap attempts.
///
/// Implements [`lock_api::RawMutex`] and [`lock_api::RawMutexFair`]; its
/// release is always a fair release.
///
/// [`FairMutex`]: crate::fair::FairMutex
pub struct RawFairMutex<R = Spin> {
    word: AtomicU64,
    relax: PhantomData<R>,
}

impl<R> RawFairMutex<R> {
    /// Creates a new unlocked raw mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self { word: AtomicU64::new(LockWord::UNLOCKED.pack()), relax: PhantomData }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn load(&self) -> LockWord {
        LockWord::unpack(self.word.load(SeqCst))
    }

    fn is_held_by_current(&self) -> bool {
        self.load().is_held_by(current_thread_id())
    }
}

impl<R: Relax> RawFairMutex<R> {
    /// One round of announce-then-sleep.
    fn park(&self) -> ParkOutcome {
        if !announce_waiter::<R>(&self.word) {
            return ParkOutcome::Retry;
        }

        let tid = current_thread_id();
        let deadlocked = AtomicBool::new(false);
        let node = WaitNodeData { tid, wait_token: 0, deadlocked: &deadlocked };
        // Sleep unless the lock became ours while the queue was locked,
        // which cannot happen before this node is queued; the check is kept
        // for symmetry with the detecting flavour.
        let validate = || !self.load().is_held_by(tid) && !deadlocked.load(SeqCst);

        // SAFETY: the closures neither panic nor re-enter the parking lot,
        // and the node outlives the park call that queues it.
        let result = unsafe {
            parking_lot_core::park(
                self.addr(),
                validate,
                || (),
                |_, _| (),
                node.as_park_token(),
                None,
            )
        };

        match result {
            ParkResult::Unparked(_) => ParkOutcome::Acquired,
            ParkResult::Invalid => {
                renounce_waiter::<R>(&self.word);
                ParkOutcome::Retry
            }
            ParkResult::TimedOut => unreachable!("parked without a deadline"),
        }
    }
}

unsafe impl<R: Relax> lock_api::RawMutex for RawFairMutex<R> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardNoSend;

    #[inline]
    fn try_lock(&self) -> bool {
        try_lock_word(&self.word)
    }

    #[inline]
    fn lock(&self) {
        let mut relax = R::new();
        loop {
            if self.try_lock() {
                break;
            }
            relax.relax();
            match self.park() {
                ParkOutcome::Retry => debug_assert!(!self.is_held_by_current()),
                ParkOutcome::Acquired => break,
                ParkOutcome::Victim => unreachable!("detection is disabled for this lock"),
            }
        }
        debug_assert!(self.is_held_by_current());
    }

    #[inline]
    unsafe fn unlock(&self) {
        release_fair::<R>(&self.word, self.addr());
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.load().is_locked()
    }
}

unsafe impl<R: Relax> lock_api::RawMutexFair for RawFairMutex<R> {
    #[inline]
    unsafe fn unlock_fair(&self) {
        // Every release of this lock is fair.
        release_fair::<R>(&self.word, self.addr());
    }
}

/// Per-thread wait publication, read by the sweep detector from any thread.
///
/// Padded out to its own cache lines so detector scans do not bounce the
/// announce path's lines between cores.
#[repr(align(128))]
pub(super) struct ThreadWaitInfo {
    pub(super) waiting_on: AtomicPtr<RawFairDeadlockSafeMutex>,
    pub(super) wait_start: AtomicU64,
    pub(super) wait_token: AtomicU64,
}

impl ThreadWaitInfo {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Self = Self {
        waiting_on: AtomicPtr::new(ptr::null_mut()),
        wait_start: AtomicU64::new(0),
        wait_token: AtomicU64::new(0),
    };

    /// Publishes the lock about to block the owning thread and starts a new
    /// wait episode. Returns the episode's token.
    fn announce(&self, lock: &RawFairDeadlockSafeMutex) -> u64 {
        self.wait_start.store(now_nanos(), SeqCst);
        self.waiting_on.store(lock as *const _ as *mut _, SeqCst);
        self.wait_token.fetch_add(1, SeqCst) + 1
    }

    fn denounce(&self) {
        self.waiting_on.store(ptr::null_mut(), SeqCst);
    }
}

/// One wait-info slot per registry id.
pub(super) static WAIT_INFO: [ThreadWaitInfo; MAX_THREADS] = [ThreadWaitInfo::EMPTY; MAX_THREADS];

static WAIT_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic, non-decreasing timestamp in nanoseconds since the first wait
/// in this process.
fn now_nanos() -> u64 {
    WAIT_EPOCH.elapsed().as_nanos() as u64
}

/// The raw lock behind [`FairDeadlockSafeMutex`]: the fair transfer protocol
/// of [`RawFairMutex`] plus the wait publication that lets
/// [`detect_deadlocks`] discover and break wait-for cycles.
///
/// This type is not generic over a relax strategy because every instance
/// shares the process-wide wait-info table; it relaxes with [`Spin`]
/// internally.
///
/// [`FairDeadlockSafeMutex`]: crate::fair::FairDeadlockSafeMutex
/// [`detect_deadlocks`]: crate::fair::detect_deadlocks
pub struct RawFairDeadlockSafeMutex {
    word: AtomicU64,
}

impl RawFairDeadlockSafeMutex {
    /// Creates a new unlocked raw mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self { word: AtomicU64::new(LockWord::UNLOCKED.pack()) }
    }

    /// Attempts to acquire this lock without blocking.
    ///
    /// Returns `true` iff ownership was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        try_lock_word(&self.word)
    }

    /// Acquires this lock, blocking the current thread until the lock is
    /// transferred to it, or until a detector sweep picks it as a deadlock
    /// victim.
    ///
    /// On [`Err(Deadlocked)`](Deadlocked) the lock was **not** acquired and
    /// must not be unlocked by the caller.
    #[inline]
    pub fn lock(&self) -> Result<(), Deadlocked> {
        let mut relax = Spin::new();
        loop {
            if self.try_lock() {
                break;
            }
            relax.relax();
            match self.park() {
                ParkOutcome::Retry => debug_assert!(!self.is_held_by_current()),
                ParkOutcome::Acquired => break,
                ParkOutcome::Victim => {
                    debug_assert!(!self.is_held_by_current());
                    return Err(Deadlocked);
                }
            }
        }
        debug_assert!(self.is_held_by_current());
        Ok(())
    }

    /// Unlocks this lock, transferring ownership to the longest-waiting
    /// announced thread if there is one.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        release_fair::<Spin>(&self.word, self.addr());
    }

    /// Returns `true` if the lock is currently held by any thread.
    ///
    /// Best-effort observation: without further synchronization the answer
    /// may be stale by the time the caller acts on it.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.read_word().is_locked()
    }

    /// Runs detection sweeps until no further wait-for cycle is found,
    /// breaking one cycle per sweep. See [`detect_deadlocks`].
    ///
    /// [`detect_deadlocks`]: crate::fair::detect_deadlocks
    pub fn detect_deadlocks() -> usize {
        super::detect::detect_deadlocks()
    }

    pub(super) fn addr(&self) -> usize {
        self as *const Self as usize
    }

    pub(super) fn read_word(&self) -> LockWord {
        LockWord::unpack(self.word.load(SeqCst))
    }

    fn is_held_by_current(&self) -> bool {
        self.read_word().is_held_by(current_thread_id())
    }

    /// One round of announce-then-sleep, with the wait published for the
    /// detector. Episode tokens make a stale detector verdict unable to
    /// victimize a later wait of the same thread.
    fn park(&self) -> ParkOutcome {
        if !announce_waiter::<Spin>(&self.word) {
            return ParkOutcome::Retry;
        }

        let tid = current_thread_id();
        let info = &WAIT_INFO[tid as usize];
        let deadlocked = AtomicBool::new(false);
        let wait_token = info.announce(self);
        let node = WaitNodeData { tid, wait_token, deadlocked: &deadlocked };
        // Do not sleep if the lock was handed to us or the victim flag was
        // raised while the queue was locked.
        let validate = || !self.read_word().is_held_by(tid) && !deadlocked.load(SeqCst);

        // SAFETY: the closures neither panic nor re-enter the parking lot,
        // and the node outlives the park call that queues it.
        let result = unsafe {
            parking_lot_core::park(
                self.addr(),
                validate,
                || (),
                |_, _| (),
                node.as_park_token(),
                None,
            )
        };

        info.denounce();

        match result {
            ParkResult::Unparked(_) => {
                if deadlocked.load(SeqCst) {
                    renounce_waiter::<Spin>(&self.word);
                    ParkOutcome::Victim
                } else {
                    ParkOutcome::Acquired
                }
            }
            ParkResult::Invalid => {
                renounce_waiter::<Spin>(&self.word);
                ParkOutcome::Retry
            }
            ParkResult::TimedOut => unreachable!("parked without a deadline"),
        }
    }
}

impl Default for RawFairDeadlockSafeMutex {
    fn default() -> Self {
        Self::new()
    }
}
