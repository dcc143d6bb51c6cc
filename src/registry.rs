//! A process-wide registry that assigns each running thread a small, dense
//! integer identifier.
//!
//! Dense ids let the deadlock detecting locks index per-thread wait state
//! with a plain array lookup, avoiding allocation and hashing on the
//! announce/park hot path. An id is claimed lazily, on the first operation
//! that needs one (any acquisition of a holder-tracking lock), and released
//! by a thread-local destructor when the thread exits, after which it may be
//! handed to a newly started thread. An id is never reused while its owning
//! thread is alive.

use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::{AcqRel, Relaxed, Release};

/// A dense thread identifier in the range `[0, MAX_THREADS)`.
pub type ThreadId = u32;

/// The exclusive upper bound on live thread ids.
///
/// Operations that need a thread id panic once this many threads are alive
/// and registered at the same time. Threads that never touch a
/// holder-tracking lock do not count against the limit.
pub const MAX_THREADS: usize = 512;

/// A sentinel value outside `[0, MAX_THREADS)`, used by lock words to encode
/// the absence of a holder.
pub const INVALID_THREAD_ID: ThreadId = ThreadId::MAX;

#[allow(clippy::declare_interior_mutable_const)]
const FREE: AtomicBool = AtomicBool::new(false);

/// One claim flag per assignable id. `true` means the id is owned by a live
/// thread.
static CLAIMED: [AtomicBool; MAX_THREADS] = [FREE; MAX_THREADS];

thread_local! {
    static REGISTRATION: Registration = Registration::acquire();
}

/// The calling thread's ownership of one registry slot. Dropping it (at
/// thread exit) returns the id to the pool.
struct Registration {
    id: ThreadId,
}

impl Registration {
    /// Claims the lowest currently free id.
    ///
    /// # Panics
    ///
    /// Panics if all `MAX_THREADS` ids are claimed by live threads.
    fn acquire() -> Self {
        for (id, slot) in CLAIMED.iter().enumerate() {
            let unclaimed = !slot.load(Relaxed);
            if unclaimed && slot.compare_exchange(false, true, AcqRel, Relaxed).is_ok() {
                return Self { id: id as ThreadId };
            }
        }
        panic!("thread registry exhausted: more than {MAX_THREADS} registered threads are alive");
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        CLAIMED[self.id as usize].store(false, Release);
    }
}

/// Returns the dense id of the calling thread, claiming one on first use.
///
/// # Panics
///
/// Panics if more than [`MAX_THREADS`] registered threads are alive, or when
/// called from a thread-local destructor running after the registration has
/// already been torn down.
#[inline]
pub fn current_thread_id() -> ThreadId {
    REGISTRATION.with(|registration| registration.id)
}

const _: () = assert!(MAX_THREADS <= INVALID_THREAD_ID as usize);
