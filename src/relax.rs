// Modified version of relax.rs from spin-rs to add exponential backoff and
// to drop strategies that do not apply to parking based locks.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Strategies that determine the behaviour of locks when encountering
//! contention.
//!
//! All compare-and-swap retry loops in this crate run one relax operation
//! between attempts. Threads only spin for the short windows in which the
//! lock word is in flux; longer waits are spent sleeping on the parking lot,
//! not relaxing.

/// A trait implemented by spinning relax strategies.
///
/// # Example
///
/// ```
/// use detlock::relax::Relax;
///
/// struct Spin;
///
/// impl Relax for Spin {
///     #[inline(always)]
///     fn new() -> Self {
///         Self
///     }
///
///     #[inline(always)]
///     fn relax(&mut self) {
///         core::hint::spin_loop();
///     }
/// }
/// ```
pub trait Relax {
    /// Returns the initial value for this relaxing strategy.
    fn new() -> Self;

    /// Performs the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// A strategy that rapidly spins while informing the CPU that it should power
/// down non-essential components via [`core::hint::spin_loop`].
///
/// This is the default strategy for every lock in this crate. The retry
/// windows it covers are bounded (a handful of interleaved compare-and-swap
/// attempts), so the priority inversion concerns of classic spinlocks do not
/// apply here.
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        core::hint::spin_loop();
    }
}

/// A strategy that yields the current time slice to the scheduler in favour
/// of other threads or processes.
///
/// Prefer this over [`Spin`] when lock holders may be preempted while the
/// lock word is mid-transition, for example on heavily oversubscribed hosts.
pub struct Yield;

impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline]
    fn relax(&mut self) {
        std::thread::yield_now();
    }
}

/// A strategy that rapidly spins, without telling the CPU to do any powering
/// down.
///
/// You almost certainly do not want to use this. Use [`Spin`] instead. It
/// exists for completeness and for targets that, for some reason, miscompile
/// or do not support spin hint intrinsics despite attempting to generate code
/// for them (i.e: this is a workaround for possible compiler bugs).
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

/// A strategy that, as [`Spin`], will run a busy-wait spin-loop, except this
/// implementation will perform exponential backoff.
///
/// Backing off in spin loops can reduce contention and improve overall
/// performance for some use cases. Further profiling is important to measure
/// any significant improvement.
pub struct SpinBackoff {
    inner: Backoff<{ Self::MAX }>,
}

impl SpinBackoff {
    /// The largest value the inner backoff counter can reach.
    const MAX: Uint = DEFAULT_SHIFTS;
}

// The maximum inner value **must** be smaller than Uint::BITS, or else the
// bitshift operation will overflow.
const _: () = assert!(SpinBackoff::MAX < Uint::BITS);

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { inner: Backoff::new() }
    }

    #[inline]
    fn relax(&mut self) {
        self.inner.saturating_spin();
        self.inner.saturating_step();
    }
}

/// A strategy that, as [`Yield`], will yield back to the OS scheduler, but
/// only after performing exponential backoff in a spin loop within a
/// threshold.
pub struct YieldBackoff {
    inner: Backoff<{ Self::MAX }>,
}

impl YieldBackoff {
    /// The largest value the inner backoff counter can reach.
    const MAX: Uint = DEFAULT_SHIFTS;
}

const _: () = assert!(YieldBackoff::MAX < Uint::BITS);

impl Relax for YieldBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { inner: Backoff::new() }
    }

    #[inline]
    fn relax(&mut self) {
        if self.inner.0 < Self::MAX {
            self.inner.saturating_spin();
        } else {
            std::thread::yield_now();
        }
        self.inner.saturating_step();
    }
}

// Exponential backoff is inspired by the crossbeam-utils implementation.
// link to most recent change (as the time of writing):
// https://github.com/crossbeam-rs/crossbeam/blob/371de8c2d304db07662450995848f3dc9598ac99/crossbeam-utils/src/backoff.rs
//
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

/// An unsigned integer type use as the inner type for [`Backoff`].
///
/// All backoff related arithmetic operations (eg. left shift, sum) should
/// only use this same type as the right-hand and left-hand side types.
type Uint = u32;

/// The default max number of shifts the inner value of `Backoff` will produce.
const DEFAULT_SHIFTS: Uint = 6;

/// Inner backoff counter that keeps track of the number of shifts applied.
///
/// The maximum value the inner shift counter can take is defined by `MAX`.
struct Backoff<const MAX: Uint>(Uint);

impl<const MAX: Uint> Backoff<MAX> {
    /// Creates a new `Backoff` instance with the counter initialized to 0.
    const fn new() -> Self {
        Self(0)
    }

    /// Runs a bounded spin loop `1 << self.inner` times, up to `MAX` times.
    fn saturating_spin(&self) {
        let shifts = self.0.min(MAX);
        for _ in 0..(1 << shifts) {
            core::hint::spin_loop();
        }
    }

    /// Increments one to the inner counter, saturating the counter at `MAX`.
    fn saturating_step(&mut self) {
        (self.0 < MAX).then(|| self.0 += 1);
    }
}
