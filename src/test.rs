pub use core::ops::DerefMut as Guard;

/// A trait for lock types that can run closures against the guard, giving
/// every flavour in this crate (infallible or deadlock detecting, plain or
/// fair) one shape the shared test suite can drive.
pub trait LockWith {
    /// The type of the protected data.
    type Target: ?Sized;

    /// The guard type that holds exclusive access to the underlying data.
    type Guard<'a>: Guard<Target = Self::Target>
    where
        Self: 'a,
        Self::Target: 'a;

    /// Creates a new mutex in an unlocked state ready for use.
    fn new(value: Self::Target) -> Self
    where
        Self::Target: Sized;

    /// Attempts to acquire this lock and then runs the closure against its
    /// guard.
    fn try_lock_with<'a, F, Ret>(&'a self, f: F) -> Ret
    where
        Self: 'a,
        Self::Target: 'a,
        F: FnOnce(Option<Self::Guard<'a>>) -> Ret;

    /// Acquires a mutex and then runs the closure against its guard.
    ///
    /// Detecting flavours unwrap here: the suite never builds wait-for
    /// cycles, so a deadlock verdict is a test failure.
    fn lock_with<'a, F, Ret>(&'a self, f: F) -> Ret
    where
        Self: 'a,
        Self::Target: 'a,
        F: FnOnce(Self::Guard<'a>) -> Ret;

    /// Returns `true` if the lock is currently held by any thread.
    fn is_locked(&self) -> bool;
}

impl<T, Raw: lock_api::RawMutex> LockWith for lock_api::Mutex<Raw, T> {
    type Target = T;

    type Guard<'a>
        = lock_api::MutexGuard<'a, Raw, T>
    where
        Self: 'a,
        T: 'a;

    fn new(value: T) -> Self {
        lock_api::Mutex::new(value)
    }

    fn try_lock_with<'a, F, Ret>(&'a self, f: F) -> Ret
    where
        Self: 'a,
        Self::Target: 'a,
        F: FnOnce(Option<Self::Guard<'a>>) -> Ret,
    {
        f(self.try_lock())
    }

    fn lock_with<'a, F, Ret>(&'a self, f: F) -> Ret
    where
        Self: 'a,
        Self::Target: 'a,
        F: FnOnce(Self::Guard<'a>) -> Ret,
    {
        f(self.lock())
    }

    fn is_locked(&self) -> bool {
        lock_api::Mutex::is_locked(self)
    }
}

impl<T> LockWith for crate::mutex::DeadlockSafeMutex<T> {
    type Target = T;

    type Guard<'a>
        = crate::mutex::DeadlockSafeMutexGuard<'a, T>
    where
        Self: 'a,
        T: 'a;

    fn new(value: T) -> Self {
        Self::new(value)
    }

    fn try_lock_with<'a, F, Ret>(&'a self, f: F) -> Ret
    where
        Self: 'a,
        Self::Target: 'a,
        F: FnOnce(Option<Self::Guard<'a>>) -> Ret,
    {
        f(self.try_lock())
    }

    fn lock_with<'a, F, Ret>(&'a self, f: F) -> Ret
    where
        Self: 'a,
        Self::Target: 'a,
        F: FnOnce(Self::Guard<'a>) -> Ret,
    {
        f(self.lock().expect("no wait-for cycle exists in this test"))
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

impl<T> LockWith for crate::fair::FairDeadlockSafeMutex<T> {
    type Target = T;

    type Guard<'a>
        = crate::fair::FairDeadlockSafeMutexGuard<'a, T>
    where
        Self: 'a,
        T: 'a;

    fn new(value: T) -> Self {
        Self::new(value)
    }

    fn try_lock_with<'a, F, Ret>(&'a self, f: F) -> Ret
    where
        Self: 'a,
        Self::Target: 'a,
        F: FnOnce(Option<Self::Guard<'a>>) -> Ret,
    {
        f(self.try_lock())
    }

    fn lock_with<'a, F, Ret>(&'a self, f: F) -> Ret
    where
        Self: 'a,
        Self::Target: 'a,
        F: FnOnce(Self::Guard<'a>) -> Ret,
    {
        f(self.lock().expect("no wait-for cycle exists in this test"))
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

pub mod tests {
    use super::LockWith;

    // Test suite from the Rust's Mutex implementation with minor
    // modifications since the API is not compatible with this crate
    // implementation and some new tests as well.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;

    type Int = u32;

    pub fn smoke<L>()
    where
        L: LockWith<Target = Int>,
    {
        let mutex = L::new(1);
        mutex.lock_with(|guard| drop(guard));
        mutex.lock_with(|guard| drop(guard));
    }

    pub fn lots_and_lots<L>()
    where
        L: LockWith<Target = Int> + Send + Sync + 'static,
    {
        const ITERS: u32 = 1000;
        const CONCURRENCY: u32 = 3;

        fn inc<L: LockWith<Target = Int>>(data: &Arc<L>) {
            for _ in 0..ITERS {
                data.lock_with(|mut guard| *guard += 1);
            }
        }

        let data = Arc::new(L::new(0));
        let (tx, rx) = channel();
        for _ in 0..CONCURRENCY {
            let data1 = Arc::clone(&data);
            let tx2 = tx.clone();
            thread::spawn(move || {
                inc(&data1);
                tx2.send(()).unwrap();
            });
            let data2 = Arc::clone(&data);
            let tx2 = tx.clone();
            thread::spawn(move || {
                inc(&data2);
                tx2.send(()).unwrap();
            });
        }

        drop(tx);
        for _ in 0..2 * CONCURRENCY {
            rx.recv().unwrap();
        }
        let value = data.lock_with(|guard| *guard);
        assert_eq!(value, ITERS * CONCURRENCY * 2);
    }

    pub fn try_lock<L>()
    where
        L: LockWith<Target = ()>,
    {
        let mutex = L::new(());
        mutex.try_lock_with(|guard| *guard.unwrap() = ());
    }

    pub fn is_locked_tracks_guard_scope<L>()
    where
        L: LockWith<Target = Int>,
    {
        let mutex = L::new(0);
        assert!(!mutex.is_locked());
        mutex.lock_with(|guard| {
            assert!(mutex.is_locked());
            drop(guard);
        });
        assert!(!mutex.is_locked());
    }

    pub fn lock_arc_nested<L1, L2>()
    where
        L1: LockWith<Target = Int>,
        L2: LockWith<Target = Arc<L1>> + Send + Sync + 'static,
    {
        // Tests nested locks and access to underlying data.
        let arc = Arc::new(L1::new(1));
        let arc2 = Arc::new(L2::new(arc));
        let (tx, rx) = channel();
        let _t = thread::spawn(move || {
            let val = arc2.lock_with(|arc2| arc2.lock_with(|guard| *guard));
            assert_eq!(val, 1);
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
    }

    pub fn lock_arc_access_in_unwind<L>()
    where
        L: LockWith<Target = Int> + Send + Sync + 'static,
    {
        let arc = Arc::new(L::new(1));
        let arc2 = arc.clone();
        let _ = thread::spawn(move || {
            struct Unwinder<T: LockWith<Target = Int>> {
                i: Arc<T>,
            }
            impl<T: LockWith<Target = Int>> Drop for Unwinder<T> {
                fn drop(&mut self) {
                    self.i.lock_with(|mut guard| *guard += 1);
                }
            }
            let _u = Unwinder { i: arc2 };
            panic!();
        })
        .join();
        let value = arc.lock_with(|guard| *guard);
        assert_eq!(value, 2);
    }

    pub fn lock_unsized<L>()
    where
        L: LockWith<Target = [Int; 3]>,
    {
        let lock = L::new([1, 2, 3]);
        lock.lock_with(|mut guard| {
            guard[0] = 4;
            guard[2] = 5;
        });
        let comp = [4, 2, 5];
        lock.lock_with(|guard| assert_eq!(*guard, comp));
    }
}
