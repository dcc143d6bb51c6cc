use std::sync::Arc;
use std::thread;

use criterion::{black_box, Bencher};

/// One locking shape for every flavour in the crate, so each bench harness
/// can be generated from the same generators. Detecting flavours unwrap:
/// the bench workloads never build wait-for cycles.
pub trait BenchMutex: Send + Sync + Sized + 'static {
    fn new(value: u32) -> Self;

    fn with_lock<Ret>(&self, f: impl FnOnce(&mut u32) -> Ret) -> Ret;
}

impl BenchMutex for detlock::Mutex<u32> {
    fn new(value: u32) -> Self {
        Self::new(value)
    }

    fn with_lock<Ret>(&self, f: impl FnOnce(&mut u32) -> Ret) -> Ret {
        f(&mut self.lock())
    }
}

impl BenchMutex for detlock::DeadlockSafeMutex<u32> {
    fn new(value: u32) -> Self {
        Self::new(value)
    }

    fn with_lock<Ret>(&self, f: impl FnOnce(&mut u32) -> Ret) -> Ret {
        f(&mut self.lock().unwrap())
    }
}

impl BenchMutex for detlock::FairMutex<u32> {
    fn new(value: u32) -> Self {
        Self::new(value)
    }

    fn with_lock<Ret>(&self, f: impl FnOnce(&mut u32) -> Ret) -> Ret {
        f(&mut self.lock())
    }
}

impl BenchMutex for detlock::FairDeadlockSafeMutex<u32> {
    fn new(value: u32) -> Self {
        Self::new(value)
    }

    fn with_lock<Ret>(&self, f: impl FnOnce(&mut u32) -> Ret) -> Ret {
        f(&mut self.lock().unwrap())
    }
}

pub fn gen_create<M: BenchMutex>(bencher: &mut Bencher) {
    bencher.iter(|| {
        let value = black_box(0);
        M::new(value)
    });
}

pub fn gen_lock_unlock<M: BenchMutex>(bencher: &mut Bencher) {
    let mutex = M::new(0);

    bencher.iter(|| {
        mutex.with_lock(|value| *value = value.wrapping_add(1));
    })
}

pub fn gen_lock_unlock_read_contention<M: BenchMutex>(bencher: &mut Bencher) {
    let data = Arc::new(M::new(0));

    let thread = thread::spawn({
        let data = Arc::clone(&data);

        move || {
            while Arc::strong_count(&data) > 1 {
                for _ in 0..1000 {
                    black_box(data.with_lock(|value| *value));
                }
            }
        }
    });

    bencher.iter(|| {
        data.with_lock(|value| *value = value.wrapping_add(1));
    });

    drop(data);
    thread.join().unwrap();
}

pub fn gen_lock_unlock_write_contention<M: BenchMutex>(bencher: &mut Bencher) {
    let data = Arc::new(M::new(0));

    let thread = thread::spawn({
        let data = Arc::clone(&data);

        move || {
            while Arc::strong_count(&data) > 1 {
                for _ in 0..1000 {
                    data.with_lock(|value| *value = value.wrapping_add(1));
                }
            }
        }
    });

    bencher.iter(|| {
        data.with_lock(|value| *value = value.wrapping_add(1));
    });

    drop(data);
    thread.join().unwrap();
}

#[macro_export]
macro_rules! generate_bench {
    ($mutex:ty: $create:literal, $lock_unlock:literal, $read_cont:literal, $write_cont:literal) => {
        use criterion::{criterion_group, criterion_main, Criterion};
        use $crate::*;

        fn create(criterion: &mut Criterion) {
            criterion.bench_function($create, |bench| gen_create::<$mutex>(bench));
        }

        fn lock_unlock(criterion: &mut Criterion) {
            criterion.bench_function($lock_unlock, |bench| gen_lock_unlock::<$mutex>(bench));
        }

        fn lock_unlock_read_contention(criterion: &mut Criterion) {
            criterion
                .bench_function($read_cont, |bench| gen_lock_unlock_read_contention::<$mutex>(bench));
        }

        fn lock_unlock_write_contention(criterion: &mut Criterion) {
            criterion.bench_function($write_cont, |bench| {
                gen_lock_unlock_write_contention::<$mutex>(bench)
            });
        }

        criterion_group!(
            mutex,
            create,
            lock_unlock,
            lock_unlock_read_contention,
            lock_unlock_write_contention,
        );

        criterion_main!(mutex);
    };
}
