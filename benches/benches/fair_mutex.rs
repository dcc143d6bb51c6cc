detlock_benches::generate_bench!(
    detlock::FairMutex<u32>:
    "fair_mutex_create",
    "fair_mutex_lock_unlock",
    "fair_mutex_lock_unlock_read_contention",
    "fair_mutex_lock_unlock_write_contention"
);
