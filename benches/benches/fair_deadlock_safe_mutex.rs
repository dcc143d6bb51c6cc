detlock_benches::generate_bench!(
    detlock::FairDeadlockSafeMutex<u32>:
    "fair_deadlock_safe_mutex_create",
    "fair_deadlock_safe_mutex_lock_unlock",
    "fair_deadlock_safe_mutex_lock_unlock_read_contention",
    "fair_deadlock_safe_mutex_lock_unlock_write_contention"
);
