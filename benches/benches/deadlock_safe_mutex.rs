detlock_benches::generate_bench!(
    detlock::DeadlockSafeMutex<u32>:
    "deadlock_safe_mutex_create",
    "deadlock_safe_mutex_lock_unlock",
    "deadlock_safe_mutex_lock_unlock_read_contention",
    "deadlock_safe_mutex_lock_unlock_write_contention"
);
