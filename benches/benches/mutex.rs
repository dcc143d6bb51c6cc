detlock_benches::generate_bench!(
    detlock::Mutex<u32>:
    "mutex_create",
    "mutex_lock_unlock",
    "mutex_lock_unlock_read_contention",
    "mutex_lock_unlock_write_contention"
);
