/// Return a thread count suitable for CPU-bound rayon pools.
///
/// Reserves 2 cores for the rest of the worker (heartbeat, store I/O) but
/// never returns less than 1.
pub fn capped_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2).max(1))
        .unwrap_or(1)
}

/// Lowercase hex rendering of a digest.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
