//! Process-wide pool of reusable byte buffers for block copy and fetch
//! traffic. Every `get` must be matched by a `put` on all paths.

use std::sync::{Mutex, OnceLock};

const MAX_POOLED_BUFFERS: usize = 64;

fn pool() -> &'static Mutex<Vec<Vec<u8>>> {
    static POOL: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

fn lock() -> std::sync::MutexGuard<'static, Vec<Vec<u8>>> {
    match pool().lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("buffer pool lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    }
}

/// Returns a zero-initialized buffer of exactly `size` bytes, reusing a
/// pooled allocation when one is large enough.
pub fn get(size: usize) -> Vec<u8> {
    let mut buf = {
        let mut guard = lock();
        match guard.iter().position(|b| b.capacity() >= size) {
            Some(idx) => guard.swap_remove(idx),
            None => Vec::with_capacity(size),
        }
    };
    buf.clear();
    buf.resize(size, 0);
    buf
}

/// Returns a buffer to the pool. Buffers beyond the pool cap are dropped.
pub fn put(buf: Vec<u8>) {
    if buf.capacity() == 0 {
        return;
    }
    let mut guard = lock();
    if guard.len() < MAX_POOLED_BUFFERS {
        guard.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_requested_size() {
        let buf = get(1234);
        assert_eq!(buf.len(), 1234);
        assert!(buf.iter().all(|&b| b == 0));
        put(buf);
    }

    #[test]
    fn put_then_get_reuses_capacity() {
        let mut buf = get(4096);
        buf[0] = 0xFF;
        let cap = buf.capacity();
        put(buf);

        let again = get(1024);
        // A pooled buffer large enough must come back zeroed.
        assert_eq!(again.len(), 1024);
        assert!(again.iter().all(|&b| b == 0));
        assert!(again.capacity() >= 1024);
        assert!(cap >= 4096);
        put(again);
    }
}
