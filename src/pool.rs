//! Reusable PDU-sized buffer pool
//!
//! Every frame a session touches lives in a buffer of exactly
//! `pdu_size + 7` bytes (the negotiated maximum PDU plus the TPKT/COTP
//! overhead), so no request or response ever reallocates. The pool holds
//! one buffer per job slot plus one for the reader; acquisition suspends
//! when all buffers are out, release happens on drop.

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::error::{S7Error, S7Result};

struct PoolInner {
    // Plain mutex: the critical section is a push/pop.
    buffers: Mutex<Vec<Vec<u8>>>,
    available: Semaphore,
    buffer_size: usize,
}

/// Fixed-capacity pool of equally sized byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        let buffers = (0..capacity).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(buffers),
                available: Semaphore::new(capacity),
                buffer_size,
            }),
        }
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Take a buffer out of the pool, suspending until one is free.
    ///
    /// Fails with [`S7Error::SessionClosed`] once the pool is closed.
    pub async fn acquire(&self) -> S7Result<PooledBuffer> {
        let permit = self
            .inner
            .available
            .acquire()
            .await
            .map_err(|_| S7Error::SessionClosed)?;
        permit.forget();
        let buf = self
            .inner
            .buffers
            .lock()
            .expect("pool lock poisoned")
            .pop()
            .expect("pool invariant: permit held but no buffer available");
        Ok(PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Close the pool: pending and future acquisitions fail with
    /// [`S7Error::SessionClosed`]. Buffers already handed out return
    /// normally on drop.
    pub fn close(&self) {
        self.inner.available.close();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`]; returns itself on drop.
///
/// Derefs to its byte contents, so the codec and the executor see only a
/// mutable byte region.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer present until drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer present until drop")
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.as_ref().map(Vec::len))
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Ok(mut buffers) = self.pool.buffers.lock() {
                buffers.push(buf);
                self.pool.available.add_permits(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = BufferPool::new(1031, 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(a.len(), 1031);
        assert_eq!(b.len(), 1031);

        // Pool is empty: a third acquisition must suspend.
        let pending = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(pending.is_err());

        drop(a);
        let c = tokio::time::timeout(Duration::from_millis(200), pool.acquire())
            .await
            .expect("released buffer becomes available")
            .unwrap();
        assert_eq!(c.len(), 1031);
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn test_buffer_is_writable() {
        let pool = BufferPool::new(64, 1);
        let mut buf = pool.acquire().await.unwrap();
        buf[0] = 0x03;
        buf[63] = 0xFF;
        assert_eq!(buf[0], 0x03);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let pool = BufferPool::new(64, 1);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        pool.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(S7Error::SessionClosed)));
        drop(held);
    }
}
