use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Upper bound on idle buffers retained per shelf.
const MAX_POOLED: usize = 1024;

/// A buffer that grew past this multiple of its shelf size is dropped on
/// release instead of being retained.
const MAX_GROWTH_FACTOR: usize = 4;

struct Shelf {
    size: usize,
    idle: Mutex<Vec<BytesMut>>,
}

impl Shelf {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            idle: Mutex::new(Vec::new()),
        })
    }

    fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .idle
            .lock()
            .expect("buffer shelf lock")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.size));
        PooledBuf {
            buf: Some(buf),
            shelf: Arc::clone(self),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.size * MAX_GROWTH_FACTOR {
            return;
        }
        buf.clear();
        let mut idle = self.idle.lock().expect("buffer shelf lock");
        if idle.len() < MAX_POOLED {
            idle.push(buf);
        }
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().expect("buffer shelf lock").len()
    }
}

/// An owned buffer lease. Dropping the lease clears the buffer and returns
/// it to the shelf it came from, so every exit path of a connection task —
/// panics included — releases exactly once.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    shelf: Arc<Shelf>,
}

impl std::ops::Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("leased buffer present")
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("leased buffer present")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.shelf.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Process-wide pool of read/write buffers bound to connections.
///
/// The two classes are kept apart so a fleet of mostly-idle connections does
/// not inflate write buffers to the read size.
#[derive(Clone)]
pub struct BufioPool {
    read: Arc<Shelf>,
    write: Arc<Shelf>,
}

impl BufioPool {
    pub fn new(read_size: usize, write_size: usize) -> Self {
        Self {
            read: Shelf::new(read_size),
            write: Shelf::new(write_size),
        }
    }

    pub fn acquire_read(&self) -> PooledBuf {
        self.read.acquire()
    }

    pub fn acquire_write(&self) -> PooledBuf {
        self.write.acquire()
    }

    pub fn read_size(&self) -> usize {
        self.read.size
    }

    pub fn write_size(&self) -> usize {
        self.write.size
    }

    pub fn idle_counts(&self) -> (usize, usize) {
        (self.read.idle_count(), self.write.idle_count())
    }
}

/// Pool of growable scratch buffers used for header-block and chunk-line
/// assembly.
#[derive(Clone)]
pub struct ByteBufferPool {
    shelf: Arc<Shelf>,
}

impl ByteBufferPool {
    pub fn new(initial_size: usize) -> Self {
        Self {
            shelf: Shelf::new(initial_size),
        }
    }

    pub fn acquire(&self) -> PooledBuf {
        self.shelf.acquire()
    }

    pub fn idle_count(&self) -> usize {
        self.shelf.idle_count()
    }
}

impl Default for ByteBufferPool {
    fn default() -> Self {
        Self::new(4 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_returns_buffer_on_drop() {
        let pool = ByteBufferPool::new(64);
        assert_eq!(pool.idle_count(), 0);
        {
            let mut lease = pool.acquire();
            lease.extend_from_slice(b"hello");
            assert_eq!(&lease[..], b"hello");
        }
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.acquire();
        assert!(reused.is_empty(), "released buffer must come back cleared");
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn oversized_buffers_are_not_retained() {
        let pool = ByteBufferPool::new(16);
        {
            let mut lease = pool.acquire();
            lease.extend_from_slice(&[0u8; 1024]);
        }
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn bufio_pool_keeps_classes_separate() {
        let pool = BufioPool::new(8 * 1024, 4 * 1024);
        let r = pool.acquire_read();
        let w = pool.acquire_write();
        assert_eq!(r.capacity(), 8 * 1024);
        assert_eq!(w.capacity(), 4 * 1024);
        drop(r);
        drop(w);
        assert_eq!(pool.idle_counts(), (1, 1));
    }
}
