use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Stored chunks never exceed this size, so partial consumption from the
/// front stays cheap regardless of how large the writes were.
const MAX_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer of capacity {capacity} can never hold {size} bytes")]
    TooLarge { size: usize, capacity: usize },
    #[error("timed out waiting for buffer space")]
    Timeout,
}

/// FIFO byte buffer over a deque of chunks.
///
/// `put` appends, `get` peeks (optionally consuming) from the front, `cut`
/// consumes. Chunks share the underlying allocation of the `Bytes` handed in,
/// split to at most [`MAX_CHUNK_SIZE`].
#[derive(Default)]
pub struct StreamBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
}

impl StreamBuffer {
    pub fn new() -> StreamBuffer {
        StreamBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn put(&mut self, data: impl Into<Bytes>) {
        let mut data = data.into();
        self.size += data.len();
        while data.len() > MAX_CHUNK_SIZE {
            self.chunks.push_back(data.split_to(MAX_CHUNK_SIZE));
        }
        if !data.is_empty() {
            self.chunks.push_back(data);
        }
    }

    /// Return up to `size` bytes from the front, consuming them iff `cut`.
    pub fn get(&mut self, size: usize, cut: bool) -> Bytes {
        let size = size.min(self.size);
        if size == 0 {
            return Bytes::new();
        }

        // single-chunk reads stay zero-copy
        if self.chunks[0].len() >= size {
            let result = self.chunks[0].slice(..size);
            if cut {
                self.advance(size);
            }
            return result;
        }

        let mut result = BytesMut::with_capacity(size);
        let mut remaining = size;
        for chunk in &self.chunks {
            let take = remaining.min(chunk.len());
            result.extend_from_slice(&chunk[..take]);
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        if cut {
            self.advance(size);
        }
        result.freeze()
    }

    /// Discard `size` bytes from the front (saturating).
    pub fn cut(&mut self, size: usize) {
        self.advance(size.min(self.size));
    }

    fn advance(&mut self, mut size: usize) {
        self.size -= size;
        while size > 0 {
            let chunk = &mut self.chunks[0];
            if chunk.len() > size {
                chunk.advance(size);
                return;
            }
            size -= chunk.len();
            self.chunks.pop_front();
        }
    }
}

/// Size-capped [`StreamBuffer`] whose `put` blocks the calling thread until
/// the data fits or a timeout elapses.
///
/// This is a producer-side throttle for plain threads feeding data towards
/// the link loop. It must never be called from the loop task itself.
pub struct BoundedStreamBuffer {
    inner: Mutex<StreamBuffer>,
    space_freed: Condvar,
    capacity: usize,
}

impl BoundedStreamBuffer {
    pub fn new(capacity: usize) -> BoundedStreamBuffer {
        BoundedStreamBuffer {
            inner: Mutex::new(StreamBuffer::new()),
            space_freed: Condvar::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `data`, waiting up to `timeout` for enough free space.
    pub fn put(&self, data: impl Into<Bytes>, timeout: Duration) -> Result<(), BufferError> {
        let data = data.into();
        if data.len() > self.capacity {
            return Err(BufferError::TooLarge {
                size: data.len(),
                capacity: self.capacity,
            });
        }

        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.len() + data.len() > self.capacity {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BufferError::Timeout);
            }
            self.space_freed.wait_for(&mut inner, remaining);
        }
        inner.put(data);
        Ok(())
    }

    pub fn get(&self, size: usize, cut: bool) -> Bytes {
        let mut inner = self.inner.lock();
        let result = inner.get(size, cut);
        if cut {
            self.space_freed.notify_all();
        }
        result
    }

    pub fn cut(&self, size: usize) {
        self.inner.lock().cut(size);
        self.space_freed.notify_all();
    }
}
