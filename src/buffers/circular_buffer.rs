use std::collections::VecDeque;
use std::sync::Arc;
use bytes::BufMut;
use crate::buffers::chunk_pool::{ChunkPool, PoolChunk};

/// Growing FIFO byte buffer made of pooled chunks. Stream transports append received bytes at
///  the end and the packet parser consumes them from the front. Chunks are borrowed as the
///  buffer grows and go back to the pool as soon as they are fully consumed.
pub struct CircularBuffer {
    pool: Arc<ChunkPool>,
    chunks: VecDeque<PoolChunk>,
    /// read position in the first chunk
    read_pos: usize,
    /// write position in the last chunk
    write_pos: usize,
    len: usize,
}

impl CircularBuffer {
    pub fn new(pool: Arc<ChunkPool>) -> CircularBuffer {
        CircularBuffer {
            pool,
            chunks: VecDeque::new(),
            read_pos: 0,
            write_pos: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&mut self, mut data: &[u8]) {
        let chunk_size = self.pool.chunk_size();

        while !data.is_empty() {
            if self.chunks.is_empty() || self.write_pos == chunk_size {
                self.chunks.push_back(self.pool.take_chunk());
                self.write_pos = 0;
            }
            if let Some(last) = self.chunks.back_mut() {
                let n = data.len().min(chunk_size - self.write_pos);
                last.bytes_mut()[self.write_pos..self.write_pos + n].copy_from_slice(&data[..n]);
                self.write_pos += n;
                self.len += n;
                data = &data[n..];
            }
        }
    }

    /// Move `n` bytes from the front of this buffer to `dst`.
    ///
    /// Panics if fewer than `n` bytes are buffered - callers check [CircularBuffer::len] first.
    pub fn read_to(&mut self, mut n: usize, dst: &mut impl BufMut) {
        assert!(n <= self.len, "reading {} bytes with only {} buffered", n, self.len);
        let chunk_size = self.pool.chunk_size();

        while n > 0 {
            let is_last = self.chunks.len() == 1;
            let Some(first) = self.chunks.front() else {
                break;
            };

            let end = if is_last { self.write_pos } else { chunk_size };
            let num_bytes = n.min(end - self.read_pos);
            dst.put_slice(&first.bytes()[self.read_pos..self.read_pos + num_bytes]);
            self.read_pos += num_bytes;
            self.len -= num_bytes;
            n -= num_bytes;

            if self.read_pos == end {
                if is_last {
                    // keep the chunk for subsequent writes
                    self.read_pos = 0;
                    self.write_pos = 0;
                }
                else {
                    self.chunks.pop_front();
                    self.read_pos = 0;
                }
            }
        }
    }

    pub fn read_exact(&mut self, dst: &mut [u8]) {
        let n = dst.len();
        let mut dst = dst;
        self.read_to(n, &mut dst);
    }

    /// Drop all buffered bytes and hand the chunks back to the pool
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
    }
}
