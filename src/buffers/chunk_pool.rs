//! Pooled, fixed-size memory chunks and the buffers built from them. All buffers on the hot path
//!  (received payloads, reassembly of fragmented messages, queued outbound messages, the stream
//!  transports' ring buffers) are made of chunks borrowed from a [ChunkPool].
//!
//! Their salient points are:
//!
//! * A [PooledBuf] exclusively owns its chunks and is writable through `BufMut`
//! * [PooledBuf::freeze] turns it into a [SharedBuf] which is immutable and reference counted:
//!    cloning or slicing it shares the chunks instead of copying them
//! * A chunk goes back to the pool when the last buffer referencing it is dropped. There is no
//!    way to reach a chunk's bytes except through a buffer handle, so 'use after release' and
//!    'double release' cannot be expressed
//! * [SharedBuf] implements `Buf` to fit into the `bytes` ecosystem

use std::fmt::{Debug, Formatter};
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use bytes::buf::UninitSlice;
use bytes::{Buf, BufMut};
use tracing::{debug, trace};

pub struct ChunkPool {
    chunk_size: usize,
    max_pooled: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
}

impl ChunkPool {
    pub fn new(chunk_size: usize, max_pooled: usize) -> Arc<ChunkPool> {
        assert!(chunk_size > 0, "chunk size must be positive");

        Arc::new(ChunkPool {
            chunk_size,
            max_pooled,
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// number of chunks currently borrowed from the pool, i.e. referenced by some buffer
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// number of chunks currently held by the pool for reuse
    pub fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Borrow a buffer with room for at least `min_size` bytes without further allocation. The
    ///  buffer grows by borrowing more chunks if more data is written to it.
    pub fn acquire(self: &Arc<Self>, min_size: usize) -> PooledBuf {
        let num_chunks = min_size.div_ceil(self.chunk_size).max(1);
        let mut chunks = Vec::with_capacity(num_chunks);
        for _ in 0..num_chunks {
            chunks.push(self.take_chunk());
        }

        PooledBuf {
            pool: self.clone(),
            chunks,
            len: 0,
        }
    }

    pub fn copy_from_slice(self: &Arc<Self>, data: &[u8]) -> SharedBuf {
        let mut buf = self.acquire(data.len());
        buf.put_slice(data);
        buf.freeze()
    }

    /// Hand a buffer back. Its chunks return to the pool once no other clone or slice of the
    ///  buffer references them any more.
    pub fn release(&self, buf: SharedBuf) {
        trace!("releasing buffer of {} bytes", buf.len());
        drop(buf);
    }

    pub(crate) fn take_chunk(self: &Arc<Self>) -> PoolChunk {
        let pooled = self.free.lock().unwrap_or_else(PoisonError::into_inner).pop();

        let data = match pooled {
            Some(data) => data,
            None => {
                debug!("no chunk in pool: allocating new chunk");
                vec![0u8; self.chunk_size].into_boxed_slice()
            }
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        PoolChunk {
            data,
            pool: self.clone(),
        }
    }

    fn return_chunk(&self, data: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_pooled {
            free.push(data);
        }
        else {
            debug!("pool is full: discarding returned chunk");
        }
    }
}


/// One chunk on loan from a pool. It goes back to the pool when dropped.
pub(crate) struct PoolChunk {
    data: Box<[u8]>,
    pool: Arc<ChunkPool>,
}
impl PoolChunk {
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
impl Drop for PoolChunk {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.return_chunk(data);
    }
}


/// Exclusively owned, writable buffer made of pooled chunks.
pub struct PooledBuf {
    pool: Arc<ChunkPool>,
    chunks: Vec<PoolChunk>,
    len: usize,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// number of bytes that can be written without borrowing more chunks
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.pool.chunk_size
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn freeze(self) -> SharedBuf {
        let chunk_size = self.pool.chunk_size;
        let len = self.len;
        SharedBuf {
            chunks: Arc::from(self.chunks),
            chunk_size,
            offset: 0,
            len,
        }
    }
}

impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuf(len={}, chunks={})", self.len, self.chunks.len())
    }
}

unsafe impl BufMut for PooledBuf {
    fn remaining_mut(&self) -> usize {
        isize::MAX as usize - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        if self.len == self.capacity() {
            let chunk = self.pool.take_chunk();
            self.chunks.push(chunk);
        }

        let chunk_size = self.pool.chunk_size;
        let offset = self.len % chunk_size;
        let chunk = &mut self.chunks[self.len / chunk_size];
        UninitSlice::new(&mut chunk.bytes_mut()[offset..])
    }
}


/// Immutable, reference counted view of pooled chunks. Clones and slices share the chunks.
#[derive(Clone)]
pub struct SharedBuf {
    chunks: Arc<[PoolChunk]>,
    chunk_size: usize,
    /// offset into the first chunk's data
    offset: usize,
    len: usize,
}

impl SharedBuf {
    pub fn empty() -> SharedBuf {
        SharedBuf {
            chunks: Arc::from(Vec::new()),
            chunk_size: 1,
            offset: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A view of part of this buffer, sharing its chunks.
    ///
    /// Panics if the range is out of bounds (like `Bytes::slice`).
    pub fn slice(&self, range: impl RangeBounds<usize>) -> SharedBuf {
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&n) => n + 1,
            Bound::Excluded(&n) => n,
            Bound::Unbounded => self.len,
        };
        assert!(start <= end, "slice start {} is after end {}", start, end);
        assert!(end <= self.len, "slice end {} is out of bounds for length {}", end, self.len);

        SharedBuf {
            chunks: self.chunks.clone(),
            chunk_size: self.chunk_size,
            offset: self.offset + start,
            len: end - start,
        }
    }

    /// the contiguous pieces of this buffer in order
    pub fn slices(&self) -> impl Iterator<Item=&[u8]> {
        let mut offset = self.offset;
        let mut remaining = self.len;
        let chunk_size = self.chunk_size;

        self.chunks.iter()
            .skip(offset / chunk_size)
            .map_while(move |chunk| {
                if remaining == 0 {
                    return None;
                }
                let start = offset % chunk_size;
                let end = chunk_size.min(start + remaining);
                remaining -= end - start;
                offset += end - start;
                Some(&chunk.bytes()[start..end])
            })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len);
        for s in self.slices() {
            result.extend_from_slice(s);
        }
        result
    }

    /// the content as a single slice if it does not span chunk boundaries
    pub fn as_contiguous(&self) -> Option<&[u8]> {
        let mut slices = self.slices();
        match (slices.next(), slices.next()) {
            (None, _) => Some(&[]),
            (Some(s), None) => Some(s),
            _ => None,
        }
    }
}

impl Buf for SharedBuf {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        let start = self.offset % self.chunk_size;
        let end = self.chunk_size.min(start + self.len);
        &self.chunks[self.offset / self.chunk_size].bytes()[start..end]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.len, "cannot advance {} bytes with only {} remaining", cnt, self.len);
        self.offset += cnt;
        self.len -= cnt;
    }
}

impl PartialEq for SharedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.to_vec() == other.to_vec()
    }
}
impl Eq for SharedBuf {}

impl PartialEq<[u8]> for SharedBuf {
    fn eq(&self, other: &[u8]) -> bool {
        if self.len != other.len() {
            return false;
        }
        let mut rest = other;
        for s in self.slices() {
            let (head, tail) = rest.split_at(s.len());
            if head != s {
                return false;
            }
            rest = tail;
        }
        true
    }
}

impl Debug for SharedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.to_vec().fmt(f)
    }
}
