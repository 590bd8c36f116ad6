use std::sync::Arc;
use anyhow::bail;
use bytes::{Buf, BufMut};
use tracing::trace;
use crate::buffers::chunk_pool::{ChunkPool, SharedBuf};
use crate::buffers::circular_buffer::CircularBuffer;
use crate::config::ServiceType;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Frames smaller than this can not even hold an opcode
pub const MIN_FRAME_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ParserState {
    Size,
    Body { size: usize },
}

/// Splits a received byte stream into frames. Bytes are pushed as they arrive, in arbitrarily
///  sized pieces; complete frames are taken out by calling [PacketParser::parse] until it returns
///  `None`.
pub struct PacketParser {
    service_type: ServiceType,
    pool: Arc<ChunkPool>,
    buffer: CircularBuffer,
    state: ParserState,
}

impl PacketParser {
    pub fn new(service_type: ServiceType, pool: Arc<ChunkPool>) -> PacketParser {
        PacketParser {
            service_type,
            buffer: CircularBuffer::new(pool.clone()),
            pool,
            state: ParserState::Size,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.write(data);
    }

    /// number of bytes received but not yet returned as part of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The next complete frame without its size prefix, or `None` if more input is needed.
    ///
    /// An error means the stream is corrupt, and the connection can not be used any further.
    pub fn parse(&mut self) -> anyhow::Result<Option<SharedBuf>> {
        loop {
            match self.state {
                ParserState::Size => {
                    let prefix_len = self.service_type.length_prefix_len();
                    if self.buffer.len() < prefix_len {
                        return Ok(None);
                    }

                    let size = self.read_size(prefix_len);
                    if size < MIN_FRAME_SIZE {
                        bail!("frame size {} is below the minimum of {}", size, MIN_FRAME_SIZE);
                    }
                    if size > self.service_type.max_frame_size() {
                        bail!("frame size {} exceeds the maximum of {}", size, self.service_type.max_frame_size());
                    }
                    self.state = ParserState::Body { size };
                }
                ParserState::Body { size } => {
                    if self.buffer.len() < size {
                        return Ok(None);
                    }

                    let mut frame = self.pool.acquire(size);
                    self.buffer.read_to(size, &mut frame);
                    self.state = ParserState::Size;
                    trace!("parsed frame of {} bytes", size);
                    return Ok(Some(frame.freeze()));
                }
            }
        }
    }

    fn read_size(&mut self, prefix_len: usize) -> usize {
        let mut prefix = [0u8; 4];
        self.buffer.read_exact(&mut prefix[..prefix_len]);
        let mut prefix: &[u8] = &prefix;
        match prefix_len {
            2 => prefix.get_u16_le().safe_cast(),
            _ => prefix.get_u32_le().safe_cast(),
        }
    }
}

/// Write `payload` (typically a frame header followed by the message body) with the size prefix
///  for the given service type.
pub fn write_frame(service_type: ServiceType, payload: &mut impl Buf, dst: &mut impl BufMut) -> anyhow::Result<()> {
    let size = payload.remaining();
    if size < MIN_FRAME_SIZE || size > service_type.max_frame_size() {
        bail!("frame size {} is outside the valid range {}..={}", size, MIN_FRAME_SIZE, service_type.max_frame_size());
    }

    match service_type.length_prefix_len() {
        2 => dst.put_u16_le(size.prechecked_cast()),
        _ => dst.put_u32_le(size.prechecked_cast()),
    }
    dst.put(payload);
    Ok(())
}
