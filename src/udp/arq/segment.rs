use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::buffers::object_pool::Recyclable;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SegmentCommand {
    Push = 81,
    Ack = 82,
}

/// ```ascii
/// 0: conversation id (u32) - the receiving channel's connection number
/// 4: command (u8)
/// 5: fragment (u8) - number of segments that follow for the same message
/// 6: receive window (u16) - the sender's free receive window
/// 8: timestamp (u32)
/// 12: sequence number (u32)
/// 16: una (u32) - the sender has received all segments with lower sequence numbers
/// 20: data length (u32)
/// 24: data
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: SegmentCommand,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

impl SegmentHeader {
    pub const SERIALIZED_LEN: usize = 24;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd.into());
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SegmentHeader> {
        let conv = buf.try_get_u32_le()?;
        let raw_cmd = buf.try_get_u8()?;
        let Ok(cmd) = SegmentCommand::try_from(raw_cmd) else {
            bail!("invalid segment command {}", raw_cmd);
        };
        Ok(SegmentHeader {
            conv,
            cmd,
            frg: buf.try_get_u8()?,
            wnd: buf.try_get_u16_le()?,
            ts: buf.try_get_u32_le()?,
            sn: buf.try_get_u32_le()?,
            una: buf.try_get_u32_le()?,
            len: buf.try_get_u32_le()?,
        })
    }
}

/// A data segment with its sender-side retransmission state. Segments are pooled, so their data
///  buffers are reused.
#[derive(Default, Debug)]
pub struct Segment {
    pub frg: u8,
    pub ts: u32,
    pub sn: u32,
    pub data: Vec<u8>,

    pub resend_ts: u32,
    pub rto: u32,
    pub fast_ack: u32,
    pub xmit: u32,
}

impl Recyclable for Segment {
    fn reset(&mut self) {
        self.frg = 0;
        self.ts = 0;
        self.sn = 0;
        self.data.clear();
        self.resend_ts = 0;
        self.rto = 0;
        self.fast_ack = 0;
        self.xmit = 0;
    }
}

impl Segment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn header(&self, conv: u32, wnd: u16, una: u32) -> SegmentHeader {
        SegmentHeader {
            conv,
            cmd: SegmentCommand::Push,
            frg: self.frg,
            wnd,
            ts: self.ts,
            sn: self.sn,
            una,
            len: self.data.len().prechecked_cast(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        SegmentHeader::SERIALIZED_LEN + self.data.len()
    }

    pub fn fill_from(&mut self, header: &SegmentHeader, data: &[u8]) {
        self.frg = header.frg;
        self.ts = header.ts;
        self.sn = header.sn;
        self.data.clear();
        self.data.extend_from_slice(&data[..header.len.safe_cast()]);
    }
}
