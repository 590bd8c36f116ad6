use std::net::SocketAddr;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameFlag {
    Syn = 1,
    Ack = 2,
    Fin = 3,
    Msg = 4,
    ReconnectSyn = 5,
    ReconnectAck = 6,
}

/// flag and sender connection number precede the ARQ segments in a MSG datagram
pub const MSG_PREFIX_LEN: usize = 5;

const CONN_PAIR_LEN: usize = 9;
const WITH_CODE_LEN: usize = 13;

/// A decoded datagram. Decoding validates lengths, so handlers can rely on well-formed frames.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlFrame<'a> {
    Syn { sender_conn: u32, receiver_conn: u32, real_address: Option<SocketAddr> },
    Ack { sender_conn: u32, receiver_conn: u32 },
    Fin { sender_conn: u32, receiver_conn: u32, error: u32 },
    /// `segments` is the datagram after the MSG prefix, i.e. starting with the receiver's
    ///  connection number as the first segment's conversation id
    Msg { sender_conn: u32, receiver_conn: u32, segments: &'a [u8] },
    ReconnectSyn { sender_conn: u32, receiver_conn: u32, nonce: u32 },
    ReconnectAck { sender_conn: u32, receiver_conn: u32, nonce: u32 },
}

impl<'a> ControlFrame<'a> {
    pub fn flag(&self) -> FrameFlag {
        match self {
            ControlFrame::Syn { .. } => FrameFlag::Syn,
            ControlFrame::Ack { .. } => FrameFlag::Ack,
            ControlFrame::Fin { .. } => FrameFlag::Fin,
            ControlFrame::Msg { .. } => FrameFlag::Msg,
            ControlFrame::ReconnectSyn { .. } => FrameFlag::ReconnectSyn,
            ControlFrame::ReconnectAck { .. } => FrameFlag::ReconnectAck,
        }
    }

    pub fn deser(datagram: &'a [u8]) -> anyhow::Result<ControlFrame<'a>> {
        let mut buf = datagram;
        let flag = buf.try_get_u8()?;
        let flag = FrameFlag::try_from(flag)
            .map_err(|_| anyhow!("unknown frame flag {}", flag))?;

        let expect_len = |valid: bool| -> anyhow::Result<()> {
            if !valid {
                bail!("invalid length {} for {:?}", datagram.len(), flag);
            }
            Ok(())
        };

        let frame = match flag {
            FrameFlag::Syn => {
                expect_len(datagram.len() >= CONN_PAIR_LEN)?;
                let sender_conn = buf.try_get_u32_le()?;
                let receiver_conn = buf.try_get_u32_le()?;
                let real_address = if buf.is_empty() {
                    None
                }
                else {
                    let s = std::str::from_utf8(buf)?;
                    Some(s.parse::<SocketAddr>()?)
                };
                ControlFrame::Syn { sender_conn, receiver_conn, real_address }
            }
            FrameFlag::Ack => {
                expect_len(datagram.len() == CONN_PAIR_LEN)?;
                ControlFrame::Ack {
                    sender_conn: buf.try_get_u32_le()?,
                    receiver_conn: buf.try_get_u32_le()?,
                }
            }
            FrameFlag::Fin => {
                expect_len(datagram.len() == WITH_CODE_LEN)?;
                ControlFrame::Fin {
                    sender_conn: buf.try_get_u32_le()?,
                    receiver_conn: buf.try_get_u32_le()?,
                    error: buf.try_get_u32_le()?,
                }
            }
            FrameFlag::Msg => {
                expect_len(datagram.len() >= CONN_PAIR_LEN)?;
                let sender_conn = buf.try_get_u32_le()?;
                let segments = buf;
                let receiver_conn = buf.try_get_u32_le()?;
                ControlFrame::Msg { sender_conn, receiver_conn, segments }
            }
            FrameFlag::ReconnectSyn => {
                expect_len(datagram.len() == WITH_CODE_LEN)?;
                ControlFrame::ReconnectSyn {
                    sender_conn: buf.try_get_u32_le()?,
                    receiver_conn: buf.try_get_u32_le()?,
                    nonce: buf.try_get_u32_le()?,
                }
            }
            FrameFlag::ReconnectAck => {
                expect_len(datagram.len() == WITH_CODE_LEN)?;
                ControlFrame::ReconnectAck {
                    sender_conn: buf.try_get_u32_le()?,
                    receiver_conn: buf.try_get_u32_le()?,
                    nonce: buf.try_get_u32_le()?,
                }
            }
        };
        Ok(frame)
    }

    /// Writes the complete datagram for all frames except MSG, for which only the prefix is
    ///  written (see [write_msg_prefix])
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flag().into());
        match self {
            ControlFrame::Syn { sender_conn, receiver_conn, real_address } => {
                buf.put_u32_le(*sender_conn);
                buf.put_u32_le(*receiver_conn);
                if let Some(addr) = real_address {
                    buf.put_slice(addr.to_string().as_bytes());
                }
            }
            ControlFrame::Ack { sender_conn, receiver_conn } => {
                buf.put_u32_le(*sender_conn);
                buf.put_u32_le(*receiver_conn);
            }
            ControlFrame::Fin { sender_conn, receiver_conn, error } => {
                buf.put_u32_le(*sender_conn);
                buf.put_u32_le(*receiver_conn);
                buf.put_u32_le(*error);
            }
            ControlFrame::Msg { sender_conn, .. } => {
                buf.put_u32_le(*sender_conn);
            }
            ControlFrame::ReconnectSyn { sender_conn, receiver_conn, nonce } |
            ControlFrame::ReconnectAck { sender_conn, receiver_conn, nonce } => {
                buf.put_u32_le(*sender_conn);
                buf.put_u32_le(*receiver_conn);
                buf.put_u32_le(*nonce);
            }
        }
    }
}

/// Write the MSG prefix into the first [MSG_PREFIX_LEN] bytes of a datagram whose ARQ segments
///  were already written after them
pub fn write_msg_prefix(datagram: &mut [u8], sender_conn: u32) {
    let mut prefix = &mut datagram[..MSG_PREFIX_LEN];
    prefix.put_u8(FrameFlag::Msg.into());
    prefix.put_u32_le(sender_conn);
}
