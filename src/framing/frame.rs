use bytes::{Buf, BufMut};
use crate::config::ServiceType;

/// The header at the start of every application message. The opcode identifies the message
///  type; the routing id addresses an entity inside the receiving process and is present for
///  inner services only.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub opcode: u16,
    pub routing_id: u128,
}

impl FrameHeader {
    pub fn new(opcode: u16) -> FrameHeader {
        FrameHeader {
            opcode,
            routing_id: 0,
        }
    }

    pub fn serialized_len(service_type: ServiceType) -> usize {
        if service_type.has_routing_id() {
            size_of::<u16>() + size_of::<u128>()
        }
        else {
            size_of::<u16>()
        }
    }

    /// The routing id is silently omitted for outer services.
    pub fn ser(&self, service_type: ServiceType, buf: &mut impl BufMut) {
        buf.put_u16_le(self.opcode);
        if service_type.has_routing_id() {
            buf.put_u128_le(self.routing_id);
        }
    }

    /// Reads the header, leaving `buf` positioned at the start of the payload
    pub fn deser(service_type: ServiceType, buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        let opcode = buf.try_get_u16_le()?;
        let routing_id = if service_type.has_routing_id() {
            buf.try_get_u128_le()?
        }
        else {
            0
        };

        Ok(FrameHeader {
            opcode,
            routing_id,
        })
    }
}
