use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use crate::util::random::{Random, RngRandom};
use crate::util::safe_converter::SafeCast;

/// The side that initiated a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Connect,
    Accept,
}

/// Local bookkeeping identifier of a channel.
///
/// ```ascii
/// bits 32-63: sequence - counting down from u32::MAX for connect-side ids, up from 1 for
///              accept-side ids, so the two namespaces never meet
/// bits  0-31: local connection number, i.e. the number the peer uses to address this channel
/// ```
///
/// Zero is never generated and stands for 'no channel'.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub const NONE: ChannelId = ChannelId(0);

    const CONNECT_SEQUENCE_FLOOR: u32 = 1 << 31;

    pub fn from_parts(sequence: u32, local_conn: u32) -> ChannelId {
        ChannelId((SafeCast::<u64>::safe_cast(sequence) << 32) | SafeCast::<u64>::safe_cast(local_conn))
    }

    pub fn from_raw(raw: u64) -> ChannelId {
        ChannelId(raw)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn sequence(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn local_conn(&self) -> u32 {
        self.0 as u32
    }

    pub fn direction(&self) -> Direction {
        if self.sequence() >= Self::CONNECT_SEQUENCE_FLOOR {
            Direction::Connect
        }
        else {
            Direction::Accept
        }
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}:{}", self.sequence(), self.local_conn())
    }
}
impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelId({})", self)
    }
}


/// Hands out fresh [ChannelId]s. There is one generator per composition root (see
///  [crate::net_services::NetServices]) shared by all of its services, so ids are unique across
///  services as well.
pub struct ChannelIdGenerator {
    connect_sequence: AtomicU32,
    accept_sequence: AtomicU32,
    accept_conn: AtomicU32,
}

impl Default for ChannelIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelIdGenerator {
    /// Connection numbers below this value are never handed out
    pub const MIN_CONN: u32 = 100;
    const ACCEPT_CONN_START: u32 = 1 << 31;

    pub fn new() -> ChannelIdGenerator {
        ChannelIdGenerator {
            connect_sequence: AtomicU32::new(u32::MAX),
            accept_sequence: AtomicU32::new(1),
            accept_conn: AtomicU32::new(Self::ACCEPT_CONN_START),
        }
    }

    /// connect-side id with a random local connection number - the peer must echo it back, so
    ///  it should be hard to guess
    pub fn new_connect_id(&self) -> ChannelId {
        self.new_connect_id_with::<RngRandom>()
    }

    fn new_connect_id_with<R: Random>(&self) -> ChannelId {
        let sequence = self.connect_sequence.fetch_sub(1, Ordering::AcqRel);
        let local_conn = R::gen_u32_range(Self::MIN_CONN..=u32::MAX);
        ChannelId::from_parts(sequence, local_conn)
    }

    /// accept-side id with a sequential local connection number
    pub fn new_accept_id(&self) -> ChannelId {
        let sequence = self.accept_sequence.fetch_add(1, Ordering::AcqRel);

        let mut local_conn = self.accept_conn.fetch_add(1, Ordering::AcqRel);
        while local_conn < Self::MIN_CONN {
            // wrapped around
            local_conn = self.accept_conn.fetch_add(1, Ordering::AcqRel);
        }
        ChannelId::from_parts(sequence, local_conn)
    }
}
