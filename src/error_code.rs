use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The closed set of channel-level failures. The numeric value is what goes over the wire in a
///  FIN frame, so existing values must never be renumbered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive, thiserror::Error)]
#[repr(u32)]
pub enum ErrorCode {
    #[error("no handshake acknowledgement within the connect timeout")]
    ConnectTimeout = 100_201,
    #[error("accepted channel did not complete its handshake within the connect timeout")]
    AcceptTimeout = 100_202,
    #[error("peer closed the channel")]
    PeerDisconnect = 100_203,
    #[error("sending on the socket failed")]
    SocketSendFailure = 100_204,
    #[error("socket error")]
    SocketError = 100_205,
    #[error("received data could not be parsed into frames")]
    PacketParserError = 100_206,
    #[error("fragmented message announced an invalid total length")]
    FragmentCountMismatch = 100_207,
    #[error("received fragment does not fit the announced total length")]
    FragmentSizeMismatch = 100_208,
    #[error("too many unacknowledged messages pending")]
    SendWindowExceeded = 100_209,
    #[error("message exceeds the maximum message size")]
    MessageTooLarge = 100_210,
    #[error("peer does not know the channel")]
    ChannelNotFound = 100_211,
    #[error("reliable session reported an empty message")]
    PeekError = 100_212,
    #[error("reliable session gave up retransmitting")]
    SessionDead = 100_213,
    #[error("stream connection could not be established")]
    ConnectFailed = 100_214,
}

impl ErrorCode {
    /// wire representation of 'no error', e.g. in a FIN for an explicitly removed channel
    pub const NONE: u32 = 0;

    /// FIN frames carry a raw code - unknown values (e.g. from a newer peer) are kept as raw values
    pub fn describe_raw(raw: u32) -> String {
        match ErrorCode::try_from(raw) {
            Ok(code) => format!("{:?}", code),
            Err(_) if raw == Self::NONE => "none".to_string(),
            Err(_) => format!("unknown({})", raw),
        }
    }
}
