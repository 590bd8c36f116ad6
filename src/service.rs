use std::collections::vec_deque::Drain;
use std::net::SocketAddr;
use std::sync::Arc;
use crate::buffers::chunk_pool::{ChunkPool, SharedBuf};
use crate::channel_id::ChannelId;
use crate::config::ServiceType;
use crate::error_code::ErrorCode;

/// Notifications from a service to its owner. They are queued while the service processes
///  [Service::update] or [Service::send], and the owner drains them afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServiceEvent {
    /// A peer opened a channel. For routed channels, `remote_address` is the peer's real address
    ///  rather than the relay's.
    Accepted { channel_id: ChannelId, remote_address: SocketAddr },
    Read { channel_id: ChannelId, payload: SharedBuf },
    /// The channel failed. It is already removed when this event is queued, so any further
    ///  operation on the id is a no-op.
    Error { channel_id: ChannelId, error: ErrorCode },
    /// The peer acknowledged a reconnect request
    Reconnected { channel_id: ChannelId },
}

impl ServiceEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ServiceEvent::Accepted { channel_id, .. } |
            ServiceEvent::Read { channel_id, .. } |
            ServiceEvent::Error { channel_id, .. } |
            ServiceEvent::Reconnected { channel_id } => *channel_id,
        }
    }
}

/// A transport service: owns one socket and the channels multiplexed over it. All operations are
///  non-blocking, and all state changes that are visible to the owner happen inside these calls.
pub trait Service: Send {
    fn service_type(&self) -> ServiceType;

    /// Open a channel to `address`. A channel with this id that exists already is left alone.
    fn create(&mut self, id: ChannelId, address: SocketAddr);

    /// Send a message on a channel. Sending on an unknown (e.g. failed) channel does nothing.
    fn send(&mut self, id: ChannelId, payload: SharedBuf);

    /// Close a channel without queueing an error event
    fn remove(&mut self, id: ChannelId);

    /// Do all pending work: timers, received data, retransmissions
    fn update(&mut self);

    fn drain_events(&mut self) -> Drain<'_, ServiceEvent>;

    fn contains(&self, id: ChannelId) -> bool;

    fn is_disposed(&self) -> bool;

    /// Close all channels and the socket
    fn dispose(&mut self);

    fn local_addr(&self) -> Option<SocketAddr>;

    fn chunk_pool(&self) -> &Arc<ChunkPool>;
}
