use std::collections::VecDeque;
use std::net::SocketAddr;
use bytes::{Buf, BufMut};
use tracing::{debug, info, trace, warn};
use crate::buffers::chunk_pool::{PooledBuf, SharedBuf};
use crate::buffers::object_pool::ObjectPool;
use crate::channel_id::{ChannelId, Direction};
use crate::error_code::ErrorCode;
use crate::service::ServiceEvent;
use crate::udp::arq::{Arq, ReliableSession};
use crate::udp::control_frame::{write_msg_prefix, ControlFrame};
use crate::udp::udp_service::ServiceCore;
use crate::util::clock::time_diff;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// length of the record announcing a fragmented message: zero marker (u32) + total length (u32)
pub const FRAGMENT_HEADER_LEN: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Closed,
}

struct Reassembly {
    buf: PooledBuf,
    total: usize,
}

/// One reliable UDP connection: handshake, fragmentation and reassembly of messages, and
///  queueing of messages sent before the handshake completed.
///
/// A channel never removes itself. Operations that fail return the [ErrorCode], and the owning
///  service removes the channel from its tables before disposing it.
pub struct Channel {
    id: ChannelId,
    remote_address: SocketAddr,
    /// target address if the channel is routed through a relay
    real_address: Option<SocketAddr>,
    local_conn: u32,
    remote_conn: u32,
    state: ChannelState,
    create_time: u32,
    last_syn_time: u32,

    /// messages sent before the reliable session is attached
    wait_send: VecDeque<SharedBuf>,
    reassembly: Option<Reassembly>,
    session: Option<Box<dyn ReliableSession>>,

    pending_reconnect: Option<u32>,
}

impl Channel {
    pub fn new_connect(id: ChannelId, remote_address: SocketAddr, real_address: Option<SocketAddr>, now: u32) -> Channel {
        Channel {
            id,
            remote_address,
            real_address,
            local_conn: id.local_conn(),
            remote_conn: 0,
            state: ChannelState::Connecting,
            create_time: now,
            last_syn_time: now,
            wait_send: VecDeque::new(),
            reassembly: None,
            session: None,
            pending_reconnect: None,
        }
    }

    /// The peer's connection number is known from its SYN, so the session is attached right
    ///  away. The channel counts as connected once the first MSG arrives.
    pub fn new_accept(id: ChannelId, remote_conn: u32, remote_address: SocketAddr, real_address: Option<SocketAddr>, core: &ServiceCore) -> Channel {
        Channel {
            id,
            remote_address,
            real_address,
            local_conn: id.local_conn(),
            remote_conn,
            state: ChannelState::Connecting,
            create_time: core.now,
            last_syn_time: core.now,
            wait_send: VecDeque::new(),
            reassembly: None,
            session: Some(Box::new(Arq::new(id.local_conn(), remote_conn, &core.config.arq))),
            pending_reconnect: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.id.direction()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn local_conn(&self) -> u32 {
        self.local_conn
    }

    pub fn remote_conn(&self) -> u32 {
        self.remote_conn
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn set_remote_address(&mut self, remote_address: SocketAddr) {
        info!("channel {}: changing remote address from {:?} to {:?}", self.id, self.remote_address, remote_address);
        self.remote_address = remote_address;
    }

    pub fn real_address(&self) -> Option<SocketAddr> {
        self.real_address
    }

    pub fn create_time(&self) -> u32 {
        self.create_time
    }

    pub fn num_queued(&self) -> usize {
        self.wait_send.len()
    }

    pub fn send_syn(&mut self, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        trace!("channel {}: sending SYN to {:?}", self.id, self.remote_address);
        self.last_syn_time = core.now;
        core.schedule.schedule_at(core.now.wrapping_add(core.retry_interval_millis()), self.id);

        core.send_control(&ControlFrame::Syn {
            sender_conn: self.local_conn,
            receiver_conn: self.remote_conn,
            real_address: self.real_address,
        }, self.remote_address)
    }

    pub fn send_ack(&self, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        trace!("channel {}: sending ACK to {:?}", self.id, self.remote_address);
        core.send_control(&ControlFrame::Ack {
            sender_conn: self.local_conn,
            receiver_conn: self.remote_conn,
        }, self.remote_address)
    }

    /// handshake acknowledgement for a connecting channel
    pub fn on_ack(&mut self, remote_conn: u32, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        if self.direction() != Direction::Connect || self.state != ChannelState::Connecting {
            debug!("channel {}: ignoring ACK in state {:?}", self.id, self.state);
            return Ok(());
        }

        info!("channel {}: connected to {:?} (local conn {}, remote conn {})", self.id, self.remote_address, self.local_conn, remote_conn);
        self.remote_conn = remote_conn;
        self.session = Some(Box::new(Arq::new(self.local_conn, remote_conn, &core.config.arq)));
        self.state = ChannelState::Connected;

        while let Some(message) = self.wait_send.pop_front() {
            self.send_direct(message, core)?;
        }
        core.schedule.schedule_now(self.id);
        Ok(())
    }

    /// data from the peer; for an accepted channel, the first MSG completes the handshake
    pub fn on_msg(&mut self, segments: &[u8], core: &mut ServiceCore) -> Result<(), ErrorCode> {
        let Some(session) = self.session.as_mut() else {
            debug!("channel {}: MSG before the handshake completed - dropping", self.id);
            return Ok(());
        };

        if self.state == ChannelState::Connecting {
            info!("channel {}: accepted connection from {:?} is established", self.id, self.remote_address);
            self.state = ChannelState::Connected;
        }

        if let Err(e) = session.input(segments, &mut core.object_pool) {
            warn!("channel {}: dropping invalid MSG datagram: {}", self.id, e);
        }
        core.schedule.schedule_now(self.id);

        self.receive_messages(core)
    }

    fn receive_messages(&mut self, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };
            let Some(size) = session.peek_size() else {
                return Ok(());
            };

            let mut buf = core.chunk_pool.acquire(size);
            if session.recv(&mut buf, &mut core.object_pool) != Some(size) {
                warn!("channel {}: session announced a message of {} bytes but did not deliver it", self.id, size);
                return Err(ErrorCode::PeekError);
            }
            self.on_message(buf.freeze(), core)?;
        }
    }

    fn on_message(&mut self, message: SharedBuf, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        if let Some(reassembly) = self.reassembly.as_mut() {
            let remaining = reassembly.total - reassembly.buf.len();
            if message.len() > remaining {
                warn!("channel {}: fragment of {} bytes exceeds the remaining {} bytes of the message", self.id, message.len(), remaining);
                return Err(ErrorCode::FragmentSizeMismatch);
            }

            reassembly.buf.put(message);
            if reassembly.buf.len() == reassembly.total {
                if let Some(complete) = self.reassembly.take() {
                    trace!("channel {}: reassembled message of {} bytes", self.id, complete.total);
                    core.events.push_back(ServiceEvent::Read { channel_id: self.id, payload: complete.buf.freeze() });
                }
            }
            return Ok(());
        }

        if let Some(total) = fragment_header(&message) {
            // headers are only sent for messages above the cap, anything else is a regular message
            if total > core.config.fragment_cap {
                if total > core.config.max_message_size {
                    warn!("channel {}: fragmented message of {} bytes exceeds the maximum message size", self.id, total);
                    return Err(ErrorCode::FragmentCountMismatch);
                }
                trace!("channel {}: receiving fragmented message of {} bytes", self.id, total);
                self.reassembly = Some(Reassembly {
                    buf: core.chunk_pool.acquire(total),
                    total,
                });
                return Ok(());
            }
        }

        core.events.push_back(ServiceEvent::Read { channel_id: self.id, payload: message });
        Ok(())
    }

    pub fn send(&mut self, message: SharedBuf, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        if self.session.is_none() {
            if self.wait_send.len() >= core.config.max_wait_send {
                warn!("channel {}: too many messages queued before the handshake completed", self.id);
                return Err(ErrorCode::SendWindowExceeded);
            }
            self.wait_send.push_back(message);
            return Ok(());
        }
        self.send_direct(message, core)
    }

    fn send_direct(&mut self, mut message: SharedBuf, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if session.wait_snd() > core.config.max_wait_send {
            warn!("channel {}: {} segments waiting for acknowledgement - closing", self.id, session.wait_snd());
            return Err(ErrorCode::SendWindowExceeded);
        }

        let len = message.len();
        if len > core.config.max_message_size {
            warn!("channel {}: message of {} bytes exceeds the maximum message size", self.id, len);
            return Err(ErrorCode::MessageTooLarge);
        }

        let cap = core.config.fragment_cap;
        let result = if len <= cap {
            session.send(&mut message, &mut core.object_pool)
        }
        else {
            trace!("channel {}: sending message of {} bytes in fragments", self.id, len);
            send_fragmented(&mut **session, &message, cap, &mut core.object_pool)
        };

        if let Err(e) = result {
            warn!("channel {}: reliable session rejected message: {}", self.id, e);
            return Err(ErrorCode::MessageTooLarge);
        }
        core.schedule.schedule_now(self.id);
        Ok(())
    }

    /// periodic protocol work: SYN retries while connecting, ARQ flush and retransmission afterwards
    pub fn update(&mut self, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        match self.state {
            ChannelState::Closed => Ok(()),
            ChannelState::Connecting if self.session.is_none() => {
                let now = core.now;
                if time_diff(now, self.create_time) >= core.connect_timeout_millis() as i32 {
                    warn!("channel {}: no ACK from {:?} within the connect timeout", self.id, self.remote_address);
                    return Err(ErrorCode::ConnectTimeout);
                }

                let next_syn = self.last_syn_time.wrapping_add(core.retry_interval_millis());
                if time_diff(now, next_syn) >= 0 {
                    self.send_syn(core)
                }
                else {
                    core.schedule.schedule_at(next_syn, self.id);
                    Ok(())
                }
            }
            _ => self.update_session(core),
        }
    }

    fn update_session(&mut self, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let now = core.now;
        let local_conn = self.local_conn;
        let remote_address = self.remote_address;
        let mut send_result = Ok(());
        session.update(now, &mut |datagram| {
            write_msg_prefix(datagram, local_conn);
            if send_result.is_ok() {
                send_result = core.send_datagram(datagram, remote_address);
            }
        });
        send_result?;

        if session.is_dead() {
            warn!("channel {}: peer {:?} stopped acknowledging", self.id, self.remote_address);
            return Err(ErrorCode::SessionDead);
        }

        let next = session.check(now);
        core.schedule.schedule_at(next, self.id);
        Ok(())
    }

    pub fn start_reconnect(&mut self, nonce: u32, core: &mut ServiceCore) -> Result<(), ErrorCode> {
        info!("channel {}: requesting reconnect via {:?}", self.id, self.remote_address);
        self.pending_reconnect = Some(nonce);
        core.send_control(&ControlFrame::ReconnectSyn {
            sender_conn: self.local_conn,
            receiver_conn: self.remote_conn,
            nonce,
        }, self.remote_address)
    }

    /// `true` if `nonce` acknowledges the pending reconnect request
    pub fn complete_reconnect(&mut self, nonce: u32) -> bool {
        if self.pending_reconnect == Some(nonce) {
            self.pending_reconnect = None;
            true
        }
        else {
            false
        }
    }

    /// Release all resources and notify the peer unless it closed the channel itself. The
    ///  channel must already be removed from the service's tables.
    pub fn dispose(&mut self, error: u32, core: &mut ServiceCore) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;

        if error != u32::from(ErrorCode::PeerDisconnect) {
            core.send_fin(self.local_conn, self.remote_conn, error, self.remote_address, core.config.fin_repeat);
        }

        info!("channel {}: closed ({})", self.id, ErrorCode::describe_raw(error));
        self.wait_send.clear();
        self.reassembly = None;
        self.session = None;
    }
}

fn send_fragmented(session: &mut dyn ReliableSession, message: &SharedBuf, cap: usize, pool: &mut ObjectPool) -> anyhow::Result<()> {
    let mut header = [0u8; FRAGMENT_HEADER_LEN];
    let mut h = &mut header[..];
    h.put_u32_le(0);
    h.put_u32_le(message.len().prechecked_cast());
    session.send(&mut &header[..], pool)?;

    let mut offset = 0;
    while offset < message.len() {
        let end = message.len().min(offset + cap);
        session.send(&mut message.slice(offset..end), pool)?;
        offset = end;
    }
    Ok(())
}

/// the total length announced by a fragment header, if `message` is one
fn fragment_header(message: &SharedBuf) -> Option<usize> {
    if message.len() != FRAGMENT_HEADER_LEN {
        return None;
    }
    let mut buf = message.clone();
    if buf.get_u32_le() != 0 {
        return None;
    }
    Some(buf.get_u32_le().safe_cast())
}
