use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};
use crate::buffers::chunk_pool::{ChunkPool, SharedBuf};
use crate::buffers::object_pool::ObjectPool;
use crate::channel_id::{ChannelId, ChannelIdGenerator, Direction};
use crate::config::{ServiceConfig, ServiceType};
use crate::error_code::ErrorCode;
use crate::service::{Service, ServiceEvent};
use crate::udp::channel::Channel;
use crate::udp::control_frame::ControlFrame;
use crate::udp::datagram_socket::{bind_udp_socket, DatagramSocket};
use crate::udp::schedule::UpdateSchedule;
use crate::util::clock::{time_diff, Clock, SystemClock};
use crate::util::random::{Random, RngRandom};
use crate::util::safe_converter::PrecheckedCast;

/// The parts of a service that channels work with, split from the channel tables so a channel
///  and its service's resources can be borrowed at the same time
pub struct ServiceCore {
    pub config: ServiceConfig,
    socket: Option<Box<dyn DatagramSocket>>,
    pub chunk_pool: Arc<ChunkPool>,
    pub object_pool: ObjectPool,
    pub schedule: UpdateSchedule,
    pub events: VecDeque<ServiceEvent>,
    /// protocol time of the operation in progress
    pub now: u32,
    scratch: Vec<u8>,
}

impl ServiceCore {
    pub fn new(config: ServiceConfig, socket: Box<dyn DatagramSocket>, chunk_pool: Arc<ChunkPool>, now: u32) -> ServiceCore {
        let object_pool = ObjectPool::new(config.pool.object_pool_cap);
        ServiceCore {
            config,
            socket: Some(socket),
            chunk_pool,
            object_pool,
            schedule: UpdateSchedule::new(now),
            events: VecDeque::new(),
            now,
            scratch: Vec::with_capacity(64),
        }
    }

    pub fn retry_interval_millis(&self) -> u32 {
        self.config.handshake_retry_interval.as_millis().prechecked_cast()
    }

    pub fn connect_timeout_millis(&self) -> u32 {
        self.config.connect_timeout.as_millis().prechecked_cast()
    }

    /// A datagram that can not be sent right now is lost, which the protocol tolerates; other
    ///  errors mean the socket is unusable for this peer.
    pub fn send_datagram(&self, datagram: &[u8], to: SocketAddr) -> Result<(), ErrorCode> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };

        trace!("sending {} bytes to {:?}", datagram.len(), to);
        match socket.send_to(datagram, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("socket send buffer is full - dropping datagram to {:?}", to);
                Ok(())
            }
            Err(e) => {
                error!("error sending UDP datagram to {:?}: {}", to, e);
                Err(ErrorCode::SocketSendFailure)
            }
        }
    }

    pub fn send_control(&mut self, frame: &ControlFrame, to: SocketAddr) -> Result<(), ErrorCode> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        frame.ser(&mut scratch);
        let result = self.send_datagram(&scratch, to);
        self.scratch = scratch;
        result
    }

    /// FIN is best effort: there is no channel left to report a failure to
    pub fn send_fin(&mut self, sender_conn: u32, receiver_conn: u32, error: u32, to: SocketAddr, times: usize) {
        let frame = ControlFrame::Fin { sender_conn, receiver_conn, error };
        for _ in 0..times {
            if self.send_control(&frame, to).is_err() {
                break;
            }
        }
        debug!("sent FIN to {:?}: {} {} {}", to, sender_conn, receiver_conn, ErrorCode::describe_raw(error));
    }
}


/// A [Service] running reliable channels over a single UDP socket. It has no background
///  activity: everything happens in [UdpService::update] and the other operations, driven by
///  the owner.
pub struct UdpService {
    core: ServiceCore,
    clock: Arc<dyn Clock>,
    id_generator: Arc<ChannelIdGenerator>,

    channels: FxHashMap<ChannelId, Channel>,
    local_conns: FxHashMap<u32, ChannelId>,
    /// accepted channels waiting for their first MSG, keyed by the peer's connection number
    wait_accept: FxHashMap<u32, ChannelId>,

    recv_buf: Vec<u8>,
    due: Vec<ChannelId>,
}

impl UdpService {
    pub fn bind(addr: SocketAddr, config: ServiceConfig, id_generator: Arc<ChannelIdGenerator>, chunk_pool: Arc<ChunkPool>) -> anyhow::Result<UdpService> {
        config.validate()?;
        let socket = bind_udp_socket(addr, config.socket_buffer_size)?;
        info!("UDP service listening on {:?}", socket.local_addr());
        UdpService::new(Box::new(socket), Arc::new(SystemClock::new()), config, id_generator, chunk_pool)
    }

    pub fn new(
        socket: Box<dyn DatagramSocket>,
        clock: Arc<dyn Clock>,
        config: ServiceConfig,
        id_generator: Arc<ChannelIdGenerator>,
        chunk_pool: Arc<ChunkPool>,
    ) -> anyhow::Result<UdpService> {
        config.validate()?;
        if chunk_pool.chunk_size() != config.pool.chunk_size {
            bail!("chunk pool does not match the configured chunk size");
        }

        let recv_buf = vec![0u8; config.recv_buffer_len];
        let now = clock.now_millis();
        Ok(UdpService {
            core: ServiceCore::new(config, socket, chunk_pool, now),
            clock,
            id_generator,
            channels: FxHashMap::default(),
            local_conns: FxHashMap::default(),
            wait_accept: FxHashMap::default(),
            recv_buf,
            due: Vec::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.core.config
    }

    fn refresh_now(&mut self) -> u32 {
        let now = self.clock.now_millis();
        self.core.now = now;
        self.core.schedule.advance(now);
        now
    }

    /// Open a channel through a relay: datagrams go to `relay`, and the SYN carries
    ///  `real_address` so the relay can forward it
    pub fn create_routed(&mut self, id: ChannelId, relay: SocketAddr, real_address: SocketAddr) {
        self.create_channel(id, relay, Some(real_address));
    }

    fn create_channel(&mut self, id: ChannelId, address: SocketAddr, real_address: Option<SocketAddr>) {
        if self.is_disposed() || self.channels.contains_key(&id) {
            return;
        }
        if id.direction() != Direction::Connect {
            warn!("channel id {} is not a connect id - ignoring", id);
            return;
        }
        if self.local_conns.contains_key(&id.local_conn()) {
            warn!("local connection number of {} is in use - failing the new channel", id);
            self.core.events.push_back(ServiceEvent::Error { channel_id: id, error: ErrorCode::ConnectFailed });
            return;
        }

        let now = self.refresh_now();
        info!("connecting channel {} to {:?}", id, address);
        let mut channel = Channel::new_connect(id, address, real_address, now);
        let result = channel.send_syn(&mut self.core);
        self.local_conns.insert(channel.local_conn(), id);
        self.channels.insert(id, channel);

        if let Err(e) = result {
            self.fail_channel(id, e);
        }
    }

    pub fn channel_conns(&self, id: ChannelId) -> Option<(u32, u32)> {
        self.channels.get(&id)
            .map(|c| (c.local_conn(), c.remote_conn()))
    }

    pub fn remote_address(&self, id: ChannelId) -> Option<SocketAddr> {
        self.channels.get(&id)
            .map(|c| c.remote_address())
    }

    pub fn change_address(&mut self, id: ChannelId, address: SocketAddr) {
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.set_remote_address(address);
        }
    }

    /// Ask the peer to move the channel to this side's current address, e.g. after a relay
    ///  change. A [ServiceEvent::Reconnected] follows when the peer confirms.
    pub fn request_reconnect(&mut self, id: ChannelId) {
        self.request_reconnect_with::<RngRandom>(id)
    }

    fn request_reconnect_with<R: Random>(&mut self, id: ChannelId) {
        self.refresh_now();
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("reconnect for unknown channel {}", id);
            return;
        };
        if !channel.is_connected() {
            debug!("reconnect for channel {} before its handshake completed - ignoring", id);
            return;
        }
        if let Err(e) = channel.start_reconnect(R::next_u32(), &mut self.core) {
            self.fail_channel(id, e);
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_waiting_for_accept(&self) -> usize {
        self.wait_accept.len()
    }

    fn remove_from_tables(&mut self, id: ChannelId) -> Option<Channel> {
        let channel = self.channels.remove(&id)?;
        if self.local_conns.get(&channel.local_conn()) == Some(&id) {
            self.local_conns.remove(&channel.local_conn());
        }
        if self.wait_accept.get(&channel.remote_conn()) == Some(&id) {
            self.wait_accept.remove(&channel.remote_conn());
        }
        Some(channel)
    }

    fn close_channel(&mut self, id: ChannelId, error: u32) -> bool {
        let Some(mut channel) = self.remove_from_tables(id) else {
            return false;
        };
        channel.dispose(error, &mut self.core);
        true
    }

    /// remove, dispose and only then report the failure
    fn fail_channel(&mut self, id: ChannelId, error: ErrorCode) {
        if self.close_channel(id, error.into()) {
            self.core.events.push_back(ServiceEvent::Error { channel_id: id, error });
        }
    }

    fn expire_pending_accepts(&mut self, now: u32) {
        let timeout = self.core.connect_timeout_millis() as i32;
        let expired = self.wait_accept.values()
            .filter_map(|id| self.channels.get(id))
            .filter(|c| !c.is_connected() && time_diff(now, c.create_time()) >= timeout)
            .map(|c| c.id())
            .collect::<Vec<_>>();

        for id in expired {
            warn!("accepted channel {} did not complete its handshake in time", id);
            self.fail_channel(id, ErrorCode::AcceptTimeout);
        }
    }

    fn receive(&mut self) {
        let mut recv_buf = std::mem::take(&mut self.recv_buf);
        loop {
            let Some(socket) = self.core.socket.as_ref() else {
                break;
            };
            match socket.try_recv_from(&mut recv_buf) {
                Ok(Some((len, from))) => {
                    if let Err(e) = self.on_datagram(&recv_buf[..len], from) {
                        warn!("dropping datagram from {:?}: {}", from, e);
                    }
                }
                Ok(None) => break,
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                    debug!("ICMP error reported by UDP socket: {}", e);
                }
                Err(e) => {
                    error!("error receiving from UDP socket: {}", e);
                    break;
                }
            }
        }
        self.recv_buf = recv_buf;
    }

    fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        let frame = ControlFrame::deser(datagram)?;
        trace!("received {:?} from {:?}", frame.flag(), from);

        match frame {
            ControlFrame::Syn { sender_conn, real_address, .. } => self.on_syn(sender_conn, real_address, from),
            ControlFrame::Ack { sender_conn, receiver_conn } => self.on_ack(sender_conn, receiver_conn),
            ControlFrame::Fin { sender_conn, receiver_conn, error } => self.on_fin(sender_conn, receiver_conn, error),
            ControlFrame::Msg { sender_conn, receiver_conn, segments } => self.on_msg(sender_conn, receiver_conn, segments, from),
            ControlFrame::ReconnectSyn { sender_conn, receiver_conn, nonce } => self.on_reconnect_syn(sender_conn, receiver_conn, nonce, from),
            ControlFrame::ReconnectAck { sender_conn, receiver_conn, nonce } => self.on_reconnect_ack(sender_conn, receiver_conn, nonce),
        }
        Ok(())
    }

    /// the accepted channel a repeated SYN belongs to, whether it is still pending or connected
    fn find_accepted(&self, remote_conn: u32, from: SocketAddr) -> Option<ChannelId> {
        if let Some(&id) = self.wait_accept.get(&remote_conn) {
            return Some(id);
        }
        self.channels.values()
            .find(|c| c.direction() == Direction::Accept && c.remote_conn() == remote_conn && c.remote_address() == from)
            .map(|c| c.id())
    }

    fn on_syn(&mut self, remote_conn: u32, real_address: Option<SocketAddr>, from: SocketAddr) {
        let id = match self.find_accepted(remote_conn, from) {
            Some(id) => id,
            None => {
                let id = self.id_generator.new_accept_id();
                if self.local_conns.contains_key(&id.local_conn()) {
                    // the peer retries its SYN, which gets a fresh id
                    debug!("accept id {} collides with an existing channel - ignoring SYN from {:?}", id, from);
                    return;
                }

                let channel = Channel::new_accept(id, remote_conn, from, real_address, &self.core);
                info!("accepted channel {} from {:?} (remote conn {})", id, from, remote_conn);
                self.local_conns.insert(channel.local_conn(), id);
                self.wait_accept.insert(remote_conn, id);
                self.channels.insert(id, channel);
                self.core.events.push_back(ServiceEvent::Accepted {
                    channel_id: id,
                    remote_address: real_address.unwrap_or(from),
                });
                id
            }
        };

        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        if channel.real_address() != real_address {
            warn!("SYN for channel {} with a different real address {:?} - ignoring", id, real_address);
            return;
        }
        if let Err(e) = channel.send_ack(&mut self.core) {
            self.fail_channel(id, e);
        }
    }

    fn on_ack(&mut self, remote_conn: u32, local_conn: u32) {
        let Some(&id) = self.local_conns.get(&local_conn) else {
            debug!("ACK for unknown local conn {}", local_conn);
            return;
        };
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if let Err(e) = channel.on_ack(remote_conn, &mut self.core) {
            self.fail_channel(id, e);
        }
    }

    fn on_fin(&mut self, remote_conn: u32, local_conn: u32, error: u32) {
        let Some(&id) = self.local_conns.get(&local_conn) else {
            return;
        };
        if self.channels.get(&id).map(|c| c.remote_conn()) != Some(remote_conn) {
            debug!("FIN for channel {} with non-matching remote conn {} - ignoring", id, remote_conn);
            return;
        }
        info!("received FIN for channel {}: {}", id, ErrorCode::describe_raw(error));
        self.fail_channel(id, ErrorCode::PeerDisconnect);
    }

    fn on_msg(&mut self, remote_conn: u32, local_conn: u32, segments: &[u8], from: SocketAddr) {
        let Some(&id) = self.local_conns.get(&local_conn) else {
            debug!("MSG for unknown local conn {} from {:?} - notifying peer", local_conn, from);
            self.core.send_fin(local_conn, remote_conn, ErrorCode::ChannelNotFound.into(), from, 1);
            return;
        };
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.remote_conn() != remote_conn {
            debug!("MSG for channel {} with non-matching remote conn {} - ignoring", id, remote_conn);
            return;
        }

        let was_connected = channel.is_connected();
        let result = channel.on_msg(segments, &mut self.core);
        if !was_connected && channel.is_connected() {
            self.wait_accept.remove(&remote_conn);
        }
        if let Err(e) = result {
            self.fail_channel(id, e);
        }
    }

    /// Only a peer that knows both connection numbers may move a channel to a new address
    fn on_reconnect_syn(&mut self, remote_conn: u32, local_conn: u32, nonce: u32, from: SocketAddr) {
        let Some(&id) = self.local_conns.get(&local_conn) else {
            warn!("reconnect for unknown local conn {} from {:?}", local_conn, from);
            return;
        };
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.local_conn() != local_conn || channel.remote_conn() != remote_conn {
            warn!("reconnect for channel {} from {:?} with non-matching conns {} / {} - rejecting", id, from, local_conn, remote_conn);
            return;
        }

        if channel.remote_address() != from {
            channel.set_remote_address(from);
        }

        let ack = ControlFrame::ReconnectAck {
            sender_conn: channel.local_conn(),
            receiver_conn: channel.remote_conn(),
            nonce,
        };
        if let Err(e) = self.core.send_control(&ack, from) {
            self.fail_channel(id, e);
        }
    }

    fn on_reconnect_ack(&mut self, remote_conn: u32, local_conn: u32, nonce: u32) {
        let Some(&id) = self.local_conns.get(&local_conn) else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.remote_conn() != remote_conn || !channel.complete_reconnect(nonce) {
            debug!("unexpected reconnect ACK for channel {} - ignoring", id);
            return;
        }
        info!("channel {} reconnected", id);
        self.core.events.push_back(ServiceEvent::Reconnected { channel_id: id });
    }

    fn update_due_channels(&mut self) {
        let mut due = std::mem::take(&mut self.due);
        self.core.schedule.take_immediate(&mut due);

        for id in due.drain(..) {
            let Some(channel) = self.channels.get_mut(&id) else {
                continue;
            };
            if let Err(e) = channel.update(&mut self.core) {
                self.fail_channel(id, e);
            }
        }
        self.due = due;
    }
}

impl Service for UdpService {
    fn service_type(&self) -> ServiceType {
        self.core.config.service_type
    }

    fn create(&mut self, id: ChannelId, address: SocketAddr) {
        self.create_channel(id, address, None);
    }

    fn send(&mut self, id: ChannelId, payload: SharedBuf) {
        self.refresh_now();
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("sending on unknown channel {} - dropping message", id);
            return;
        };
        if let Err(e) = channel.send(payload, &mut self.core) {
            self.fail_channel(id, e);
        }
    }

    fn remove(&mut self, id: ChannelId) {
        self.refresh_now();
        if self.close_channel(id, ErrorCode::NONE) {
            info!("removed channel {}", id);
        }
    }

    fn update(&mut self) {
        if self.is_disposed() {
            return;
        }
        let now = self.refresh_now();

        self.core.schedule.collect_due(now);
        self.expire_pending_accepts(now);
        self.receive();
        self.update_due_channels();
    }

    fn drain_events(&mut self) -> Drain<'_, ServiceEvent> {
        self.core.events.drain(..)
    }

    fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    fn is_disposed(&self) -> bool {
        self.core.socket.is_none()
    }

    fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }
        self.refresh_now();

        let ids = self.channels.keys().copied().collect::<Vec<_>>();
        for id in ids {
            self.close_channel(id, ErrorCode::NONE);
        }
        self.core.socket = None;
        info!("UDP service disposed");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core.socket.as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn chunk_pool(&self) -> &Arc<ChunkPool> {
        &self.core.chunk_pool
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::loopback::{Datagram, LoopbackNetwork};
    use crate::test_util::{payload, test_addr};
    use crate::util::clock::ManualClock;
    use super::*;

    const A: u16 = 4001;
    const B: u16 = 4002;
    const C: u16 = 4003;

    fn new_service(network: &LoopbackNetwork, clock: &Arc<ManualClock>, port: u16, config: ServiceConfig) -> UdpService {
        let chunk_pool = ChunkPool::new(config.pool.chunk_size, config.pool.max_pooled_chunks);
        UdpService::new(
            Box::new(network.socket(test_addr(port))),
            clock.clone(),
            config,
            Arc::new(ChannelIdGenerator::new()),
            chunk_pool,
        ).unwrap()
    }

    fn ser(frame: ControlFrame) -> Vec<u8> {
        let mut buf = Vec::new();
        frame.ser(&mut buf);
        buf
    }

    struct Harness {
        network: LoopbackNetwork,
        clock: Arc<ManualClock>,
        a: UdpService,
        b: UdpService,
        events_a: Vec<ServiceEvent>,
        events_b: Vec<ServiceEvent>,
    }

    impl Harness {
        fn new() -> Harness {
            Harness::with_config(ServiceConfig::outer())
        }

        fn with_config(config_a: ServiceConfig) -> Harness {
            let network = LoopbackNetwork::new();
            let clock = Arc::new(ManualClock::new(1000));
            let a = new_service(&network, &clock, A, config_a);
            let b = new_service(&network, &clock, B, ServiceConfig::outer());
            Harness { network, clock, a, b, events_a: Vec::new(), events_b: Vec::new() }
        }

        fn pump(&mut self, rounds: usize) {
            for _ in 0..rounds {
                self.clock.advance(10);
                self.a.update();
                self.b.update();
                self.events_a.extend(self.a.drain_events());
                self.events_b.extend(self.b.drain_events());
            }
        }

        fn message(&self, data: &[u8]) -> SharedBuf {
            self.a.chunk_pool().copy_from_slice(data)
        }

        /// opens a channel from a to b and exchanges one message, so both sides are connected
        fn connect(&mut self) -> (ChannelId, ChannelId) {
            let id_a = ChannelId::from_parts(u32::MAX, 4711);
            self.a.create(id_a, test_addr(B));
            let hello = self.message(b"hello");
            self.a.send(id_a, hello);
            self.pump(10);

            let id_b = self.events_b.iter()
                .find_map(|e| match e {
                    ServiceEvent::Accepted { channel_id, .. } => Some(*channel_id),
                    _ => None,
                })
                .expect("no channel was accepted");
            assert_eq!(reads(&self.events_b, id_b), vec![b"hello".to_vec()]);
            self.events_a.clear();
            self.events_b.clear();
            (id_a, id_b)
        }
    }

    fn reads(events: &[ServiceEvent], id: ChannelId) -> Vec<Vec<u8>> {
        events.iter()
            .filter_map(|e| match e {
                ServiceEvent::Read { channel_id, payload } if *channel_id == id => Some(payload.to_vec()),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[ServiceEvent]) -> Vec<(ChannelId, ErrorCode)> {
        events.iter()
            .filter_map(|e| match e {
                ServiceEvent::Error { channel_id, error } => Some((*channel_id, *error)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_messages_in_both_directions() {
        let mut h = Harness::new();
        let (id_a, id_b) = h.connect();

        assert_eq!(h.b.channel_conns(id_b), h.a.channel_conns(id_a).map(|(l, r)| (r, l)));
        assert_eq!(h.b.num_waiting_for_accept(), 0);

        for i in 0..5 {
            let msg = h.message(&payload(100 + i, i as u8));
            h.a.send(id_a, msg);
        }
        let reply = h.b.chunk_pool().copy_from_slice(b"reply");
        h.b.send(id_b, reply);
        h.pump(10);

        assert_eq!(reads(&h.events_b, id_b), (0..5).map(|i| payload(100 + i, i as u8)).collect::<Vec<_>>());
        assert_eq!(reads(&h.events_a, id_a), vec![b"reply".to_vec()]);
        assert!(errors(&h.events_a).is_empty());
        assert!(errors(&h.events_b).is_empty());
    }

    #[test]
    fn test_fragmented_messages() {
        let mut h = Harness::new();
        let (id_a, id_b) = h.connect();

        let sizes = [10_000, 10_001, 30_000, 3, 65_535];
        for (i, &size) in sizes.iter().enumerate() {
            let msg = h.message(&payload(size, i as u8));
            h.a.send(id_a, msg);
        }
        h.pump(100);

        let expected = sizes.iter().enumerate()
            .map(|(i, &size)| payload(size, i as u8))
            .collect::<Vec<_>>();
        assert_eq!(reads(&h.events_b, id_b), expected);
    }

    #[test]
    fn test_fragmented_messages_with_loss() {
        let mut h = Harness::new();
        let (id_a, id_b) = h.connect();

        let mut n = 0usize;
        h.network.set_drop_filter(move |d: &Datagram| {
            n += 1;
            d.flag() == 4 && n % 5 == 0
        });

        let data = payload(25_000, 7);
        let msg = h.message(&data);
        h.a.send(id_a, msg);
        h.pump(500);

        assert_eq!(reads(&h.events_b, id_b), vec![data]);
    }

    #[test]
    fn test_lost_acks_are_retried() {
        let mut h = Harness::new();
        let mut dropped = 0;
        h.network.set_drop_filter(move |d: &Datagram| {
            if d.flag() == 2 && dropped < 3 {
                dropped += 1;
                return true;
            }
            false
        });

        let id_a = ChannelId::from_parts(u32::MAX, 4711);
        h.a.create(id_a, test_addr(B));
        let msg = h.message(b"queued");
        h.a.send(id_a, msg);
        h.pump(200);

        assert!(h.network.sent_with_flag(1).len() >= 4);
        assert!(errors(&h.events_a).is_empty());
        let accepted = h.events_b.iter()
            .filter(|e| matches!(e, ServiceEvent::Accepted { .. }))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(h.events_b.iter().filter_map(|e| match e {
            ServiceEvent::Read { payload, .. } => Some(payload.to_vec()),
            _ => None,
        }).collect::<Vec<_>>(), vec![b"queued".to_vec()]);
    }

    #[test]
    fn test_connect_timeout() {
        let mut h = Harness::new();
        let id = ChannelId::from_parts(u32::MAX, 4711);
        h.a.create(id, test_addr(9999));

        let mut events = Vec::new();
        for _ in 0..250 {
            h.clock.advance(100);
            h.a.update();
            events.extend(h.a.drain_events());
        }

        assert_eq!(events, vec![ServiceEvent::Error { channel_id: id, error: ErrorCode::ConnectTimeout }]);
        assert!(!h.a.contains(id));

        // operations on the failed channel are no-ops
        let msg = h.message(b"late");
        h.a.send(id, msg);
        h.a.remove(id);
        assert_eq!(h.a.drain_events().count(), 0);
    }

    #[test]
    fn test_local_conn_collision() {
        let mut h = Harness::new();
        let first = ChannelId::from_parts(u32::MAX, 4711);
        let second = ChannelId::from_parts(u32::MAX - 1, 4711);
        h.a.create(first, test_addr(B));
        h.a.create(second, test_addr(B));

        assert!(h.a.contains(first));
        assert!(!h.a.contains(second));
        assert_eq!(errors(&h.a.drain_events().collect::<Vec<_>>()), vec![(second, ErrorCode::ConnectFailed)]);
    }

    #[test]
    fn test_remove_sends_fin() {
        let mut h = Harness::new();
        let (id_a, id_b) = h.connect();

        h.a.remove(id_a);
        assert!(!h.a.contains(id_a));
        assert_eq!(h.a.drain_events().count(), 0);

        let fins = h.network.sent_with_flag(3);
        assert_eq!(fins.len(), 3);
        assert!(fins.iter().all(|d| d.from == test_addr(A) && d.to == test_addr(B)));

        h.pump(1);
        assert_eq!(errors(&h.events_b), vec![(id_b, ErrorCode::PeerDisconnect)]);
        assert!(!h.b.contains(id_b));
        // no FIN back for a channel the peer closed
        assert_eq!(h.network.sent_with_flag(3).len(), 3);
    }

    #[test]
    fn test_msg_for_unknown_channel() {
        let mut h = Harness::new();
        h.network.inject(test_addr(C), test_addr(B), &[4, 77, 0, 0, 0, 0x39, 0x30, 0, 0, 1, 2, 3]);
        h.b.update();

        let fins = h.network.sent_with_flag(3);
        assert_eq!(fins.len(), 1);
        assert_eq!(fins[0].to, test_addr(C));
        assert_eq!(fins[0].data, ser(ControlFrame::Fin {
            sender_conn: 12345,
            receiver_conn: 77,
            error: ErrorCode::ChannelNotFound.into(),
        }));
        assert_eq!(h.b.drain_events().count(), 0);
    }

    #[test]
    fn test_garbage_is_ignored() {
        let mut h = Harness::new();
        let (id_a, id_b) = h.connect();

        h.network.inject(test_addr(C), test_addr(B), &[]);
        h.network.inject(test_addr(C), test_addr(B), &[99, 1, 2, 3]);
        h.network.inject(test_addr(C), test_addr(B), &[2, 1, 2]);
        let msg = h.message(b"still alive");
        h.a.send(id_a, msg);
        h.pump(5);

        assert_eq!(reads(&h.events_b, id_b), vec![b"still alive".to_vec()]);
    }

    #[test]
    fn test_address_migration() {
        let mut h = Harness::new();
        let (_, id_b) = h.connect();
        let (local_b, remote_b) = h.b.channel_conns(id_b).unwrap();
        let c = h.network.socket(test_addr(C));

        h.network.inject(test_addr(C), test_addr(B), &ser(ControlFrame::ReconnectSyn {
            sender_conn: remote_b,
            receiver_conn: local_b,
            nonce: 42,
        }));
        h.b.update();

        assert_eq!(h.b.remote_address(id_b), Some(test_addr(C)));
        let mut buf = [0u8; 64];
        let (len, from) = c.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(from, test_addr(B));
        assert_eq!(&buf[..len], ser(ControlFrame::ReconnectAck {
            sender_conn: local_b,
            receiver_conn: remote_b,
            nonce: 42,
        }).as_slice());

        let msg = h.b.chunk_pool().copy_from_slice(b"moved");
        h.b.send(id_b, msg);
        h.clock.advance(10);
        h.b.update();
        assert!(h.network.sent_with_flag(4).iter().any(|d| d.to == test_addr(C)));
    }

    #[test]
    fn test_address_migration_rejected() {
        let mut h = Harness::new();
        let (_, id_b) = h.connect();
        let (local_b, remote_b) = h.b.channel_conns(id_b).unwrap();
        let c = h.network.socket(test_addr(C));

        h.network.inject(test_addr(C), test_addr(B), &ser(ControlFrame::ReconnectSyn {
            sender_conn: remote_b.wrapping_add(1),
            receiver_conn: local_b,
            nonce: 42,
        }));
        h.b.update();

        assert_eq!(h.b.remote_address(id_b), Some(test_addr(A)));
        let mut buf = [0u8; 64];
        assert_eq!(c.try_recv_from(&mut buf).unwrap(), None);
        assert!(h.b.contains(id_b));
    }

    #[test]
    fn test_change_address() {
        let mut h = Harness::new();
        let (id_a, _) = h.connect();
        let _c = h.network.socket(test_addr(C));

        h.a.change_address(id_a, test_addr(C));
        assert_eq!(h.a.remote_address(id_a), Some(test_addr(C)));

        let msg = h.message(b"elsewhere");
        h.a.send(id_a, msg);
        h.clock.advance(10);
        h.a.update();
        assert!(h.network.num_pending(test_addr(C)) >= 1);
    }

    #[test]
    fn test_request_reconnect() {
        let mut h = Harness::new();
        let (id_a, _) = h.connect();

        h.a.request_reconnect(id_a);
        h.pump(2);
        assert_eq!(h.events_a, vec![ServiceEvent::Reconnected { channel_id: id_a }]);
    }

    #[test]
    fn test_send_window_exceeded() {
        let mut config = ServiceConfig::outer();
        config.max_wait_send = 8;
        let mut h = Harness::with_config(config);
        let (id_a, _) = h.connect();

        h.network.set_drop_filter(|d: &Datagram| d.from == test_addr(A) && d.flag() == 4);
        for i in 0..20 {
            let msg = h.message(&[i]);
            h.a.send(id_a, msg);
        }

        assert_eq!(errors(&h.a.drain_events().collect::<Vec<_>>()), vec![(id_a, ErrorCode::SendWindowExceeded)]);
        assert!(!h.a.contains(id_a));
    }

    #[test]
    fn test_message_too_large() {
        let mut h = Harness::new();
        let (id_a, _) = h.connect();

        let msg = h.message(&payload(65_536, 1));
        h.a.send(id_a, msg);
        assert_eq!(errors(&h.a.drain_events().collect::<Vec<_>>()), vec![(id_a, ErrorCode::MessageTooLarge)]);
        assert!(!h.a.contains(id_a));
    }

    #[test]
    fn test_accept_timeout() {
        let mut h = Harness::new();
        let syn = ser(ControlFrame::Syn { sender_conn: 77, receiver_conn: 0, real_address: None });
        h.network.inject(test_addr(C), test_addr(B), &syn);
        h.network.inject(test_addr(C), test_addr(B), &syn);
        h.b.update();

        let events = h.b.drain_events().collect::<Vec<_>>();
        assert_eq!(events.len(), 1);
        let id = match events[0] {
            ServiceEvent::Accepted { channel_id, remote_address } => {
                assert_eq!(remote_address, test_addr(C));
                channel_id
            }
            ref other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(id.direction(), Direction::Accept);
        assert_eq!(h.network.sent_with_flag(2).len(), 2);
        assert_eq!(h.b.num_waiting_for_accept(), 1);

        h.clock.advance(19_999);
        h.b.update();
        assert_eq!(h.b.drain_events().count(), 0);

        h.clock.advance(1);
        h.b.update();
        assert_eq!(errors(&h.b.drain_events().collect::<Vec<_>>()), vec![(id, ErrorCode::AcceptTimeout)]);
        assert_eq!(h.b.num_waiting_for_accept(), 0);
        assert!(!h.b.contains(id));
    }

    #[test]
    fn test_late_syn_is_acknowledged_by_connected_channel() {
        let mut h = Harness::new();
        let (id_a, id_b) = h.connect();
        let (local_a, _) = h.a.channel_conns(id_a).unwrap();
        let acks = h.network.sent_with_flag(2).len();

        h.network.inject(test_addr(A), test_addr(B), &ser(ControlFrame::Syn {
            sender_conn: local_a,
            receiver_conn: 0,
            real_address: None,
        }));
        h.b.update();

        assert_eq!(h.b.num_channels(), 1);
        assert_eq!(h.b.num_waiting_for_accept(), 0);
        assert_eq!(h.b.drain_events().count(), 0);
        let sent = h.network.sent_with_flag(2);
        assert_eq!(sent.len(), acks + 1);
        assert_eq!(sent[acks].to, test_addr(A));

        // the channel still works and nothing times out later
        h.clock.advance(30_000);
        let msg = h.message(b"after");
        h.a.send(id_a, msg);
        h.pump(5);
        assert_eq!(reads(&h.events_b, id_b), vec![b"after".to_vec()]);
        assert!(errors(&h.events_b).is_empty());
    }

    #[test]
    fn test_same_conn_from_other_peer_is_accepted_separately() {
        let mut h = Harness::new();
        let (id_a, _) = h.connect();
        let (local_a, _) = h.a.channel_conns(id_a).unwrap();
        let _c = h.network.socket(test_addr(C));

        h.network.inject(test_addr(C), test_addr(B), &ser(ControlFrame::Syn {
            sender_conn: local_a,
            receiver_conn: 0,
            real_address: None,
        }));
        h.b.update();

        assert_eq!(h.b.num_channels(), 2);
        let events = h.b.drain_events().collect::<Vec<_>>();
        assert!(matches!(&events[..], [ServiceEvent::Accepted { remote_address, .. }] if *remote_address == test_addr(C)));
    }

    /// injects a SYN from C and returns the pending channel together with its conns
    fn pending_accept(h: &mut Harness) -> (ChannelId, u32) {
        h.network.inject(test_addr(C), test_addr(B), &ser(ControlFrame::Syn { sender_conn: 77, receiver_conn: 0, real_address: None }));
        h.b.update();
        let id = match h.b.drain_events().next() {
            Some(ServiceEvent::Accepted { channel_id, .. }) => channel_id,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(h.b.num_waiting_for_accept(), 1);
        let (local_conn, remote_conn) = h.b.channel_conns(id).unwrap();
        assert_eq!(remote_conn, 77);
        (id, local_conn)
    }

    #[test]
    fn test_pending_accept_closed_by_fin() {
        let mut h = Harness::new();
        let _c = h.network.socket(test_addr(C));
        let (id, local_conn) = pending_accept(&mut h);

        h.network.inject(test_addr(C), test_addr(B), &ser(ControlFrame::Fin {
            sender_conn: 77,
            receiver_conn: local_conn,
            error: ErrorCode::PeerDisconnect.into(),
        }));
        h.b.update();

        assert_eq!(errors(&h.b.drain_events().collect::<Vec<_>>()), vec![(id, ErrorCode::PeerDisconnect)]);
        assert!(!h.b.contains(id));
        assert_eq!(h.b.num_waiting_for_accept(), 0);
        assert_eq!(h.b.channel_conns(id), None);

        // the local conn is free: a MSG for it is answered with ChannelNotFound
        h.network.clear_sent();
        let mut msg = vec![4];
        msg.extend_from_slice(&77u32.to_le_bytes());
        msg.extend_from_slice(&local_conn.to_le_bytes());
        h.network.inject(test_addr(C), test_addr(B), &msg);
        h.clock.advance(20_000);
        h.b.update();
        assert_eq!(h.b.drain_events().count(), 0);
        assert_eq!(h.network.sent_with_flag(3).len(), 1);
    }

    #[test]
    fn test_pending_accept_removed() {
        let mut h = Harness::new();
        let _c = h.network.socket(test_addr(C));
        let (id, _) = pending_accept(&mut h);

        h.b.remove(id);
        assert!(!h.b.contains(id));
        assert_eq!(h.b.num_channels(), 0);
        assert_eq!(h.b.num_waiting_for_accept(), 0);

        h.clock.advance(20_000);
        h.b.update();
        assert_eq!(h.b.drain_events().count(), 0);

        // a retried SYN opens a fresh channel
        h.network.inject(test_addr(C), test_addr(B), &ser(ControlFrame::Syn { sender_conn: 77, receiver_conn: 0, real_address: None }));
        h.b.update();
        let events = h.b.drain_events().collect::<Vec<_>>();
        assert!(matches!(&events[..], [ServiceEvent::Accepted { channel_id, .. }] if *channel_id != id));
        assert_eq!(h.b.num_waiting_for_accept(), 1);
    }

    #[test]
    fn test_routed_channel() {
        let mut h = Harness::new();
        let real = test_addr(C);
        let id_a = ChannelId::from_parts(u32::MAX, 4711);
        h.a.create_routed(id_a, test_addr(B), real);
        h.b.update();

        let events = h.b.drain_events().collect::<Vec<_>>();
        assert!(matches!(&events[..], [ServiceEvent::Accepted { remote_address, .. }] if *remote_address == real));
        let acks = h.network.sent_with_flag(2).len();

        // a SYN for the same peer connection but a different target is not acknowledged
        h.network.inject(test_addr(A), test_addr(B), &ser(ControlFrame::Syn {
            sender_conn: 4711,
            receiver_conn: 0,
            real_address: Some(test_addr(9)),
        }));
        h.b.update();
        assert_eq!(h.network.sent_with_flag(2).len(), acks);
    }

    #[test]
    fn test_dispose() {
        let mut h = Harness::new();
        let (id_a, _) = h.connect();
        h.network.clear_sent();

        h.a.dispose();
        assert!(h.a.is_disposed());
        assert!(!h.a.contains(id_a));
        assert_eq!(h.a.local_addr(), None);
        assert_eq!(h.a.drain_events().count(), 0);
        assert_eq!(h.network.sent_with_flag(3).len(), 3);

        h.a.update();
        let id = ChannelId::from_parts(u32::MAX - 1, 4712);
        h.a.create(id, test_addr(B));
        assert!(!h.a.contains(id));
        h.a.dispose();
    }

    #[test]
    fn test_buffers_are_returned_to_pool() {
        let mut h = Harness::new();
        let (id_a, id_b) = h.connect();

        let msg = h.message(&payload(30_000, 3));
        h.a.send(id_a, msg);
        let msg = h.b.chunk_pool().copy_from_slice(&payload(12_000, 4));
        h.b.send(id_b, msg);
        h.pump(50);
        assert_eq!(reads(&h.events_b, id_b).len(), 1);
        assert_eq!(reads(&h.events_a, id_a).len(), 1);

        h.events_a.clear();
        h.events_b.clear();
        h.a.remove(id_a);
        h.pump(2);
        h.events_b.clear();

        assert!(!h.b.contains(id_b));
        assert_eq!(h.a.chunk_pool().outstanding(), 0);
        assert_eq!(h.b.chunk_pool().outstanding(), 0);
    }

    #[test]
    fn test_rejects_mismatched_chunk_pool() {
        let network = LoopbackNetwork::new();
        let result = UdpService::new(
            Box::new(network.socket(test_addr(A))),
            Arc::new(ManualClock::new(0)),
            ServiceConfig::outer(),
            Arc::new(ChannelIdGenerator::new()),
            ChunkPool::new(100, 10),
        );
        assert!(result.is_err());
    }
}
