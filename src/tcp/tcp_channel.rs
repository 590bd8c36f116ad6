use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use crate::buffers::chunk_pool::{ChunkPool, SharedBuf};
use crate::channel_id::ChannelId;
use crate::config::ServiceConfig;
use crate::error_code::ErrorCode;
use crate::framing::packet_parser::{write_frame, PacketParser};
use crate::service::ServiceEvent;
use crate::tcp::tcp_service::SocketEvent;

/// One TCP connection. Received bytes are split into frames by the channel's [PacketParser];
///  outgoing frames go to a writer task through an unbounded queue.
///
/// Dropping the channel aborts its tasks, which closes the socket.
pub struct TcpChannel {
    id: ChannelId,
    remote_address: SocketAddr,
    parser: PacketParser,
    writer: Option<mpsc::UnboundedSender<SharedBuf>>,
    /// frames sent before the connection is established
    wait_send: VecDeque<SharedBuf>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl TcpChannel {
    pub fn new(id: ChannelId, remote_address: SocketAddr, config: &ServiceConfig, chunk_pool: Arc<ChunkPool>) -> TcpChannel {
        TcpChannel {
            id,
            remote_address,
            parser: PacketParser::new(config.service_type, chunk_pool),
            writer: None,
            wait_send: VecDeque::new(),
            tasks: Vec::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    pub fn num_queued(&self) -> usize {
        self.wait_send.len()
    }

    pub(crate) fn add_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Start reading and writing on an established connection, sending the frames that were
    ///  queued while connecting
    pub(crate) fn attach(&mut self, stream: TcpStream, runtime: &Handle, socket_events: &mpsc::UnboundedSender<SocketEvent>, chunk_pool: &Arc<ChunkPool>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("channel {}: could not set TCP_NODELAY: {}", self.id, e);
        }
        let (reader, writer) = stream.into_split();
        let (frame_sender, frame_receiver) = mpsc::unbounded_channel();

        self.tasks.push(runtime.spawn(read_loop(self.id, reader, chunk_pool.clone(), socket_events.clone())));
        self.tasks.push(runtime.spawn(write_loop(self.id, writer, frame_receiver, socket_events.clone())));

        while let Some(frame) = self.wait_send.pop_front() {
            // the receiver is owned by the writer task that was just spawned
            frame_sender.send(frame).ok();
        }
        self.writer = Some(frame_sender);
    }

    pub fn send(&mut self, mut message: SharedBuf, config: &ServiceConfig, chunk_pool: &Arc<ChunkPool>) -> Result<(), ErrorCode> {
        let mut frame = chunk_pool.acquire(message.len() + config.service_type.length_prefix_len());
        if let Err(e) = write_frame(config.service_type, &mut message, &mut frame) {
            warn!("channel {}: can not send message: {}", self.id, e);
            return Err(ErrorCode::MessageTooLarge);
        }
        let frame = frame.freeze();

        match &self.writer {
            Some(writer) => {
                if writer.send(frame).is_err() {
                    debug!("channel {}: writer task is gone", self.id);
                    return Err(ErrorCode::SocketError);
                }
            }
            None => {
                if self.wait_send.len() >= config.max_wait_send {
                    warn!("channel {}: too many messages queued while connecting", self.id);
                    return Err(ErrorCode::SendWindowExceeded);
                }
                self.wait_send.push_back(frame);
            }
        }
        Ok(())
    }

    /// Feed received bytes through the parser, queueing a [ServiceEvent::Read] per frame
    pub fn on_data(&mut self, data: &SharedBuf, events: &mut VecDeque<ServiceEvent>) -> Result<(), ErrorCode> {
        for slice in data.slices() {
            self.parser.push(slice);
        }

        loop {
            match self.parser.parse() {
                Ok(Some(payload)) => events.push_back(ServiceEvent::Read { channel_id: self.id, payload }),
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("channel {}: corrupt stream from {:?}: {}", self.id, self.remote_address, e);
                    return Err(ErrorCode::PacketParserError);
                }
            }
        }
    }
}

async fn read_loop(id: ChannelId, mut reader: OwnedReadHalf, chunk_pool: Arc<ChunkPool>, socket_events: mpsc::UnboundedSender<SocketEvent>) {
    loop {
        let mut buf = chunk_pool.acquire(chunk_pool.chunk_size());
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("channel {}: connection closed by peer", id);
                socket_events.send(SocketEvent::Failed { id, error: ErrorCode::PeerDisconnect }).ok();
                return;
            }
            Ok(n) => {
                trace!("channel {}: received {} bytes", id, n);
                if socket_events.send(SocketEvent::Received { id, data: buf.freeze() }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("channel {}: error reading from socket: {}", id, e);
                socket_events.send(SocketEvent::Failed { id, error: ErrorCode::SocketError }).ok();
                return;
            }
        }
    }
}

async fn write_loop(id: ChannelId, mut writer: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<SharedBuf>, socket_events: mpsc::UnboundedSender<SocketEvent>) {
    while let Some(mut frame) = frames.recv().await {
        trace!("channel {}: writing frame of {} bytes", id, frame.len());
        if let Err(e) = writer.write_all_buf(&mut frame).await {
            warn!("channel {}: error writing to socket: {}", id, e);
            socket_events.send(SocketEvent::Failed { id, error: ErrorCode::SocketError }).ok();
            return;
        }
    }
}
