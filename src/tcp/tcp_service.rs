use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{bail, Context};
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::buffers::chunk_pool::{ChunkPool, SharedBuf};
use crate::channel_id::{ChannelId, ChannelIdGenerator};
use crate::config::{ServiceConfig, ServiceType};
use crate::error_code::ErrorCode;
use crate::service::{Service, ServiceEvent};
use crate::tcp::tcp_channel::TcpChannel;

/// Everything the socket tasks report to the service. They are processed in
///  [Service::update] only.
pub enum SocketEvent {
    Accepted { stream: TcpStream, remote_address: SocketAddr },
    Connected { id: ChannelId, stream: TcpStream },
    Received { id: ChannelId, data: SharedBuf },
    Failed { id: ChannelId, error: ErrorCode },
}

pub struct TcpService {
    config: ServiceConfig,
    runtime: Handle,
    id_generator: Arc<ChannelIdGenerator>,
    chunk_pool: Arc<ChunkPool>,

    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    socket_events_sender: mpsc::UnboundedSender<SocketEvent>,
    socket_events: mpsc::UnboundedReceiver<SocketEvent>,

    channels: FxHashMap<ChannelId, TcpChannel>,
    events: VecDeque<ServiceEvent>,
}

impl TcpService {
    /// Bind a listener and start accepting connections. Must be called inside a tokio runtime,
    ///  which then runs all of this service's socket tasks.
    pub async fn bind(addr: SocketAddr, config: ServiceConfig, id_generator: Arc<ChannelIdGenerator>, chunk_pool: Arc<ChunkPool>) -> anyhow::Result<TcpService> {
        config.validate()?;
        if chunk_pool.chunk_size() != config.pool.chunk_size {
            bail!("chunk pool does not match the configured chunk size");
        }

        let listener = TcpListener::bind(addr).await
            .with_context(|| format!("binding TCP listener to {:?}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("TCP service listening on {:?}", local_addr);

        let runtime = Handle::current();
        let (socket_events_sender, socket_events) = mpsc::unbounded_channel();
        let accept_task = runtime.spawn(accept_loop(listener, socket_events_sender.clone()));

        Ok(TcpService {
            config,
            runtime,
            id_generator,
            chunk_pool,
            local_addr: Some(local_addr),
            accept_task: Some(accept_task),
            socket_events_sender,
            socket_events,
            channels: FxHashMap::default(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn remote_address(&self, id: ChannelId) -> Option<SocketAddr> {
        self.channels.get(&id)
            .map(|c| c.remote_address())
    }

    /// Dropping the channel closes its socket
    fn fail_channel(&mut self, id: ChannelId, error: ErrorCode) {
        if self.channels.remove(&id).is_some() {
            info!("channel {} closed: {}", id, error);
            self.events.push_back(ServiceEvent::Error { channel_id: id, error });
        }
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Accepted { stream, remote_address } => {
                let id = self.id_generator.new_accept_id();
                info!("accepted channel {} from {:?}", id, remote_address);

                let mut channel = TcpChannel::new(id, remote_address, &self.config, self.chunk_pool.clone());
                channel.attach(stream, &self.runtime, &self.socket_events_sender, &self.chunk_pool);
                self.channels.insert(id, channel);
                self.events.push_back(ServiceEvent::Accepted { channel_id: id, remote_address });
            }
            SocketEvent::Connected { id, stream } => {
                // a channel removed while connecting just drops the stream
                if let Some(channel) = self.channels.get_mut(&id) {
                    info!("channel {} connected to {:?}", id, channel.remote_address());
                    channel.attach(stream, &self.runtime, &self.socket_events_sender, &self.chunk_pool);
                }
            }
            SocketEvent::Received { id, data } => {
                let Some(channel) = self.channels.get_mut(&id) else {
                    return;
                };
                if let Err(e) = channel.on_data(&data, &mut self.events) {
                    self.fail_channel(id, e);
                }
            }
            SocketEvent::Failed { id, error } => {
                self.fail_channel(id, error);
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, socket_events: mpsc::UnboundedSender<SocketEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_address)) => {
                if socket_events.send(SocketEvent::Accepted { stream, remote_address }).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("error accepting TCP connection: {}", e);
            }
        }
    }
}

async fn connect(id: ChannelId, address: SocketAddr, config: ServiceConfig, socket_events: mpsc::UnboundedSender<SocketEvent>) {
    let event = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => SocketEvent::Connected { id, stream },
        Ok(Err(e)) => {
            warn!("channel {}: connecting to {:?} failed: {}", id, address, e);
            SocketEvent::Failed { id, error: ErrorCode::ConnectFailed }
        }
        Err(_) => {
            warn!("channel {}: no connection to {:?} within the connect timeout", id, address);
            SocketEvent::Failed { id, error: ErrorCode::ConnectTimeout }
        }
    };
    socket_events.send(event).ok();
}

impl Service for TcpService {
    fn service_type(&self) -> ServiceType {
        self.config.service_type
    }

    fn create(&mut self, id: ChannelId, address: SocketAddr) {
        if self.is_disposed() || self.channels.contains_key(&id) {
            return;
        }

        info!("connecting channel {} to {:?}", id, address);
        let mut channel = TcpChannel::new(id, address, &self.config, self.chunk_pool.clone());
        channel.add_task(self.runtime.spawn(connect(id, address, self.config.clone(), self.socket_events_sender.clone())));
        self.channels.insert(id, channel);
    }

    fn send(&mut self, id: ChannelId, payload: SharedBuf) {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("sending on unknown channel {} - dropping message", id);
            return;
        };
        if let Err(e) = channel.send(payload, &self.config, &self.chunk_pool) {
            self.fail_channel(id, e);
        }
    }

    fn remove(&mut self, id: ChannelId) {
        if self.channels.remove(&id).is_some() {
            info!("removed channel {}", id);
        }
    }

    fn update(&mut self) {
        while let Ok(event) = self.socket_events.try_recv() {
            self.on_socket_event(event);
        }
    }

    fn drain_events(&mut self) -> Drain<'_, ServiceEvent> {
        self.events.drain(..)
    }

    fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    fn is_disposed(&self) -> bool {
        self.local_addr.is_none()
    }

    fn dispose(&mut self) {
        if let Some(accept_task) = self.accept_task.take() {
            accept_task.abort();
        }
        self.channels.clear();
        self.local_addr = None;
        while self.socket_events.try_recv().is_ok() {}
        info!("TCP service disposed");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn chunk_pool(&self) -> &Arc<ChunkPool> {
        &self.chunk_pool
    }
}

impl Drop for TcpService {
    fn drop(&mut self) {
        if let Some(accept_task) = self.accept_task.take() {
            accept_task.abort();
        }
    }
}
