use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use tracing::{debug, info};
use crate::buffers::chunk_pool::ChunkPool;
use crate::channel_id::ChannelIdGenerator;
use crate::config::{PoolConfig, ServiceConfig};
use crate::service::{Service, ServiceEvent};
use crate::tcp::tcp_service::TcpService;
use crate::udp::udp_service::UdpService;

/// index of a service in its [NetServices]
pub type ServiceId = usize;

/// The composition root of the transport layer: owns the [ChannelIdGenerator] and the
///  [ChunkPool] shared by all services, and a bounded table of services that is ticked as a whole.
///
/// There is no global instance; the application creates one and passes it around explicitly.
pub struct NetServices {
    id_generator: Arc<ChannelIdGenerator>,
    chunk_pool: Arc<ChunkPool>,
    pool_config: PoolConfig,
    services: Vec<Option<Box<dyn Service>>>,
}

impl NetServices {
    pub fn new(max_services: usize, pool_config: PoolConfig) -> anyhow::Result<NetServices> {
        pool_config.validate()?;
        if max_services == 0 {
            bail!("there must be room for at least one service");
        }

        let mut services = Vec::with_capacity(max_services);
        services.resize_with(max_services, || None);
        Ok(NetServices {
            id_generator: Arc::new(ChannelIdGenerator::new()),
            chunk_pool: ChunkPool::new(pool_config.chunk_size, pool_config.max_pooled_chunks),
            pool_config,
            services,
        })
    }

    pub fn id_generator(&self) -> &Arc<ChannelIdGenerator> {
        &self.id_generator
    }

    pub fn chunk_pool(&self) -> &Arc<ChunkPool> {
        &self.chunk_pool
    }

    pub fn num_services(&self) -> usize {
        self.services.iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Register a service in the first free slot
    pub fn add(&mut self, service: Box<dyn Service>) -> anyhow::Result<ServiceId> {
        let Some(id) = self.services.iter().position(|s| s.is_none()) else {
            bail!("all {} service slots are in use", self.services.len());
        };
        info!("registered {:?} service {} on {:?}", service.service_type(), id, service.local_addr());
        self.services[id] = Some(service);
        Ok(id)
    }

    pub fn bind_udp(&mut self, addr: SocketAddr, config: ServiceConfig) -> anyhow::Result<ServiceId> {
        let config = self.with_shared_pool(config);
        let service = UdpService::bind(addr, config, self.id_generator.clone(), self.chunk_pool.clone())?;
        self.add(Box::new(service))
    }

    pub async fn bind_tcp(&mut self, addr: SocketAddr, config: ServiceConfig) -> anyhow::Result<ServiceId> {
        let config = self.with_shared_pool(config);
        let service = TcpService::bind(addr, config, self.id_generator.clone(), self.chunk_pool.clone()).await?;
        self.add(Box::new(service))
    }

    fn with_shared_pool(&self, mut config: ServiceConfig) -> ServiceConfig {
        config.pool = self.pool_config.clone();
        config
    }

    pub fn get(&self, id: ServiceId) -> Option<&(dyn Service + 'static)> {
        self.services.get(id)?.as_deref()
    }

    pub fn get_mut(&mut self, id: ServiceId) -> Option<&mut (dyn Service + 'static)> {
        self.services.get_mut(id)?.as_deref_mut()
    }

    /// Dispose a service and free its slot
    pub fn remove(&mut self, id: ServiceId) -> bool {
        match self.services.get_mut(id).and_then(|s| s.take()) {
            Some(mut service) => {
                service.dispose();
                info!("removed service {}", id);
                true
            }
            None => false,
        }
    }

    /// Tick every live service and collect the events they produced, in service order
    pub fn update(&mut self) -> Vec<(ServiceId, ServiceEvent)> {
        let mut events = Vec::new();
        for (id, slot) in self.services.iter_mut().enumerate() {
            let Some(service) = slot else {
                continue;
            };
            if service.is_disposed() {
                continue;
            }
            service.update();
            events.extend(service.drain_events().map(|e| (id, e)));
        }
        if !events.is_empty() {
            debug!("{} service events", events.len());
        }
        events
    }

    pub fn dispose(&mut self) {
        for id in 0..self.services.len() {
            self.remove(id);
        }
    }
}
