use std::time::Duration;
use anyhow::bail;

/// The class of a service. 'Outer' services face the public network (game clients etc.),
///  'inner' services connect the processes of a trusted server cluster.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ServiceType {
    Outer,
    Inner,
}

impl ServiceType {
    /// length of the size prefix of a stream transport frame
    pub fn length_prefix_len(&self) -> usize {
        match self {
            ServiceType::Outer => 2,
            ServiceType::Inner => 4,
        }
    }

    /// Inner frames carry a routing id after the opcode
    pub fn has_routing_id(&self) -> bool {
        *self == ServiceType::Inner
    }

    /// upper bound for a stream transport frame's declared size; anything bigger is treated as a
    ///  corrupted or hostile stream
    pub fn max_frame_size(&self) -> usize {
        match self {
            ServiceType::Outer => u16::MAX as usize,
            ServiceType::Inner => u16::MAX as usize * 16,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub service_type: ServiceType,

    /// A connecting channel that is not acknowledged within this time fails with
    ///  `ConnectTimeout`; an accepted channel that does not receive its first message within this
    ///  time fails with `AcceptTimeout`.
    pub connect_timeout: Duration,
    /// interval for re-sending an unacknowledged SYN
    pub handshake_retry_interval: Duration,

    /// number of times a FIN is sent when a channel is closed locally - there is no
    ///  acknowledgement for FIN, so repetition is all we can do over a lossy network
    pub fin_repeat: usize,

    /// Messages bigger than this are sent as a sequence of fragments
    pub fragment_cap: usize,
    pub max_message_size: usize,

    /// A channel is closed with `SendWindowExceeded` if the number of segments waiting for
    ///  acknowledgement exceeds this value when the application sends a message
    pub max_wait_send: usize,

    pub socket_buffer_size: usize,
    /// size of the buffer datagrams are received into - longer datagrams are truncated
    pub recv_buffer_len: usize,

    pub arq: ArqConfig,
    pub pool: PoolConfig,
}

impl ServiceConfig {
    pub fn outer() -> ServiceConfig {
        ServiceConfig {
            service_type: ServiceType::Outer,
            connect_timeout: Duration::from_secs(20),
            handshake_retry_interval: Duration::from_millis(300),
            fin_repeat: 3,
            fragment_cap: 10_000,
            max_message_size: u16::MAX as usize,
            max_wait_send: 1024,
            socket_buffer_size: 64 * 1024 * 1024,
            recv_buffer_len: 8192,
            arq: ArqConfig {
                mtu: 470,
                send_window: 256,
                receive_window: 256,
                ..ArqConfig::default()
            },
            pool: PoolConfig::default(),
        }
    }

    pub fn inner() -> ServiceConfig {
        ServiceConfig {
            service_type: ServiceType::Inner,
            max_message_size: u16::MAX as usize * 16,
            max_wait_send: 16 * 1024,
            arq: ArqConfig {
                mtu: 1400,
                send_window: 1024,
                receive_window: 1024,
                ..ArqConfig::default()
            },
            ..ServiceConfig::outer()
        }
    }

    pub fn for_type(service_type: ServiceType) -> ServiceConfig {
        match service_type {
            ServiceType::Outer => ServiceConfig::outer(),
            ServiceType::Inner => ServiceConfig::inner(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout.as_millis() > (u32::MAX / 4) as u128 {
            bail!("connect timeout is too long");
        }
        if self.handshake_retry_interval.is_zero() || self.handshake_retry_interval >= self.connect_timeout {
            bail!("handshake retry interval must be positive and shorter than the connect timeout");
        }
        if self.fin_repeat == 0 {
            bail!("FIN must be sent at least once");
        }
        if self.fragment_cap == 0 || self.fragment_cap >= self.max_message_size {
            bail!("fragment cap must be positive and smaller than the maximum message size");
        }
        if self.max_message_size > u32::MAX as usize {
            bail!("maximum message size must fit into a fragment header");
        }
        if self.max_wait_send == 0 {
            bail!("max_wait_send must be positive");
        }
        if self.recv_buffer_len < self.arq.mtu {
            bail!("receive buffer must hold at least one full datagram");
        }
        self.arq.validate()?;
        self.pool.validate()?;
        Ok(())
    }
}

/// Tuning of the reliability primitive underneath a UDP channel
#[derive(Clone, Debug)]
pub struct ArqConfig {
    /// maximum datagram size produced by the primitive, including its headers and the channel's
    ///  5 byte MSG prefix
    pub mtu: usize,
    /// maximum number of segments in flight
    pub send_window: u16,
    pub receive_window: u16,
    /// interval for flushing acknowledgements and checking for retransmission
    pub interval: Duration,
    /// retransmission timeout for the first retransmission of a segment
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// a segment is resent early if this many acknowledgements for later segments arrived
    pub fast_resend: u32,
    /// The session is considered dead if a segment was retransmitted this many times
    pub dead_link: u32,
}

impl Default for ArqConfig {
    fn default() -> Self {
        ArqConfig {
            mtu: 1400,
            send_window: 256,
            receive_window: 256,
            interval: Duration::from_millis(10),
            min_rto: Duration::from_millis(30),
            max_rto: Duration::from_secs(5),
            fast_resend: 2,
            dead_link: 20,
        }
    }
}

impl ArqConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 64 || self.mtu > 65_000 {
            bail!("ARQ mtu must be between 64 and 65000");
        }
        if self.send_window == 0 || self.receive_window == 0 {
            bail!("ARQ windows must be positive");
        }
        if self.interval.is_zero() || self.interval.as_millis() > 5_000 {
            bail!("ARQ interval must be between 1 ms and 5 s");
        }
        if self.min_rto.is_zero() || self.min_rto > self.max_rto || self.max_rto.as_millis() > 60_000 {
            bail!("ARQ rto bounds are inconsistent");
        }
        if self.dead_link == 0 {
            bail!("dead link threshold must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub chunk_size: usize,
    /// Chunks returned to a full pool are discarded
    pub max_pooled_chunks: usize,
    /// maximum number of pooled objects per type
    pub object_pool_cap: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            chunk_size: 8192,
            max_pooled_chunks: 4096,
            object_pool_cap: 100,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size < 64 {
            bail!("chunk size is too small");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::outer(ServiceType::Outer, 2, false, 65535)]
    #[case::inner(ServiceType::Inner, 4, true, 65535*16)]
    fn test_service_type(#[case] service_type: ServiceType, #[case] prefix_len: usize, #[case] routing_id: bool, #[case] max_frame_size: usize) {
        assert_eq!(service_type.length_prefix_len(), prefix_len);
        assert_eq!(service_type.has_routing_id(), routing_id);
        assert_eq!(service_type.max_frame_size(), max_frame_size);
    }

    #[rstest]
    #[case::outer(ServiceType::Outer, 470, 256, 1024)]
    #[case::inner(ServiceType::Inner, 1400, 1024, 16384)]
    fn test_presets(#[case] service_type: ServiceType, #[case] mtu: usize, #[case] window: u16, #[case] max_wait_send: usize) {
        let config = ServiceConfig::for_type(service_type);
        assert_eq!(config.service_type, service_type);
        assert_eq!(config.arq.mtu, mtu);
        assert_eq!(config.arq.send_window, window);
        assert_eq!(config.arq.receive_window, window);
        assert_eq!(config.max_wait_send, max_wait_send);
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.handshake_retry_interval, Duration::from_millis(300));
        assert_eq!(config.fragment_cap, 10_000);
        assert_eq!(config.fin_repeat, 3);
        assert!(config.validate().is_ok());
    }

    fn modified(f: impl FnOnce(&mut ServiceConfig)) -> ServiceConfig {
        let mut config = ServiceConfig::outer();
        f(&mut config);
        config
    }

    #[rstest]
    #[case::zero_retry(modified(|c| c.handshake_retry_interval = Duration::ZERO))]
    #[case::retry_longer_than_timeout(modified(|c| c.handshake_retry_interval = Duration::from_secs(30)))]
    #[case::huge_timeout(modified(|c| c.connect_timeout = Duration::from_secs(100_000_000)))]
    #[case::no_fin(modified(|c| c.fin_repeat = 0))]
    #[case::cap_exceeds_max(modified(|c| c.fragment_cap = c.max_message_size))]
    #[case::zero_cap(modified(|c| c.fragment_cap = 0))]
    #[case::zero_wait_send(modified(|c| c.max_wait_send = 0))]
    #[case::recv_buffer_too_small(modified(|c| c.recv_buffer_len = 100))]
    #[case::tiny_mtu(modified(|c| c.arq.mtu = 20))]
    #[case::zero_window(modified(|c| c.arq.send_window = 0))]
    #[case::rto_bounds(modified(|c| c.arq.min_rto = Duration::from_secs(10)))]
    #[case::dead_link(modified(|c| c.arq.dead_link = 0))]
    #[case::tiny_chunks(modified(|c| c.pool.chunk_size = 16))]
    fn test_validate_rejects(#[case] config: ServiceConfig) {
        assert!(config.validate().is_err());
    }
}
