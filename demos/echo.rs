use std::net::SocketAddr;
use std::time::{Duration, Instant};
use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use netchannel::config::ServiceConfig;
use netchannel::config::PoolConfig;
use netchannel::net_services::NetServices;
use netchannel::service::ServiceEvent;
use tracing::{error, info, warn, Level};

/// Reliable-UDP echo: run one process as server, another as client pointing at it
#[derive(Parser)]
struct Args {
    /// address to bind to
    bind_address: String,

    /// server to connect to; without it, the process echoes everything it receives
    #[clap(long)]
    connect: Option<String>,

    /// number of messages the client sends
    #[clap(long, default_value_t = 10)]
    count: usize,

    /// size of each message in bytes
    #[clap(long, default_value_t = 100)]
    size: usize,

    #[clap(long, default_value_t = false)]
    inner: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const TICK: Duration = Duration::from_millis(5);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = if args.inner { ServiceConfig::inner() } else { ServiceConfig::outer() };
    let mut registry = NetServices::new(1, PoolConfig::default())?;
    let service_id = registry.bind_udp(args.bind_address.parse()?, config)?;

    match args.connect {
        Some(server) => run_client(&mut registry, service_id, server.parse()?, args.count, args.size),
        None => run_server(&mut registry, service_id),
    }
}

fn run_server(registry: &mut NetServices, service_id: usize) -> anyhow::Result<()> {
    info!("echo server running");
    loop {
        for (_, event) in registry.update() {
            match event {
                ServiceEvent::Accepted { channel_id, remote_address } => info!("client {:?} connected on {}", remote_address, channel_id),
                ServiceEvent::Read { channel_id, payload } => {
                    if let Some(service) = registry.get_mut(service_id) {
                        service.send(channel_id, payload);
                    }
                }
                ServiceEvent::Error { channel_id, error } => info!("channel {} closed: {}", channel_id, error),
                ServiceEvent::Reconnected { channel_id } => info!("channel {} reconnected", channel_id),
            }
        }
        std::thread::sleep(TICK);
    }
}

fn run_client(registry: &mut NetServices, service_id: usize, server: SocketAddr, count: usize, size: usize) -> anyhow::Result<()> {
    let channel_id = registry.id_generator().new_connect_id();
    let service = registry.get_mut(service_id)
        .ok_or_else(|| anyhow!("service is not registered"))?;
    service.create(channel_id, server);

    let start = Instant::now();
    for i in 0..count {
        let message = (0..size).map(|n| (n + i) as u8).collect::<Vec<_>>();
        let message = registry.chunk_pool().copy_from_slice(&message);
        if let Some(service) = registry.get_mut(service_id) {
            service.send(channel_id, message);
        }
    }

    let mut received = 0;
    while received < count {
        for (_, event) in registry.update() {
            match event {
                ServiceEvent::Read { payload, .. } => {
                    received += 1;
                    info!("received echo #{} ({} bytes)", received, payload.len());
                }
                ServiceEvent::Error { error, .. } => {
                    error!("channel failed: {}", error);
                    return Err(error.into());
                }
                other => warn!("unexpected event {:?}", other),
            }
        }
        std::thread::sleep(TICK);
    }

    info!("{} echoes in {:?}", count, start.elapsed());
    registry.dispose();
    Ok(())
}
