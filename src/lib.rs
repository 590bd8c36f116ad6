//! Transport layer for an application server: many logical channels multiplexed over UDP (with
//!  a handshake and reliability protocol of its own) or TCP, behind one uniform
//!  accept / connect / send / receive / error interface.
//!
//! Services are driven from the outside: the owner calls [service::Service::update] periodically
//!  and drains the resulting [service::ServiceEvent]s. [net_services::NetServices] is the
//!  composition root that ties services, the id generator and the buffer pool together.

pub mod buffers;
pub mod channel_id;
pub mod config;
pub mod error_code;
pub mod framing;
pub mod net_services;
pub mod service;
pub mod tcp;
pub mod udp;
pub mod util;

#[cfg(test)]
mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
