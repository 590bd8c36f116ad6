//! Stream transport: the [crate::service::Service] contract over TCP.
//!
//! Tokio tasks accept, connect, read and write. They never touch channel state; everything they
//!  observe is queued as a [tcp_service::SocketEvent] and processed inside
//!  [crate::service::Service::update], so the owner sees the same single-threaded event flow as
//!  for the UDP transport. Messages are framed with the service type's length prefix.

pub mod tcp_channel;
pub mod tcp_service;
