//! Reliable messaging over UDP.
//!
//! Every datagram starts with a one-byte flag that determines its layout. All numbers are little
//!  endian; 'sender' and 'receiver' denote the connection numbers of the sending and the
//!  receiving channel respectively:
//!
//! ```ascii
//! 1 SYN             sender, receiver (0 if not yet known), [real address (UTF-8)]
//! 2 ACK             sender, receiver
//! 3 FIN             sender, receiver, error code (u32)
//! 4 MSG             sender, followed by ARQ segments (the first of which starts with 'receiver')
//! 5 RECONNECT_SYN   sender, receiver, nonce (u32)
//! 6 RECONNECT_ACK   sender, receiver, nonce (u32)
//! ```
//!
//! A connecting channel sends SYN until it receives ACK or the connect timeout expires. The
//!  accepting side answers every SYN with ACK and considers the handshake complete when the
//!  first MSG arrives. From then on, application messages travel as MSG datagrams whose reliable,
//!  ordered delivery is the job of the [arq] session. Messages exceeding the fragment cap are
//!  split into fragments, preceded by an 8 byte fragment header `(0u32, total length u32)`.
//!
//! A channel that is closed locally notifies its peer with (repeated) FIN datagrams; a FIN is
//!  also the answer to a MSG addressed to an unknown channel.
//!
//! A client whose network address changes (e.g. a mobile device switching networks, or a relay
//!  restart) proves its identity with RECONNECT_SYN carrying both connection numbers before its
//!  channel's address is changed.

pub mod arq;
pub mod channel;
pub mod control_frame;
pub mod datagram_socket;
pub mod schedule;
pub mod udp_service;
