//! Message framing for stream transports:
//!
//! ```ascii
//! 0: size (u16 LE for outer services, u32 LE for inner services) - number of bytes following
//!     the size prefix
//! *: frame header: opcode (u16 LE), followed by the routing id (u128 LE) for inner services
//! *: payload
//! ```
//!
//! The size prefix is handled by the [packet_parser], the frame header by [frame]. Reliable UDP
//!  channels deliver whole messages, so only the frame header applies to them.

pub mod frame;
pub mod packet_parser;
