//! Common types and wire-protocol primitives shared across the pool stack.
//!
//! This crate provides:
//! - Binary packet serialization and parsing ([`packet`])
//! - Stream framing for length-prefixed packets ([`codec`])
//! - Block template layout and parsing ([`block`])
//! - 256-bit target arithmetic ([`target`])
//! - Share evaluation against pool and network targets ([`share`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod block;
pub mod codec;
pub mod packet;
pub mod share;
pub mod target;
pub mod types;

pub use codec::PacketCodec;
pub use packet::{FramingError, Packet};
pub use target::Target;
pub use types::{ConnectionId, MiningMode};
