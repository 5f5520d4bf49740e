//! Control protocol definitions
//!
//! This crate defines the messages exchanged between the relay and its agents
//! over the persistent control channel, the NAT descriptor types both sides
//! agree on, and the length-prefixed codec used to frame them.

pub mod codec;
pub mod messages;
pub mod nat;

pub use codec::{CodecError, ControlCodec};
pub use messages::*;
pub use nat::{NatDescriptor, ReachabilityClass};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default port the relay accepts agent control connections on
pub const DEFAULT_CONTROL_PORT: u16 = 3000;

/// Default port of the relayed backend service (SSH)
pub const DEFAULT_SSH_PORT: u16 = 22;
