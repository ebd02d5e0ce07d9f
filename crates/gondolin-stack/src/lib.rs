#![forbid(unsafe_code)]

//! Sans-IO userspace network stack for the Gondolin sandbox.
//!
//! [`NetworkStack`] consumes raw Ethernet frames from the guest NIC and a
//! millisecond clock, and produces [`Action`]s: frames to emit back to the
//! guest and flow-level events for the interception layer. It performs no
//! IO of its own, which keeps every protocol state machine directly
//! testable from byte buffers.

pub mod arp;
pub mod dhcp;
pub mod dns;
pub mod frag;
pub mod stack;
pub mod tcp;

pub use dhcp::{DhcpParams, Lease};
pub use dns::NameBindings;
pub use stack::{Action, FlowId, FlowIo, NetworkStack, StackConfig, StackStats};
pub use tcp::{Millis, TcpState, TcpTuning};
