//! Secure packet transport
//!
//! Gossip packets travel over an unreliable datagram [`Link`]. [`SecureTransport`]
//! establishes a per-peer session key with a signed, certificate-authenticated
//! handshake and seals every data packet under it.

pub mod certs;
pub mod memory;
pub mod secure;
pub mod session;
pub mod stats;
pub mod traits;
pub mod udp;
pub mod wire;

pub use certs::{Credentials, PeerIdentity, TrustStore};
pub use memory::{MemoryLink, MemoryNetwork};
pub use secure::SecureTransport;
pub use session::Session;
pub use stats::{Disposition, DispositionCounters};
pub use traits::{resolve, Link, Transport};
pub use udp::UdpLink;
pub use wire::{Msg, MsgType};
