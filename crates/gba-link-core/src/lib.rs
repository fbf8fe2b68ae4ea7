//! Game Boy Advance link cable for an emulated SI bus.
//!
//! Instead of emulating the handheld, each SI port is bridged over TCP to a
//! peer process that plays the GBA. The [`ConnectionRegistry`] accepts peers
//! and hands their sockets to the per-port [`LinkSession`]s; a
//! [`GbaLinkDevice`] drives its session from bus polls and keeps the bus
//! moving with fallback replies whenever the peer is missing or slow.

pub mod config;
pub mod device;
pub mod error;
pub mod joybus;
pub mod registry;
pub mod session;
pub mod si;
pub mod state;

pub use config::LinkConfig;
pub use device::GbaLinkDevice;
pub use error::{LinkError, StateError};
pub use joybus::{FallbackTable, PACKET_SIZE, Packet};
pub use registry::{ConnectionRegistry, LinkChannel, LinkEvent, RegistryHandle};
pub use session::{LinkSession, ReceiveStatus};
pub use si::SiDevice;
pub use state::{ByteCursor, CursorMode, StateCursor};
