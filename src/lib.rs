//! Real-time broadcast relay.
//!
//! Clients hold a WebSocket open to `/ws`; every message one of them sends is
//! stamped with its sender and relayed to all connected clients. A single hub
//! task owns the set of live connections and serializes registration,
//! unregistration and fan-out against it.

pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;

pub use error::{DeliveryError, HubError};
pub use protocol::Message;
pub use server::connection::{Connection, ConnectionId};
pub use server::hub::{HubConfig, HubHandle};
pub use server::{Server, ServerConfig};
