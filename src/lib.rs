//! Realtime record synchronization over WebSocket
//!
//! Clients connect over a long-lived WebSocket, submit CRUD requests against
//! a shared record set, and receive broadcast notifications so every
//! connected client converges on the same view. Persistence is delegated to
//! a [`Storage`] collaborator; this crate implements the protocol state
//! machine, the connection registry and the broadcast fan-out.

pub mod dispatcher;
pub mod errors;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod transport;

// Re-export commonly used items
pub use dispatcher::{ ConnectionEvent, Dispatcher };
pub use errors::{ Error, Result };
pub use protocol::{ classify, ChangeNotification, ClientRequest, ErrorEnvelope, OutboundEvent, Record };
pub use registry::{ ConnectionId, ConnectionRegistry };
pub use storage::{ MemoryStorage, Storage };
pub use transport::{ WebSocketServerOptions, WebSocketSyncServer };
