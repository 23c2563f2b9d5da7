//! WebSocket transport
//!
//! Nodes are identified by their advertised `ws://host:port` address until
//! the upgrade handshake has exchanged peer ids.

pub mod codes;
pub mod endpoint;
pub mod handshake;
pub mod peer_book;
pub mod transport;

pub use codes::DisconnectionReason;
pub use endpoint::{Direction, WsConnection, WsEndpoint};
pub use peer_book::PeerBook;
pub use transport::{WebSocketTransport, WsStream};
