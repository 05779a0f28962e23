//! Realtime delivery: connection registry and tenant-contained rooms.

pub mod connection;
pub mod router;

pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionState, OutboundMessage,
    SendError,
};
pub use router::{authorized_rooms, may_join, RoomRouter};
