//! Realtime wire frames and room names.
//!
//! Frames are `MsgPack` maps with a `type` discriminator, encoded with
//! `rmp_serde::to_vec_named()` so field names survive on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::tenant::{TenantId, TenantIdError};
use crate::types::Value;

/// A broadcast group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// All connections of one tenant.
    Tenant(TenantId),
    /// All connections of one principal (multiple tabs/devices).
    Principal(String),
    /// Cross-tenant room for platform staff only.
    Admin,
}

/// Error parsing a [`Room`] name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomParseError {
    #[error("unknown room kind in {0:?}")]
    UnknownKind(String),
    #[error("invalid tenant in room name: {0}")]
    Tenant(#[from] TenantIdError),
    #[error("empty principal in room name")]
    EmptyPrincipal,
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Tenant(t) => write!(f, "tenant:{t}"),
            Room::Principal(p) => write!(f, "principal:{p}"),
            Room::Admin => f.write_str("admin"),
        }
    }
}

impl FromStr for Room {
    type Err = RoomParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "admin" {
            return Ok(Room::Admin);
        }
        match s.split_once(':') {
            Some(("tenant", id)) => Ok(Room::Tenant(TenantId::parse(id)?)),
            Some(("principal", "")) => Err(RoomParseError::EmptyPrincipal),
            Some(("principal", id)) => Ok(Room::Principal(id.to_string())),
            _ => Err(RoomParseError::UnknownKind(s.to_string())),
        }
    }
}

impl Serialize for Room {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Room {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Frames sent by a realtime client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    Auth { token: String },
    Subscribe { room: String },
    Unsubscribe { room: String },
    Ping { timestamp: i64 },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Authentication succeeded; lists the rooms joined automatically.
    AuthAck { rooms: Vec<Room> },
    /// Authentication failed; the connection is closed after this frame.
    AuthFail { error: String },
    Subscribed { room: Room },
    Unsubscribed { room: Room },
    /// A subscribe request was refused.
    SubscribeDenied { room: String, error: String },
    Event {
        room: Room,
        event: String,
        payload: Value,
    },
    Pong { timestamp: i64 },
}

impl ServerFrame {
    /// Encodes to named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

impl ClientFrame {
    /// Decodes a named `MsgPack` frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not a recognised frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
