//! Room membership and event fan-out.
//!
//! A connection's rooms are fixed at authentication: its tenant room, its
//! principal room, and the admin room for elevated principals. Client
//! subscribe requests can only re-join rooms from that set. Every emit
//! re-checks membership on the handle before enqueueing, so a stale room
//! index entry can never deliver across tenants.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use hse_core::{Principal, Room, ServerFrame, TenantId, Value};
use tracing::{debug, error, info, warn};

use super::connection::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionState, OutboundMessage,
};
use crate::error::TenancyError;

/// Rooms a principal is authorized for.
#[must_use]
pub fn authorized_rooms(principal: &Principal) -> Vec<Room> {
    let mut rooms = vec![
        Room::Tenant(principal.tenant_id.clone()),
        Room::Principal(principal.principal_id.clone()),
    ];
    if principal.is_elevated() {
        rooms.push(Room::Admin);
    }
    rooms
}

/// Whether `principal` may be a member of `room`.
#[must_use]
pub fn may_join(principal: &Principal, room: &Room) -> bool {
    match room {
        Room::Tenant(t) => *t == principal.tenant_id,
        Room::Principal(p) => *p == principal.principal_id,
        Room::Admin => principal.is_elevated(),
    }
}

pub struct RoomRouter {
    registry: Arc<ConnectionRegistry>,
    members: DashMap<Room, HashSet<ConnectionId>>,
    max_denied_subscriptions: u32,
}

impl RoomRouter {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, max_denied_subscriptions: u32) -> Self {
        Self {
            registry,
            members: DashMap::new(),
            max_denied_subscriptions,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// `Connecting → Authenticating`. Returns `false` if the connection
    /// already left `Connecting`.
    pub fn begin_auth(&self, handle: &ConnectionHandle) -> bool {
        let mut meta = handle.metadata.write();
        if meta.state != ConnectionState::Connecting {
            return false;
        }
        meta.state = ConnectionState::Authenticating;
        true
    }

    /// `Authenticating → Authorized`, joining every room the principal is
    /// authorized for. Returns the joined rooms.
    pub fn authorize(&self, handle: &ConnectionHandle, principal: Principal) -> Vec<Room> {
        let rooms = authorized_rooms(&principal);
        {
            let mut meta = handle.metadata.write();
            meta.state = ConnectionState::Authorized(principal.clone());
            meta.rooms.extend(rooms.iter().cloned());
        }
        for room in &rooms {
            self.members.entry(room.clone()).or_default().insert(handle.id);
        }
        info!(
            connection_id = %handle.id,
            tenant_id = %principal.tenant_id,
            principal_id = %principal.principal_id,
            rooms = rooms.len(),
            "realtime connection authorized"
        );
        rooms
    }

    /// Moves the connection to the terminal `Rejected` state.
    pub fn reject(&self, handle: &ConnectionHandle, reason: &str) {
        handle.metadata.write().state = ConnectionState::Rejected;
        warn!(connection_id = %handle.id, reason, "realtime authentication rejected");
    }

    /// Joins `raw_room` on behalf of the connection.
    ///
    /// # Errors
    ///
    /// `UnauthorizedRoomAccess` if the connection is not authorized, the
    /// room name is malformed, or the room is outside the principal's set.
    /// Once the refusals exceed the probe threshold a close frame is queued.
    pub fn subscribe(&self, handle: &ConnectionHandle, raw_room: &str) -> Result<Room, TenancyError> {
        let principal = handle.state().principal().cloned();
        let Some(principal) = principal else {
            return Err(self.deny(handle, raw_room, "not authenticated"));
        };
        let room: Room = match raw_room.parse() {
            Ok(room) => room,
            Err(_) => return Err(self.deny(handle, raw_room, "malformed room")),
        };
        if !may_join(&principal, &room) {
            return Err(self.deny(handle, raw_room, "outside authorized rooms"));
        }

        handle.metadata.write().rooms.insert(room.clone());
        self.members.entry(room.clone()).or_default().insert(handle.id);
        debug!(connection_id = %handle.id, room = %room, "subscribed");
        Ok(room)
    }

    /// Leaves `raw_room`. Leaving a room the connection is not in is a no-op.
    ///
    /// # Errors
    ///
    /// `UnauthorizedRoomAccess` if the room name is malformed.
    pub fn unsubscribe(&self, handle: &ConnectionHandle, raw_room: &str) -> Result<Room, TenancyError> {
        let room: Room = raw_room
            .parse()
            .map_err(|_| TenancyError::UnauthorizedRoomAccess {
                room: raw_room.to_string(),
            })?;
        handle.metadata.write().rooms.remove(&room);
        self.leave(&room, handle.id);
        Ok(room)
    }

    /// Removes the connection from the registry and from every room.
    pub fn disconnect(&self, id: ConnectionId) {
        let Some(handle) = self.registry.remove(id) else {
            return;
        };
        let rooms: Vec<Room> = handle.metadata.write().rooms.drain().collect();
        for room in &rooms {
            self.leave(room, id);
        }
        debug!(connection_id = %id, "realtime connection removed");
    }

    #[must_use]
    pub fn member_count(&self, room: &Room) -> usize {
        self.members.get(room).map_or(0, |m| m.len())
    }

    /// Delivers `event` to every connection joined to `room`. Returns the
    /// number of connections the frame was enqueued for; slow consumers with
    /// a full outbound channel miss the event.
    pub fn emit(&self, room: &Room, event: &str, payload: Value) -> usize {
        let frame = ServerFrame::Event {
            room: room.clone(),
            event: event.to_string(),
            payload,
        };
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(room = %room, event, error = %e, "failed to encode realtime event");
                return 0;
            }
        };

        let ids: Vec<ConnectionId> = match self.members.get(room) {
            Some(m) => m.iter().copied().collect(),
            None => return 0,
        };
        let mut delivered = 0;
        for id in ids {
            let Some(handle) = self.registry.get(id) else {
                continue;
            };
            if !handle.receives(room) {
                continue;
            }
            if handle.try_send(OutboundMessage::Binary(bytes.clone())) {
                delivered += 1;
            } else {
                debug!(connection_id = %id, room = %room, "outbound channel full, event dropped");
            }
        }
        delivered
    }

    pub fn emit_to_tenant(&self, tenant_id: &TenantId, event: &str, payload: Value) -> usize {
        self.emit(&Room::Tenant(tenant_id.clone()), event, payload)
    }

    pub fn emit_to_principal(&self, principal_id: &str, event: &str, payload: Value) -> usize {
        self.emit(&Room::Principal(principal_id.to_string()), event, payload)
    }

    pub fn emit_to_admins(&self, event: &str, payload: Value) -> usize {
        self.emit(&Room::Admin, event, payload)
    }

    fn leave(&self, room: &Room, id: ConnectionId) {
        let now_empty = self.members.get_mut(room).is_some_and(|mut m| {
            m.remove(&id);
            m.is_empty()
        });
        if now_empty {
            self.members.remove_if(room, |_, m| m.is_empty());
        }
    }

    fn deny(&self, handle: &ConnectionHandle, raw_room: &str, reason: &str) -> TenancyError {
        let (denied, tenant) = {
            let mut meta = handle.metadata.write();
            meta.denied_subscriptions += 1;
            let tenant = meta.state.principal().map(|p| p.tenant_id.to_string());
            (meta.denied_subscriptions, tenant)
        };
        metrics::counter!("hse_room_access_denied_total").increment(1);
        warn!(
            connection_id = %handle.id,
            tenant_id = tenant.as_deref().unwrap_or("-"),
            room = raw_room,
            reason,
            denied,
            "room subscription denied"
        );
        if denied > self.max_denied_subscriptions {
            warn!(connection_id = %handle.id, denied, "closing connection after repeated room probing");
            let _ = handle.try_send(OutboundMessage::Close(Some(
                "too many unauthorized subscriptions".to_string(),
            )));
        }
        TenancyError::UnauthorizedRoomAccess {
            room: raw_room.to_string(),
        }
    }
}
