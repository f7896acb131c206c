//! Connection registry owned by the hub loop.
//!
//! Only the loop touches this, so nothing here is synchronised. Two views are
//! kept consistent: `connections` (every viewer ever registered and not yet
//! unregistered) and `rooms` (registered viewers partitioned by affinity).

use super::{ConnectionId, HubStats, Outbound};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Registered,
    /// Queue closed by the hub (slow consumer, shutdown). Kept as a tombstone
    /// until the viewer task unregisters.
    Closing,
    /// Unregistered; the entry is gone.
    Closed,
}

#[derive(Debug)]
struct Connection {
    state: ConnectionState,
    affinity: Option<String>,
    outbound: Option<mpsc::Sender<Outbound>>,
}

impl Connection {
    /// Registered -> Closing. Closing twice is a bug in the loop.
    fn begin_close(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Registered, "delivery queue closed twice");
        self.affinity = None;
        // Dropping the only sender ends the writer's receive loop.
        self.outbound = None;
        self.state = ConnectionState::Closing;
    }

    /// Closing -> Closed, once the viewer task has let go.
    fn finish_close(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Closing);
        self.state = ConnectionState::Closed;
    }
}

/// Delivery result of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl HubState {
    pub fn register(&mut self, id: ConnectionId, outbound: mpsc::Sender<Outbound>) {
        if self.connections.contains_key(&id) {
            error!(%id, "connection registered twice, ignoring");
            debug_assert!(false, "connection {id} registered twice");
            return;
        }
        self.connections.insert(
            id,
            Connection {
                state: ConnectionState::Registered,
                affinity: None,
                outbound: Some(outbound),
            },
        );
        debug!(%id, total = self.live_count(), "viewer registered");
    }

    /// Moves a viewer into `server`'s room, leaving its previous one first.
    pub fn set_affinity(&mut self, id: ConnectionId, server: String) {
        let previous = match self.connections.get_mut(&id) {
            Some(conn) if conn.state == ConnectionState::Registered => conn.affinity.replace(server.clone()),
            Some(_) => {
                debug!(%id, "affinity change for a closed viewer ignored");
                return;
            }
            None => {
                warn!(%id, "affinity change for an unknown viewer ignored");
                return;
            }
        };

        if let Some(previous) = previous {
            self.leave_room(id, &previous);
        }
        self.rooms.entry(server.clone()).or_default().insert(id);
        debug!(%id, server = %server, "viewer affinity set");
    }

    /// Drops the viewer for good and returns its final state.
    ///
    /// A registered viewer goes through both close phases here; a tombstone
    /// left by a hub-side disconnect only finishes its close.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<ConnectionState> {
        let Some(mut conn) = self.connections.remove(&id) else {
            error!(%id, "unregister of an unknown viewer");
            debug_assert!(false, "unregister of unknown connection {id}");
            return None;
        };

        match conn.state {
            ConnectionState::Registered => {
                if let Some(room) = conn.affinity.clone() {
                    self.leave_room(id, &room);
                }
                conn.begin_close();
                conn.finish_close();
            }
            ConnectionState::Closing => conn.finish_close(),
            ConnectionState::Closed => {
                error!(%id, "closed viewer was still registered");
                debug_assert!(false, "closed connection {id} kept in the registry");
            }
        }
        debug!(%id, total = self.live_count(), "viewer unregistered");
        Some(conn.state)
    }

    /// Pushes `payload` to every viewer in `server`'s room. Full or dead queues are disconnected.
    pub fn broadcast_to_server(&mut self, server: &str, payload: &Outbound) -> Delivery {
        let targets: Vec<ConnectionId> = match self.rooms.get(server) {
            Some(room) => room.iter().copied().collect(),
            None => return Delivery::default(),
        };
        self.deliver(targets, payload)
    }

    /// Pushes `payload` to every registered viewer under the same full-queue policy.
    pub fn broadcast(&mut self, payload: &Outbound) -> Delivery {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state == ConnectionState::Registered)
            .map(|(id, _)| *id)
            .collect();
        self.deliver(targets, payload)
    }

    fn deliver(&mut self, targets: Vec<ConnectionId>, payload: &Outbound) -> Delivery {
        let mut delivery = Delivery::default();
        let mut slow = Vec::new();

        for id in targets {
            let Some(sender) = self.connections.get(&id).and_then(|c| c.outbound.as_ref()) else {
                continue;
            };
            match sender.try_send(payload.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(%id, "viewer queue full, disconnecting slow consumer");
                    slow.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%id, "viewer writer gone");
                    slow.push(id);
                }
            }
        }

        delivery.dropped = slow.len();
        for id in slow {
            self.disconnect(id);
        }
        delivery
    }

    /// Closes a viewer's queue on the hub's initiative, leaving a tombstone.
    fn disconnect(&mut self, id: ConnectionId) {
        let room = match self.connections.get(&id) {
            Some(conn) if conn.state == ConnectionState::Registered => conn.affinity.clone(),
            _ => return,
        };
        if let Some(room) = room {
            self.leave_room(id, &room);
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.begin_close();
        }
    }

    fn leave_room(&mut self, id: ConnectionId, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    /// Closes every queue; used when the hub stops.
    pub fn close_all(&mut self) {
        let live: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state == ConnectionState::Registered)
            .map(|(id, _)| *id)
            .collect();
        for id in &live {
            self.disconnect(*id);
        }
        info!(closed = live.len(), "hub stopped, viewer queues closed");
    }

    pub fn state_of(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(|c| c.state)
    }

    fn live_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state == ConnectionState::Registered)
            .count()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.live_count(),
            rooms: self.rooms.len(),
        }
    }

    /// Every room member is a registered viewer whose affinity names that room, and vice versa.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (room, members) in &self.rooms {
            if members.is_empty() {
                return Err(format!("empty room {room} kept"));
            }
            for id in members {
                match self.connections.get(id) {
                    Some(conn) if conn.state == ConnectionState::Registered => {
                        if conn.affinity.as_deref() != Some(room.as_str()) {
                            return Err(format!("{id} in room {room} but affinity is {:?}", conn.affinity));
                        }
                    }
                    _ => return Err(format!("{id} in room {room} but not registered")),
                }
            }
        }
        for (id, conn) in &self.connections {
            if let Some(room) = &conn.affinity {
                if !self.rooms.get(room).is_some_and(|m| m.contains(id)) {
                    return Err(format!("{id} has affinity {room} but is not in that room"));
                }
            }
        }
        Ok(())
    }
}
