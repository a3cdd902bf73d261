//! Host-driven relay logic: membership and envelope routing. No I/O.
//!
//! The host owns the sockets, reports connect / signal / disconnect, and writes each
//! returned `Delivery` to the socket registered under `to`.

use std::collections::HashSet;

use tracing::debug;

use crate::room::{ConnectionId, RoomDirectory};
use crate::signal::{ClientSignal, RelaySignal};

/// One envelope for the host to write to a socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub signal: RelaySignal,
}

#[derive(Debug, Default)]
pub struct RelayRouter {
    connected: HashSet<ConnectionId>,
    rooms: RoomDirectory,
}

impl RelayRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh socket. The socket is told its own id.
    pub fn on_connect(&mut self, conn: ConnectionId) -> Vec<Delivery> {
        self.connected.insert(conn.clone());
        vec![Delivery {
            to: conn.clone(),
            signal: RelaySignal::Connected(conn),
        }]
    }

    /// Route one envelope from `from`. Unknown senders and targets are dropped.
    pub fn on_signal(&mut self, from: &ConnectionId, signal: ClientSignal) -> Vec<Delivery> {
        if !self.connected.contains(from) {
            debug!(%from, "signal from unregistered connection dropped");
            return vec![];
        }
        match signal {
            ClientSignal::JoinRoom(room) => {
                let others = self.rooms.join(&room, from);
                debug!(%from, %room, peers = others.len(), "joined room");
                others
                    .into_iter()
                    .map(|to| Delivery {
                        to,
                        signal: RelaySignal::UserConnected(from.clone()),
                    })
                    .collect()
            }
            forwarded => {
                let Some((to, signal)) = forwarded.into_forwarded(from.clone()) else {
                    return vec![];
                };
                if !self.connected.contains(&to) {
                    debug!(%from, target = %to, "target not connected; envelope dropped");
                    return vec![];
                }
                vec![Delivery { to, signal }]
            }
        }
    }

    /// Forget a socket and prune it from every room. Remaining members are not told.
    pub fn on_disconnect(&mut self, conn: &ConnectionId) {
        self.connected.remove(conn);
        let rooms = self.rooms.leave_all(conn);
        debug!(%conn, rooms = rooms.len(), "connection removed");
    }

    pub fn is_connected(&self, conn: &ConnectionId) -> bool {
        self.connected.contains(conn)
    }

    pub fn connection_count(&self) -> usize {
        self.connected.len()
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomId;
    use serde_json::json;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::new(s)
    }

    fn join(router: &mut RelayRouter, who: &str, room: &str) -> Vec<Delivery> {
        router.on_signal(&id(who), ClientSignal::JoinRoom(RoomId::parse(room).unwrap()))
    }

    fn connected(names: &[&str]) -> RelayRouter {
        let mut router = RelayRouter::new();
        for n in names {
            router.on_connect(id(n));
        }
        router
    }

    #[test]
    fn connect_announces_own_id() {
        let mut router = RelayRouter::new();
        let out = router.on_connect(id("x"));
        assert_eq!(
            out,
            vec![Delivery {
                to: id("x"),
                signal: RelaySignal::Connected(id("x"))
            }]
        );
    }

    #[test]
    fn second_joiner_is_announced_to_first_only() {
        let mut router = connected(&["x", "y"]);
        assert!(join(&mut router, "x", "abc123").is_empty());
        let out = join(&mut router, "y", "abc123");
        assert_eq!(
            out,
            vec![Delivery {
                to: id("x"),
                signal: RelaySignal::UserConnected(id("y"))
            }]
        );
    }

    #[test]
    fn rejoin_notifies_again_without_duplicating_membership() {
        let mut router = connected(&["x", "y"]);
        join(&mut router, "x", "r");
        join(&mut router, "y", "r");
        let out = join(&mut router, "y", "r");
        assert_eq!(out.len(), 1);
        assert_eq!(router.rooms().members(&RoomId::parse("r").unwrap()).len(), 2);
    }

    #[test]
    fn offer_forwarded_exactly_once_with_caller() {
        let mut router = connected(&["x", "y", "z"]);
        let sdp = json!({"type": "offer", "nested": {"a": 1}});
        let out = router.on_signal(
            &id("x"),
            ClientSignal::Offer {
                target: id("y"),
                sdp: sdp.clone(),
            },
        );
        assert_eq!(
            out,
            vec![Delivery {
                to: id("y"),
                signal: RelaySignal::Offer {
                    sdp,
                    caller: id("x")
                }
            }]
        );
    }

    #[test]
    fn ice_candidate_carries_sender() {
        let mut router = connected(&["x", "y"]);
        let out = router.on_signal(
            &id("y"),
            ClientSignal::IceCandidate {
                target: id("x"),
                candidate: json!("cand"),
            },
        );
        assert_eq!(
            out[0].signal,
            RelaySignal::IceCandidate {
                candidate: json!("cand"),
                sender: id("y")
            }
        );
    }

    #[test]
    fn unknown_target_dropped_silently() {
        let mut router = connected(&["x"]);
        let out = router.on_signal(
            &id("x"),
            ClientSignal::Answer {
                target: id("gone"),
                sdp: json!({}),
            },
        );
        assert!(out.is_empty());
    }

    #[test]
    fn disconnect_prunes_rooms_without_notifying() {
        let mut router = connected(&["x", "y"]);
        join(&mut router, "x", "r");
        join(&mut router, "y", "r");
        router.on_disconnect(&id("x"));
        assert!(!router.is_connected(&id("x")));
        assert_eq!(
            router.rooms().members(&RoomId::parse("r").unwrap()),
            vec![id("y")]
        );
        let out = router.on_signal(
            &id("y"),
            ClientSignal::Offer {
                target: id("x"),
                sdp: json!({}),
            },
        );
        assert!(out.is_empty());
    }

    #[test]
    fn unregistered_sender_ignored() {
        let mut router = connected(&["x"]);
        assert!(join(&mut router, "stranger", "r").is_empty());
        assert_eq!(router.rooms().room_count(), 0);
    }
}
