//! Signaling coordinator: decides who initiates on a 2-party room and shuttles
//! negotiation blobs between the relay and the Peer Link.
//!
//! Host-driven like the rest of the core: the host reports relay envelopes and link
//! events, the coordinator returns [`Action`]s. The host owns the actual link object
//! and feeds blobs it produces back through [`SignalingCoordinator::on_local_signal`].

use std::fmt;

use tracing::{debug, info, warn};

use crate::room::{ConnectionId, RoomId};
use crate::signal::{Blob, ClientSignal, RelaySignal};

/// Ticks (seconds, with the session's 1 s tick) a negotiation may take before failing.
pub const DEFAULT_NEGOTIATION_TIMEOUT_TICKS: u64 = 30;

/// Which side of the handshake this client plays. Fixed by join order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First joiner, told about the second one; creates the offer.
    Initiator,
    /// Second joiner; answers the offer it receives.
    Responder,
}

/// Tags every link the coordinator asks for, so events from a replaced link are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    WaitingForPeer,
    Offering,
    Answering,
    Established,
    Failed,
}

impl CoordinatorState {
    pub fn is_negotiating(self) -> bool {
        matches!(self, CoordinatorState::Offering | CoordinatorState::Answering)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::WaitingForPeer => write!(f, "waiting for peer"),
            CoordinatorState::Offering | CoordinatorState::Answering => write!(f, "connecting"),
            CoordinatorState::Established => write!(f, "connected"),
            CoordinatorState::Failed => write!(f, "failed"),
        }
    }
}

/// What the host must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write an envelope to the relay.
    Signal(ClientSignal),
    /// Build an initiator link and report its offer via `on_local_signal`.
    Initiate { link: LinkId, remote: ConnectionId },
    /// Build a responder link fed with `offer` and report its answer via `on_local_signal`.
    Accept {
        link: LinkId,
        remote: ConnectionId,
        offer: Blob,
    },
    /// Hand a remote blob (answer or candidate) to the existing link.
    ApplyRemote { link: LinkId, blob: Blob },
    /// Tear the link down and release it. Closing an already closed link is a no-op.
    CloseLink(LinkId),
    StateChanged(CoordinatorState),
}

pub struct SignalingCoordinator {
    room: Option<RoomId>,
    own_id: Option<ConnectionId>,
    state: CoordinatorState,
    role: Option<Role>,
    remote: Option<ConnectionId>,
    link: Option<LinkId>,
    next_link: u64,
    local_signals: u32,
    tick_count: u64,
    negotiation_started: u64,
    negotiation_timeout_ticks: u64,
    relay_up: bool,
    /// Relay came back while a link was established; rejoin once that link ends.
    rejoin_pending: bool,
}

impl SignalingCoordinator {
    pub fn new() -> Self {
        Self {
            room: None,
            own_id: None,
            state: CoordinatorState::WaitingForPeer,
            role: None,
            remote: None,
            link: None,
            next_link: 1,
            local_signals: 0,
            tick_count: 0,
            negotiation_started: 0,
            negotiation_timeout_ticks: DEFAULT_NEGOTIATION_TIMEOUT_TICKS,
            relay_up: true,
            rejoin_pending: false,
        }
    }

    /// Set negotiation timeout in ticks. Zero disables it.
    pub fn set_negotiation_timeout(&mut self, ticks: u64) {
        self.negotiation_timeout_ticks = ticks;
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn remote(&self) -> Option<&ConnectionId> {
        self.remote.as_ref()
    }

    pub fn current_link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    /// Own relay connection id, once the relay has announced it.
    pub fn own_id(&self) -> Option<&ConnectionId> {
        self.own_id.as_ref()
    }

    pub fn join_room(&mut self, room: RoomId) -> Vec<Action> {
        info!(%room, "joining room");
        self.room = Some(room.clone());
        vec![Action::Signal(ClientSignal::JoinRoom(room))]
    }

    pub fn relay_up(&self) -> bool {
        self.relay_up
    }

    /// The relay socket dropped. Connection ids do not survive a reconnect, so a
    /// negotiation in flight fails now. An established link is left alone.
    pub fn on_relay_down(&mut self) -> Vec<Action> {
        if !self.relay_up {
            return vec![];
        }
        self.relay_up = false;
        self.own_id = None;
        if !self.state.is_negotiating() {
            return vec![];
        }
        warn!(state = ?self.state, "relay lost during negotiation");
        let mut actions = self.teardown();
        actions.extend(self.transition(CoordinatorState::Failed));
        actions
    }

    /// The relay socket is back. The new connection is not in any room yet, so the
    /// room is joined again, or once the established link ends.
    pub fn on_relay_up(&mut self) -> Vec<Action> {
        if self.relay_up {
            return vec![];
        }
        self.relay_up = true;
        let Some(room) = self.room.clone() else {
            return vec![];
        };
        if self.state == CoordinatorState::Established {
            debug!(%room, "relay back; rejoin deferred while link is up");
            self.rejoin_pending = true;
            return vec![];
        }
        self.rejoin_pending = false;
        info!(%room, "relay back; rejoining room");
        vec![Action::Signal(ClientSignal::JoinRoom(room))]
    }

    pub fn on_relay_signal(&mut self, signal: RelaySignal) -> Vec<Action> {
        match signal {
            RelaySignal::Connected(id) => {
                debug!(%id, "relay assigned connection id");
                self.own_id = Some(id);
                vec![]
            }
            RelaySignal::UserConnected(peer) => {
                info!(%peer, "peer joined; initiating");
                let mut actions = self.teardown();
                let link = self.start(Role::Initiator, peer.clone());
                actions.push(Action::Initiate { link, remote: peer });
                actions.extend(self.transition(CoordinatorState::Offering));
                actions
            }
            RelaySignal::Offer { sdp, caller } => {
                info!(%caller, "offer received; answering");
                let mut actions = self.teardown();
                let link = self.start(Role::Responder, caller.clone());
                actions.push(Action::Accept {
                    link,
                    remote: caller,
                    offer: sdp,
                });
                actions.extend(self.transition(CoordinatorState::Answering));
                actions
            }
            RelaySignal::Answer { sdp, responder } => {
                match (self.state, self.link, self.is_remote(&responder)) {
                    (CoordinatorState::Offering, Some(link), true) => {
                        debug!(%responder, "answer received");
                        vec![Action::ApplyRemote { link, blob: sdp }]
                    }
                    _ => {
                        debug!(%responder, state = ?self.state, "unexpected answer ignored");
                        vec![]
                    }
                }
            }
            RelaySignal::IceCandidate { candidate, sender } => {
                match (self.link, self.is_remote(&sender)) {
                    (Some(link), true) => vec![Action::ApplyRemote {
                        link,
                        blob: candidate,
                    }],
                    _ => {
                        debug!(%sender, "candidate for no current link ignored");
                        vec![]
                    }
                }
            }
        }
    }

    /// A blob produced by the current link: the offer / answer first, candidates after.
    pub fn on_local_signal(&mut self, link: LinkId, blob: Blob) -> Vec<Action> {
        if self.link != Some(link) {
            debug!(%link, "local signal from stale link ignored");
            return vec![];
        }
        let (Some(role), Some(target)) = (self.role, self.remote.clone()) else {
            return vec![];
        };
        self.local_signals += 1;
        let signal = match (role, self.local_signals) {
            (Role::Initiator, 1) => ClientSignal::Offer { target, sdp: blob },
            (Role::Responder, 1) => ClientSignal::Answer { target, sdp: blob },
            _ => ClientSignal::IceCandidate {
                target,
                candidate: blob,
            },
        };
        vec![Action::Signal(signal)]
    }

    pub fn on_link_connected(&mut self, link: LinkId) -> Vec<Action> {
        if self.link != Some(link) || !self.state.is_negotiating() {
            return vec![];
        }
        info!(%link, role = ?self.role, "peer link connected");
        self.transition(CoordinatorState::Established)
    }

    pub fn on_link_error(&mut self, link: LinkId, error: &str) -> Vec<Action> {
        if self.link != Some(link) {
            return vec![];
        }
        warn!(%link, error, "peer link failed");
        self.link = None;
        let mut actions = vec![Action::CloseLink(link)];
        actions.extend(self.transition(CoordinatorState::Failed));
        actions
    }

    pub fn on_link_closed(&mut self, link: LinkId) -> Vec<Action> {
        if self.link != Some(link) {
            return vec![];
        }
        info!(%link, "peer link closed");
        self.link = None;
        let mut actions = vec![Action::CloseLink(link)];
        actions.extend(self.transition(CoordinatorState::Failed));
        actions
    }

    /// Local teardown, e.g. the user leaving the room.
    pub fn close(&mut self) -> Vec<Action> {
        self.rejoin_pending = false;
        let mut actions = self.teardown();
        actions.extend(self.transition(CoordinatorState::Failed));
        actions
    }

    /// Periodic tick. Fails a negotiation that has outlived the timeout.
    pub fn tick(&mut self) -> Vec<Action> {
        self.tick_count = self.tick_count.saturating_add(1);
        if !self.state.is_negotiating() || self.negotiation_timeout_ticks == 0 {
            return vec![];
        }
        if self.tick_count.saturating_sub(self.negotiation_started) <= self.negotiation_timeout_ticks
        {
            return vec![];
        }
        warn!(
            ticks = self.negotiation_timeout_ticks,
            "negotiation timed out"
        );
        let mut actions = self.teardown();
        actions.extend(self.transition(CoordinatorState::Failed));
        actions
    }

    fn is_remote(&self, id: &ConnectionId) -> bool {
        self.remote.as_ref() == Some(id)
    }

    fn start(&mut self, role: Role, remote: ConnectionId) -> LinkId {
        let link = LinkId(self.next_link);
        self.next_link += 1;
        self.role = Some(role);
        self.remote = Some(remote);
        self.link = Some(link);
        self.local_signals = 0;
        self.negotiation_started = self.tick_count;
        link
    }

    fn teardown(&mut self) -> Vec<Action> {
        match self.link.take() {
            Some(link) => vec![Action::CloseLink(link)],
            None => vec![],
        }
    }

    fn transition(&mut self, next: CoordinatorState) -> Vec<Action> {
        if self.state == next {
            return vec![];
        }
        debug!(from = ?self.state, to = ?next, "coordinator state");
        self.state = next;
        let mut actions = vec![Action::StateChanged(next)];
        if next == CoordinatorState::Failed && self.rejoin_pending && self.relay_up {
            self.rejoin_pending = false;
            if let Some(room) = self.room.clone() {
                info!(%room, "link ended; rejoining room");
                actions.push(Action::Signal(ClientSignal::JoinRoom(room)));
            }
        }
        actions
    }
}

impl Default for SignalingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::new(s)
    }

    fn initiate_link(actions: &[Action]) -> LinkId {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Initiate { link, .. } | Action::Accept { link, .. } => Some(*link),
                _ => None,
            })
            .expect("expected a link to be created")
    }

    #[test]
    fn join_emits_join_room() {
        let mut c = SignalingCoordinator::new();
        let actions = c.join_room(RoomId::parse("abc123").unwrap());
        assert_eq!(
            actions,
            vec![Action::Signal(ClientSignal::JoinRoom(
                RoomId::parse("abc123").unwrap()
            ))]
        );
        assert_eq!(c.state(), CoordinatorState::WaitingForPeer);
    }

    #[test]
    fn existing_member_becomes_initiator() {
        let mut x = SignalingCoordinator::new();
        let actions = x.on_relay_signal(RelaySignal::UserConnected(id("y")));
        assert_eq!(x.role(), Some(Role::Initiator));
        assert_eq!(x.state(), CoordinatorState::Offering);
        let link = initiate_link(&actions);
        assert!(actions.contains(&Action::Initiate {
            link,
            remote: id("y")
        }));

        let out = x.on_local_signal(link, json!({"offer": 1}));
        assert_eq!(
            out,
            vec![Action::Signal(ClientSignal::Offer {
                target: id("y"),
                sdp: json!({"offer": 1})
            })]
        );
    }

    #[test]
    fn joiner_answers_offer() {
        let mut y = SignalingCoordinator::new();
        let actions = y.on_relay_signal(RelaySignal::Offer {
            sdp: json!("o"),
            caller: id("x"),
        });
        assert_eq!(y.role(), Some(Role::Responder));
        assert_eq!(y.state(), CoordinatorState::Answering);
        let link = initiate_link(&actions);
        assert!(actions.contains(&Action::Accept {
            link,
            remote: id("x"),
            offer: json!("o")
        }));
        let out = y.on_local_signal(link, json!("a"));
        assert_eq!(
            out,
            vec![Action::Signal(ClientSignal::Answer {
                target: id("x"),
                sdp: json!("a")
            })]
        );
    }

    #[test]
    fn later_local_signals_become_candidates() {
        let mut x = SignalingCoordinator::new();
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        x.on_local_signal(link, json!("offer"));
        let out = x.on_local_signal(link, json!("cand"));
        assert_eq!(
            out,
            vec![Action::Signal(ClientSignal::IceCandidate {
                target: id("y"),
                candidate: json!("cand")
            })]
        );
    }

    #[test]
    fn answer_applied_only_from_expected_responder() {
        let mut x = SignalingCoordinator::new();
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        assert!(x
            .on_relay_signal(RelaySignal::Answer {
                sdp: json!("a"),
                responder: id("z")
            })
            .is_empty());
        assert_eq!(
            x.on_relay_signal(RelaySignal::Answer {
                sdp: json!("a"),
                responder: id("y")
            }),
            vec![Action::ApplyRemote {
                link,
                blob: json!("a")
            }]
        );
    }

    #[test]
    fn established_only_on_link_event() {
        let mut x = SignalingCoordinator::new();
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        x.on_relay_signal(RelaySignal::Answer {
            sdp: json!("a"),
            responder: id("y"),
        });
        assert_eq!(x.state(), CoordinatorState::Offering);
        assert_eq!(
            x.on_link_connected(link),
            vec![Action::StateChanged(CoordinatorState::Established)]
        );
    }

    #[test]
    fn candidate_applied_to_current_link() {
        let mut y = SignalingCoordinator::new();
        let link = initiate_link(&y.on_relay_signal(RelaySignal::Offer {
            sdp: json!("o"),
            caller: id("x"),
        }));
        assert_eq!(
            y.on_relay_signal(RelaySignal::IceCandidate {
                candidate: json!("c"),
                sender: id("x")
            }),
            vec![Action::ApplyRemote {
                link,
                blob: json!("c")
            }]
        );
    }

    #[test]
    fn error_fails_and_closes() {
        let mut x = SignalingCoordinator::new();
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        let out = x.on_link_error(link, "ice failed");
        assert_eq!(
            out,
            vec![
                Action::CloseLink(link),
                Action::StateChanged(CoordinatorState::Failed)
            ]
        );
        assert_eq!(x.current_link(), None);
    }

    #[test]
    fn close_event_fails() {
        let mut x = SignalingCoordinator::new();
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        x.on_link_connected(link);
        assert_eq!(
            x.on_link_closed(link),
            vec![
                Action::CloseLink(link),
                Action::StateChanged(CoordinatorState::Failed)
            ]
        );
    }

    #[test]
    fn new_peer_replaces_previous_link() {
        let mut x = SignalingCoordinator::new();
        let first = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        let actions = x.on_relay_signal(RelaySignal::UserConnected(id("y2")));
        assert_eq!(actions[0], Action::CloseLink(first));
        let second = initiate_link(&actions);
        assert_ne!(first, second);
        assert!(x.on_link_connected(first).is_empty());
        assert!(x.on_local_signal(first, json!("late")).is_empty());
        assert_eq!(x.remote(), Some(&id("y2")));
    }

    #[test]
    fn negotiation_times_out() {
        let mut x = SignalingCoordinator::new();
        x.set_negotiation_timeout(3);
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        for _ in 0..3 {
            assert!(x.tick().is_empty());
        }
        assert_eq!(
            x.tick(),
            vec![
                Action::CloseLink(link),
                Action::StateChanged(CoordinatorState::Failed)
            ]
        );
    }

    #[test]
    fn waiting_and_established_never_time_out() {
        let mut x = SignalingCoordinator::new();
        x.set_negotiation_timeout(1);
        for _ in 0..5 {
            assert!(x.tick().is_empty());
        }
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        x.on_link_connected(link);
        for _ in 0..5 {
            assert!(x.tick().is_empty());
        }
        assert_eq!(x.state(), CoordinatorState::Established);
    }

    fn room(s: &str) -> RoomId {
        RoomId::parse(s).unwrap()
    }

    #[test]
    fn relay_status_without_room_is_quiet() {
        let mut x = SignalingCoordinator::new();
        assert!(x.on_relay_up().is_empty());
        assert!(x.on_relay_down().is_empty());
        assert!(!x.relay_up());
        assert!(x.on_relay_down().is_empty());
        assert!(x.on_relay_up().is_empty());
        assert_eq!(x.state(), CoordinatorState::WaitingForPeer);
    }

    #[test]
    fn relay_drop_fails_negotiation_and_rejoins_on_return() {
        let mut x = SignalingCoordinator::new();
        x.join_room(room("r"));
        x.on_relay_signal(RelaySignal::Connected(id("x1")));
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));

        assert_eq!(
            x.on_relay_down(),
            vec![
                Action::CloseLink(link),
                Action::StateChanged(CoordinatorState::Failed)
            ]
        );
        assert_eq!(x.own_id(), None);
        assert_eq!(
            x.on_relay_up(),
            vec![Action::Signal(ClientSignal::JoinRoom(room("r")))]
        );
        assert!(x.on_relay_up().is_empty());
    }

    #[test]
    fn established_link_outlives_relay_and_rejoins_when_it_ends() {
        let mut x = SignalingCoordinator::new();
        x.join_room(room("r"));
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        x.on_link_connected(link);

        assert!(x.on_relay_down().is_empty());
        assert!(x.on_relay_up().is_empty());
        assert_eq!(x.state(), CoordinatorState::Established);
        assert_eq!(x.current_link(), Some(link));

        assert_eq!(
            x.on_link_closed(link),
            vec![
                Action::CloseLink(link),
                Action::StateChanged(CoordinatorState::Failed),
                Action::Signal(ClientSignal::JoinRoom(room("r"))),
            ]
        );
    }

    #[test]
    fn deferred_rejoin_waits_for_relay() {
        let mut x = SignalingCoordinator::new();
        x.join_room(room("r"));
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        x.on_link_connected(link);
        x.on_relay_down();
        x.on_relay_up();
        x.on_relay_down();

        assert_eq!(
            x.on_link_error(link, "reset"),
            vec![
                Action::CloseLink(link),
                Action::StateChanged(CoordinatorState::Failed)
            ]
        );
        assert_eq!(
            x.on_relay_up(),
            vec![Action::Signal(ClientSignal::JoinRoom(room("r")))]
        );
    }

    #[test]
    fn leaving_drops_a_deferred_rejoin() {
        let mut x = SignalingCoordinator::new();
        x.join_room(room("r"));
        let link = initiate_link(&x.on_relay_signal(RelaySignal::UserConnected(id("y"))));
        x.on_link_connected(link);
        x.on_relay_down();
        x.on_relay_up();
        assert_eq!(
            x.close(),
            vec![
                Action::CloseLink(link),
                Action::StateChanged(CoordinatorState::Failed)
            ]
        );
    }
}
