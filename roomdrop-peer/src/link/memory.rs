//! In-process loopback link pair. Negotiates through the same blob round trip as a
//! network link so sessions can be exercised without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use roomdrop_core::{Blob, Frame, LinkId, Role};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    FrameSender, LinkError, LinkEvent, LinkEventSender, LinkFactory, LinkState, Outbound, PeerLink,
    SharedState,
};

/// Shared rendezvous for memory links. Clone it into every session that should be
/// able to reach the others.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    next_token: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, Arc<Mutex<Pair>>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pair: Arc<Mutex<Pair>>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.pending).insert(token, pair);
        token
    }

    fn claim(&self, token: u64) -> Option<Arc<Mutex<Pair>>> {
        lock(&self.pending).remove(&token)
    }
}

impl LinkFactory for MemoryNetwork {
    type Link = MemoryLink;

    fn create(&mut self, id: LinkId, events: LinkEventSender) -> MemoryLink {
        MemoryLink {
            id,
            events,
            network: self.clone(),
            outbound: Outbound::new(),
            pair: None,
            role: None,
        }
    }
}

struct Endpoint {
    id: LinkId,
    events: LinkEventSender,
    state: SharedState,
    frames: Option<mpsc::Receiver<Frame>>,
}

#[derive(Default)]
struct Pair {
    initiator: Option<Endpoint>,
    responder: Option<Endpoint>,
    pumps: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Pair {
    fn endpoint(&self, role: Role) -> Option<&Endpoint> {
        match role {
            Role::Initiator => self.initiator.as_ref(),
            Role::Responder => self.responder.as_ref(),
        }
    }
}

pub struct MemoryLink {
    id: LinkId,
    events: LinkEventSender,
    network: MemoryNetwork,
    outbound: Outbound,
    pair: Option<Arc<Mutex<Pair>>>,
    role: Option<Role>,
}

impl MemoryLink {
    fn endpoint(&mut self, what: &'static str) -> Result<Endpoint, LinkError> {
        let frames = self.outbound.rx.take().ok_or(LinkError::Unexpected(what))?;
        self.outbound.state.set(LinkState::Negotiating);
        Ok(Endpoint {
            id: self.id,
            events: self.events.clone(),
            state: self.outbound.state.clone(),
            frames: Some(frames),
        })
    }
}

impl PeerLink for MemoryLink {
    fn initiate(&mut self) -> Result<Blob, LinkError> {
        let endpoint = self.endpoint("offer")?;
        let pair = Arc::new(Mutex::new(Pair {
            initiator: Some(endpoint),
            ..Pair::default()
        }));
        let token = self.network.register(pair.clone());
        self.pair = Some(pair);
        self.role = Some(Role::Initiator);
        Ok(json!({ "type": "offer", "memory": token }))
    }

    fn accept(&mut self, offer: Blob) -> Result<Blob, LinkError> {
        let token = offer_token(&offer, "offer")?;
        let pair = self
            .network
            .claim(token)
            .ok_or(LinkError::Unexpected("unknown offer"))?;
        let endpoint = self.endpoint("second offer")?;
        lock(&pair).responder = Some(endpoint);
        self.pair = Some(pair);
        self.role = Some(Role::Responder);
        Ok(json!({ "type": "answer", "memory": token }))
    }

    fn apply_remote(&mut self, blob: Blob) -> Result<(), LinkError> {
        offer_token(&blob, "answer")?;
        if self.role != Some(Role::Initiator) {
            return Err(LinkError::Unexpected("answer"));
        }
        let pair = self.pair.clone().ok_or(LinkError::Unexpected("answer"))?;
        let mut guard = lock(&pair);
        let pair = &mut *guard;
        if pair.closed || !pair.pumps.is_empty() {
            return Err(LinkError::Closed);
        }
        let (Some(i), Some(r)) = (pair.initiator.as_mut(), pair.responder.as_mut()) else {
            return Err(LinkError::Unexpected("answer"));
        };
        let (Some(i_frames), Some(r_frames)) = (i.frames.take(), r.frames.take()) else {
            return Err(LinkError::Unexpected("answer"));
        };
        for end in [&*i, &*r] {
            end.state.set(LinkState::Connected);
            let _ = end.events.send((end.id, LinkEvent::Connected));
        }
        let to_responder = tokio::spawn(pump(i_frames, r.id, r.events.clone()));
        let to_initiator = tokio::spawn(pump(r_frames, i.id, i.events.clone()));
        pair.pumps.push(to_responder);
        pair.pumps.push(to_initiator);
        debug!(link = %self.id, "memory link connected");
        Ok(())
    }

    fn frames(&self) -> FrameSender {
        self.outbound.sender()
    }

    fn state(&self) -> LinkState {
        self.outbound.state.get()
    }

    fn close(&mut self) {
        self.outbound.state.set(LinkState::Closed);
        let (Some(pair), Some(role)) = (self.pair.take(), self.role) else {
            return;
        };
        let mut pair = lock(&pair);
        if pair.closed {
            return;
        }
        pair.closed = true;
        for pump in pair.pumps.drain(..) {
            pump.abort();
        }
        let other = match role {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        };
        if let Some(end) = pair.endpoint(other) {
            if end.state.get() == LinkState::Connected {
                end.state.set(LinkState::Closed);
                let _ = end.events.send((end.id, LinkEvent::Closed));
            }
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(mut frames: mpsc::Receiver<Frame>, to: LinkId, events: LinkEventSender) {
    while let Some(frame) = frames.recv().await {
        if events.send((to, LinkEvent::Frame(frame))).is_err() {
            break;
        }
    }
}

fn offer_token(blob: &Blob, what: &'static str) -> Result<u64, LinkError> {
    blob.get("memory")
        .and_then(|t| t.as_u64())
        .ok_or(LinkError::Unexpected(what))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
