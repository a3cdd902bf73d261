//! Peer Link: the direct, ordered, reliable channel between the two room members.
//!
//! A link is negotiated through opaque blobs the coordinator carries over the relay.
//! Once connected it moves [`Frame`]s both ways; inbound frames and lifecycle changes
//! arrive on the session's event channel tagged with the link's [`LinkId`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use roomdrop_core::identity::WireCryptoError;
use roomdrop_core::{check_frame, Blob, Frame, FrameDecodeError, FrameEncodeError, LinkId};
use tokio::sync::mpsc;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryLink, MemoryNetwork};
pub use tcp::{TcpLink, TcpLinkFactory};

/// Frames queued towards the wire per link. Bounds how far a sender runs ahead.
pub const OUTBOUND_QUEUE_FRAMES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LinkState::Idle,
            1 => LinkState::Negotiating,
            2 => LinkState::Connected,
            3 => LinkState::Failed,
            _ => LinkState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkState::Idle => 0,
            LinkState::Negotiating => 1,
            LinkState::Connected => 2,
            LinkState::Failed => 3,
            LinkState::Closed => 4,
        }
    }
}

/// Link state shared between the link object, its I/O tasks and its frame senders.
#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        SharedState(Arc::new(AtomicU8::new(LinkState::Idle.as_u8())))
    }

    pub fn get(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: LinkState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Frame(Frame),
    Error(String),
    Closed,
}

pub type LinkEventSender = mpsc::UnboundedSender<(LinkId, LinkEvent)>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<(LinkId, LinkEvent)>;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link not connected")]
    NotConnected,
    #[error("link closed")]
    Closed,
    #[error("malformed negotiation blob: {0}")]
    BadBlob(#[from] serde_json::Error),
    #[error("unexpected {0} blob")]
    Unexpected(&'static str),
    #[error("protocol version {0} not supported")]
    Version(u8),
    #[error("peer key does not match negotiated key")]
    KeyMismatch,
    #[error("frame: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error("frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("wire: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One negotiated connection to the remote member.
///
/// The negotiation calls are synchronous and only produce blobs; all I/O runs on tasks
/// the link spawns, reporting through the event channel it was created with.
pub trait PeerLink: Send {
    /// Initiator side: start listening and produce the offer blob.
    fn initiate(&mut self) -> Result<Blob, LinkError>;
    /// Responder side: consume the offer, start connecting, produce the answer blob.
    fn accept(&mut self, offer: Blob) -> Result<Blob, LinkError>;
    /// Answer (initiator) or a trickled candidate (either side).
    fn apply_remote(&mut self, blob: Blob) -> Result<(), LinkError>;
    /// Handle for queueing outbound frames; fails until the link is connected.
    fn frames(&self) -> FrameSender;
    fn state(&self) -> LinkState;
    /// Tear down. Idempotent; no events are emitted for a local close.
    fn close(&mut self);
}

/// Builds a fresh link per negotiation. Nothing is bound or dialed until the
/// coordinator asks for a link, so a peer that never meets anyone opens no sockets.
pub trait LinkFactory: Send {
    type Link: PeerLink;

    fn create(&mut self, id: LinkId, events: LinkEventSender) -> Self::Link;
}

/// Cloneable outbound side of a link. Sends wait while the link's queue is full.
#[derive(Debug, Clone)]
pub struct FrameSender {
    state: SharedState,
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    pub fn is_connected(&self) -> bool {
        self.state.get() == LinkState::Connected && !self.tx.is_closed()
    }

    /// Queue one frame. A frame the codec would refuse is rejected here and the link
    /// stays up.
    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.state.get() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        check_frame(&frame)?;
        self.tx.send(frame).await.map_err(|_| LinkError::Closed)
    }
}

/// Shared outbound plumbing both link kinds start with.
pub(crate) struct Outbound {
    pub state: SharedState,
    pub tx: mpsc::Sender<Frame>,
    pub rx: Option<mpsc::Receiver<Frame>>,
}

impl Outbound {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
        Self {
            state: SharedState::new(),
            tx,
            rx: Some(rx),
        }
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender {
            state: self.state.clone(),
            tx: self.tx.clone(),
        }
    }
}
