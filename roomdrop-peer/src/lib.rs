//! Roomdrop peer: joins a room through the relay, negotiates a direct link with the
//! other member, and exchanges files and chat text over it.

pub mod config;
pub mod downloads;
pub mod link;
pub mod session;
pub mod signaling;

pub use config::Config;
pub use link::{LinkError, LinkFactory, LinkState, MemoryNetwork, PeerLink, TcpLinkFactory};
pub use session::{start, Direction, SessionError, SessionEvent, SessionHandle};
pub use signaling::{RelayEvent, SignalingClient};
