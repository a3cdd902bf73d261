//! Roomdrop protocol core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod coordinator;
pub mod frame;
pub mod identity;
pub mod relay;
pub mod room;
pub mod signal;
pub mod transfer;

pub use coordinator::{Action, CoordinatorState, LinkId, Role, SignalingCoordinator};
pub use frame::{
    check_frame, decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError,
};
pub use identity::{Keypair, PublicKey};
pub use relay::{Delivery, RelayRouter};
pub use room::{ConnectionId, InvalidRoomId, RoomDirectory, RoomId};
pub use signal::{Blob, ClientSignal, RelaySignal};
pub use transfer::{
    FileMeta, OutgoingTransfer, Reassembler, ReceivedFile, SendOutcome, TransferEvent, CHUNK_SIZE,
};

/// Current link protocol version. Sent in the link hello and negotiation blobs.
pub const PROTOCOL_VERSION: u8 = 1;
