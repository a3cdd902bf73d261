//! Peer Link framing: 1-byte kind + 4-byte LE length + body.
//!
//! Metadata and text bodies are JSON (`{"type":"meta",...}`, `{"type":"text",...}`);
//! chunk bodies are raw bytes. Classification is by the kind byte only.

use serde::{Deserialize, Serialize};

use crate::transfer::{FileMeta, CHUNK_SIZE};

const HEADER_SIZE: usize = 1 + 4;
const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

const KIND_META: u8 = 1;
const KIND_TEXT: u8 = 2;
const KIND_CHUNK: u8 = 3;

/// One message unit on a Peer Link.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Starts a file; chunks that follow belong to it.
    Meta(FileMeta),
    Text(String),
    /// Raw slice of the currently announced file, at most `CHUNK_SIZE` bytes.
    Chunk(Vec<u8>),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JsonBody {
    Meta { meta: FileMeta },
    Text { content: String },
}

impl Frame {
    /// Short label for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Meta(_) => "meta",
            Frame::Text(_) => "text",
            Frame::Chunk(_) => "chunk",
        }
    }
}

/// Encode a frame: kind byte, body length, body.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let (kind, body) = match frame {
        Frame::Meta(meta) => (
            KIND_META,
            serde_json::to_vec(&JsonBody::Meta { meta: meta.clone() })?,
        ),
        Frame::Text(content) => (
            KIND_TEXT,
            serde_json::to_vec(&JsonBody::Text {
                content: content.clone(),
            })?,
        ),
        Frame::Chunk(bytes) => {
            if bytes.len() > CHUNK_SIZE {
                return Err(FrameEncodeError::ChunkTooLarge(bytes.len()));
            }
            (KIND_CHUNK, bytes.clone())
        }
    };
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.push(kind);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Check that `frame` would encode, without keeping the bytes. Links call this before
/// queueing so an unsendable frame is refused at the caller instead of on the wire.
pub fn check_frame(frame: &Frame) -> Result<(), FrameEncodeError> {
    match frame {
        Frame::Chunk(bytes) if bytes.len() > CHUNK_SIZE => {
            Err(FrameEncodeError::ChunkTooLarge(bytes.len()))
        }
        Frame::Chunk(_) => Ok(()),
        Frame::Meta(_) | Frame::Text(_) => encode_frame(frame).map(|_| ()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("chunk of {0} bytes exceeds chunk size")]
    ChunkTooLarge(usize),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// A partial buffer yields `NeedMore`; call again once more bytes arrive.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let kind = bytes[0];
    let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let body = &bytes[HEADER_SIZE..HEADER_SIZE + len];
    let frame = match kind {
        KIND_META | KIND_TEXT => match serde_json::from_slice::<JsonBody>(body)? {
            JsonBody::Meta { meta } if kind == KIND_META => Frame::Meta(meta),
            JsonBody::Text { content } if kind == KIND_TEXT => Frame::Text(content),
            _ => return Err(FrameDecodeError::KindMismatch(kind)),
        },
        KIND_CHUNK => {
            if len > CHUNK_SIZE {
                return Err(FrameDecodeError::ChunkTooLarge(len));
            }
            Frame::Chunk(body.to_vec())
        }
        other => return Err(FrameDecodeError::UnknownKind(other)),
    };
    Ok((frame, HEADER_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("body does not match frame kind {0}")]
    KindMismatch(u8),
    #[error("chunk of {0} bytes exceeds chunk size")]
    ChunkTooLarge(usize),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
