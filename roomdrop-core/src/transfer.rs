//! Transfer engine: chunk planning and progress for outbound files, reassembly of inbound ones.
//!
//! One file at a time per link in each direction. Inbound chunks belong to the most
//! recent metadata frame and are appended in arrival order; the link guarantees order.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frame::Frame;

/// Size of every binary chunk except possibly the last.
pub const CHUNK_SIZE: usize = 16 * 1024; // 16 KiB

/// Announced at the start of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

impl FileMeta {
    /// Build metadata for a local file, guessing the MIME type from the extension.
    pub fn for_file(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let mime_type = mime_type_for(&name).to_string();
        Self {
            name,
            size,
            mime_type,
        }
    }
}

/// Byte range `[start, end)` of one chunk within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split `total_len` bytes into consecutive ranges of `chunk_size` (last one may be shorter).
pub fn split_into_chunks(total_len: u64, chunk_size: usize) -> Vec<ChunkRange> {
    let size = (if chunk_size == 0 { CHUNK_SIZE } else { chunk_size }) as u64;
    let mut out = Vec::new();
    let mut start = 0u64;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkRange { start, end });
        start = end;
    }
    out
}

/// Send-side percentage, clamped to 100. Empty files count as done.
pub fn send_progress(sent: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (sent as f64 / total as f64).min(1.0) * 100.0
}

/// Outbound state for the file currently being sent.
#[derive(Debug)]
pub struct OutgoingTransfer {
    meta: FileMeta,
    ranges: Vec<ChunkRange>,
    next: usize,
    sent: u64,
}

impl OutgoingTransfer {
    pub fn new(meta: FileMeta) -> Self {
        let ranges = split_into_chunks(meta.size, CHUNK_SIZE);
        Self {
            meta,
            ranges,
            next: 0,
            sent: 0,
        }
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    /// The frame that opens this file on the wire.
    pub fn metadata_frame(&self) -> Frame {
        Frame::Meta(self.meta.clone())
    }

    /// Next range to read and send, in offset order.
    pub fn next_range(&mut self) -> Option<ChunkRange> {
        let range = self.ranges.get(self.next).copied()?;
        self.next += 1;
        Some(range)
    }

    /// Record that `len` bytes were accepted by the link. Returns the new progress.
    pub fn record_sent(&mut self, len: u64) -> f64 {
        self.sent = self.sent.saturating_add(len);
        self.progress()
    }

    pub fn progress(&self) -> f64 {
        send_progress(self.sent, self.meta.size)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    pub fn chunk_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_complete(&self) -> bool {
        self.next >= self.ranges.len()
    }
}

/// How one queued outbound file ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Failed(String),
}

/// A fully received file, ready to hand to whoever materializes downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub data: Vec<u8>,
}

/// What the reassembler tells the host after each frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    FileStarted(FileMeta),
    Progress(f64),
    FileCompleted(ReceivedFile),
    Text(String),
}

/// Receiver-side accumulator for the one in-flight file.
#[derive(Debug)]
struct IncomingTransfer {
    meta: FileMeta,
    chunks: Vec<Vec<u8>>,
    received: u64,
}

impl IncomingTransfer {
    fn progress(&self) -> f64 {
        if self.meta.size == 0 {
            return 100.0;
        }
        self.received as f64 / self.meta.size as f64 * 100.0
    }

    fn is_complete(&self) -> bool {
        self.received >= self.meta.size
    }

    fn into_file(self) -> ReceivedFile {
        ReceivedFile {
            data: self.chunks.concat(),
            meta: self.meta,
        }
    }
}

/// Reassembles inbound frames into files and text. One instance per link.
#[derive(Debug, Default)]
pub struct Reassembler {
    current: Option<IncomingTransfer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_frame(&mut self, frame: Frame) -> Vec<TransferEvent> {
        match frame {
            Frame::Meta(meta) => self.on_meta(meta),
            Frame::Text(content) => vec![TransferEvent::Text(content)],
            Frame::Chunk(bytes) => self.on_chunk(bytes),
        }
    }

    /// Discard any half-built file (link went away). Returns whether one was dropped.
    pub fn reset(&mut self) -> bool {
        match self.current.take() {
            Some(t) => {
                debug!(name = %t.meta.name, received = t.received, "discarding partial file");
                true
            }
            None => false,
        }
    }

    pub fn in_progress(&self) -> Option<&FileMeta> {
        self.current.as_ref().map(|t| &t.meta)
    }

    pub fn received_bytes(&self) -> u64 {
        self.current.as_ref().map(|t| t.received).unwrap_or(0)
    }

    fn on_meta(&mut self, meta: FileMeta) -> Vec<TransferEvent> {
        if let Some(prev) = &self.current {
            warn!(previous = %prev.meta.name, "new file announced before previous completed; restarting");
        }
        debug!(name = %meta.name, size = meta.size, "incoming file");
        self.current = Some(IncomingTransfer {
            meta: meta.clone(),
            chunks: Vec::new(),
            received: 0,
        });
        let mut events = vec![TransferEvent::FileStarted(meta), TransferEvent::Progress(0.0)];
        events.extend(self.finish_if_complete());
        events
    }

    fn on_chunk(&mut self, mut bytes: Vec<u8>) -> Vec<TransferEvent> {
        let Some(current) = self.current.as_mut() else {
            debug!(len = bytes.len(), "chunk without open file ignored");
            return vec![];
        };
        if bytes.is_empty() {
            return vec![];
        }
        let remaining = current.meta.size - current.received;
        if bytes.len() as u64 > remaining {
            warn!(
                name = %current.meta.name,
                extra = bytes.len() as u64 - remaining,
                "chunk runs past announced size; truncating"
            );
            bytes.truncate(remaining as usize);
        }
        current.received += bytes.len() as u64;
        current.chunks.push(bytes);
        let mut events = vec![TransferEvent::Progress(current.progress())];
        events.extend(self.finish_if_complete());
        events
    }

    fn finish_if_complete(&mut self) -> Vec<TransferEvent> {
        match self.current.take() {
            Some(t) if t.is_complete() => {
                debug!(name = %t.meta.name, size = t.meta.size, "file complete");
                vec![
                    TransferEvent::FileCompleted(t.into_file()),
                    TransferEvent::Progress(0.0),
                ]
            }
            other => {
                self.current = other;
                vec![]
            }
        }
    }
}

/// Make a remote-supplied name safe to write under a download directory.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_control() && *c != ':')
        .collect::<String>();
    let trimmed = base.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// MIME type from the file extension.
pub fn mime_type_for(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> FileMeta {
        FileMeta {
            name: "f.bin".into(),
            size,
            mime_type: "application/octet-stream".into(),
        }
    }

    fn completed(events: &[TransferEvent]) -> Option<&ReceivedFile> {
        events.iter().find_map(|e| match e {
            TransferEvent::FileCompleted(f) => Some(f),
            _ => None,
        })
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ChunkRange { start: 0, end: 30 });
        assert_eq!(chunks[3], ChunkRange { start: 90, end: 100 });
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_chunks(0, 30).is_empty());
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        assert_eq!(split_into_chunks(CHUNK_SIZE as u64 * 2, 0).len(), 2);
    }

    #[test]
    fn one_mebibyte_is_64_chunks() {
        let mut out = OutgoingTransfer::new(meta(1024 * 1024));
        assert_eq!(out.chunk_count(), 64);
        let mut hundreds = 0;
        while let Some(r) = out.next_range() {
            assert_eq!(r.len(), CHUNK_SIZE as u64);
            if out.record_sent(r.len()) == 100.0 {
                hundreds += 1;
            }
        }
        assert!(out.is_complete());
        assert_eq!(hundreds, 1);
    }

    #[test]
    fn send_progress_is_clamped() {
        assert_eq!(send_progress(50, 100), 50.0);
        assert_eq!(send_progress(150, 100), 100.0);
        assert_eq!(send_progress(0, 0), 100.0);
    }

    #[test]
    fn reassemble_in_arrival_order() {
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let mut r = Reassembler::new();
        r.on_frame(Frame::Meta(meta(100)));
        let mut last = vec![];
        for c in data.chunks(30) {
            last = r.on_frame(Frame::Chunk(c.to_vec()));
        }
        let file = completed(&last).expect("complete");
        assert_eq!(file.data, data);
        assert_eq!(last.last(), Some(&TransferEvent::Progress(0.0)));
        assert!(r.in_progress().is_none());
    }

    #[test]
    fn received_count_reaches_size_exactly() {
        let mut r = Reassembler::new();
        r.on_frame(Frame::Meta(meta(40)));
        let mut seen = vec![];
        for _ in 0..3 {
            r.on_frame(Frame::Chunk(vec![1; 10]));
            seen.push(r.received_bytes());
        }
        assert_eq!(seen, vec![10, 20, 30]);
        let events = r.on_frame(Frame::Chunk(vec![1; 10]));
        assert_eq!(completed(&events).unwrap().data.len(), 40);
    }

    #[test]
    fn overshoot_is_truncated() {
        let mut r = Reassembler::new();
        r.on_frame(Frame::Meta(meta(5)));
        let events = r.on_frame(Frame::Chunk(vec![9; 8]));
        assert!(events.contains(&TransferEvent::Progress(100.0)));
        assert_eq!(completed(&events).unwrap().data, vec![9; 5]);
    }

    #[test]
    fn zero_byte_file_completes_on_metadata() {
        let mut r = Reassembler::new();
        let events = r.on_frame(Frame::Meta(meta(0)));
        assert_eq!(completed(&events).unwrap().data, Vec::<u8>::new());
        assert!(r.in_progress().is_none());
    }

    #[test]
    fn repeated_metadata_resets_state() {
        let mut r = Reassembler::new();
        r.on_frame(Frame::Meta(meta(20)));
        r.on_frame(Frame::Chunk(vec![1; 10]));
        r.on_frame(Frame::Meta(meta(20)));
        assert_eq!(r.received_bytes(), 0);
        r.on_frame(Frame::Chunk(vec![2; 10]));
        let events = r.on_frame(Frame::Chunk(vec![3; 10]));
        let mut expected = vec![2; 10];
        expected.extend(vec![3; 10]);
        assert_eq!(completed(&events).unwrap().data, expected);
    }

    #[test]
    fn stray_chunk_ignored() {
        let mut r = Reassembler::new();
        assert!(r.on_frame(Frame::Chunk(vec![1, 2, 3])).is_empty());
        assert!(r.in_progress().is_none());
    }

    #[test]
    fn text_passes_through_without_state() {
        let mut r = Reassembler::new();
        r.on_frame(Frame::Meta(meta(10)));
        assert_eq!(
            r.on_frame(Frame::Text("hello".into())),
            vec![TransferEvent::Text("hello".into())]
        );
        assert_eq!(r.in_progress().map(|m| m.size), Some(10));
    }

    #[test]
    fn reset_discards_partial() {
        let mut r = Reassembler::new();
        r.on_frame(Frame::Meta(meta(10)));
        r.on_frame(Frame::Chunk(vec![1; 4]));
        assert!(r.reset());
        assert!(!r.reset());
        assert!(r.on_frame(Frame::Chunk(vec![1; 6])).is_empty());
    }

    #[test]
    fn sanitize_strips_paths() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\x\\report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name(""), "download");
        assert_eq!(sanitize_file_name("photo.png"), "photo.png");
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_type_for("a.PNG"), "image/png");
        assert_eq!(mime_type_for("noext"), "application/octet-stream");
        assert_eq!(FileMeta::for_file("x.txt", 3).mime_type, "text/plain");
    }
}
