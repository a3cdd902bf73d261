//! TCP link: the initiator listens, the responder dials one of the offered addresses.
//!
//! Offer and answer carry each side's ephemeral X25519 key. After connecting, both
//! sides exchange a hello (version + key) and refuse a peer whose key differs from the
//! negotiated one. Frames are then sealed per direction: 4-byte LE length + ciphertext.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use roomdrop_core::identity::{decrypt_wire, derive_session_keys, encrypt_wire};
use roomdrop_core::{
    decode_frame, encode_frame, Blob, Frame, Keypair, LinkId, PublicKey, Role, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    FrameSender, LinkError, LinkEvent, LinkEventSender, LinkFactory, LinkState, Outbound, PeerLink,
    SharedState,
};

const HELLO_SIZE: usize = 1 + 32; // version + public_key
const LEN_SIZE: usize = 4;
const MAX_SEALED_LEN: u32 = 2 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum NegotiationBlob {
    Offer {
        version: u8,
        key: PublicKey,
        candidates: Vec<SocketAddr>,
    },
    Answer {
        version: u8,
        key: PublicKey,
    },
    Candidate {
        addr: SocketAddr,
    },
}

#[derive(Debug, Clone)]
pub struct TcpLinkFactory {
    bind_addr: SocketAddr,
    advertise: Vec<SocketAddr>,
}

impl TcpLinkFactory {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            advertise: Vec::new(),
        }
    }

    /// Addresses to offer instead of the detected ones. Port 0 means "the bound port".
    pub fn with_advertise(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.advertise = addrs;
        self
    }
}

impl LinkFactory for TcpLinkFactory {
    type Link = TcpLink;

    fn create(&mut self, id: LinkId, events: LinkEventSender) -> TcpLink {
        TcpLink::new(id, events, self.bind_addr, self.advertise.clone())
    }
}

pub struct TcpLink {
    id: LinkId,
    keypair: Arc<Keypair>,
    events: LinkEventSender,
    bind_addr: SocketAddr,
    advertise: Vec<SocketAddr>,
    outbound: Outbound,
    answer_tx: Option<oneshot::Sender<PublicKey>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpLink {
    pub fn new(
        id: LinkId,
        events: LinkEventSender,
        bind_addr: SocketAddr,
        advertise: Vec<SocketAddr>,
    ) -> Self {
        Self {
            id,
            keypair: Arc::new(Keypair::generate()),
            events,
            bind_addr,
            advertise,
            outbound: Outbound::new(),
            answer_tx: None,
            tasks: Vec::new(),
        }
    }

    fn connection(&mut self, role: Role, what: &'static str) -> Result<Connection, LinkError> {
        let frames = self.outbound.rx.take().ok_or(LinkError::Unexpected(what))?;
        self.outbound.state.set(LinkState::Negotiating);
        Ok(Connection {
            id: self.id,
            role,
            keypair: self.keypair.clone(),
            events: self.events.clone(),
            state: self.outbound.state.clone(),
            frames,
        })
    }
}

impl PeerLink for TcpLink {
    fn initiate(&mut self) -> Result<Blob, LinkError> {
        let conn = self.connection(Role::Initiator, "offer")?;
        let listener = std::net::TcpListener::bind(self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;
        let candidates = candidate_addrs(local, &self.advertise);
        info!(link = %self.id, %local, ?candidates, "listening for peer");

        let (answer_tx, answer_rx) = oneshot::channel();
        self.answer_tx = Some(answer_tx);
        self.tasks
            .push(tokio::spawn(conn.run_listener(listener, answer_rx)));

        let blob = NegotiationBlob::Offer {
            version: PROTOCOL_VERSION,
            key: self.keypair.public_key().clone(),
            candidates,
        };
        Ok(serde_json::to_value(blob)?)
    }

    fn accept(&mut self, offer: Blob) -> Result<Blob, LinkError> {
        let NegotiationBlob::Offer {
            version,
            key,
            candidates,
        } = serde_json::from_value(offer)?
        else {
            return Err(LinkError::Unexpected("non-offer"));
        };
        if version != PROTOCOL_VERSION {
            return Err(LinkError::Version(version));
        }
        let conn = self.connection(Role::Responder, "second offer")?;
        debug!(link = %self.id, peer = %key.fingerprint(), ?candidates, "dialing offered addresses");
        self.tasks
            .push(tokio::spawn(conn.run_dialer(candidates, key)));

        let blob = NegotiationBlob::Answer {
            version: PROTOCOL_VERSION,
            key: self.keypair.public_key().clone(),
        };
        Ok(serde_json::to_value(blob)?)
    }

    fn apply_remote(&mut self, blob: Blob) -> Result<(), LinkError> {
        match serde_json::from_value(blob)? {
            NegotiationBlob::Answer { version, key } => {
                if version != PROTOCOL_VERSION {
                    return Err(LinkError::Version(version));
                }
                let tx = self.answer_tx.take().ok_or(LinkError::Unexpected("answer"))?;
                debug!(link = %self.id, peer = %key.fingerprint(), "answer applied");
                let _ = tx.send(key);
                Ok(())
            }
            NegotiationBlob::Candidate { addr } => {
                // Offers already list every address; nothing trickles in later.
                debug!(link = %self.id, %addr, "extra candidate ignored");
                Ok(())
            }
            NegotiationBlob::Offer { .. } => Err(LinkError::Unexpected("offer")),
        }
    }

    fn frames(&self) -> FrameSender {
        self.outbound.sender()
    }

    fn state(&self) -> LinkState {
        self.outbound.state.get()
    }

    fn close(&mut self) {
        if self.outbound.state.get() != LinkState::Failed {
            self.outbound.state.set(LinkState::Closed);
        }
        self.answer_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Everything the connection task needs once the link has handed off to it.
struct Connection {
    id: LinkId,
    role: Role,
    keypair: Arc<Keypair>,
    events: LinkEventSender,
    state: SharedState,
    frames: mpsc::Receiver<Frame>,
}

impl Connection {
    async fn run_listener(
        self,
        listener: TcpListener,
        answer_rx: oneshot::Receiver<PublicKey>,
    ) {
        let Ok(expected) = answer_rx.await else {
            return;
        };
        loop {
            let (mut stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.fail(format!("accept: {e}"));
                    return;
                }
            };
            match timeout(
                HANDSHAKE_TIMEOUT,
                hello_accept(&mut stream, &self.keypair, &expected),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!(link = %self.id, %addr, "peer link up");
                    self.run(stream, &expected).await;
                    return;
                }
                Ok(Err(e)) => debug!(link = %self.id, %addr, error = %e, "connection rejected"),
                Err(_) => debug!(link = %self.id, %addr, "handshake timed out"),
            }
        }
    }

    async fn run_dialer(self, candidates: Vec<SocketAddr>, expected: PublicKey) {
        for addr in candidates {
            let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    debug!(link = %self.id, %addr, error = %e, "connect failed");
                    continue;
                }
                Err(_) => {
                    debug!(link = %self.id, %addr, "connect timed out");
                    continue;
                }
            };
            match timeout(
                HANDSHAKE_TIMEOUT,
                hello_connect(&mut stream, &self.keypair, &expected),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!(link = %self.id, %addr, "peer link up");
                    self.run(stream, &expected).await;
                    return;
                }
                Ok(Err(e)) => debug!(link = %self.id, %addr, error = %e, "handshake failed"),
                Err(_) => debug!(link = %self.id, %addr, "handshake timed out"),
            }
        }
        self.fail("no offered address reachable".into());
    }

    async fn run(self, stream: TcpStream, peer: &PublicKey) {
        let Connection {
            id,
            role,
            keypair,
            events,
            state,
            mut frames,
        } = self;
        let keys = derive_session_keys(&keypair.shared_secret(peer), role);
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        state.set(LinkState::Connected);
        let _ = events.send((id, LinkEvent::Connected));

        let write = async {
            let mut nonce: u64 = 0;
            while let Some(frame) = frames.recv().await {
                write_sealed(&mut writer, &keys.send, nonce, &frame).await?;
                nonce = nonce.saturating_add(1);
            }
            Ok::<(), LinkError>(())
        };
        let read = async {
            let mut nonce: u64 = 0;
            while let Some(frame) = read_sealed(&mut reader, &keys.recv, nonce).await? {
                nonce = nonce.saturating_add(1);
                if events.send((id, LinkEvent::Frame(frame))).is_err() {
                    break;
                }
            }
            Ok::<(), LinkError>(())
        };
        let result = tokio::select! {
            r = read => r,
            w = write => w,
        };

        let event = match result {
            Ok(()) => {
                state.set(LinkState::Closed);
                LinkEvent::Closed
            }
            Err(e) => {
                warn!(link = %id, error = %e, "peer link failed");
                state.set(LinkState::Failed);
                LinkEvent::Error(e.to_string())
            }
        };
        let _ = events.send((id, event));
    }

    fn fail(&self, error: String) {
        self.state.set(LinkState::Failed);
        let _ = self.events.send((self.id, LinkEvent::Error(error)));
    }
}

async fn hello_accept(
    stream: &mut TcpStream,
    keypair: &Keypair,
    expected: &PublicKey,
) -> Result<(), LinkError> {
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    check_hello(&buf, expected)?;
    stream.write_all(&hello_bytes(keypair)).await?;
    stream.flush().await?;
    Ok(())
}

async fn hello_connect(
    stream: &mut TcpStream,
    keypair: &Keypair,
    expected: &PublicKey,
) -> Result<(), LinkError> {
    stream.write_all(&hello_bytes(keypair)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    check_hello(&buf, expected)
}

fn hello_bytes(keypair: &Keypair) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..].copy_from_slice(keypair.public_key().as_bytes());
    out
}

fn check_hello(buf: &[u8; HELLO_SIZE], expected: &PublicKey) -> Result<(), LinkError> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(LinkError::Version(buf[0]));
    }
    if &buf[1..] != expected.as_bytes().as_slice() {
        return Err(LinkError::KeyMismatch);
    }
    Ok(())
}

async fn write_sealed(
    writer: &mut OwnedWriteHalf,
    key: &[u8; 32],
    nonce: u64,
    frame: &Frame,
) -> Result<(), LinkError> {
    let plain = encode_frame(frame)?;
    let cipher = encrypt_wire(key, nonce, &plain)?;
    writer.write_all(&(cipher.len() as u32).to_le_bytes()).await?;
    writer.write_all(&cipher).await?;
    writer.flush().await?;
    Ok(())
}

/// `None` on a clean close between frames.
async fn read_sealed(
    reader: &mut OwnedReadHalf,
    key: &[u8; 32],
    nonce: u64,
) -> Result<Option<Frame>, LinkError> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_SEALED_LEN {
        return Err(LinkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("sealed frame of {len} bytes"),
        )));
    }
    let mut cipher = vec![0u8; len as usize];
    reader.read_exact(&mut cipher).await?;
    let plain = decrypt_wire(key, nonce, &cipher)?;
    let (frame, _) = decode_frame(&plain)?;
    Ok(Some(frame))
}

fn candidate_addrs(local: SocketAddr, advertise: &[SocketAddr]) -> Vec<SocketAddr> {
    if !advertise.is_empty() {
        return advertise
            .iter()
            .map(|a| match a.port() {
                0 => SocketAddr::new(a.ip(), local.port()),
                _ => *a,
            })
            .collect();
    }
    if !local.ip().is_unspecified() {
        return vec![local];
    }
    let mut out = Vec::new();
    if let Some(ip) = primary_ip() {
        out.push(SocketAddr::new(ip, local.port()));
    }
    out.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port()));
    out
}

/// Address of the interface the default route goes out of. Connecting a UDP socket
/// sends nothing.
fn primary_ip() -> Option<IpAddr> {
    let sock = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    sock.connect(("192.0.2.1", 9)).ok()?;
    let ip = sock.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}
