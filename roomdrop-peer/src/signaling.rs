//! WebSocket connection to the relay, exposed as a pair of typed channels.
//!
//! The first connect must succeed. After that a dropped socket is retried in the
//! background, and the session learns about it through [`RelayEvent::Down`] and
//! [`RelayEvent::Up`].

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use roomdrop_core::{ClientSignal, RelaySignal};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Waits between reconnect attempts. The last one repeats until the relay is back.
pub const RECONNECT_DELAYS: [Duration; 5] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("connect to relay {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// What the relay connection reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// A socket is open. Sent first on every connection, the initial one included.
    Up,
    Signal(RelaySignal),
    /// The socket dropped and a reconnect is under way.
    Down,
}

/// Live relay connection. Dropping `outgoing` (and every clone of it) closes the socket
/// and stops reconnecting.
pub struct SignalingClient {
    pub outgoing: mpsc::UnboundedSender<ClientSignal>,
    pub incoming: mpsc::UnboundedReceiver<RelayEvent>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        Self::connect_with_delays(url, RECONNECT_DELAYS.to_vec()).await
    }

    /// Like [`SignalingClient::connect`], retrying a dropped socket after `delays`.
    pub async fn connect_with_delays(
        url: &str,
        delays: Vec<Duration>,
    ) -> Result<Self, SignalingError> {
        let ws = open(url).await?;
        info!(%url, "connected to relay");
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(url.to_string(), ws, delays, out_rx, in_tx));
        Ok(Self {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientSignal>,
        mpsc::UnboundedReceiver<RelayEvent>,
    ) {
        (self.outgoing, self.incoming)
    }
}

async fn open(url: &str) -> Result<Ws, SignalingError> {
    connect_async(url)
        .await
        .map(|(ws, _)| ws)
        .map_err(|source| SignalingError::Connect {
            url: url.to_string(),
            source,
        })
}

enum Ended {
    /// Socket dropped; reconnect.
    Lost,
    /// Session went away; stop for good.
    Finished,
}

async fn run(
    url: String,
    mut ws: Ws,
    delays: Vec<Duration>,
    mut outgoing: mpsc::UnboundedReceiver<ClientSignal>,
    incoming: mpsc::UnboundedSender<RelayEvent>,
) {
    loop {
        if incoming.send(RelayEvent::Up).is_err() {
            break;
        }
        if let Ended::Finished = pump(ws, &mut outgoing, &incoming).await {
            break;
        }
        if incoming.send(RelayEvent::Down).is_err() {
            break;
        }
        warn!(%url, "relay connection lost; reconnecting");
        match reconnect(&url, &delays, &mut outgoing).await {
            Some(next) => ws = next,
            None => break,
        }
    }
    info!("relay connection closed");
}

/// Shuttle envelopes over one socket until it drops or the session ends.
async fn pump(
    ws: Ws,
    outgoing: &mut mpsc::UnboundedReceiver<ClientSignal>,
    incoming: &mpsc::UnboundedSender<RelayEvent>,
) -> Ended {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            signal = outgoing.recv() => {
                let Some(signal) = signal else {
                    let _ = sink.close().await;
                    return Ended::Finished;
                };
                let text = match signal.to_text() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "failed to encode envelope");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "relay write failed");
                    return Ended::Lost;
                }
            }
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ended::Lost,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "relay read failed");
                        return Ended::Lost;
                    }
                };
                match RelaySignal::from_text(text.as_str()) {
                    Ok(signal) => {
                        if incoming.send(RelayEvent::Signal(signal)).is_err() {
                            return Ended::Finished;
                        }
                    }
                    Err(e) => debug!(error = %e, "unparseable relay envelope dropped"),
                }
            }
        }
    }
}

/// Retry until a socket opens. Envelopes queued meanwhile name connection ids from
/// the old socket and are dropped. `None` once the session has gone away.
async fn reconnect(
    url: &str,
    delays: &[Duration],
    outgoing: &mut mpsc::UnboundedReceiver<ClientSignal>,
) -> Option<Ws> {
    let mut attempt = 0usize;
    loop {
        let delay = delays
            .get(attempt)
            .or(delays.last())
            .copied()
            .unwrap_or(Duration::from_secs(1));
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                signal = outgoing.recv() => match signal {
                    Some(signal) => debug!(?signal, "relay down; envelope dropped"),
                    None => return None,
                },
            }
        }
        attempt += 1;
        match open(url).await {
            Ok(ws) => {
                while let Ok(signal) = outgoing.try_recv() {
                    debug!(?signal, "stale envelope dropped");
                }
                info!(%url, attempt, "reconnected to relay");
                return Some(ws);
            }
            Err(e) => debug!(attempt, error = %e, "relay reconnect failed"),
        }
    }
}
