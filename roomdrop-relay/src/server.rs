//! WebSocket relay: one task per socket, one hub task owning the router.
//!
//! Socket tasks only parse and forward; every membership change and routing decision
//! happens on the hub, so per-room envelope order is the order the hub sees them.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use roomdrop_core::{ClientSignal, ConnectionId, Delivery, RelayRouter};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::Config;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// One address per private range plus a public one. Connecting a UDP socket towards
/// each reveals which local address the host routes through; nothing is sent.
const ROUTE_TARGETS: [Ipv4Addr; 4] = [
    Ipv4Addr::new(192, 168, 255, 255),
    Ipv4Addr::new(10, 255, 255, 255),
    Ipv4Addr::new(172, 31, 255, 255),
    Ipv4Addr::new(192, 0, 2, 1),
];

enum HubEvent {
    Connect {
        conn: ConnectionId,
        tx: mpsc::UnboundedSender<String>,
    },
    Signal {
        from: ConnectionId,
        signal: ClientSignal,
    },
    Disconnect {
        conn: ConnectionId,
    },
}

#[derive(Clone)]
struct AppState {
    hub: mpsc::UnboundedSender<HubEvent>,
    max_message_bytes: usize,
}

/// Build the relay router and start its hub. Needs a running tokio runtime.
pub fn app(config: &Config) -> Router {
    let (hub_tx, hub_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_hub(hub_rx));
    let state = AppState {
        hub: hub_tx,
        max_message_bytes: config.max_message_bytes,
    };
    let path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };
    Router::new()
        .route(&path, get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: Config, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = app(&config);
    let local = listener.local_addr()?;
    info!(addr = %local, path = %config.path, "relay listening");
    if local.ip().is_unspecified() {
        for url in lan_urls(local.port(), &config.path, &lan_ipv4_addrs()) {
            info!(%url, "reachable on the local network");
        }
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Non-loopback IPv4 addresses this host routes through, in address order.
fn lan_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut found = BTreeSet::new();
    for target in ROUTE_TARGETS {
        let Ok(sock) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
            continue;
        };
        if sock.connect(SocketAddr::from((target, 9))).is_err() {
            continue;
        }
        if let Ok(SocketAddr::V4(local)) = sock.local_addr() {
            let ip = *local.ip();
            if !ip.is_loopback() && !ip.is_unspecified() {
                found.insert(ip);
            }
        }
    }
    found.into_iter().collect()
}

fn lan_urls(port: u16, path: &str, addrs: &[Ipv4Addr]) -> Vec<String> {
    let path = path.trim_start_matches('/');
    addrs
        .iter()
        .map(|ip| format!("ws://{}/{}", SocketAddr::new(IpAddr::V4(*ip), port), path))
        .collect()
}

async fn run_hub(mut rx: mpsc::UnboundedReceiver<HubEvent>) {
    let mut router = RelayRouter::new();
    let mut sockets: HashMap<ConnectionId, mpsc::UnboundedSender<String>> = HashMap::new();
    while let Some(event) = rx.recv().await {
        let deliveries = match event {
            HubEvent::Connect { conn, tx } => {
                sockets.insert(conn.clone(), tx);
                router.on_connect(conn)
            }
            HubEvent::Signal { from, signal } => router.on_signal(&from, signal),
            HubEvent::Disconnect { conn } => {
                sockets.remove(&conn);
                router.on_disconnect(&conn);
                vec![]
            }
        };
        for delivery in deliveries {
            deliver(&sockets, delivery);
        }
    }
    debug!("relay hub stopped");
}

/// Fire-and-forget write to the target's socket task.
fn deliver(sockets: &HashMap<ConnectionId, mpsc::UnboundedSender<String>>, delivery: Delivery) {
    let Some(tx) = sockets.get(&delivery.to) else {
        return;
    };
    match delivery.signal.to_text() {
        Ok(text) => {
            trace!(to = %delivery.to, %text, "deliver");
            let _ = tx.send(text);
        }
        Err(e) => warn!(to = %delivery.to, error = %e, "failed to encode envelope"),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn = ConnectionId::new(Uuid::new_v4().simple().to_string());
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    if state
        .hub
        .send(HubEvent::Connect {
            conn: conn.clone(),
            tx,
        })
        .is_err()
    {
        return;
    }
    info!(%conn, "client connected");

    let send_task = tokio::spawn(async move {
        let mut ping_interval = time::interval(PING_INTERVAL);
        ping_interval.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(result) = receiver.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%conn, error = %e, "websocket error");
                break;
            }
        };
        match ClientSignal::from_text(text.as_str()) {
            Ok(signal) => {
                let event = HubEvent::Signal {
                    from: conn.clone(),
                    signal,
                };
                if state.hub.send(event).is_err() {
                    break;
                }
            }
            Err(e) => debug!(%conn, error = %e, "malformed envelope dropped"),
        }
    }

    let _ = state.hub.send(HubEvent::Disconnect { conn: conn.clone() });
    send_task.abort();
    info!(%conn, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lan_urls_use_listen_port_and_path() {
        let addrs = [Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(10, 0, 0, 5)];
        assert_eq!(
            lan_urls(3001, "/ws", &addrs),
            vec!["ws://192.168.1.20:3001/ws", "ws://10.0.0.5:3001/ws"]
        );
        assert_eq!(lan_urls(80, "ws", &addrs[..1]), vec!["ws://192.168.1.20:80/ws"]);
    }

    #[test]
    fn lan_addrs_skip_internal() {
        for ip in lan_ipv4_addrs() {
            assert!(!ip.is_loopback() && !ip.is_unspecified(), "{ip}");
        }
    }
}
