//! Relay, signaling client and TCP links on loopback.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roomdrop_core::{CoordinatorState, RoomId, SendOutcome};
use roomdrop_peer::{
    LinkError, SessionError, SessionEvent, SessionHandle, SignalingClient, TcpLinkFactory,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

async fn start_relay_at() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(roomdrop_relay::serve(
        listener,
        roomdrop_relay::Config::default(),
        std::future::pending(),
    ));
    addr
}

async fn start_relay() -> String {
    ws_url(start_relay_at().await)
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}/ws", addr)
}

/// Plain TCP forwarder in front of the relay. `cut` drops every connection through it
/// while new ones are still accepted.
struct Forwarder {
    url: String,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Forwarder {
    async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = ws_url(listener.local_addr().unwrap());
        let conns = Arc::new(Mutex::new(Vec::new()));
        let list = conns.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let task = tokio::spawn(async move {
                    let Ok(upstream) = TcpStream::connect(target).await else {
                        return;
                    };
                    let (mut cr, mut cw) = inbound.split();
                    let (mut ur, mut uw) = upstream.into_split();
                    let _ = tokio::join!(
                        tokio::io::copy(&mut ur, &mut cw),
                        tokio::io::copy(&mut cr, &mut uw)
                    );
                });
                list.lock().unwrap().push(task);
            }
        });
        Self { url, conns }
    }

    fn cut(&self) {
        for task in self.conns.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn peer(url: &str) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (signals, incoming) = SignalingClient::connect(url).await.unwrap().into_parts();
    let factory = TcpLinkFactory::new("127.0.0.1:0".parse().unwrap());
    let (handle, events, _task) = roomdrop_peer::start(factory, signals, incoming, 30);
    (handle, events)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session ended")
}

async fn wait_relay(events: &mut mpsc::UnboundedReceiver<SessionEvent>, up: bool) {
    loop {
        if next_event(events).await == SessionEvent::RelayConnected(up) {
            return;
        }
    }
}

async fn wait_established(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    loop {
        match next_event(events).await {
            SessionEvent::ConnectionState(CoordinatorState::Established) => return,
            SessionEvent::ConnectionState(CoordinatorState::Failed) => panic!("link failed"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn file_and_text_over_tcp_link() {
    let url = start_relay().await;
    let room = RoomId::generate();
    let (a, mut a_events) = peer(&url).await;
    let (b, mut b_events) = peer(&url).await;
    a.join_room(room.clone()).unwrap();
    b.join_room(room).unwrap();
    wait_established(&mut a_events).await;
    wait_established(&mut b_events).await;

    b.send_text("hello").await.unwrap();
    loop {
        if let SessionEvent::IncomingText(t) = next_event(&mut a_events).await {
            assert_eq!(t, "hello");
            break;
        }
    }

    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let dir = std::env::temp_dir().join(format!("roomdrop-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("photo.png");
    std::fs::write(&path, &data).unwrap();

    assert_eq!(a.send_file(&path).await, SendOutcome::Sent);
    let file = loop {
        if let SessionEvent::FileReceived(file) = next_event(&mut b_events).await {
            break file;
        }
    };
    assert_eq!(file.meta.name, "photo.png");
    assert_eq!(file.meta.mime_type, "image/png");
    assert_eq!(file.data, data);

    a.leave();
    loop {
        if next_event(&mut b_events).await
            == SessionEvent::ConnectionState(CoordinatorState::Failed)
        {
            break;
        }
    }
}

#[tokio::test]
async fn oversized_text_is_refused_and_link_survives() {
    let url = start_relay().await;
    let room = RoomId::generate();
    let (a, mut a_events) = peer(&url).await;
    let (b, mut b_events) = peer(&url).await;
    a.join_room(room.clone()).unwrap();
    b.join_room(room).unwrap();
    wait_established(&mut a_events).await;
    wait_established(&mut b_events).await;

    let pasted = "x".repeat(2 * 1024 * 1024);
    assert!(matches!(
        a.send_text(pasted).await,
        Err(SessionError::Link(LinkError::Frame(_)))
    ));

    a.send_text("after the big one").await.unwrap();
    loop {
        match next_event(&mut b_events).await {
            SessionEvent::IncomingText(t) => {
                assert_eq!(t, "after the big one");
                break;
            }
            SessionEvent::ConnectionState(state) => panic!("unexpected state {state}"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn signaling_reconnects_and_rejoins() {
    let relay = start_relay_at().await;
    let forwarder = Forwarder::start(relay).await;
    let room = RoomId::generate();

    let client =
        SignalingClient::connect_with_delays(&forwarder.url, vec![Duration::from_millis(50)])
            .await
            .unwrap();
    let (signals, incoming) = client.into_parts();
    let factory = TcpLinkFactory::new("127.0.0.1:0".parse().unwrap());
    let (a, mut a_events, _task) = roomdrop_peer::start(factory, signals, incoming, 30);
    a.join_room(room.clone()).unwrap();
    assert!(a.send_text("anyone?").await.is_err());

    forwarder.cut();
    wait_relay(&mut a_events, false).await;
    wait_relay(&mut a_events, true).await;

    let (b, mut b_events) = peer(&ws_url(relay)).await;
    b.join_room(room).unwrap();
    wait_established(&mut a_events).await;
    wait_established(&mut b_events).await;
}
