//! Client session: one event loop tying relay signaling, the coordinator, the current
//! Peer Link and the transfer engine together.
//!
//! The loop owns all mutable state. Outbound files and texts go through a separate
//! sender task so a large file never stalls signaling or inbound frames.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use roomdrop_core::{
    Action, ClientSignal, CoordinatorState, FileMeta, Frame, LinkId, OutgoingTransfer,
    Reassembler, ReceivedFile, RoomId, SendOutcome, SignalingCoordinator,
    TransferEvent,
};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::link::{FrameSender, LinkError, LinkEvent, LinkEventSender, LinkFactory, PeerLink};
use crate::signaling::RelayEvent;

/// Coordinator tick period; negotiation timeouts are counted in these.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// What the session reports to its UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Whether the relay socket is up. An established link does not depend on it.
    RelayConnected(bool),
    ConnectionState(CoordinatorState),
    Progress { direction: Direction, percent: f64 },
    /// A file started arriving (`Some`) or the in-flight one finished or was dropped (`None`).
    IncomingFile(Option<FileMeta>),
    IncomingText(String),
    FileReceived(ReceivedFile),
    FileSent { name: String, outcome: SendOutcome },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session stopped")]
    Stopped,
    #[error(transparent)]
    Link(#[from] LinkError),
}

enum Command {
    JoinRoom(RoomId),
    SendFile {
        path: PathBuf,
        done: oneshot::Sender<SendOutcome>,
    },
    SendText {
        text: String,
        done: oneshot::Sender<Result<(), LinkError>>,
    },
    Leave,
}

/// Cloneable control handle for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn join_room(&self, room: RoomId) -> Result<(), SessionError> {
        self.commands
            .send(Command::JoinRoom(room))
            .map_err(|_| SessionError::Stopped)
    }

    /// Queue a file and wait until it has been fully handed to the link, or failed.
    /// Files go out one at a time in the order they were queued.
    pub async fn send_file(&self, path: impl Into<PathBuf>) -> SendOutcome {
        let (done, rx) = oneshot::channel();
        let command = Command::SendFile {
            path: path.into(),
            done,
        };
        if self.commands.send(command).is_err() {
            return SendOutcome::Failed(SessionError::Stopped.to_string());
        }
        rx.await
            .unwrap_or_else(|_| SendOutcome::Failed(SessionError::Stopped.to_string()))
    }

    /// Send a chat message. Fails right away when no link is connected.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::SendText {
                text: text.into(),
                done,
            })
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)??;
        Ok(())
    }

    /// Close the link and stop the session.
    pub fn leave(&self) {
        let _ = self.commands.send(Command::Leave);
    }
}

/// Start a session on the current runtime. `signals`/`relay` are the two ends of the
/// relay connection; `negotiation_timeout_ticks` of zero disables the timeout.
pub fn start<F>(
    factory: F,
    signals: mpsc::UnboundedSender<ClientSignal>,
    relay: mpsc::UnboundedReceiver<RelayEvent>,
    negotiation_timeout_ticks: u64,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<()>,
)
where
    F: LinkFactory + 'static,
    F::Link: 'static,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (file_tx, file_rx) = mpsc::unbounded_channel();
    let (text_tx, text_rx) = mpsc::unbounded_channel();
    let (current_tx, current_rx) = watch::channel(None);

    tokio::spawn(run_sender(file_rx, text_rx, current_rx, event_tx.clone()));

    let mut coordinator = SignalingCoordinator::new();
    coordinator.set_negotiation_timeout(negotiation_timeout_ticks);
    let session = Session {
        coordinator,
        factory,
        link: None,
        link_tx,
        reassembler: Reassembler::new(),
        signals,
        events: event_tx,
        outbound: Outbound {
            files: file_tx,
            texts: text_tx,
            current: current_tx,
        },
    };
    let task = tokio::spawn(session.run(relay, command_rx, link_rx));
    (
        SessionHandle {
            commands: command_tx,
        },
        event_rx,
        task,
    )
}

struct Outbound {
    files: mpsc::UnboundedSender<FileJob>,
    texts: mpsc::UnboundedSender<TextJob>,
    /// Frame sender of the established link, if any.
    current: watch::Sender<Option<FrameSender>>,
}

struct FileJob {
    path: PathBuf,
    done: oneshot::Sender<SendOutcome>,
}

struct TextJob {
    text: String,
    done: oneshot::Sender<Result<(), LinkError>>,
}

struct Session<F: LinkFactory> {
    coordinator: SignalingCoordinator,
    factory: F,
    link: Option<(LinkId, F::Link)>,
    link_tx: LinkEventSender,
    reassembler: Reassembler,
    signals: mpsc::UnboundedSender<ClientSignal>,
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: Outbound,
}

impl<F: LinkFactory> Session<F> {
    async fn run(
        mut self,
        mut relay: mpsc::UnboundedReceiver<RelayEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_events: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
    ) {
        let mut tick = time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        let mut relay_open = true;

        loop {
            tokio::select! {
                event = relay.recv(), if relay_open => match event {
                    Some(event) => self.on_relay_event(event),
                    None => {
                        warn!("relay connection closed for good");
                        relay_open = false;
                        self.on_relay_event(RelayEvent::Down);
                    }
                },
                Some((link, event)) = link_events.recv() => self.on_link_event(link, event),
                command = commands.recv() => match command {
                    Some(Command::Leave) | None => break,
                    Some(command) => self.on_command(command),
                },
                _ = tick.tick() => {
                    let actions = self.coordinator.tick();
                    self.perform(actions);
                }
            }
        }

        let actions = self.coordinator.close();
        self.perform(actions);
        info!("session stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::JoinRoom(room) => {
                let actions = self.coordinator.join_room(room);
                self.perform(actions);
            }
            Command::SendFile { path, done } => {
                let _ = self.outbound.files.send(FileJob { path, done });
            }
            Command::SendText { text, done } => {
                let _ = self.outbound.texts.send(TextJob { text, done });
            }
            // Stops the loop in `run`.
            Command::Leave => {}
        }
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Signal(signal) => {
                trace!(?signal, "relay signal");
                let actions = self.coordinator.on_relay_signal(signal);
                self.perform(actions);
            }
            RelayEvent::Up => {
                let actions = self.coordinator.on_relay_up();
                self.perform(actions);
                self.emit(SessionEvent::RelayConnected(true));
            }
            RelayEvent::Down => {
                // An established link keeps working without the relay.
                warn!("relay connection lost");
                let actions = self.coordinator.on_relay_down();
                self.perform(actions);
                self.emit(SessionEvent::RelayConnected(false));
            }
        }
    }

    fn on_link_event(&mut self, link: LinkId, event: LinkEvent) {
        if self.current_link() != Some(link) {
            trace!(%link, "event from released link ignored");
            return;
        }
        let actions = match event {
            LinkEvent::Connected => self.coordinator.on_link_connected(link),
            LinkEvent::Frame(frame) => {
                self.on_frame(frame);
                vec![]
            }
            LinkEvent::Error(error) => self.coordinator.on_link_error(link, &error),
            LinkEvent::Closed => self.coordinator.on_link_closed(link),
        };
        self.perform(actions);
    }

    fn on_frame(&mut self, frame: Frame) {
        trace!(kind = frame.kind_name(), "frame in");
        for event in self.reassembler.on_frame(frame) {
            match event {
                TransferEvent::FileStarted(meta) => {
                    info!(name = %meta.name, size = meta.size, "receiving file");
                    self.emit(SessionEvent::IncomingFile(Some(meta)));
                }
                TransferEvent::Progress(percent) => self.emit(SessionEvent::Progress {
                    direction: Direction::Incoming,
                    percent,
                }),
                TransferEvent::FileCompleted(file) => {
                    info!(name = %file.meta.name, bytes = file.data.len(), "file received");
                    self.emit(SessionEvent::IncomingFile(None));
                    self.emit(SessionEvent::FileReceived(file));
                }
                TransferEvent::Text(text) => self.emit(SessionEvent::IncomingText(text)),
            }
        }
    }

    /// Run coordinator actions, including any follow-ups they produce, in order.
    fn perform(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            queue.extend(self.perform_one(action));
        }
    }

    fn perform_one(&mut self, action: Action) -> Vec<Action> {
        match action {
            Action::Signal(signal) => {
                if self.signals.send(signal).is_err() {
                    warn!("relay connection gone; envelope dropped");
                }
                vec![]
            }
            Action::Initiate { link, remote } => {
                debug!(%link, %remote, "creating initiator link");
                let mut new_link = self.factory.create(link, self.link_tx.clone());
                let offer = new_link.initiate();
                self.link = Some((link, new_link));
                match offer {
                    Ok(blob) => self.coordinator.on_local_signal(link, blob),
                    Err(e) => self.coordinator.on_link_error(link, &e.to_string()),
                }
            }
            Action::Accept {
                link,
                remote,
                offer,
            } => {
                debug!(%link, %remote, "creating responder link");
                let mut new_link = self.factory.create(link, self.link_tx.clone());
                let answer = new_link.accept(offer);
                self.link = Some((link, new_link));
                match answer {
                    Ok(blob) => self.coordinator.on_local_signal(link, blob),
                    Err(e) => self.coordinator.on_link_error(link, &e.to_string()),
                }
            }
            Action::ApplyRemote { link, blob } => match &mut self.link {
                Some((id, current)) if *id == link => match current.apply_remote(blob) {
                    Ok(()) => vec![],
                    Err(e) => self.coordinator.on_link_error(link, &e.to_string()),
                },
                _ => vec![],
            },
            Action::CloseLink(link) => {
                self.release_link(link);
                vec![]
            }
            Action::StateChanged(state) => {
                let frames = match (state, &self.link) {
                    (CoordinatorState::Established, Some((_, link))) => Some(link.frames()),
                    _ => None,
                };
                self.outbound.current.send_replace(frames);
                info!(%state, "connection state");
                self.emit(SessionEvent::ConnectionState(state));
                vec![]
            }
        }
    }

    fn release_link(&mut self, link: LinkId) {
        if self.current_link() != Some(link) {
            return;
        }
        if let Some((_, mut current)) = self.link.take() {
            current.close();
        }
        self.outbound.current.send_replace(None);
        if self.reassembler.reset() {
            self.emit(SessionEvent::IncomingFile(None));
            self.emit(SessionEvent::Progress {
                direction: Direction::Incoming,
                percent: 0.0,
            });
        }
    }

    fn current_link(&self) -> Option<LinkId> {
        self.link.as_ref().map(|(id, _)| *id)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Works through queued files strictly one after another. Texts queued meanwhile are
/// slipped in between chunks.
async fn run_sender(
    mut files: mpsc::UnboundedReceiver<FileJob>,
    mut texts: mpsc::UnboundedReceiver<TextJob>,
    current: watch::Receiver<Option<FrameSender>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        tokio::select! {
            biased;
            Some(job) = texts.recv() => send_text(&current, job).await,
            Some(job) = files.recv() => {
                let name = display_name(&job.path);
                let outcome = match send_file(&job.path, &current, &mut texts, &events).await {
                    Ok(()) => {
                        info!(%name, "file sent");
                        SendOutcome::Sent
                    }
                    Err(e) => {
                        warn!(%name, error = %e, "file send failed");
                        SendOutcome::Failed(e.to_string())
                    }
                };
                let _ = events.send(SessionEvent::Progress {
                    direction: Direction::Outgoing,
                    percent: 0.0,
                });
                let _ = events.send(SessionEvent::FileSent {
                    name,
                    outcome: outcome.clone(),
                });
                let _ = job.done.send(outcome);
            }
            else => break,
        }
    }
}

fn connected_sender(current: &watch::Receiver<Option<FrameSender>>) -> Result<FrameSender, LinkError> {
    match current.borrow().as_ref() {
        Some(frames) if frames.is_connected() => Ok(frames.clone()),
        _ => Err(LinkError::NotConnected),
    }
}

async fn send_text(current: &watch::Receiver<Option<FrameSender>>, job: TextJob) {
    let result = match connected_sender(current) {
        Ok(frames) => frames.send(Frame::Text(job.text)).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        debug!(error = %e, "text not sent");
    }
    let _ = job.done.send(result);
}

async fn send_file(
    path: &Path,
    current: &watch::Receiver<Option<FrameSender>>,
    texts: &mut mpsc::UnboundedReceiver<TextJob>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), SendError> {
    let frames = connected_sender(current)?;
    let read_err = |source| SendError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).await.map_err(read_err)?;
    let size = file.metadata().await.map_err(read_err)?.len();
    let mut transfer = OutgoingTransfer::new(FileMeta::for_file(display_name(path), size));
    debug!(name = %transfer.meta().name, size, chunks = transfer.chunk_count(), "sending file");

    frames.send(transfer.metadata_frame()).await?;
    if transfer.is_complete() {
        let _ = events.send(SessionEvent::Progress {
            direction: Direction::Outgoing,
            percent: transfer.progress(),
        });
    }
    while let Some(range) = transfer.next_range() {
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf).await.map_err(read_err)?;
        frames.send(Frame::Chunk(buf)).await?;
        let percent = transfer.record_sent(range.len());
        let _ = events.send(SessionEvent::Progress {
            direction: Direction::Outgoing,
            percent,
        });
        while let Ok(job) = texts.try_recv() {
            send_text(current, job).await;
        }
        tokio::task::yield_now().await;
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}
