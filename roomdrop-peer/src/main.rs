// Roomdrop peer CLI: create or join a room, then trade files and chat with whoever
// else is in it.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use roomdrop_core::{CoordinatorState, RoomId, SendOutcome};
use roomdrop_peer::{config, downloads, SessionEvent, SessionHandle, SignalingClient, TcpLinkFactory};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Roomdrop: share files and text with one other person through a room.
#[derive(Parser, Debug)]
#[command(name = "roomdrop", author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file to use instead of the default locations.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Relay WebSocket URL, overriding the config.
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Verbosity level (-v, -vv).
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new room and wait for someone to join it.
    New(RoomArgs),
    /// Join an existing room by id.
    Join {
        room: String,
        #[command(flatten)]
        args: RoomArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct RoomArgs {
    /// File to send once connected. Repeat for several; they go out in order.
    #[arg(long = "send", value_name = "FILE")]
    send: Vec<PathBuf>,

    /// Message to send once connected. Repeatable.
    #[arg(long = "text", value_name = "MESSAGE")]
    text: Vec<String>,

    /// Directory for received files.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Leave the room after everything queued on the command line has been sent.
    #[arg(long)]
    once: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut cfg = match &cli.config {
        Some(p) => config::load_from(p)?,
        None => config::load(),
    };
    if let Some(url) = cli.relay {
        cfg.relay_url = url;
    }
    let (room, args) = match cli.command {
        Command::New(args) => (RoomId::generate(), args),
        Command::Join { room, args } => {
            let room = RoomId::parse(&room).with_context(|| format!("invalid room id {room:?}"))?;
            (room, args)
        }
    };
    if let Some(out) = &args.out {
        cfg.download_dir = out.clone();
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, room, args))
}

async fn run(cfg: config::Config, room: RoomId, args: RoomArgs) -> anyhow::Result<()> {
    let relay = SignalingClient::connect(&cfg.relay_url).await?;
    let (signals, incoming) = relay.into_parts();
    let factory =
        TcpLinkFactory::new(cfg.link_bind_addr).with_advertise(cfg.advertise_addrs.clone());
    let (handle, mut events, session) =
        roomdrop_peer::start(factory, signals, incoming, cfg.negotiation_timeout_secs);

    handle.join_room(room.clone())?;
    println!("room {room}  (share this id; type a message, /file <path>, or /quit)");

    let mut queued = Some(args);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                on_event(event, &handle, &cfg.download_dir, &mut queued).await;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !on_line(line.trim(), &handle) {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    debug!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "signal handler failed");
                }
                break;
            }
        }
    }

    handle.leave();
    let _ = session.await;
    Ok(())
}

async fn on_event(
    event: SessionEvent,
    handle: &SessionHandle,
    download_dir: &std::path::Path,
    queued: &mut Option<RoomArgs>,
) {
    match event {
        SessionEvent::RelayConnected(true) => println!("* relay connected"),
        SessionEvent::RelayConnected(false) => println!("* relay lost, reconnecting..."),
        SessionEvent::ConnectionState(state) => {
            println!("* {state}");
            if state == CoordinatorState::Established {
                if let Some(args) = queued.take() {
                    tokio::spawn(send_queued(handle.clone(), args));
                }
            }
        }
        SessionEvent::Progress { direction, percent } => {
            debug!(?direction, percent = format_args!("{percent:.1}"), "progress");
        }
        SessionEvent::IncomingFile(Some(meta)) => {
            println!("* receiving {} ({} bytes, {})", meta.name, meta.size, meta.mime_type);
        }
        SessionEvent::IncomingFile(None) => {}
        SessionEvent::IncomingText(text) => println!("peer: {text}"),
        SessionEvent::FileReceived(file) => match downloads::save(download_dir, &file).await {
            Ok(path) => println!("* saved {}", path.display()),
            Err(e) => println!("! could not save {}: {e}", file.meta.name),
        },
        SessionEvent::FileSent { name, outcome } => match outcome {
            SendOutcome::Sent => println!("* sent {name}"),
            SendOutcome::Failed(reason) => println!("! {name} not sent: {reason}"),
        },
    }
}

/// Handle one line typed by the user. Returns false to quit.
fn on_line(line: &str, handle: &SessionHandle) -> bool {
    if line.is_empty() {
        return true;
    }
    if line == "/quit" {
        return false;
    }
    if let Some(path) = line.strip_prefix("/file ") {
        let handle = handle.clone();
        let path = PathBuf::from(path.trim());
        tokio::spawn(async move {
            handle.send_file(path).await;
        });
        return true;
    }
    let handle = handle.clone();
    let text = line.to_string();
    tokio::spawn(async move {
        match handle.send_text(text.clone()).await {
            Ok(()) => println!("You: {text}"),
            Err(e) => println!("! message not sent: {e}"),
        }
    });
    true
}

async fn send_queued(handle: SessionHandle, args: RoomArgs) {
    for text in args.text {
        match handle.send_text(text.clone()).await {
            Ok(()) => println!("You: {text}"),
            Err(e) => println!("! message not sent: {e}"),
        }
    }
    for path in args.send {
        handle.send_file(path).await;
    }
    if args.once {
        handle.leave();
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "roomdrop_peer=warn,roomdrop_core=warn",
        1 => "roomdrop_peer=info,roomdrop_core=info",
        _ => "roomdrop_peer=debug,roomdrop_core=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
