#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use heychat::config::{self, ConfigStore, Profile};
use heychat::models::{normalize_phone, CallType, ContactStatus, MessageKind};
use heychat::p2p::relay_transport::RelayTransport;
use heychat::p2p::{CallEvent, SessionConfig, SessionManager, TypingStatus};
use heychat::relay::{RelayServer, DEFAULT_BACKLOG};

const HELP: &str = "\
Commands:
  /peers                  list people on the relay and discovered peers
  /connect <address>      open a connection to a relay address
  /add <phone>            send a contact request
  /accept <phone>         accept a contact request
  /decline <phone>        decline a contact request
  /msg <phone> <text>     send a message to a mutual contact
  /typing <phone>         tell a contact you are typing
  /read <phone>           mark a conversation as read
  /history <phone>        show a conversation
  /call <phone> [video]   start a call
  /answer | /reject       respond to an incoming call
  /hangup                 end the current call
  /quit                   save and exit";

/// Command line arguments for heychat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "heychat: peer-to-peer chat between phone-number identities.",
    long_about = "heychat connects peers through a small WebSocket relay. Chat is only possible \
    between mutual contacts; calls are signaled over the same session.\n\n\
    Environment: HEYCHAT_PHONE, HEYCHAT_NAME and HEYCHAT_RELAY override the stored profile."
)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Relay {
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:9000")]
        listen: String,
        /// Broadcast frames kept for late joiners
        #[arg(long, default_value_t = DEFAULT_BACKLOG)]
        backlog: usize,
    },
    /// Join a relay and chat
    Chat {
        /// Relay URL, e.g. ws://127.0.0.1:9000
        #[arg(long)]
        relay: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Directory for the profile, snapshots and log file
        #[arg(long, value_name = "PATH")]
        config_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Relay { listen, backlog } => run_relay(&listen, backlog, args.log_level).await,
        Command::Chat {
            relay,
            phone,
            name,
            config_dir,
        } => run_chat(relay, phone, name, config_dir, args.log_level).await,
    }
}

async fn run_relay(listen: &str, backlog: usize, level: LevelFilter) -> Result<()> {
    env_logger::Builder::new().filter_level(level).init();

    let server = RelayServer::bind(listen, backlog).await?;
    println!("Relay listening on ws://{}", server.local_addr()?);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Relay shutting down"),
    }
    Ok(())
}

fn default_display_name() -> String {
    hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "heychat user".to_string())
}

/// Accept a phone number in any common form, or a raw id.
fn contact_id(input: &str) -> String {
    normalize_phone(input).unwrap_or_else(|| input.to_string())
}

async fn run_chat(
    relay: Option<String>,
    phone: Option<String>,
    name: Option<String>,
    config_dir: Option<PathBuf>,
    level: LevelFilter,
) -> Result<()> {
    if let Some(dir) = config_dir {
        config::set_config_dir_override(dir);
    }
    let store = ConfigStore::open_default()?;
    let log_path = store.log_path();
    utils::setup_logging(log_path.to_str(), level)?;
    info!("heychat starting; logging to {}", log_path.display());

    let mut profile = store
        .load_profile()?
        .unwrap_or_else(|| Profile::new("", &default_display_name()))
        .apply_env();
    if let Some(phone) = phone {
        profile.phone = phone;
    }
    if let Some(name) = name {
        profile.display_name = name;
    }
    if let Some(relay) = relay {
        profile.relay_url = Some(relay);
    }
    if profile.phone.is_empty() {
        println!("Enter your phone number:");
        profile.phone = utils::read_line()?;
    }

    let address = RelayTransport::random_address();
    let identity = profile.identity(&address)?;
    store.save_profile(&profile)?;

    println!("Connecting to relay at {}...", profile.relay_url());
    let (transport, incoming) = RelayTransport::connect(profile.relay_url(), &address, &profile.display_name)
        .await
        .with_context(|| format!("joining relay {}", profile.relay_url()))?;
    let transport = Arc::new(transport);
    let session = SessionManager::spawn(identity.clone(), transport.clone(), incoming, SessionConfig::default());

    if let Some(snapshot) = store.load_snapshot(&identity.id)? {
        if let Err(e) = session.import_state(snapshot).await {
            warn!("Could not restore saved state: {}", e);
        }
    }
    install_printers(&session).await?;
    transport.announce(session.user_info_frame().await?)?;

    println!(
        "You are {} ({}) at {}. Type /help for commands.",
        identity.display_name, identity.id, address
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_command(&session, &transport, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {}", e),
        }
    }

    store.save_snapshot(&session.export_state().await?)?;
    session.shutdown().await;
    transport.leave();
    info!("heychat exiting");
    Ok(())
}

/// Print session events as they happen.
async fn install_printers(session: &SessionManager) -> Result<()> {
    session
        .on_message(Some(MessageKind::Chat), |message| {
            println!(
                "[{}] {}: {}",
                message.timestamp.with_timezone(&Local).format("%H:%M"),
                message.sender_display_name,
                message.text().unwrap_or_default()
            );
        })
        .await?;

    session
        .on_message(Some(MessageKind::Typing), |message| {
            if let heychat::models::Payload::Typing(notice) = &message.payload {
                if notice.state == TypingStatus::Composing {
                    println!("{} is typing...", message.sender_display_name);
                }
            }
        })
        .await?;

    session
        .on_contact_change(|edge| {
            let name = edge.display_name.as_deref().unwrap_or(&edge.remote_id);
            match edge.status {
                ContactStatus::RequestedByThem => {
                    println!("{} ({}) wants to chat: /accept {}", name, edge.remote_id, edge.remote_id)
                }
                ContactStatus::RequestedByMe => println!("Contact request sent to {}", name),
                ContactStatus::Mutual => println!("{} is now a contact", name),
            }
        })
        .await?;

    session
        .on_peer_discovered(|peer| {
            if peer.online {
                println!(
                    "{} ({}) is online at {}",
                    peer.identity.display_name, peer.identity.id, peer.identity.address
                );
            } else {
                println!("{} went offline", peer.identity.display_name);
            }
        })
        .await?;

    session
        .on_call_event(|event| match event {
            CallEvent::Incoming(call) => println!(
                "Incoming {:?} call from {} (/answer or /reject)",
                call.call_type, call.contact_id
            ),
            CallEvent::StateChanged(call) => println!("Call with {}: {}", call.contact_id, call.state),
            CallEvent::Ended { session, reason } => {
                println!("Call with {} ended ({:?})", session.contact_id, reason)
            }
            CallEvent::BusyRejected { caller, .. } => println!("Missed call from {} (busy)", caller),
        })
        .await?;

    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_command(session: &SessionManager, transport: &RelayTransport, line: &str) -> Result<bool> {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim);
    let rest = parts.next().map(str::trim);

    match (command, arg) {
        ("/quit", _) => return Ok(false),
        ("/help", _) => println!("{}", HELP),
        ("/peers", _) => {
            for peer in transport.peers().await {
                println!("  relay  {} ({})", peer.address, peer.display_name);
            }
            for peer in session.discovered_peers().await {
                let status = session.contact_status(&peer.identity.id).await;
                println!(
                    "  {:7} {} ({}) at {} {}",
                    if peer.online { "online" } else { "offline" },
                    peer.identity.display_name,
                    peer.identity.id,
                    peer.identity.address,
                    status.map(|s| s.to_string()).unwrap_or_default()
                );
            }
        }
        ("/connect", Some(address)) => {
            let connection = session.connect(address).await?;
            println!(
                "Connected to {} at {}",
                connection.remote_identity.unwrap_or_default(),
                connection.peer_address
            );
        }
        ("/add", Some(id)) => {
            session.request_contact(&contact_id(id)).await?;
        }
        ("/accept", Some(id)) => {
            session.accept_contact(&contact_id(id)).await?;
        }
        ("/decline", Some(id)) => {
            session.decline_contact(&contact_id(id)).await?;
            println!("Declined");
        }
        ("/msg", Some(id)) => {
            let text = rest.unwrap_or_default();
            if text.is_empty() {
                println!("Usage: /msg <phone> <text>");
            } else {
                session.send_chat(&contact_id(id), text).await?;
            }
        }
        ("/typing", Some(id)) => {
            session.send_typing(&contact_id(id), TypingStatus::Composing).await?;
        }
        ("/read", Some(id)) => {
            let count = session.mark_read(&contact_id(id)).await?;
            println!("Marked {} message(s) as read", count);
        }
        ("/history", Some(id)) => {
            for stored in session.conversation(&contact_id(id)).await {
                println!(
                    "  [{}] {}: {} ({:?})",
                    stored.message.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    stored.message.sender_display_name,
                    stored.message.text().unwrap_or_default(),
                    stored.status
                );
            }
        }
        ("/call", Some(id)) => {
            let call_type = match rest {
                Some("video") => CallType::Video,
                _ => CallType::Audio,
            };
            session.start_call(&contact_id(id), call_type).await?;
        }
        ("/answer", _) => {
            session.accept_call().await?;
        }
        ("/reject", _) => session.reject_call().await?,
        ("/hangup", _) => session.end_call().await?,
        _ => println!("Unknown command. Type /help for the list."),
    }
    Ok(true)
}
