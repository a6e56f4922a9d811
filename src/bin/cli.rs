// Meeting client CLI
// Pre-flight checks, an interactive console client and a protocol reference

use clap::{Parser, Subcommand};
use colored::*;
use futures::{SinkExt, StreamExt};
use std::io::{self, BufRead, Write};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use meet_mesh::api::signaling_socket::signaling_url;
use meet_mesh::api::{check_can_join, run_meeting};
use meet_mesh::mesh::host::HostCommand;
use meet_mesh::mesh::{ClientMessage, IceCandidate, JoinUser, SignalData};
use meet_mesh::{ClientCommand, Config, Notice};

#[derive(Parser)]
#[command(name = "meet-cli")]
#[command(about = "Full-mesh meeting client console", long_about = None)]
struct Cli {
    /// Signaling websocket URL (overrides SIGNALING_URL)
    #[arg(short, long)]
    signaling: Option<String>,

    /// REST API base URL (overrides API_BASE_URL)
    #[arg(short, long)]
    api: Option<String>,

    /// Auth token (overrides AUTH_TOKEN)
    #[arg(short, long)]
    token: Option<String>,

    /// Meeting id (overrides MEETING_ID)
    #[arg(short, long)]
    meeting: Option<String>,

    /// Stable user key (overrides USER_KEY)
    #[arg(short, long)]
    user: Option<String>,

    /// Display name (overrides DISPLAY_NAME)
    #[arg(short, long)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the API whether this user may join the meeting
    Check,

    /// Open the signaling socket and print raw frames for a few seconds
    Connect {
        /// Seconds to listen before closing
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },

    /// Join the meeting with an interactive console
    Join {
        /// Join without microphone
        #[arg(long)]
        no_audio: bool,

        /// Join without camera
        #[arg(long)]
        no_video: bool,
    },

    /// Print example frames of the signaling protocol
    Protocol,
}

fn apply_overrides(cli: &Cli) {
    let overrides = [
        ("SIGNALING_URL", &cli.signaling),
        ("API_BASE_URL", &cli.api),
        ("AUTH_TOKEN", &cli.token),
        ("MEETING_ID", &cli.meeting),
        ("USER_KEY", &cli.user),
        ("DISPLAY_NAME", &cli.name),
    ];
    for (key, value) in overrides {
        if let Some(value) = value {
            std::env::set_var(key, value);
        }
    }
    if let Commands::Join { no_audio, no_video } = &cli.command {
        if *no_audio {
            std::env::set_var("START_AUDIO", "false");
        }
        if *no_video {
            std::env::set_var("START_VIDEO", "false");
        }
    }
}

fn load_config() -> Option<Config> {
    match Config::from_env() {
        Ok(config) => Some(config),
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            println!("  Set it in .env or pass it as a flag (see --help)");
            None
        }
    }
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Environment is set before the runtime starts any threads
    apply_overrides(&cli);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("{} Cannot start runtime: {}", "✗".red(), e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        match &cli.command {
            Commands::Check => check_join().await,
            Commands::Connect { seconds } => raw_connect(*seconds).await,
            Commands::Join { .. } => join_meeting().await,
            Commands::Protocol => print_protocol(),
        }
    });
}

async fn check_join() {
    println!("{}", "Checking join permission...".cyan());
    let Some(config) = load_config() else {
        return;
    };

    println!("  Meeting: {}", config.session.meeting_id);
    println!("  User: {}", config.session.user_key);

    match check_can_join(
        &config.signaling.api_base_url,
        &config.session.meeting_id,
        config.signaling.token.as_deref(),
    )
    .await
    {
        Ok(_) => println!("{} Allowed to join", "✓".green()),
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

async fn raw_connect(seconds: u64) {
    println!("{}", "Testing signaling connection...".cyan());
    let Some(config) = load_config() else {
        return;
    };

    let url = signaling_url(&config.signaling.url, config.signaling.token.as_deref());
    match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => {
            println!("{} WebSocket connection established", "✓".green());
            println!("  URL: {}", config.signaling.url);
            let (mut write, mut read) = ws_stream.split();

            loop {
                match timeout(Duration::from_secs(seconds), read.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        println!("{} {}", "◀".green(), text.bright_white());
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        println!("{} Server closed the connection", "✗".yellow());
                        return;
                    }
                    Ok(Some(Ok(_))) => continue,
                    Ok(Some(Err(e))) => {
                        println!("{} Connection error: {}", "✗".red(), e);
                        return;
                    }
                    Err(_) => break,
                }
            }

            let _ = write.send(Message::Close(None)).await;
            println!("{} Connection closed cleanly", "✓".green());
        }
        Err(e) => {
            println!("{} WebSocket connection failed: {}", "✗".red(), e);
        }
    }
}

/// One line typed at the console
#[derive(Debug, PartialEq)]
enum Input {
    Command(ClientCommand),
    Help,
    Invalid(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "help" || line == "/help" {
        return Some(Input::Help);
    }
    if line == "quit" || line == "exit" {
        return Some(Input::Command(ClientCommand::Leave));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Input::Command(ClientCommand::Chat {
            text: line.to_string(),
            to: None,
        }));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (rest, None),
    };

    let command = match (name, arg) {
        ("leave", _) => ClientCommand::Leave,
        ("audio", _) => ClientCommand::ToggleAudio,
        ("video", _) => ClientCommand::ToggleVideo,
        ("share", _) => ClientCommand::StartScreenShare,
        ("unshare", _) => ClientCommand::StopScreenShare,
        ("record", _) => ClientCommand::StartRecording,
        ("stop", _) => ClientCommand::StopRecording,
        ("delete", Some(id)) => ClientCommand::DeleteMessage { id: id.to_string() },
        ("dm", Some(arg)) => match arg.split_once(char::is_whitespace) {
            Some((to, text)) => ClientCommand::Chat {
                text: text.trim().to_string(),
                to: Some(to.to_string()),
            },
            None => return Some(Input::Invalid("usage: /dm <user-key> <text>".to_string())),
        },
        (name, target) => match name.parse::<HostCommand>() {
            Ok(cmd) => ClientCommand::Host {
                cmd,
                target: target.map(str::to_string),
            },
            Err(_) => return Some(Input::Invalid(format!("unknown command /{}", name))),
        },
    };
    Some(Input::Command(command))
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::Joined { meeting_id } => {
            println!("{} Joined meeting {}", "✓".green(), meeting_id.green().bold())
        }
        Notice::MediaDegraded { message } => println!("{} {}", "⚠".yellow(), message),
        Notice::Roster(snapshot) => {
            let host = snapshot
                .host_connection_id
                .as_deref()
                .map(|id| {
                    snapshot
                        .participant_by_connection(id)
                        .map(|p| p.display_name.clone())
                        .unwrap_or_else(|| id.to_string())
                })
                .unwrap_or_else(|| "none".to_string());
            println!(
                "{} {} participant(s), host: {}, chat: {}, recording: {}",
                "●".blue(),
                snapshot.total,
                host,
                if snapshot.chat_enabled { "on" } else { "off" },
                if snapshot.recording { "yes".red() } else { "no".normal() }
            );
        }
        Notice::PeerJoined { peer_id, display_name } => println!(
            "{} {} joined",
            "+".green(),
            display_name.as_deref().unwrap_or(peer_id)
        ),
        Notice::PeerLeft { peer_id } => println!("{} {} left", "-".yellow(), peer_id),
        Notice::RemoteTrack { peer_id, kind } => {
            println!("{} receiving {} from {}", "◀".green(), kind, peer_id)
        }
        Notice::HostControls { unlocked } => {
            if *unlocked {
                println!("{} Host controls unlocked", "★".green().bold());
            } else {
                println!("{} Host controls removed", "★".yellow());
            }
        }
        Notice::HostAction { action, reason } => println!(
            "{} Host action {:?}{}",
            "!".yellow().bold(),
            action,
            reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default()
        ),
        Notice::LocalMedia { audio_on, video_on } => println!(
            "{} mic {}, camera {}",
            "●".blue(),
            if *audio_on { "on" } else { "off" },
            if *video_on { "on" } else { "off" }
        ),
        Notice::ScreenShare { active } => println!(
            "{} Screen share {}",
            "●".blue(),
            if *active { "started" } else { "stopped" }
        ),
        Notice::Recording { recording, by } => println!(
            "{} Recording {}{}",
            "●".red(),
            if *recording { "started" } else { "stopped" },
            by.as_ref().map(|b| format!(" by {}", b)).unwrap_or_default()
        ),
        Notice::RecordingSaved(artifact) => println!(
            "{} Recording saved to {} ({}s)",
            "✓".green(),
            artifact.path.display(),
            artifact.duration.as_secs()
        ),
        Notice::ChatEnabled(enabled) => println!(
            "{} Chat {}",
            "●".blue(),
            if *enabled { "enabled" } else { "disabled" }
        ),
        Notice::ChatHistory { count } => println!("{} {} earlier message(s)", "●".blue(), count),
        Notice::ChatMessage(message) => {
            let scope = if message.is_private() { " (private)" } else { "" };
            println!(
                "[{}] {}{}: {}",
                message.id.dimmed(),
                message.from_name.bold(),
                scope.dimmed(),
                message.text
            );
        }
        Notice::MessageDeleted { id } => println!("{} message {} deleted", "-".yellow(), id),
        Notice::Failed { message, .. } => println!("{} {}", "✗".red(), message),
        Notice::ConnectionStatus { connected } => {
            if *connected {
                println!("{} Connected", "✓".green());
            } else {
                println!("{} Disconnected from meeting server", "✗".red());
            }
        }
        Notice::Ended(reason) => println!("{} Session ended: {}", "■".yellow(), reason),
    }
}

async fn join_meeting() {
    let Some(config) = load_config() else {
        return;
    };

    println!("\n{}", "Meeting Console".bold().green());
    println!("{}", "═".repeat(60).green());
    println!("Type {} for help, {} to leave\n", "help".cyan(), "quit".cyan());

    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = oneshot::channel::<()>();

    let printer = tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            print_notice(&notice);
        }
    });

    // Stdin is blocking; read it on its own thread
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match parse_input(&line) {
                Some(Input::Command(command)) => {
                    let leaving = command == ClientCommand::Leave;
                    if command_tx.send(command).is_err() || leaving {
                        break;
                    }
                }
                Some(Input::Help) => print_console_help(),
                Some(Input::Invalid(message)) => println!("{} {}", "✗".yellow(), message),
                None => {}
            }
            print!("{} ", "►".cyan());
            let _ = io::stdout().flush();
        }
        let _ = command_tx.send(ClientCommand::Leave);
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = view_tx.send(());
        }
    });

    match run_meeting(config, command_rx, view_rx, notice_tx).await {
        Ok(_) => {}
        Err(e) => println!("{} Could not join: {}", "✗".red(), e),
    }
    let _ = printer.await;
}

fn print_console_help() {
    println!("\n{}", "Console Commands".bold());
    println!("{}", "─".repeat(60));
    println!("  {:<28} send a chat message", "<text>");
    println!("  {:<28} private message", "/dm <user-key> <text>");
    println!("  {:<28} delete your message", "/delete <id>");
    println!("  {:<28} toggle microphone / camera", "/audio, /video");
    println!("  {:<28} screen share on / off", "/share, /unshare");
    println!("  {:<28} local recording on / off", "/record, /stop");
    println!("  {:<28} leave the meeting", "/leave, quit");
    println!("\n{}", "Host commands".bold());
    for cmd in HostCommand::ALL {
        let usage = if cmd.requires_target() {
            format!("/{} <connection-id>", cmd)
        } else {
            format!("/{}", cmd)
        };
        println!("  {}", usage.cyan());
    }
    println!();
}

fn print_frame(title: &str, message: &ClientMessage) {
    println!("\n{}:", title.cyan());
    match serde_json::to_string(message) {
        Ok(json) => println!("  {}", json),
        Err(e) => println!("  {} {}", "✗".red(), e),
    }
}

fn print_protocol() {
    println!("\n{}", "Signaling Protocol".bold());
    println!("{}", "─".repeat(60));
    println!("{}", "Client → server".bold());

    print_frame(
        "Join",
        &ClientMessage::Join {
            meeting_id: "math-101".into(),
            user: JoinUser {
                user_key: "u-42".into(),
                display_name: "Ada".into(),
                role: "instructor".into(),
            },
        },
    );
    print_frame(
        "Offer",
        &ClientMessage::Signal {
            to: "peer-b".into(),
            data: SignalData::Offer { sdp: "v=0...".into() },
        },
    );
    print_frame(
        "ICE candidate",
        &ClientMessage::Signal {
            to: "peer-b".into(),
            data: SignalData::Ice(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.5 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
        },
    );
    print_frame(
        "Status",
        &ClientMessage::Status {
            audio_on: true,
            video_on: false,
        },
    );
    print_frame(
        "Host command",
        &ClientMessage::HostCommand {
            meeting_id: "math-101".into(),
            cmd: HostCommand::MuteUser,
            target: Some("peer-b".into()),
        },
    );
    print_frame(
        "Chat",
        &ClientMessage::Chat {
            to: None,
            text: "hello".into(),
        },
    );
    print_frame(
        "Delete message",
        &ClientMessage::DeleteMessage {
            meeting_id: "math-101".into(),
            message_id: "17".into(),
        },
    );
    print_frame("Leave", &ClientMessage::Leave {});

    println!("\n{}", "Server → client".bold());
    for example in [
        r#"{"type":"participants","participants":[{"userKey":"u-42","sockets":["a"],"displayName":"Ada","role":"instructor","audioOn":true,"videoOn":true}],"total":1,"host":"a","ownerId":"u-42","chatEnabled":true,"recording":false}"#,
        r#"{"type":"peer-join","id":"b","user":{"userKey":"u-7","displayName":"Bo","role":"student"}}"#,
        r#"{"type":"signal","from":"b","data":{"type":"answer","sdp":"v=0..."}}"#,
        r#"{"type":"peer-left","id":"b"}"#,
        r#"{"type":"host-assigned","hostId":"b"}"#,
        r#"{"type":"host-action","cmd":"mute","reason":"too loud"}"#,
        r#"{"type":"recording","recording":true,"by":"u-42"}"#,
        r#"{"type":"chat-toggled","enabled":false}"#,
        r#"{"type":"chat","message":{"id":"17","from":"u-7","fromName":"Bo","text":"hi"}}"#,
        r#"{"type":"message-deleted","id":"17"}"#,
        r#"{"type":"meeting-deleted","meetingId":"math-101"}"#,
    ] {
        println!("  {}", example);
    }
    println!();
}
