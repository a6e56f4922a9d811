use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use meet_mesh::api::run_meeting;
use meet_mesh::{Config, Notice};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };

    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let (_command_tx, command_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = oneshot::channel();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, leaving meeting");
            let _ = view_tx.send(());
        }
    });

    tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            match notice {
                Notice::Failed { kind, message } => tracing::warn!(kind = ?kind, "{}", message),
                Notice::Roster(snapshot) => tracing::info!(
                    revision = snapshot.revision,
                    participants = snapshot.participants.len(),
                    host = ?snapshot.host_connection_id,
                    chat_enabled = snapshot.chat_enabled,
                    recording = snapshot.recording,
                    "Roster"
                ),
                other => tracing::info!(notice = ?other, "Meeting notice"),
            }
        }
    });

    match run_meeting(config, command_rx, view_rx, notice_tx).await {
        Ok(reason) => tracing::info!(reason = %reason, "Session finished"),
        Err(e) => {
            tracing::error!(error = %e, "Could not start meeting session");
            std::process::exit(1);
        }
    }
}
