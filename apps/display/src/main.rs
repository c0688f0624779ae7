mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use display_core::{DisplayEvent, HttpSnapshotSource, MatchSession, WsConnector};
use shared::domain::MatchId;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_settings_from, DEFAULT_CONFIG_PATH};

/// Audience display for a live quiz match. Prints every view change as one
/// JSON line on stdout.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    match_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config, |key| std::env::var(key).ok());
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(match_id) = args.match_id {
        settings.match_id = Some(match_id);
    }
    let match_id = settings
        .match_id
        .map(MatchId)
        .context("no match id: pass --match-id or set APP__MATCH_ID")?;

    let source = HttpSnapshotSource::new(&settings.server_url)
        .with_context(|| format!("invalid server url '{}'", settings.server_url))?;
    let connector = WsConnector::new(settings.server_url.clone());
    connector
        .endpoint(match_id)
        .with_context(|| format!("invalid server url '{}'", settings.server_url))?;

    let session = MatchSession::start(
        settings.session_config(),
        match_id,
        Arc::new(source),
        Arc::new(connector),
    );
    info!(
        session_id = %session.session_id(),
        match_id = match_id.0,
        server_url = %settings.server_url,
        "display: session started"
    );

    let mut view = session.view();
    let mut events = session.events();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!("display: failed to listen for ctrl-c: {err}");
                }
                break;
            }
            changed = view.changed() => {
                if changed.is_err() {
                    warn!("display: session stopped publishing");
                    break;
                }
                let line = serde_json::to_string(&*view.borrow_and_update())?;
                println!("{line}");
            }
            event = events.recv() => match event {
                Ok(DisplayEvent::SliceFailed { kind, attempt, error }) => {
                    warn!(%kind, attempt, "display: slice failed: {error}");
                }
                Ok(DisplayEvent::Error(error)) => warn!("display: {error}"),
                Ok(event) => info!(?event, "display: event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "display: event feed lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.dispose().await;
    info!("display: shut down");
    Ok(())
}
