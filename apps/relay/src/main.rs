use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

mod bootstrap;
mod cli;

use crate::bootstrap::{BootstrapFile, Relay};
use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("relay failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let file = BootstrapFile::load(cli.config.as_deref())?;
    let global = file.global_config(cli.patch())?;
    info!(
        host = %global.host,
        port = global.port,
        proxy = %global.proxy.as_deref().unwrap_or(""),
        retry_times = global.retry_times,
        channels = file.channels.len(),
        users = file.users.len(),
        tokens = file.tokens.len(),
        "config loaded"
    );

    let bind = format!("{}:{}", global.host, global.port);
    let relay = Arc::new(Relay::build(file, global)?);
    spawn_reload_on_hangup(relay.clone(), cli);

    let app = relay_router::relay_router(relay.engine.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("relay stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("relay=info,relay_core=info,relay_router=info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Re-read `--config` on SIGHUP. The listen address is fixed at startup.
#[cfg(unix)]
fn spawn_reload_on_hangup(relay: Arc<Relay>, cli: Cli) {
    use tokio::signal::unix::{SignalKind, signal};

    let Some(path) = cli.config.clone() else {
        return;
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            warn!(error = %err, "failed to install SIGHUP handler");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let reloaded = BootstrapFile::load(Some(path.as_path())).and_then(|file| {
                let global = file.global_config(cli.patch())?;
                Ok((file, global))
            });
            match reloaded {
                Ok((file, global)) => relay.reload(file, global),
                Err(err) => warn!(event = "bootstrap_reload_failed", error = %format!("{err:#}")),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_relay: Arc<Relay>, _cli: Cli) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install CTRL+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
