#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use tether_common::types::BROADCAST;
use tether_common::ClientId;
use tetherc::config::{load_config, Cli};
use tetherc::connector::WsConnector;
use tetherc::engine::ReconnectEngine;
use tetherc::error::EngineError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

fn parse_receiver(raw: &str) -> anyhow::Result<ClientId> {
    if raw.trim() == BROADCAST {
        return Ok(ClientId::broadcast());
    }
    ClientId::parse(raw).with_context(|| format!("invalid receiver {raw:?}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref url) = cli.url {
        config.server_url.clone_from(url);
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let identity = ClientId::parse(&cli.client_id)
        .with_context(|| format!("invalid client id {:?}", cli.client_id))?;
    let receiver = parse_receiver(&cli.receiver)?;

    let connector = WsConnector::new(config.server_url.as_str(), &identity)?;
    let engine = ReconnectEngine::new(identity.clone(), connector, config.engine_config());
    engine.on_receive(|envelope| {
        println!(
            "Received message from {} to {}: {}",
            envelope.sender(),
            envelope.receiver(),
            String::from_utf8_lossy(envelope.payload())
        );
    });
    engine.start()?;
    info!(client = %identity, receiver = %receiver, url = %config.server_url, "client started");

    let greeting = format!("Hello, I am {identity}!");
    let mut ticker = tokio::time::interval(config.send_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = {
        let finished = engine.finished();
        tokio::pin!(finished);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = &mut finished => break result,
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    engine.send_to(receiver.clone(), greeting.as_bytes()).await;
                }
            }
        }
    };

    engine.stop().await;

    match outcome {
        Err(e @ EngineError::MaxRetriesExceeded { .. }) => {
            error!(error = %e, "could not reach the relay");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
        Ok(()) => {
            info!("client stopped");
            Ok(())
        }
    }
}
