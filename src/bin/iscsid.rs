// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The daemon binary (§11): binds the control socket, drives the request
//! router and discovery scheduler. `SIGPIPE` is ignored process-wide, which
//! is the Rust runtime's default disposition on Unix and needs no extra
//! setup here.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use iscsi_client_rs::{
    cfg::{config::Config, logger::init_logger},
    daemon::{
        power::{self, NoopDiskArbitration},
        router::Router,
        scheduler::Scheduler,
    },
    engine::session::SessionManager,
    store::{FileConfigStore, InMemorySecretStore},
};
use tokio::{net::UnixListener, signal::unix::{SignalKind, signal}, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "iscsid")]
#[command(about = "iSCSI initiator control-plane daemon", long_about = None)]
struct Args {
    /// UNIX-domain socket `iscsictl` connects to.
    #[arg(short, long, default_value = "/var/run/iscsid.sock")]
    socket: String,

    /// Initiator-side login/runtime parameters (cfg/config.rs shape).
    #[arg(short, long, default_value = "docker/lio/config.lio.yaml")]
    config: String,

    /// Persisted target/discovery-portal database (store.rs shape).
    #[arg(long, default_value = "docker/targets.yaml")]
    store: String,

    /// tracing/tracing-subscriber YAML config (cfg/logger.rs shape).
    #[arg(long, default_value = "tests/config_logger.yaml")]
    logger_config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logger(&args.logger_config).context("failed to initialize logger")?;

    let cfg = Config::load_from_file(&args.config)
        .with_context(|| format!("failed to load initiator config {}", args.config))?;
    let config_store: Arc<dyn iscsi_client_rs::store::ConfigStore> =
        Arc::new(FileConfigStore::open(&args.store).context("failed to open config store")?);
    let secret_store: Arc<dyn iscsi_client_rs::store::SecretStore> =
        Arc::new(InMemorySecretStore::default());

    let session_manager = SessionManager::new(cfg);
    let discovery_trigger = Arc::new(Notify::new());
    let shutdown = CancellationToken::new();

    let scheduler = Scheduler::new(
        session_manager.clone(),
        config_store.clone(),
        discovery_trigger.clone(),
    );
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    // §4.H's sleep notification has no portable stand-in in plain Rust/tokio;
    // SIGUSR1 plays that role here so the quiesce path is exercisable without
    // a platform-specific power-management integration (see DESIGN.md).
    let power_session_manager = session_manager.clone();
    let power_shutdown = shutdown.clone();
    let power_task = tokio::spawn(async move {
        let arbitration = NoopDiskArbitration;
        let mut sleep_signal = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGUSR1 handler for sleep notifications");
                return;
            },
        };
        loop {
            tokio::select! {
                _ = power_shutdown.cancelled() => return,
                _ = sleep_signal.recv() => {
                    info!("sleep notification received, quiescing active sessions");
                    power::prepare_for_sleep(&power_session_manager, &arbitration).await;
                },
            }
        }
    });

    let _ = std::fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("failed to bind control socket {}", args.socket))?;
    info!(socket = %args.socket, "iscsid listening");

    let router = Router {
        session_manager,
        config_store,
        secret_store,
        discovery_trigger,
        shutdown: shutdown.clone(),
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown signal received, no longer accepting connections");
                break;
            },
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.context("accept on control socket failed")?;
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = router.serve(stream).await {
                        warn!(error = %e, "client connection ended with an error");
                    }
                });
            },
        }
    }

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "discovery scheduler task panicked");
    }
    power_task.abort();
    let _ = std::fs::remove_file(&args.socket);
    Ok(())
}
