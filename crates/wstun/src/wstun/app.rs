use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::wstun::{
    admin, config, logging, telemetry,
    tunnel::{
        handshake::RelayContext,
        resolver::SystemResolver,
        server::{Server, ServerOptions},
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        path = %cfg.path,
        admin_addr = ?cfg.admin_addr,
        "wstun: starting"
    );

    let prom = match cfg.admin_addr {
        Some(_) => Some(Arc::new(telemetry::init_prometheus()?)),
        None => None,
    };
    let conns: telemetry::SharedConnections = Arc::new(telemetry::ConnectionRegistry::new());

    let relay = Arc::new(RelayContext {
        opts: cfg.relay_options(),
        resolver: Arc::new(SystemResolver::new()),
        conns: conns.clone(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    if let Some(addr) = cfg.admin_addr {
        let state = admin::AdminState {
            prom: prom.clone(),
            conns: conns.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    let server = Server::bind(ServerOptions {
        listen_addr: cfg.listen_addr,
        path: cfg.path.clone(),
        relay,
    })
    .await?;
    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    // Wait for Ctrl-C / SIGTERM or a task ending on its own.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
                Some(Ok(Ok(()))) | None => {}
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = ?DRAIN_TIMEOUT, "shutdown: tasks did not finish, aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!(open_connections = conns.len(), "wstun: stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
