use crate::config::{self, Config};
use crate::manager::Manager;
use crate::notify::TracingNotifier;
use crate::paths::Paths;
use crate::pid;
use crate::ports::PortAllocator;
use crate::protocol::{self, Response};
use crate::registry::ServerRegistry;
use crate::store::MemoryStore;
use crate::supervisor::SupervisorContext;
use color_eyre::eyre::WrapErr;
use std::fs;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::watch;

/// Wire up the orchestration core from a loaded config.
pub fn build_manager(config: Config, paths: &Paths) -> color_eyre::Result<Manager> {
    let log_dir = config.log_dir_or(&paths.log_dir());
    let store = MemoryStore::new(config.policy.clone(), config.host.default_quota);
    let ports = PortAllocator::new(config.host.min_port, config.host.max_port);
    let ctx = SupervisorContext::new(
        Arc::new(config),
        ServerRegistry::new(),
        Arc::new(store),
        Arc::new(TracingNotifier),
        ports,
        log_dir,
    )?;
    Ok(Manager::new(ctx))
}

pub async fn run(paths: Paths) -> color_eyre::Result<()> {
    fs::create_dir_all(paths.data_dir())?;

    let pid_file = pid::PidFile::claim(&paths)?;
    tracing::info!(pid = pid_file.pid(), "daemon starting");

    let config_path = paths.config_file();
    let config = config::load_config(&config_path)
        .wrap_err_with(|| format!("failed to load {}", config_path.display()))?;
    let manager = build_manager(config, &paths)?;

    // Remove stale socket file if it exists
    let socket_path = paths.socket_file();
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(socket = %socket_path.display(), "daemon listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let cleanup = manager.spawn_cleanup(shutdown_rx.clone());

    let result = run_accept_loop(&manager, &listener, &shutdown_tx, &mut shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = cleanup {
        let _ = handle.await;
    }
    manager.shutdown_all().await;

    // Cleanup
    let _ = fs::remove_file(paths.socket_file());
    drop(pid_file);
    tracing::info!("daemon stopped");

    result
}

async fn run_accept_loop(
    manager: &Manager,
    listener: &UnixListener,
    shutdown_tx: &watch::Sender<bool>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> color_eyre::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _addr) = accept_result?;
                let tx = shutdown_tx.clone();
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &tx, &manager).await {
                        tracing::warn!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = signal_shutdown(&mut sigterm, &mut sigint) => {
                tracing::info!("signal received, shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn signal_shutdown(sigterm: &mut Signal, sigint: &mut Signal) {
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

async fn handle_connection(
    stream: tokio::net::UnixStream,
    shutdown_tx: &watch::Sender<bool>,
    manager: &Manager,
) -> color_eyre::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    buf_reader.read_line(&mut line).await?;

    if line.is_empty() {
        return Ok(());
    }

    let response = match protocol::decode_request(&line) {
        Ok(request) => {
            tracing::debug!(?request, "request");
            manager.dispatch(request, shutdown_tx).await
        }
        Err(e) => Response::error(format!("invalid request: {e}")),
    };
    let encoded = protocol::encode_response(&response)?;
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;

    Ok(())
}
