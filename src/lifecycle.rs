//! Server lifecycle management.
//!
//! Bootstraps credentials, the Raft node and the placement service, runs
//! the host-facing gRPC server and the health endpoint, and coordinates
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use placement_commons::credentials::{CertChain, TlsCredentials};
use placement_raft::{PlacementFsm, RaftExecutor, RaftNode};
use placement_service::healthz::{run_healthz_server, HealthState};
use placement_service::PlacementService;

use crate::config::ServerConfig;

const CREDENTIALS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Components shared between the servers and shutdown handling
pub struct ApplicationComponents {
    pub node: Arc<RaftNode>,
    pub service: Arc<PlacementService>,
    /// Credentials directory and the chain loaded from it, when mTLS is on
    pub tls: Option<(TlsCredentials, CertChain)>,
}

/// Wait for credentials (if mTLS is on), then start Raft and the
/// placement service.
pub async fn bootstrap(config: &ServerConfig) -> Result<ApplicationComponents> {
    let bootstrap_start = Instant::now();

    let tls = if config.placement.tls_enabled {
        let creds = TlsCredentials::new(&config.placement.certchain);
        info!("Waiting for credentials in {}", creds.dir().display());
        let chain = tokio::select! {
            chain = creds.wait_for_files(CREDENTIALS_POLL_INTERVAL, Duration::MAX) => chain?,
            _ = shutdown_signal() => return Err(anyhow!("interrupted while waiting for credentials")),
        };
        info!("Credentials loaded, mTLS enabled for host streams");
        Some((creds, chain))
    } else {
        warn!("mTLS disabled: host streams are served in plaintext");
        None
    };

    let raft_config = config.raft_node_config()?;
    match &raft_config.log_store_path {
        Some(path) => info!("Raft log store: {}", path.display()),
        None => info!("Raft log store: in-memory"),
    }
    let fsm = Arc::new(PlacementFsm::new(config.placement.replication_factor));
    let node = RaftNode::start(raft_config, fsm).await?;

    let executor = Arc::new(RaftExecutor::new(node.clone(), config.proposal_timeout()));
    let service = PlacementService::start(executor, config.service_config())?;

    debug!(
        "Bootstrap completed in {:.2}ms",
        bootstrap_start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(ApplicationComponents { node, service, tls })
}

/// Serve until a termination signal, then shut down within the graceful
/// timeout. Returns an error if the servers fail or shutdown overruns.
pub async fn run(config: &ServerConfig, components: ApplicationComponents) -> Result<()> {
    let ApplicationComponents { node, service, tls } = components;

    let grpc_shutdown = CancellationToken::new();
    let healthz_shutdown = CancellationToken::new();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.placement.port));
    let grpc_task: JoinHandle<placement_service::Result<()>> = {
        let (service, token) = (service.clone(), grpc_shutdown.clone());
        tokio::spawn(serve_hosts(service, addr, tls, token))
    };

    let healthz_task: JoinHandle<placement_service::Result<()>> = {
        let state = HealthState {
            node_id: config.raft.id.clone(),
            service: service.clone(),
        };
        let (port, token) = (config.placement.healthz_port, healthz_shutdown.clone());
        tokio::spawn(async move { run_healthz_server(state, port, token).await })
    };

    info!(
        "Placement node {} running: gRPC on {}, healthz on {}",
        config.raft.id, addr, config.placement.healthz_port
    );

    let mut grpc_task = grpc_task;
    let fatal = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received termination signal, initiating graceful shutdown...");
            None
        }
        result = &mut grpc_task => {
            let err = match result {
                Ok(Ok(())) => anyhow!("placement gRPC server exited unexpectedly"),
                Ok(Err(e)) => anyhow!("placement gRPC server failed: {}", e),
                Err(e) => anyhow!("placement gRPC server task failed: {}", e),
            };
            error!("{}", err);
            Some(err)
        }
    };

    let graceful_timeout = config.graceful_timeout();
    let shutdown = async {
        grpc_shutdown.cancel();

        // Open host streams hold the gRPC server until they are closed
        info!("Closing host streams...");
        service.shutdown().await;

        if !grpc_task.is_finished() {
            if let Ok(Err(e)) = (&mut grpc_task).await {
                warn!("gRPC server stopped with error: {}", e);
            }
        }

        info!("Shutting down Raft node...");
        if let Err(e) = node.shutdown().await {
            error!("Error shutting down Raft node: {}", e);
        }

        healthz_shutdown.cancel();
        match healthz_task.await {
            Ok(Err(e)) => warn!("Healthz server stopped with error: {}", e),
            Err(e) => warn!("Healthz server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    };

    if tokio::time::timeout(graceful_timeout, shutdown).await.is_err() {
        error!("Graceful shutdown exceeded {:?}", graceful_timeout);
        return Err(anyhow!("graceful shutdown timed out after {:?}", graceful_timeout));
    }

    match fatal {
        Some(err) => Err(err),
        None => {
            info!("Server shutdown complete");
            Ok(())
        }
    }
}

/// Serve host streams until `shutdown`. With mTLS, a rotated credential
/// triplet restarts the server with the new chain; connected hosts are
/// closed with `Unavailable` and reconnect.
async fn serve_hosts(
    service: Arc<PlacementService>,
    addr: SocketAddr,
    tls: Option<(TlsCredentials, CertChain)>,
    shutdown: CancellationToken,
) -> placement_service::Result<()> {
    let Some((creds, mut chain)) = tls else {
        return service.serve(addr, None, shutdown).await;
    };

    loop {
        let generation = shutdown.child_token();
        let server = service.serve(addr, Some(chain.server_tls_config()), generation.clone());
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => return result,
            next = creds.wait_for_change(&chain, CREDENTIALS_POLL_INTERVAL) => {
                info!("Credentials in {} changed, reloading host gRPC server", creds.dir().display());
                generation.cancel();
                let closed = service.close_streams("placement credentials rotated");
                server.await?;
                debug!("Closed {} host streams for credential reload", closed);
                chain = next;
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
