//! Placement Raft node
//!
//! Owns the openraft instance, its storage and the gRPC transport server,
//! and publishes leadership transitions on a watch channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError as OpenRaftError};
use openraft::storage::Adaptor;
use openraft::{Config, Raft, RaftMetrics, SnapshotPolicy};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use crate::commands::{ApplyResponse, Command};
use crate::config::RaftNodeConfig;
use crate::error::{RaftError, Result};
use crate::network::{RaftNetworkFactory, RaftServer, RaftService};
use crate::state_machine::PlacementFsm;
use crate::storage::{PlacementNode, PlacementRaftStorage, PlacementTypeConfig};

/// Type alias for the openraft Raft instance
pub type RaftInstance = Raft<PlacementTypeConfig>;

/// Type alias for the storage adaptor
pub type StorageAdaptor = Adaptor<PlacementTypeConfig, Arc<PlacementRaftStorage>>;

/// A running placement Raft node
pub struct RaftNode {
    config: RaftNodeConfig,
    node_id: u64,
    raft: RaftInstance,
    storage: Arc<PlacementRaftStorage>,
    network_factory: RaftNetworkFactory,
    leader_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.config.id)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl RaftNode {
    /// Start the node: open storage, bind the Raft transport, create the
    /// openraft instance and bootstrap the cluster if this node has no
    /// prior state.
    pub async fn start(config: RaftNodeConfig, fsm: Arc<PlacementFsm>) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = config.node_id();

        let storage = Arc::new(match &config.log_store_path {
            Some(path) => PlacementRaftStorage::open(path, fsm)?,
            None => PlacementRaftStorage::new(fsm),
        });
        let pristine = storage.is_pristine();

        let raft_config = Config {
            cluster_name: "placement".to_string(),
            heartbeat_interval: config.heartbeat_interval_ms,
            election_timeout_min: config.election_timeout_ms.0,
            election_timeout_max: config.election_timeout_ms.1,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_logs_since_last),
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| RaftError::Config(e.to_string()))?,
        );

        let network_factory = RaftNetworkFactory::new();
        for peer in &config.peers {
            network_factory.register_node(
                peer.node_id(),
                PlacementNode::new(&peer.id, &peer.address),
            );
        }

        let (log_store, state_machine): (StorageAdaptor, StorageAdaptor) =
            Adaptor::new(storage.clone());

        let raft = Raft::new(
            node_id,
            raft_config,
            network_factory.clone(),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| RaftError::Internal(format!("Failed to create Raft: {:?}", e)))?;

        let shutdown = CancellationToken::new();
        let listener = bind(config.self_address()?).await?;
        let server_task = spawn_rpc_server(listener, raft.clone(), shutdown.clone());

        let (leader_tx, _) = watch::channel(false);
        let node = Arc::new(Self {
            config,
            node_id,
            raft,
            storage,
            network_factory,
            leader_tx,
            tasks: Mutex::new(vec![server_task]),
            shutdown,
        });

        let monitor = node.clone().spawn_leader_monitor();
        node.tasks.lock().push(monitor);

        if pristine {
            node.bootstrap().await?;
        } else {
            log::info!("Raft node {} has prior state; skipping bootstrap", node.config.id);
        }

        log::info!(
            "Started placement raft node {} ({}) with {} peers, {} store",
            node.config.id,
            node.node_id,
            node.config.peers.len(),
            if node.storage.is_persistent() { "rocksdb" } else { "in-memory" }
        );
        Ok(node)
    }

    /// Initialize the cluster with every configured peer as a voter
    async fn bootstrap(&self) -> Result<()> {
        let members: BTreeMap<u64, PlacementNode> = self
            .config
            .peers
            .iter()
            .map(|p| (p.node_id(), PlacementNode::new(&p.id, &p.address)))
            .collect();

        match self.raft.initialize(members).await {
            Ok(()) => {
                log::info!("Bootstrapped placement cluster from node {}", self.config.id);
                Ok(())
            }
            Err(OpenRaftError::APIError(InitializeError::NotAllowed(e))) => {
                log::debug!("Cluster already initialized: {}", e);
                Ok(())
            }
            Err(e) => Err(RaftError::Internal(format!("Failed to initialize cluster: {}", e))),
        }
    }

    fn spawn_leader_monitor(self: Arc<Self>) -> JoinHandle<()> {
        let mut metrics = self.raft.metrics();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let is_leader = {
                    let m = metrics.borrow();
                    m.current_leader == Some(m.id)
                };
                let changed = self.leader_tx.send_if_modified(|current| {
                    if *current != is_leader {
                        *current = is_leader;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    log::info!(
                        "Placement raft node {} {} leadership",
                        self.config.id,
                        if is_leader { "acquired" } else { "lost" }
                    );
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = metrics.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            self.leader_tx.send_replace(false);
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn fsm(&self) -> &Arc<PlacementFsm> {
        self.storage.fsm()
    }

    pub fn raft(&self) -> &RaftInstance {
        &self.raft
    }

    pub fn network_factory(&self) -> &RaftNetworkFactory {
        &self.network_factory
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    /// Current leader node id, if known
    pub fn current_leader(&self) -> Option<u64> {
        self.raft.metrics().borrow().current_leader
    }

    /// Leader's string id, if known
    pub fn current_leader_name(&self) -> Option<String> {
        self.current_leader()
            .and_then(|id| self.network_factory.get_node(id))
            .map(|n| n.name)
    }

    pub fn metrics(&self) -> RaftMetrics<u64, PlacementNode> {
        self.raft.metrics().borrow().clone()
    }

    /// Subscribe to leadership transitions
    pub fn leadership_changes(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    /// Propose a command and wait for it to be applied
    pub async fn apply_command(&self, command: &Command, timeout: Duration) -> Result<ApplyResponse> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Shutdown);
        }
        let data = command.encode()?;

        match tokio::time::timeout(timeout, self.raft.client_write(data)).await {
            Err(_) => Err(RaftError::Timeout(timeout)),
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(OpenRaftError::APIError(ClientWriteError::ForwardToLeader(fwd)))) => {
                Err(RaftError::not_leader(fwd.leader_id))
            }
            Ok(Err(e)) => Err(RaftError::Proposal(e.to_string())),
        }
    }

    /// Stop the transport and the openraft instance
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let result = self
            .raft
            .shutdown()
            .await
            .map_err(|e| RaftError::Internal(format!("Raft shutdown failed: {}", e)));

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Raft background task ended abnormally: {}", e);
            }
        }

        log::info!("Placement raft node {} stopped", self.config.id);
        result
    }
}

async fn bind(address: &str) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| RaftError::Network(format!("Failed to bind raft address {}: {}", address, e)))
}

fn spawn_rpc_server(
    listener: tokio::net::TcpListener,
    raft: RaftInstance,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let local = listener.local_addr().ok();
    tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(RaftServer::new(RaftService::new(raft)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
            .await;
        if let Err(e) = result {
            log::error!("Raft RPC server on {:?} failed: {}", local, e);
        }
    })
}
