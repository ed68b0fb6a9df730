//! Placement service
//!
//! The leader terminates one long-lived `ReportAppStatus` stream per runtime
//! host. Heartbeats become membership proposals, and every dissemination
//! tick pushes lock/update/unlock orders to the connected streams.
//!
//! ```text
//! host stream ──heartbeat──▶ membership channel ──▶ CommandExecutor ──▶ PlacementFsm
//!      ▲                                                                     │
//!      └──────── lock / update(tables) / unlock ◀── dissemination loop ◀─────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use placement_commons::proto::{self, placement_server::PlacementServer};
use placement_raft::{CommandExecutor, Member, PlacementFsm};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::ServerTlsConfig;
use tonic::Status;

use crate::config::PlacementServiceConfig;
use crate::error::{Result, ServiceError};
use crate::stream::PlacementHandler;

/// Sender half of one host stream
pub(crate) type OrderSender = mpsc::Sender<std::result::Result<proto::PlacementOrder, Status>>;

/// A membership change queued for proposal
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MembershipChange {
    Upsert(Member),
    Remove(String),
}

impl MembershipChange {
    pub(crate) fn host_name(&self) -> &str {
        match self {
            MembershipChange::Upsert(m) => &m.name,
            MembershipChange::Remove(name) => name,
        }
    }
}

/// One connected host stream in the dissemination pool
pub(crate) struct StreamConn {
    pub(crate) host_name: String,
    pub(crate) tx: OrderSender,
    /// Set until this stream has received a full lock/update/unlock cycle
    pub(crate) needs_table: bool,
    pub(crate) cancel: CancellationToken,
}

/// Leader-side placement server
pub struct PlacementService {
    pub(crate) executor: Arc<dyn CommandExecutor>,
    pub(crate) config: PlacementServiceConfig,

    pub(crate) has_leadership: AtomicBool,
    pub(crate) leadership_since: Mutex<Option<Instant>>,

    pub(crate) streams: RwLock<HashMap<u64, StreamConn>>,
    pub(crate) next_stream_id: AtomicU64,

    /// Last heartbeat per host name, across reconnects
    pub(crate) last_heartbeat: DashMap<String, Instant>,

    pub(crate) membership_tx: mpsc::Sender<MembershipChange>,
    pub(crate) membership_seq: AtomicU64,

    /// A proposal changed the table since the last dissemination
    pub(crate) pending_changes: AtomicBool,
    pub(crate) disseminated_generation: AtomicU64,

    serving: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PlacementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacementService")
            .field("has_leadership", &self.has_leadership())
            .field("streams", &self.stream_count())
            .finish_non_exhaustive()
    }
}

impl PlacementService {
    /// Create the service and start its background loops
    pub fn start(
        executor: Arc<dyn CommandExecutor>,
        config: PlacementServiceConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (membership_tx, membership_rx) = mpsc::channel(config.membership_channel_capacity);

        let service = Arc::new(Self {
            executor,
            config,
            has_leadership: AtomicBool::new(false),
            leadership_since: Mutex::new(None),
            streams: RwLock::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
            last_heartbeat: DashMap::new(),
            membership_tx,
            membership_seq: AtomicU64::new(0),
            pending_changes: AtomicBool::new(false),
            disseminated_generation: AtomicU64::new(0),
            serving: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(service.clone().leadership_loop()),
            tokio::spawn(service.clone().membership_loop(membership_rx)),
            tokio::spawn(service.clone().dissemination_loop()),
            tokio::spawn(service.clone().faulty_host_loop()),
        ];
        service.tasks.lock().extend(tasks);

        log::info!(
            "Placement service started: dissemination every {:?}, faulty host timeout {:?}",
            service.config.dissemination_interval,
            service.config.faulty_host_timeout
        );
        Ok(service)
    }

    pub fn config(&self) -> &PlacementServiceConfig {
        &self.config
    }

    pub fn fsm(&self) -> Arc<PlacementFsm> {
        self.executor.fsm()
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    pub fn has_leadership(&self) -> bool {
        self.has_leadership.load(Ordering::Acquire)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Placement tables built from the current replicated state
    pub fn placement_tables(&self) -> proto::PlacementTables {
        self.fsm().placement_tables()
    }

    /// True while the host-facing gRPC server is accepting streams
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    /// gRPC service wrapper to mount on a tonic server
    pub fn grpc_service(self: &Arc<Self>) -> PlacementServer<PlacementHandler> {
        PlacementServer::new(PlacementHandler::new(self.clone()))
    }

    /// Bind `addr` and serve host streams until `shutdown` fires
    pub async fn serve(
        self: &Arc<Self>,
        addr: SocketAddr,
        tls: Option<ServerTlsConfig>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener, tls, shutdown).await
    }

    pub async fn serve_with_listener(
        self: &Arc<Self>,
        listener: TcpListener,
        tls: Option<ServerTlsConfig>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        let mut builder = tonic::transport::Server::builder();
        if let Some(tls) = tls {
            builder = builder.tls_config(tls)?;
            log::info!("Placement gRPC server on {} requires mTLS", local);
        }

        self.serving.store(true, Ordering::Release);
        log::info!("Placement gRPC server listening on {}", local);

        let result = builder
            .add_service(self.grpc_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
            .await;

        self.serving.store(false, Ordering::Release);
        result.map_err(ServiceError::from)
    }

    async fn leadership_loop(self: Arc<Self>) {
        let mut changes = self.executor.leadership_changes();
        loop {
            let leader = *changes.borrow_and_update();
            self.set_leadership(leader);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = changes.changed() => {
                    if res.is_err() {
                        self.set_leadership(false);
                        break;
                    }
                }
            }
        }
    }

    /// Apply a leadership transition
    pub(crate) fn set_leadership(&self, leader: bool) {
        let was_leader = self.has_leadership.swap(leader, Ordering::AcqRel);
        if was_leader == leader {
            return;
        }

        if leader {
            *self.leadership_since.lock() = Some(Instant::now());
            self.last_heartbeat.clear();
            self.pending_changes.store(true, Ordering::Release);
            log::info!("Placement service gained leadership");
        } else {
            *self.leadership_since.lock() = None;
            let closed = self.close_all_streams(Status::failed_precondition(
                "placement service lost leadership",
            ));
            log::info!("Placement service lost leadership; closed {} streams", closed);
        }
    }

    pub(crate) fn register_stream(&self, stream_id: u64, conn: StreamConn) {
        let mut streams = self.streams.write();
        streams.entry(stream_id).or_insert(conn);
    }

    pub(crate) fn is_stream_registered(&self, stream_id: u64) -> bool {
        self.streams.read().contains_key(&stream_id)
    }

    pub(crate) fn remove_stream(&self, stream_id: u64) -> Option<StreamConn> {
        self.streams.write().remove(&stream_id)
    }

    /// Close every stream belonging to `host_name`
    pub(crate) fn close_host_streams(&self, host_name: &str) -> usize {
        let removed: Vec<StreamConn> = {
            let mut streams = self.streams.write();
            let ids: Vec<u64> = streams
                .iter()
                .filter(|(_, s)| s.host_name == host_name)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| streams.remove(id)).collect()
        };
        for conn in &removed {
            conn.cancel.cancel();
        }
        removed.len()
    }

    /// Close every host stream with `Unavailable` so hosts reconnect, for
    /// example after the server credentials were rotated
    pub fn close_streams(&self, reason: &str) -> usize {
        self.close_all_streams(Status::unavailable(reason.to_string()))
    }

    fn close_all_streams(&self, status: Status) -> usize {
        let drained: Vec<StreamConn> = self.streams.write().drain().map(|(_, s)| s).collect();
        for conn in &drained {
            let _ = conn.tx.try_send(Err(status.clone()));
            conn.cancel.cancel();
        }
        drained.len()
    }

    /// Stop accepting streams, stop the loops and close existing streams.
    /// Shutting down the Raft node is left to the owner of the executor.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let closed = self.close_all_streams(Status::unavailable("placement service shutting down"));

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Placement background task ended abnormally: {}", e);
            }
        }
        log::info!("Placement service stopped ({} streams closed)", closed);
    }
}

/// Unix nanoseconds used to stamp `UpdatedAt`
pub(crate) fn now_unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
