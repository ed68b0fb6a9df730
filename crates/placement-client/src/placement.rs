//! Actor placement client
//!
//! One connection loop per host:
//!
//! ```text
//! dial addresses[server_index] ──▶ ReportAppStatus stream
//!        ▲                           ├─ heartbeat task: Host every interval while healthy
//!        │ next peer + backoff       └─ order loop: lock / update / unlock
//!        └──────────── stream error ◀─┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use placement_commons::proto::{self, placement_client::PlacementClient, Operation};
use placement_commons::ConsistentHashTables;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::{add_dns_resolver_prefix, endpoint_for, PlacementClientConfig};
use crate::error::{ClientError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// How long `stop` waits for the server to acknowledge the closed stream
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type HealthFn = Arc<dyn Fn() -> bool + Send + Sync>;
type TableUpdateFn = Arc<dyn Fn() + Send + Sync>;

/// Placement client embedded in a runtime host
pub struct ActorPlacement {
    config: PlacementClientConfig,
    server_addrs: Vec<String>,
    server_index: AtomicUsize,

    /// `true` between a `lock` and its `unlock`
    blocked: watch::Sender<bool>,
    tables: RwLock<Arc<ConsistentHashTables>>,

    health_fn: HealthFn,
    table_update_fn: TableUpdateFn,

    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ActorPlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorPlacement")
            .field("host_name", &self.config.host_name)
            .field("servers", &self.server_addrs)
            .field("blocked", &self.is_blocked())
            .finish_non_exhaustive()
    }
}

impl ActorPlacement {
    pub fn new(config: PlacementClientConfig) -> Self {
        let (blocked, _) = watch::channel(false);
        Self {
            server_addrs: add_dns_resolver_prefix(&config.addresses),
            config,
            server_index: AtomicUsize::new(0),
            blocked,
            tables: RwLock::new(Arc::new(ConsistentHashTables::default())),
            health_fn: Arc::new(|| true),
            table_update_fn: Arc::new(|| {}),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Heartbeats are only sent while `f` returns true
    pub fn with_health_check(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.health_fn = Arc::new(f);
        self
    }

    /// Invoked after every newly installed table version
    pub fn with_table_update(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.table_update_fn = Arc::new(f);
        self
    }

    pub fn host_name(&self) -> &str {
        &self.config.host_name
    }

    pub fn server_index(&self) -> usize {
        self.server_index.load(Ordering::Acquire)
    }

    pub fn server_addresses(&self) -> &[String] {
        &self.server_addrs
    }

    pub fn is_blocked(&self) -> bool {
        *self.blocked.borrow()
    }

    /// Version of the installed table; empty before the first update
    pub fn table_version(&self) -> String {
        self.tables.read().version.clone()
    }

    /// Start the connection loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.server_addrs.is_empty() {
            return Err(ClientError::NoServers);
        }
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Stopped);
        }
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(tokio::spawn(self.clone().connection_loop()));
        }
        Ok(())
    }

    /// Stop the connection loop, close the stream and release parked lookups
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Placement connection loop ended abnormally: {}", e);
            }
        }
        self.unblock_placements();
    }

    /// Park until the table is not blocked by a rebalance
    pub async fn wait_until_placement_table_is_ready(&self) {
        let mut rx = self.blocked.subscribe();
        let _ = rx.wait_for(|blocked| !*blocked).await;
    }

    /// Resolve an actor to `(host name, app id)`. Waits out an in-flight
    /// rebalance. Empty strings mean no host serves `actor_type`.
    pub async fn lookup_actor(&self, actor_type: &str, actor_id: &str) -> (String, String) {
        self.wait_until_placement_table_is_ready().await;
        self.resolve(actor_type, actor_id)
            .unwrap_or_else(|| (String::new(), String::new()))
    }

    /// Resolve against the installed table without waiting
    pub fn resolve(&self, actor_type: &str, actor_id: &str) -> Option<(String, String)> {
        let tables = self.tables.read().clone();
        let ring = tables.entries.get(actor_type)?;
        ring.get_host(actor_id)
            .ok()
            .map(|host| (host.name.clone(), host.app_id.clone()))
    }

    pub(crate) fn block_placements(&self) {
        self.blocked.send_if_modified(|blocked| {
            let changed = !*blocked;
            *blocked = true;
            changed
        });
    }

    pub(crate) fn unblock_placements(&self) {
        self.blocked.send_if_modified(|blocked| {
            let changed = *blocked;
            *blocked = false;
            changed
        });
    }

    /// Install `tables` unless that version is already installed.
    /// Returns true if the table was replaced.
    pub(crate) fn update_placements(&self, tables: &proto::PlacementTables) -> bool {
        {
            let mut current = self.tables.write();
            if current.version == tables.version {
                return false;
            }
            *current = Arc::new(ConsistentHashTables::from_proto(
                tables,
                self.config.replication_factor,
            ));
        }
        log::info!("Placement table updated to version {}", tables.version);
        (self.table_update_fn)();
        true
    }

    pub(crate) fn on_placement_order(&self, order: proto::PlacementOrder) {
        match order.op() {
            Some(Operation::Lock) => self.block_placements(),
            Some(Operation::Update) => match &order.tables {
                Some(tables) => {
                    self.update_placements(tables);
                }
                None => log::warn!("Placement update order without tables"),
            },
            Some(Operation::Unlock) => self.unblock_placements(),
            None => log::warn!("Unknown placement operation '{}'", order.operation),
        }
    }

    fn heartbeat(&self) -> proto::Host {
        proto::Host {
            name: self.config.host_name.clone(),
            load: 1,
            entities: self.config.entities.clone(),
            id: self.config.app_id.clone(),
            port: self.config.port,
        }
    }

    async fn connection_loop(self: Arc<Self>) {
        let servers = self.server_addrs.len();
        let mut backoff = INITIAL_BACKOFF;

        while !self.shutdown.is_cancelled() {
            let index = self.server_index.load(Ordering::Acquire) % servers;
            let address = &self.server_addrs[index];
            let started = tokio::time::Instant::now();

            match self.run_stream(address).await {
                Ok(()) => break,
                Err(e) => {
                    if e.is_retryable() {
                        log::debug!("Placement stream to {} ended: {}", address, e);
                    } else {
                        log::warn!("Placement stream to {} failed: {}", address, e);
                    }
                }
            }

            // A dropped leader means the table may be stale until the next one
            self.unblock_placements();
            self.server_index.store((index + 1) % servers, Ordering::Release);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = if started.elapsed() > self.config.max_backoff {
                INITIAL_BACKOFF
            } else {
                (backoff * 2).min(self.config.max_backoff)
            };
        }
        log::debug!("Placement connection loop stopped");
    }

    /// Drive one stream. `Ok` only when the client is stopping.
    async fn run_stream(&self, address: &str) -> Result<()> {
        let channel = endpoint_for(address, self.config.tls.as_ref())?
            .connect()
            .await?;
        let mut client = PlacementClient::new(channel);

        let (tx, rx) = mpsc::channel(1);
        let stream_cancel = self.shutdown.child_token();
        let heartbeats = tokio::spawn(heartbeat_loop(
            tx,
            self.heartbeat(),
            self.health_fn.clone(),
            self.config.heartbeat_interval,
            stream_cancel.clone(),
        ));

        let result = match client.report_app_status(ReceiverStream::new(rx)).await {
            Ok(response) => self.receive_orders(response.into_inner(), &stream_cancel).await,
            Err(status) => Err(status.into()),
        };

        stream_cancel.cancel();
        let _ = heartbeats.await;
        result
    }

    async fn receive_orders(
        &self,
        mut inbound: tonic::Streaming<proto::PlacementOrder>,
        stream_cancel: &CancellationToken,
    ) -> Result<()> {
        log::info!("Connected to placement leader at index {}", self.server_index());
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                msg = inbound.message() => Some(msg),
            };

            match next {
                Some(Ok(Some(order))) => self.on_placement_order(order),
                Some(Ok(None)) => return Err(ClientError::StreamClosed),
                Some(Err(status)) => return Err(status.into()),
                None => {
                    // Closing the request side lets the server remove this host
                    stream_cancel.cancel();
                    let drained = tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, async {
                        while let Ok(Some(order)) = inbound.message().await {
                            self.on_placement_order(order);
                        }
                    })
                    .await;
                    if drained.is_err() {
                        log::debug!("Placement server did not acknowledge stream close");
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn heartbeat_loop(
    tx: mpsc::Sender<proto::Host>,
    host: proto::Host,
    health_fn: HealthFn,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        if health_fn() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = tx.send(host.clone()) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_placement() -> ActorPlacement {
        ActorPlacement::new(PlacementClientConfig {
            addresses: vec!["127.0.0.1:50005".to_string()],
            host_name: "127.0.0.1:1000".to_string(),
            app_id: "testAppID".to_string(),
            entities: vec!["X".to_string()],
            replication_factor: 10,
            ..Default::default()
        })
    }

    fn table_with(version: &str, hosts: &[(&str, &str)]) -> proto::PlacementTables {
        let mut ring = placement_commons::Consistent::new(10);
        for (name, app) in hosts {
            ring.add(name, app, 0);
        }
        let mut tables = ConsistentHashTables {
            version: version.to_string(),
            ..Default::default()
        };
        tables.entries.insert("X".to_string(), ring);
        tables.to_proto()
    }

    #[tokio::test]
    async fn test_lookup_parks_while_locked() {
        let placement = Arc::new(test_placement());
        placement.on_placement_order(proto::PlacementOrder::update(table_with(
            "1",
            &[("127.0.0.1:2000", "appB")],
        )));

        placement.on_placement_order(proto::PlacementOrder::lock());
        assert!(placement.is_blocked());

        let p = placement.clone();
        let mut lookup = tokio::spawn(async move { p.lookup_actor("X", "id").await });

        let early = tokio::time::timeout(Duration::from_millis(50), &mut lookup).await;
        assert!(early.is_err(), "lookup returned while the table was locked");

        placement.on_placement_order(proto::PlacementOrder::unlock());
        let (host, app) = tokio::time::timeout(Duration::from_millis(50), lookup)
            .await
            .expect("lookup still parked after unlock")
            .unwrap();
        assert_eq!(host, "127.0.0.1:2000");
        assert_eq!(app, "appB");
    }

    #[tokio::test]
    async fn test_same_version_update_is_ignored() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let placement = test_placement().with_table_update(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let table = table_with("1", &[("127.0.0.1:2000", "appB")]);
        placement.on_placement_order(proto::PlacementOrder::update(table.clone()));
        placement.on_placement_order(proto::PlacementOrder::update(table));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(placement.table_version(), "1");
    }

    #[tokio::test]
    async fn test_unknown_actor_type_resolves_empty() {
        let placement = test_placement();
        placement.on_placement_order(proto::PlacementOrder::update(table_with(
            "3",
            &[("127.0.0.1:2000", "appB")],
        )));
        assert_eq!(
            placement.lookup_actor("Y", "id").await,
            (String::new(), String::new())
        );
    }

    #[tokio::test]
    async fn test_lookup_is_deterministic() {
        let placement = test_placement();
        placement.on_placement_order(proto::PlacementOrder::update(table_with(
            "1",
            &[("a:1", "appA"), ("b:2", "appB"), ("c:3", "appC")],
        )));
        for i in 0..50 {
            let id = i.to_string();
            let first = placement.lookup_actor("X", &id).await;
            assert_eq!(placement.lookup_actor("X", &id).await, first);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_unblock_is_safe() {
        let placement = Arc::new(test_placement());
        for _ in 0..10_000 {
            placement.block_placements();
            let (a, b) = (placement.clone(), placement.clone());
            let t1 = tokio::spawn(async move { a.unblock_placements() });
            let t2 = tokio::spawn(async move { b.unblock_placements() });
            t1.await.unwrap();
            t2.await.unwrap();
            assert!(!placement.is_blocked());
        }
        placement.wait_until_placement_table_is_ready().await;
    }

    #[tokio::test]
    async fn test_stop_releases_parked_lookups() {
        let placement = Arc::new(test_placement());
        placement.block_placements();

        let p = placement.clone();
        let lookup = tokio::spawn(async move { p.lookup_actor("X", "id").await });
        placement.stop().await;

        let result = tokio::time::timeout(Duration::from_millis(100), lookup).await;
        assert!(result.is_ok());
    }
}
