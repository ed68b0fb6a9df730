//! Placement service stream tests
//!
//! A real tonic server on loopback backed by an in-process state machine.
//! Each test uses its own port.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::Streaming;

use placement_commons::proto::{placement_client::PlacementClient, Host, Operation, PlacementOrder};
use placement_raft::{DirectExecutor, PlacementFsm};
use placement_service::{PlacementService, PlacementServiceConfig};

// =============================================================================
// Helpers
// =============================================================================

struct TestServer {
    executor: Arc<DirectExecutor>,
    fsm: Arc<PlacementFsm>,
    service: Arc<PlacementService>,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn stop(self) {
        self.shutdown.cancel();
        self.service.shutdown().await;
    }
}

fn fast_config() -> PlacementServiceConfig {
    PlacementServiceConfig {
        heartbeat_interval: Duration::from_millis(100),
        dissemination_interval: Duration::from_millis(100),
        drain_grace: Duration::from_millis(10),
        faulty_host_timeout: Duration::from_millis(600),
        membership_batch_window: Duration::from_millis(2),
        membership_channel_capacity: 100,
    }
}

async fn start_server(port: u16) -> TestServer {
    let fsm = Arc::new(PlacementFsm::new(100));
    let executor = Arc::new(DirectExecutor::new(fsm.clone()));
    let service = PlacementService::start(executor.clone(), fast_config()).unwrap();

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let shutdown = CancellationToken::new();
    let (svc, token) = (service.clone(), shutdown.clone());
    tokio::spawn(async move { svc.serve_with_listener(listener, None, token).await });

    assert!(wait_until(|| service.has_leadership(), Duration::from_secs(2)).await);
    TestServer {
        executor,
        fsm,
        service,
        shutdown,
    }
}

async fn connect(port: u16) -> (mpsc::Sender<Host>, Streaming<PlacementOrder>) {
    let channel = Endpoint::from_shared(format!("http://127.0.0.1:{}", port))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = PlacementClient::new(channel);
    let (tx, rx) = mpsc::channel(8);
    let response = client.report_app_status(ReceiverStream::new(rx)).await.unwrap();
    (tx, response.into_inner())
}

fn host(name: &str, entities: &[&str]) -> Host {
    Host {
        name: name.to_string(),
        load: 1,
        entities: entities.iter().map(|e| e.to_string()).collect(),
        id: "appA".to_string(),
        port: 0,
    }
}

async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Read orders until an `update` with `version` completes its cycle,
/// checking lock → update → unlock ordering along the way.
async fn wait_for_version(orders: &mut Streaming<PlacementOrder>, version: &str) -> PlacementOrder {
    let mut last_op: Option<Operation> = None;
    let mut matched: Option<PlacementOrder> = None;
    loop {
        let order = tokio::time::timeout(Duration::from_secs(3), orders.message())
            .await
            .expect("no placement order")
            .unwrap()
            .expect("stream closed");
        let op = order.op().unwrap();
        match op {
            Operation::Lock => assert_ne!(last_op, Some(Operation::Lock)),
            Operation::Update => assert_eq!(last_op, Some(Operation::Lock)),
            Operation::Unlock => {
                assert_eq!(last_op, Some(Operation::Update));
                if let Some(update) = matched.take() {
                    return update;
                }
            }
        }
        if op == Operation::Update
            && order.tables.as_ref().map(|t| t.version.as_str()) == Some(version)
        {
            matched = Some(order.clone());
        }
        last_op = Some(op);
    }
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn test_register_then_graceful_close() {
    let server = start_server(18401).await;
    let (tx, mut orders) = connect(18401).await;

    tx.send(host("127.0.0.1:50102", &["Dog", "Cat"])).await.unwrap();

    let fsm = server.fsm.clone();
    assert!(
        wait_until(
            || fsm.member_count() == 1 && fsm.table_generation() == 1,
            Duration::from_millis(300)
        )
        .await
    );
    assert_eq!(server.service.stream_count(), 1);

    let update = wait_for_version(&mut orders, "1").await;
    let tables = update.tables.unwrap();
    assert!(tables.entries.contains_key("Dog"));
    assert!(tables.entries.contains_key("Cat"));
    assert_eq!(tables.entries["Dog"].sorted_set.len(), 100);

    // Closing the request stream removes the host
    drop(tx);
    let fsm = server.fsm.clone();
    assert!(
        wait_until(
            || fsm.member_count() == 0 && fsm.table_generation() == 2,
            Duration::from_millis(500)
        )
        .await
    );
    assert!(wait_until(|| server.service.stream_count() == 0, Duration::from_millis(500)).await);

    server.stop().await;
}

#[tokio::test]
async fn test_non_actor_host_is_not_a_member() {
    let server = start_server(18402).await;
    let (tx, _orders) = connect(18402).await;

    tx.send(host("127.0.0.1:50104", &[])).await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert_eq!(server.fsm.member_count(), 0);
    assert_eq!(server.fsm.table_generation(), 0);
    assert_eq!(server.service.stream_count(), 1);

    server.stop().await;
}

// =============================================================================
// Leadership
// =============================================================================

#[tokio::test]
async fn test_follower_rejects_heartbeat() {
    let server = start_server(18403).await;
    server.executor.set_leader(false);
    assert!(wait_until(|| !server.service.has_leadership(), Duration::from_secs(1)).await);

    let (tx, mut orders) = connect(18403).await;
    tx.send(host("127.0.0.1:50102", &["Dog"])).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(2), orders.message())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    assert_eq!(server.fsm.member_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_losing_leadership_closes_streams() {
    let server = start_server(18404).await;
    let (tx, mut orders) = connect(18404).await;

    tx.send(host("127.0.0.1:50102", &["Dog"])).await.unwrap();
    let fsm = server.fsm.clone();
    assert!(wait_until(|| fsm.member_count() == 1, Duration::from_millis(500)).await);

    server.executor.set_leader(false);

    let status = loop {
        match tokio::time::timeout(Duration::from_secs(2), orders.message())
            .await
            .unwrap()
        {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("stream ended without a status"),
            Err(status) => break status,
        }
    };
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    assert_eq!(server.service.stream_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_closed_streams_let_the_server_stop_and_keep_members() {
    let server = start_server(18406).await;

    // A second server on its own token, as used for a credential reload
    let listener = TcpListener::bind(("127.0.0.1", 18407)).await.unwrap();
    let reload = CancellationToken::new();
    let (svc, token) = (server.service.clone(), reload.clone());
    let serving = tokio::spawn(async move { svc.serve_with_listener(listener, None, token).await });

    let (tx, mut orders) = connect(18407).await;
    tx.send(host("127.0.0.1:50106", &["Dog"])).await.unwrap();
    let fsm = server.fsm.clone();
    assert!(wait_until(|| fsm.member_count() == 1, Duration::from_millis(500)).await);
    let service = server.service.clone();
    assert!(wait_until(|| service.stream_count() == 1, Duration::from_millis(500)).await);

    reload.cancel();
    assert_eq!(server.service.close_streams("credentials rotated"), 1);

    let status = loop {
        match tokio::time::timeout(Duration::from_secs(2), orders.message())
            .await
            .unwrap()
        {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("stream ended without a status"),
            Err(status) => break status,
        }
    };
    assert_eq!(status.code(), tonic::Code::Unavailable);

    // The host keeps its slot until it reconnects or is swept
    assert_eq!(server.fsm.member_count(), 1);

    let stopped = tokio::time::timeout(Duration::from_secs(3), serving).await;
    assert!(stopped.is_ok());

    drop(tx);
    server.stop().await;
}

// =============================================================================
// Faulty hosts
// =============================================================================

#[tokio::test]
async fn test_silent_host_is_swept() {
    let server = start_server(18405).await;
    let (tx, mut orders) = connect(18405).await;

    tx.send(host("127.0.0.1:50105", &["Dog"])).await.unwrap();
    let fsm = server.fsm.clone();
    assert!(wait_until(|| fsm.member_count() == 1, Duration::from_millis(500)).await);

    // No further heartbeats; the stream stays open
    let fsm = server.fsm.clone();
    assert!(wait_until(|| fsm.member_count() == 0, Duration::from_secs(3)).await);
    assert_eq!(server.fsm.table_generation(), 2);

    // The swept stream is closed by the server
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match orders.message().await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    drop(tx);
    server.stop().await;
}
