//! Rebalance draining driven by real placement table updates

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use placement_actors::{placement_with_rebalancing, ActiveActors};
use placement_client::PlacementClientConfig;
use placement_raft::{Command, CommandExecutor, DirectExecutor, Member, PlacementFsm};
use placement_service::{PlacementService, PlacementServiceConfig};

// =============================================================================
// Helpers
// =============================================================================

const LOCAL_HOST: &str = "127.0.0.1:1000";

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

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_new_host_drains_moved_actors() {
    let fsm = Arc::new(PlacementFsm::new(100));
    let executor = Arc::new(DirectExecutor::new(fsm.clone()));
    let config = PlacementServiceConfig {
        heartbeat_interval: Duration::from_millis(100),
        dissemination_interval: Duration::from_millis(100),
        drain_grace: Duration::from_millis(10),
        faulty_host_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let service = PlacementService::start(executor.clone(), config).unwrap();
    let listener = TcpListener::bind(("127.0.0.1", 18601)).await.unwrap();
    let shutdown = CancellationToken::new();
    let (svc, token) = (service.clone(), shutdown.clone());
    tokio::spawn(async move { svc.serve_with_listener(listener, None, token).await });

    let actors = Arc::new(ActiveActors::new(LOCAL_HOST, Duration::from_secs(1)));
    let placement = placement_with_rebalancing(
        PlacementClientConfig {
            addresses: vec!["127.0.0.1:18601".to_string()],
            host_name: LOCAL_HOST.to_string(),
            app_id: "appA".to_string(),
            port: 1000,
            entities: vec!["Dog".to_string()],
            heartbeat_interval: Duration::from_millis(100),
            replication_factor: 100,
            max_backoff: Duration::from_millis(200),
            tls: None,
        },
        actors.clone(),
    );
    placement.start().unwrap();

    let p = placement.clone();
    assert!(wait_until(move || p.table_version() == "1", Duration::from_secs(3)).await);

    let mut activated = Vec::new();
    for i in 0..20 {
        let id = format!("dog-{}", i);
        let (host, _) = placement.lookup_actor("Dog", &id).await;
        assert_eq!(host, LOCAL_HOST);
        activated.push(actors.get_or_create("Dog", &id));
    }
    assert_eq!(actors.len(), 20);

    // A second Dog host joins; part of the key space moves to it
    executor
        .execute(Command::Upsert(Member::new(
            "127.0.0.1:2000",
            "appB",
            vec!["Dog".to_string()],
        )))
        .await
        .unwrap();

    let p = placement.clone();
    assert!(wait_until(move || p.table_version() == "2", Duration::from_secs(3)).await);
    let a = actors.clone();
    assert!(wait_until(move || a.len() < 20, Duration::from_secs(2)).await);

    for actor in &activated {
        let (host, _) = placement.resolve("Dog", actor.actor_id()).unwrap();
        if host == LOCAL_HOST {
            assert!(!actor.is_disposed());
            assert!(actors.get("Dog", actor.actor_id()).is_some());
        } else {
            assert!(wait_until(|| actor.is_disposed(), Duration::from_secs(1)).await);
            assert!(actors.get("Dog", actor.actor_id()).is_none());
        }
    }

    placement.stop().await;
    shutdown.cancel();
    service.shutdown().await;
}
