//! Raft node integration tests
//!
//! Real openraft instances talking over the gRPC transport on loopback.
//! Each test uses its own port range.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use placement_raft::{
    CommandExecutor, Command, Member, PeerConfig, PlacementFsm, RaftExecutor, RaftNode,
    RaftNodeConfig,
};

// =============================================================================
// Helpers
// =============================================================================

fn node_config(id: &str, peers: &[(&str, u16)]) -> RaftNodeConfig {
    RaftNodeConfig {
        id: id.to_string(),
        peers: peers
            .iter()
            .map(|(peer, port)| PeerConfig::new(*peer, format!("127.0.0.1:{}", port)))
            .collect(),
        replication_factor: 10,
        ..Default::default()
    }
}

async fn wait_for_leader(nodes: &[Arc<RaftNode>], timeout: Duration) -> Option<Arc<RaftNode>> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(leader) = nodes.iter().find(|n| n.is_leader()) {
            return Some(leader.clone());
        }
        sleep(Duration::from_millis(50)).await;
    }
    None
}

async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    check()
}

fn dog_cat_host(name: &str) -> Member {
    Member::new(name, "appA", vec!["Dog".to_string(), "Cat".to_string()])
}

// =============================================================================
// Single node
// =============================================================================

#[tokio::test]
async fn test_single_node_becomes_leader_and_applies() {
    let config = node_config("solo", &[("solo", 18301)]);
    let fsm = Arc::new(PlacementFsm::new(config.replication_factor));
    let node = RaftNode::start(config, fsm.clone()).await.unwrap();

    let leader = wait_for_leader(&[node.clone()], Duration::from_secs(5)).await;
    assert!(leader.is_some(), "single node never became leader");
    assert_eq!(node.current_leader(), Some(node.node_id()));

    let executor = RaftExecutor::new(node.clone(), Duration::from_secs(5));
    let resp = executor
        .execute(Command::Upsert(dog_cat_host("127.0.0.1:50102")))
        .await
        .unwrap();
    assert!(resp.updated);
    assert_eq!(fsm.member_count(), 1);
    assert_eq!(fsm.table_generation(), 1);

    // Same placement again only refreshes UpdatedAt
    let resp = executor
        .execute(Command::Upsert(dog_cat_host("127.0.0.1:50102")))
        .await
        .unwrap();
    assert!(!resp.updated);
    assert_eq!(fsm.table_generation(), 1);

    // Disseminate advances the index only
    let index_before = fsm.index();
    executor.execute(Command::Disseminate).await.unwrap();
    assert!(fsm.index() > index_before);
    assert_eq!(fsm.table_generation(), 1);

    executor
        .execute(Command::Remove("127.0.0.1:50102".to_string()))
        .await
        .unwrap();
    assert_eq!(fsm.member_count(), 0);
    assert_eq!(fsm.table_generation(), 2);

    executor.shutdown().await.unwrap();
    assert!(!node.is_leader());
}

#[tokio::test]
async fn test_leadership_watch_reports_transition() {
    let config = node_config("watcher", &[("watcher", 18311)]);
    let fsm = Arc::new(PlacementFsm::new(config.replication_factor));
    let node = RaftNode::start(config, fsm).await.unwrap();

    let mut changes = node.leadership_changes();
    let became_leader = tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|l| *l))
        .await
        .is_ok();
    assert!(became_leader);

    node.shutdown().await.unwrap();
    assert!(!*node.leadership_changes().borrow());
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config("durable", &[("durable", 18321)]);
    config.log_store_path = Some(dir.path().to_path_buf());

    {
        let fsm = Arc::new(PlacementFsm::new(config.replication_factor));
        let node = RaftNode::start(config.clone(), fsm.clone()).await.unwrap();
        assert!(wait_for_leader(&[node.clone()], Duration::from_secs(5)).await.is_some());
        node.apply_command(&Command::Upsert(dog_cat_host("127.0.0.1:7001")), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fsm.member_count(), 1);
        node.shutdown().await.unwrap();
    }

    // Port may linger briefly after shutdown
    sleep(Duration::from_millis(200)).await;

    let fsm = Arc::new(PlacementFsm::new(config.replication_factor));
    let node = RaftNode::start(config, fsm.clone()).await.unwrap();
    assert!(wait_for_leader(&[node.clone()], Duration::from_secs(5)).await.is_some());
    assert!(wait_until(|| fsm.member_count() == 1, Duration::from_secs(5)).await);
    assert!(fsm.member("127.0.0.1:7001").is_some());
    node.shutdown().await.unwrap();
}

// =============================================================================
// Three nodes
// =============================================================================

#[tokio::test]
async fn test_three_node_replication_and_follower_rejection() {
    let peers = [("n0", 18331), ("n1", 18332), ("n2", 18333)];
    let fsms: Vec<Arc<PlacementFsm>> = (0..3).map(|_| Arc::new(PlacementFsm::new(100))).collect();

    let (a, b, c) = tokio::join!(
        RaftNode::start(node_config("n0", &peers), fsms[0].clone()),
        RaftNode::start(node_config("n1", &peers), fsms[1].clone()),
        RaftNode::start(node_config("n2", &peers), fsms[2].clone()),
    );
    let nodes = vec![a.unwrap(), b.unwrap(), c.unwrap()];

    let leader = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .expect("no leader elected");

    for host in ["h1:1", "h2:2", "h3:3"] {
        leader
            .apply_command(
                &Command::Upsert(Member::new(host, "app", vec!["X".to_string()])),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
    }

    for fsm in &fsms {
        let fsm = fsm.clone();
        assert!(wait_until(move || fsm.member_count() == 3, Duration::from_secs(5)).await);
    }

    // Every replica builds the identical ring
    let rings: Vec<Vec<u64>> = fsms
        .iter()
        .map(|f| f.ring("X").unwrap().sorted_set().to_vec())
        .collect();
    assert_eq!(rings[0], rings[1]);
    assert_eq!(rings[1], rings[2]);

    let follower = nodes.iter().find(|n| !n.is_leader()).unwrap();
    let err = follower
        .apply_command(&Command::Disseminate, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(tonic::Status::from(err).code(), tonic::Code::FailedPrecondition);

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
}
