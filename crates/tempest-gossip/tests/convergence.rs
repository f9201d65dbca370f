//! End-to-end gossip tests over the in-memory transport:
//! - Two- and three-node state convergence through real rounds
//! - Application-state dissemination
//! - Restart detection via generation bumps
//! - Graceful shutdown announcements
//! - Shadow rounds for pre-join bootstrap

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempest_common::config::{FailureDetectorConfig, GossipConfig};
use tempest_gossip::{
    dispatch, ApplicationState, Gossiper, GossipTransport, InMemoryTransport, MemoryPeerStore,
    SingleDc, StaticTopology,
};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn fast_config(seeds: Vec<SocketAddr>) -> GossipConfig {
    GossipConfig {
        seeds,
        gossip_interval: Duration::from_millis(50),
        status_check_interval: Duration::from_millis(50),
        quarantine_delay: Duration::from_millis(200),
        shadow_round_wait: Duration::from_millis(500),
        ..GossipConfig::default()
    }
}

struct Node {
    gossiper: Arc<Gossiper>,
    transport: Arc<InMemoryTransport>,
}

fn make_node(port: u16, seeds: Vec<SocketAddr>, topology: Arc<StaticTopology>) -> Node {
    let local = addr(port);
    let transport = InMemoryTransport::new(local);
    let gossiper = Gossiper::new(
        local,
        fast_config(seeds),
        FailureDetectorConfig::default(),
        transport.clone(),
        topology,
        Arc::new(SingleDc),
        Arc::new(MemoryPeerStore::new()),
    );
    Node { gossiper, transport }
}

/// Route received messages through the verb handlers and send replies
/// back, the way a real transport server would.
async fn pump(node: &Node) {
    let gossiper = node.gossiper.clone();
    let transport = node.transport.clone();
    let mut rx = transport.take_receiver().await.expect("receiver taken twice");
    tokio::spawn(async move {
        while let Some((from, msg)) = rx.recv().await {
            if let Some(reply) = dispatch(&gossiper, from, msg) {
                let _ = transport.send_one_way(from, reply).await;
            }
        }
    });
}

fn converged(a: &Node, b: &Node) -> bool {
    a.gossiper.get_endpoint_state(b.gossiper.local_addr()).is_some()
        && b.gossiper.get_endpoint_state(a.gossiper.local_addr()).is_some()
        && a.gossiper.is_alive(b.gossiper.local_addr())
        && b.gossiper.is_alive(a.gossiper.local_addr())
}

async fn wait_until(mut probe: impl FnMut() -> bool, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    probe()
}

#[tokio::test]
async fn test_two_node_convergence() {
    let topology = Arc::new(StaticTopology::new());
    topology.add_member(addr(8000));
    topology.add_member(addr(8001));

    let a = make_node(8000, vec![addr(8001)], topology.clone());
    let b = make_node(8001, vec![addr(8000)], topology);
    a.transport.connect(&b.transport);
    pump(&a).await;
    pump(&b).await;

    a.gossiper.start(1, Vec::new()).unwrap();
    b.gossiper.start(1, Vec::new()).unwrap();

    assert!(
        wait_until(|| converged(&a, &b), Duration::from_secs(5)).await,
        "two nodes failed to converge"
    );

    let a_record_of_b = a.gossiper.get_endpoint_state(addr(8001)).unwrap();
    let b_own = b.gossiper.get_endpoint_state(addr(8001)).unwrap();
    assert_eq!(a_record_of_b.generation(), b_own.generation());
    assert!(a_record_of_b.max_version() > 0);
}

#[tokio::test]
async fn test_application_state_disseminates() {
    let topology = Arc::new(StaticTopology::new());
    topology.add_member(addr(8010));
    topology.add_member(addr(8011));

    let a = make_node(8010, vec![addr(8011)], topology.clone());
    let b = make_node(8011, vec![addr(8010)], topology);
    a.transport.connect(&b.transport);
    pump(&a).await;
    pump(&b).await;

    a.gossiper.start(1, Vec::new()).unwrap();
    b.gossiper.start(1, Vec::new()).unwrap();

    assert!(wait_until(|| a.gossiper.get_endpoint_state(addr(8011)).is_some(), Duration::from_secs(5)).await);

    a.gossiper
        .add_local_application_state(ApplicationState::Load, "0.73".to_string())
        .unwrap();

    let seen = wait_until(
        || {
            b.gossiper
                .get_endpoint_state(addr(8010))
                .and_then(|s| s.application_state(ApplicationState::Load).map(|v| v.value.clone()))
                .as_deref()
                == Some("0.73")
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(seen, "application state never reached the peer");
}

#[tokio::test]
async fn test_three_node_transitive_discovery() {
    // C only knows B; it must learn about A transitively
    let topology = Arc::new(StaticTopology::new());
    for port in [8020, 8021, 8022] {
        topology.add_member(addr(port));
    }

    let a = make_node(8020, vec![addr(8021)], topology.clone());
    let b = make_node(8021, vec![addr(8020)], topology.clone());
    let c = make_node(8022, vec![addr(8021)], topology);
    a.transport.connect(&b.transport);
    b.transport.connect(&c.transport);
    a.transport.connect(&c.transport);
    pump(&a).await;
    pump(&b).await;
    pump(&c).await;

    a.gossiper.start(1, Vec::new()).unwrap();
    b.gossiper.start(1, Vec::new()).unwrap();
    c.gossiper.start(1, Vec::new()).unwrap();

    let discovered = wait_until(
        || {
            c.gossiper.get_endpoint_state(addr(8020)).is_some()
                && a.gossiper.get_endpoint_state(addr(8022)).is_some()
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(discovered, "transitive discovery failed");
}

#[tokio::test]
async fn test_restart_adopts_new_generation() {
    let topology = Arc::new(StaticTopology::new());
    topology.add_member(addr(8030));
    topology.add_member(addr(8031));

    let a = make_node(8030, vec![addr(8031)], topology.clone());
    let b = make_node(8031, vec![addr(8030)], topology.clone());
    a.transport.connect(&b.transport);
    pump(&a).await;
    pump(&b).await;

    a.gossiper.start(1, Vec::new()).unwrap();
    b.gossiper.start(5, Vec::new()).unwrap();

    assert!(wait_until(
        || a.gossiper
            .get_endpoint_state(addr(8031))
            .map_or(false, |s| s.generation() == 5),
        Duration::from_secs(5)
    )
    .await);

    // B restarts with a higher generation on a fresh transport
    b.gossiper.stop().await;
    let b2 = make_node(8031, vec![addr(8030)], topology);
    a.transport.connect(&b2.transport);
    pump(&b2).await;
    b2.gossiper.start(6, Vec::new()).unwrap();

    let restarted = wait_until(
        || {
            a.gossiper
                .get_endpoint_state(addr(8031))
                .map_or(false, |s| s.generation() == 6)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(restarted, "restart generation never adopted");
}

#[tokio::test]
async fn test_graceful_shutdown_marks_peer_down() {
    let topology = Arc::new(StaticTopology::new());
    topology.add_member(addr(8040));
    topology.add_member(addr(8041));

    let a = make_node(8040, vec![addr(8041)], topology.clone());
    let b = make_node(8041, vec![addr(8040)], topology);
    a.transport.connect(&b.transport);
    pump(&a).await;
    pump(&b).await;

    a.gossiper.start(1, Vec::new()).unwrap();
    b.gossiper.start(1, Vec::new()).unwrap();

    assert!(wait_until(|| a.gossiper.is_alive(addr(8041)), Duration::from_secs(5)).await);

    b.gossiper.stop().await;

    let down = wait_until(|| !a.gossiper.is_alive(addr(8041)), Duration::from_secs(5)).await;
    assert!(down, "shutdown announcement never marked the peer down");
    let status = a
        .gossiper
        .get_endpoint_state(addr(8041))
        .and_then(|s| s.status());
    assert!(status.map_or(false, |s| s.is_shutdown()));
}

#[tokio::test]
async fn test_shadow_round_collects_without_joining() {
    let topology = Arc::new(StaticTopology::new());
    topology.add_member(addr(8050));

    let seed = make_node(8050, Vec::new(), topology.clone());
    pump(&seed).await;
    seed.gossiper.start(1, Vec::new()).unwrap();

    let joiner = make_node(8051, vec![addr(8050)], topology);
    seed.transport.connect(&joiner.transport);
    pump(&joiner).await;

    let states = joiner.gossiper.do_shadow_round().await.unwrap();
    assert!(states.contains_key(&addr(8050)));

    // nothing was applied to the joiner's own table
    assert!(joiner.gossiper.get_endpoint_state(addr(8050)).is_none());
    assert!(!joiner.gossiper.is_alive(addr(8050)));
}

#[tokio::test]
async fn test_shadow_round_times_out_without_seeds_answering() {
    let topology = Arc::new(StaticTopology::new());
    // the seed address exists in config but nothing is connected
    let joiner = make_node(8061, vec![addr(8060)], topology);
    pump(&joiner).await;

    let result = joiner.gossiper.do_shadow_round().await;
    assert!(result.is_err());
}
