//! Collaborator seams: the point-to-point message transport and the
//! topology/locality/peer-storage hooks the engine consumes.
//!
//! The wire framing itself lives outside this crate; production code
//! implements `GossipTransport` over its messaging layer, tests use the
//! channel-backed `InMemoryTransport`.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempest_common::prelude::*;
use tokio::sync::{mpsc, Mutex as TokioMutex};

use crate::messages::GossipMessage;

/// Current gossip wire-protocol version.
pub const PROTOCOL_VERSION: u32 = 2;

/// First protocol version that answers ECHO; peers older than this are
/// marked alive without the round-trip confirmation.
pub const ECHO_PROTOCOL_VERSION: u32 = 2;

/// Point-to-point message facility. Sends are fire-and-forget from the
/// protocol's point of view; only `echo` waits, and that wait is
/// bounded by the caller.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Best-effort one-way send. Failures are reported but the engine
    /// never retries; the next round re-attempts naturally.
    async fn send_one_way(&self, to: SocketAddr, msg: GossipMessage) -> Result<()>;

    /// Round-trip ECHO confirming the direct link to `to` works, bounded
    /// by `timeout`.
    async fn echo(&self, to: SocketAddr, timeout: Duration) -> Result<()>;

    /// Advertised wire-protocol version of a peer, if known.
    fn protocol_version(&self, _to: SocketAddr) -> Option<u32> {
        Some(PROTOCOL_VERSION)
    }
}

/// Ring-membership predicate supplied by topology code outside this
/// crate: whether an address is a current ring member, and whether it
/// owns tokens (a gossip participant without tokens is a fat client).
pub trait RingTopology: Send + Sync {
    fn is_member(&self, addr: SocketAddr) -> bool;
    fn owns_tokens(&self, addr: SocketAddr) -> bool;
}

/// Pluggable "datacenter-local" classifier; used to prefer a local-DC
/// seed when several are configured.
pub trait LocalityProbe: Send + Sync {
    fn is_local_dc(&self, addr: SocketAddr) -> bool;
}

/// Node-storage callbacks: the engine reports peers worth persisting
/// and peers that have been evicted.
pub trait PeerStore: Send + Sync {
    fn save_peer(&self, addr: SocketAddr);
    fn forget_peer(&self, addr: SocketAddr);
}

/// Topology with explicitly registered members and token owners.
#[derive(Default)]
pub struct StaticTopology {
    members: DashSet<SocketAddr>,
    token_owners: DashSet<SocketAddr>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, addr: SocketAddr) {
        self.members.insert(addr);
        self.token_owners.insert(addr);
    }

    pub fn add_tokenless_member(&self, addr: SocketAddr) {
        self.members.insert(addr);
    }

    pub fn remove_member(&self, addr: SocketAddr) {
        self.members.remove(&addr);
        self.token_owners.remove(&addr);
    }
}

impl RingTopology for StaticTopology {
    fn is_member(&self, addr: SocketAddr) -> bool {
        self.members.contains(&addr)
    }

    fn owns_tokens(&self, addr: SocketAddr) -> bool {
        self.token_owners.contains(&addr)
    }
}

/// Everything is local.
pub struct SingleDc;

impl LocalityProbe for SingleDc {
    fn is_local_dc(&self, _addr: SocketAddr) -> bool {
        true
    }
}

/// Peer store that remembers nothing.
pub struct NullPeerStore;

impl PeerStore for NullPeerStore {
    fn save_peer(&self, _addr: SocketAddr) {}
    fn forget_peer(&self, _addr: SocketAddr) {}
}

/// In-memory peer store for tests.
#[derive(Default)]
pub struct MemoryPeerStore {
    peers: DashSet<SocketAddr>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.peers.contains(&addr)
    }
}

impl PeerStore for MemoryPeerStore {
    fn save_peer(&self, addr: SocketAddr) {
        self.peers.insert(addr);
    }

    fn forget_peer(&self, addr: SocketAddr) {
        self.peers.remove(&addr);
    }
}

type Inbox = mpsc::Sender<(SocketAddr, GossipMessage)>;

/// In-memory transport for testing: nodes connect pairwise and
/// messages flow over tokio channels. Partitions can be injected per
/// destination to exercise unreachable/dead paths.
pub struct InMemoryTransport {
    local: SocketAddr,
    peers: DashMap<SocketAddr, Inbox>,
    partitioned: DashSet<SocketAddr>,
    sender: Inbox,
    receiver: TokioMutex<Option<mpsc::Receiver<(SocketAddr, GossipMessage)>>>,
}

impl InMemoryTransport {
    pub fn new(local: SocketAddr) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(1000);
        Arc::new(Self {
            local,
            peers: DashMap::new(),
            partitioned: DashSet::new(),
            sender,
            receiver: TokioMutex::new(Some(receiver)),
        })
    }

    /// Wire two transports together, both directions.
    pub fn connect(&self, other: &InMemoryTransport) {
        self.peers.insert(other.local, other.sender.clone());
        other.peers.insert(self.local, self.sender.clone());
    }

    /// Drop the link to `addr`: sends fail, echoes time out.
    pub fn partition(&self, addr: SocketAddr) {
        self.partitioned.insert(addr);
    }

    pub fn heal(&self, addr: SocketAddr) {
        self.partitioned.remove(&addr);
    }

    /// Take the incoming-message receiver; the owner pumps it into the
    /// gossiper's inbox.
    pub async fn take_receiver(&self) -> Option<mpsc::Receiver<(SocketAddr, GossipMessage)>> {
        self.receiver.lock().await.take()
    }
}

#[async_trait]
impl GossipTransport for InMemoryTransport {
    async fn send_one_way(&self, to: SocketAddr, msg: GossipMessage) -> Result<()> {
        if self.partitioned.contains(&to) {
            return Err(Error::internal(format!("partitioned from {to}")));
        }
        let sender = self
            .peers
            .get(&to)
            .map(|s| s.clone())
            .ok_or_else(|| Error::internal(format!("no route to {to}")))?;
        sender
            .send((self.local, msg))
            .await
            .map_err(|_| Error::internal(format!("{to} inbox closed")))
    }

    async fn echo(&self, to: SocketAddr, _timeout: Duration) -> Result<()> {
        if self.partitioned.contains(&to) || !self.peers.contains_key(&to) {
            return Err(Error::timeout(format!("echo to {to}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_send_and_receive() {
        let t1 = InMemoryTransport::new(addr(7000));
        let t2 = InMemoryTransport::new(addr(7001));
        t1.connect(&t2);

        t1.send_one_way(addr(7001), GossipMessage::Echo).await.unwrap();

        let mut rx = t2.take_receiver().await.unwrap();
        let (from, msg) = rx.recv().await.unwrap();
        assert_eq!(from, addr(7000));
        assert_eq!(msg.verb(), "ECHO");
    }

    #[tokio::test]
    async fn test_partition_blocks_sends_and_echo() {
        let t1 = InMemoryTransport::new(addr(7000));
        let t2 = InMemoryTransport::new(addr(7001));
        t1.connect(&t2);

        t1.partition(addr(7001));
        assert!(t1.send_one_way(addr(7001), GossipMessage::Echo).await.is_err());
        assert!(t1.echo(addr(7001), Duration::from_secs(1)).await.is_err());

        t1.heal(addr(7001));
        assert!(t1.echo(addr(7001), Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_destination_errors() {
        let t1 = InMemoryTransport::new(addr(7000));
        assert!(t1.send_one_way(addr(9999), GossipMessage::Shutdown).await.is_err());
    }

    #[test]
    fn test_static_topology() {
        let topo = StaticTopology::new();
        topo.add_member(addr(1));
        topo.add_tokenless_member(addr(2));

        assert!(topo.is_member(addr(1)));
        assert!(topo.owns_tokens(addr(1)));
        assert!(topo.is_member(addr(2)));
        assert!(!topo.owns_tokens(addr(2)));
        assert!(!topo.is_member(addr(3)));
    }
}
