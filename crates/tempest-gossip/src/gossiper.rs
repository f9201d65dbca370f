//! The gossip digest protocol engine.
//!
//! Owns the peer table, runs periodic SYN/ACK/ACK2 rounds, merges
//! remote state, and drives failure-detector convictions into
//! membership transitions. One round per `gossip_interval`; an
//! independent status sweep interprets phi for every peer and evicts
//! what has expired.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempest_common::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::failure_detector::{FailureDetectionEventListener, FailureDetector};
use crate::handlers;
use crate::messages::{sort_by_staleness, GossipDigest, GossipMessage};
use crate::state::{ApplicationState, EndpointState, HeartBeatState, VersionedValue};
use crate::status::NodeStatus;
use crate::transport::{GossipTransport, LocalityProbe, PeerStore, RingTopology, ECHO_PROTOCOL_VERSION};

/// Expire horizon applied when a node is administratively removed or
/// assassinated: its tombstone record survives this long.
const VERY_LONG_TIME_MS: i64 = 3 * 24 * 3600 * 1000;

/// Receives membership and state-change notifications. Fan-out is
/// synchronous on the merging thread; implementations must be fast,
/// non-blocking, and safe to call concurrently.
pub trait EndpointStateChangeSubscriber: Send + Sync {
    fn on_join(&self, _endpoint: SocketAddr, _state: &EndpointState) {}
    fn before_change(
        &self,
        _endpoint: SocketAddr,
        _current: &EndpointState,
        _key: ApplicationState,
        _new_value: &VersionedValue,
    ) {
    }
    fn on_change(&self, _endpoint: SocketAddr, _key: ApplicationState, _value: &VersionedValue) {}
    fn on_alive(&self, _endpoint: SocketAddr, _state: &EndpointState) {}
    fn on_dead(&self, _endpoint: SocketAddr, _state: &EndpointState) {}
    fn on_remove(&self, _endpoint: SocketAddr) {}
    /// The peer was seen with a new generation: it has very definitely
    /// restarted. Carries the superseded state.
    fn on_restart(&self, _endpoint: SocketAddr, _old_state: &EndpointState) {}
}

/// Routes failure-detector convictions back into the engine.
struct ConvictionHook {
    gossiper: Weak<Gossiper>,
}

impl FailureDetectionEventListener for ConvictionHook {
    fn convict(&self, endpoint: SocketAddr, phi: f64) {
        if let Some(gossiper) = self.gossiper.upgrade() {
            gossiper.convict(endpoint, phi);
        }
    }
}

/// The gossip engine. Explicitly constructed and shared by `Arc`;
/// there is no process-wide instance.
pub struct Gossiper {
    local_addr: SocketAddr,
    config: GossipConfig,
    version_gen: VersionGenerator,

    /// The single source of truth for membership.
    endpoints: DashMap<SocketAddr, EndpointState>,
    /// Peers confirmed up. Never contains the local address.
    live: DashSet<SocketAddr>,
    /// Peers marked down, with the instant they went down.
    unreachable: DashMap<SocketAddr, Instant>,
    /// Recently removed addresses and when their window lapses;
    /// gossip about them is ignored until then.
    quarantined: DashMap<SocketAddr, Instant>,
    /// Wall-clock expiry for terminal-status records.
    expire_times: DashMap<SocketAddr, i64>,

    subscribers: RwLock<Vec<Arc<dyn EndpointStateChangeSubscriber>>>,
    failure_detector: Arc<FailureDetector>,
    transport: Arc<dyn GossipTransport>,
    topology: Arc<dyn RingTopology>,
    locality: Arc<dyn LocalityProbe>,
    peer_store: Arc<dyn PeerStore>,

    /// Serializes the local heartbeat tick and local app-state writes
    /// so a concurrent round never reads the local record mid-update.
    task_lock: Mutex<()>,

    started: AtomicBool,
    shutdown: CancellationToken,
    in_shadow_round: AtomicBool,
    shadow_states: Mutex<HashMap<SocketAddr, EndpointState>>,

    incoming_tx: mpsc::Sender<(SocketAddr, GossipMessage)>,
    incoming_rx: tokio::sync::Mutex<Option<mpsc::Receiver<(SocketAddr, GossipMessage)>>>,

    clock_base: Instant,
}

impl Gossiper {
    pub fn new(
        local_addr: SocketAddr,
        config: GossipConfig,
        fd_config: FailureDetectorConfig,
        transport: Arc<dyn GossipTransport>,
        topology: Arc<dyn RingTopology>,
        locality: Arc<dyn LocalityProbe>,
        peer_store: Arc<dyn PeerStore>,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(1000);

        Arc::new(Self {
            local_addr,
            config,
            version_gen: VersionGenerator::new(),
            endpoints: DashMap::new(),
            live: DashSet::new(),
            unreachable: DashMap::new(),
            quarantined: DashMap::new(),
            expire_times: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            failure_detector: Arc::new(FailureDetector::new(fd_config)),
            transport,
            topology,
            locality,
            peer_store,
            task_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            in_shadow_round: AtomicBool::new(false),
            shadow_states: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(Some(incoming_rx)),
            clock_base: Instant::now(),
        })
    }

    /// Sender the transport layer pushes received messages into.
    pub fn incoming_sender(&self) -> mpsc::Sender<(SocketAddr, GossipMessage)> {
        self.incoming_tx.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn failure_detector(&self) -> &Arc<FailureDetector> {
        &self.failure_detector
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Install the local record at `generation`, preload application
    /// states, and spawn the round/status tasks.
    pub fn start(
        self: &Arc<Self>,
        generation: i32,
        preload: Vec<(ApplicationState, VersionedValue)>,
    ) -> Result<()> {
        self.config
            .validate()
            .map_err(|errs| Error::Config(errs.join("; ")))?;

        let mut local = EndpointState::new(HeartBeatState::new(generation));
        for (key, value) in preload {
            local.add_application_state(key, value);
        }
        local.set_alive(true);
        local.touch();
        self.endpoints.insert(self.local_addr, local);

        self.failure_detector.register_listener(Arc::new(ConvictionHook {
            gossiper: Arc::downgrade(self),
        }));
        self.started.store(true, Ordering::SeqCst);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });

        info!(local = %self.local_addr, generation, "gossip engine started");
        Ok(())
    }

    /// Broadcast SHUTDOWN to live members, then cancel the round task.
    pub async fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            let live: Vec<SocketAddr> = self.live.iter().map(|e| *e).collect();
            info!(peers = live.len(), "announcing shutdown to live members");
            let sends = live
                .into_iter()
                .map(|peer| self.transport.send_one_way(peer, GossipMessage::Shutdown));
            for result in futures::future::join_all(sends).await {
                if let Err(e) = result {
                    debug!(error = %e, "shutdown announcement failed");
                }
            }
        }
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.incoming_rx.lock().await.take() else {
            warn!("gossip engine already running");
            return;
        };
        let mut gossip_tick = tokio::time::interval(self.config.gossip_interval);
        let mut status_tick = tokio::time::interval(self.config.status_check_interval);

        loop {
            tokio::select! {
                _ = gossip_tick.tick() => {
                    // one bad round never kills future rounds
                    if let Err(e) = self.do_gossip_round().await {
                        warn!(error = %e, "gossip round failed");
                    }
                }
                _ = status_tick.tick() => {
                    self.status_check();
                }
                msg = rx.recv() => {
                    match msg {
                        Some((from, msg)) => {
                            trace!(%from, verb = msg.verb(), "received gossip message");
                            if let Some(reply) = handlers::dispatch(&self, from, msg) {
                                if let Err(e) = self.transport.send_one_way(from, reply).await {
                                    debug!(%from, error = %e, "gossip reply failed");
                                }
                            }
                        }
                        None => break,
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("gossip engine stopping");
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Round driving
    // ------------------------------------------------------------------

    async fn do_gossip_round(&self) -> Result<()> {
        {
            let _task = self.task_lock.lock();
            if let Some(mut local) = self.endpoints.get_mut(&self.local_addr) {
                local.heart_beat_state_mut().update_heart_beat(&self.version_gen);
            }
        }

        let digests = self.make_random_digests();
        if digests.is_empty() {
            return Ok(());
        }
        let syn = GossipMessage::Syn {
            cluster: self.config.cluster_name.clone(),
            partitioner: self.config.partitioner.clone(),
            digests,
        };

        // all randomness happens before the first await
        let live: Vec<SocketAddr> = self.live.iter().map(|e| *e).collect();
        let (live_target, unreachable_target, seed_target) = {
            let mut rng = rand::thread_rng();

            let live_target = live.choose(&mut rng).copied();

            let unreachable: Vec<SocketAddr> =
                self.unreachable.iter().map(|e| *e.key()).collect();
            let unreachable_target = if unreachable.is_empty() {
                None
            } else {
                let probability = unreachable.len() as f64 / (live.len() as f64 + 1.0);
                if rng.gen::<f64>() < probability {
                    unreachable.choose(&mut rng).copied()
                } else {
                    None
                }
            };

            // seeds must always eventually hear gossip, even when the
            // live graph never selects one
            let gossiped_to_seed =
                live_target.map_or(false, |t| self.config.seeds.contains(&t));
            let seed_target = if !gossiped_to_seed || live.len() < self.config.seeds.len() {
                self.pick_seed(&mut rng)
            } else {
                None
            };

            (live_target, unreachable_target, seed_target)
        };

        if let Some(target) = live_target {
            self.send_gossip(target, syn.clone()).await;
        }
        if let Some(target) = unreachable_target {
            self.send_gossip(target, syn.clone()).await;
        }
        if let Some(target) = seed_target {
            if Some(target) != live_target {
                self.send_gossip(target, syn).await;
            }
        }
        Ok(())
    }

    fn pick_seed(&self, rng: &mut impl Rng) -> Option<SocketAddr> {
        let candidates: Vec<SocketAddr> = self
            .config
            .seeds
            .iter()
            .copied()
            .filter(|s| *s != self.local_addr)
            .collect();
        let local_dc: Vec<SocketAddr> = candidates
            .iter()
            .copied()
            .filter(|s| self.locality.is_local_dc(*s))
            .collect();
        if !local_dc.is_empty() {
            local_dc.choose(rng).copied()
        } else {
            candidates.choose(rng).copied()
        }
    }

    async fn send_gossip(&self, target: SocketAddr, syn: GossipMessage) {
        trace!(%target, "sending gossip SYN");
        if let Err(e) = self.transport.send_one_way(target, syn).await {
            debug!(%target, error = %e, "gossip send failed");
        }
    }

    fn make_random_digests(&self) -> Vec<GossipDigest> {
        let mut digests: Vec<GossipDigest> = self
            .endpoints
            .iter()
            .map(|e| GossipDigest::new(*e.key(), e.generation(), e.max_version()))
            .collect();
        digests.shuffle(&mut rand::thread_rng());
        digests
    }

    fn local_max_version(&self, endpoint: SocketAddr) -> i64 {
        self.endpoints.get(&endpoint).map(|e| e.max_version()).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Protocol entry points (called from the verb handlers)
    // ------------------------------------------------------------------

    pub(crate) fn handle_syn(
        &self,
        from: SocketAddr,
        cluster: &str,
        partitioner: &str,
        digests: Vec<GossipDigest>,
    ) -> Option<GossipMessage> {
        if !self.started.load(Ordering::SeqCst) {
            debug!(%from, "dropping SYN, engine not started");
            return None;
        }
        if self.in_shadow_round.load(Ordering::SeqCst) {
            debug!(%from, "dropping SYN while in shadow round");
            return None;
        }
        if cluster != self.config.cluster_name {
            let err = GossipError::ClusterMismatch {
                ours: self.config.cluster_name.clone(),
                theirs: cluster.to_string(),
            };
            warn!(%from, error = %err, "dropping SYN");
            return None;
        }
        if partitioner != self.config.partitioner {
            let err = GossipError::PartitionerMismatch {
                ours: self.config.partitioner.clone(),
                theirs: partitioner.to_string(),
            };
            warn!(%from, error = %err, "dropping SYN");
            return None;
        }

        if digests.is_empty() {
            // shadow-round request: send everything we know
            debug!(%from, "replying to shadow round request with full state");
            let states: Vec<(SocketAddr, EndpointState)> = self
                .endpoints
                .iter()
                .map(|e| (*e.key(), e.clone()))
                .collect();
            return Some(GossipMessage::Ack { digests: Vec::new(), states });
        }

        let mut digests = digests;
        sort_by_staleness(&mut digests, |ep| self.local_max_version(ep));
        let (request_digests, send_states) = self.examine_digests(&digests);
        Some(GossipMessage::Ack {
            digests: request_digests,
            states: send_states,
        })
    }

    /// Per-digest comparison against local knowledge: what we must
    /// request (as residual digests) and what we can already send.
    fn examine_digests(
        &self,
        digests: &[GossipDigest],
    ) -> (Vec<GossipDigest>, Vec<(SocketAddr, EndpointState)>) {
        let mut request = Vec::new();
        let mut send = Vec::new();

        for digest in digests {
            match self.endpoints.get(&digest.endpoint) {
                None => {
                    // never heard of it: ask for everything
                    request.push(GossipDigest::new(digest.endpoint, digest.generation, 0));
                }
                Some(local) => {
                    let local_gen = local.generation();
                    let local_max = local.max_version();
                    if digest.generation > local_gen {
                        request.push(GossipDigest::new(digest.endpoint, digest.generation, 0));
                    } else if digest.generation < local_gen {
                        send.push((digest.endpoint, local.clone()));
                    } else if digest.max_version > local_max {
                        request.push(GossipDigest::new(digest.endpoint, digest.generation, local_max));
                    } else if digest.max_version < local_max {
                        if let Some(delta) = local.state_newer_than(digest.max_version) {
                            send.push((digest.endpoint, delta));
                        }
                    }
                    // equal on both: nothing to exchange
                }
            }
        }
        (request, send)
    }

    pub(crate) fn handle_ack(
        self: &Arc<Self>,
        from: SocketAddr,
        digests: Vec<GossipDigest>,
        states: Vec<(SocketAddr, EndpointState)>,
    ) -> Option<GossipMessage> {
        if self.in_shadow_round.load(Ordering::SeqCst) {
            debug!(%from, peers = states.len(), "shadow round complete");
            let mut shadow = self.shadow_states.lock();
            for (addr, state) in states {
                shadow.insert(addr, state);
            }
            self.in_shadow_round.store(false, Ordering::SeqCst);
            return None;
        }

        for (addr, state) in &states {
            self.notify_failure_detector(*addr, state);
        }
        self.apply_state_locally(states);

        let mut reply_states = Vec::new();
        for digest in &digests {
            if let Some(local) = self.endpoints.get(&digest.endpoint) {
                if let Some(delta) = local.state_newer_than(digest.max_version) {
                    reply_states.push((digest.endpoint, delta));
                }
            }
        }
        Some(GossipMessage::Ack2 { states: reply_states })
    }

    pub(crate) fn handle_ack2(self: &Arc<Self>, _from: SocketAddr, states: Vec<(SocketAddr, EndpointState)>) {
        for (addr, state) in &states {
            self.notify_failure_detector(*addr, state);
        }
        self.apply_state_locally(states);
    }

    pub(crate) fn handle_shutdown(&self, from: SocketAddr) {
        if !self.endpoints.contains_key(&from) {
            debug!(%from, "shutdown notice from unknown endpoint, ignoring");
            return;
        }
        self.mark_as_shutdown(from);
    }

    /// Graceful shutdown is certain, instantaneous death: pin the
    /// record so nothing in this generation supersedes it, then convict.
    fn mark_as_shutdown(&self, endpoint: SocketAddr) {
        info!(%endpoint, "marking endpoint as shut down");
        {
            let Some(mut state) = self.endpoints.get_mut(&endpoint) else {
                return;
            };
            state.add_application_state(
                NodeStatus::key(),
                VersionedValue::with_version(
                    i64::MAX,
                    NodeStatus::Shutdown { graceful: true }.to_string(),
                ),
            );
            state.heart_beat_state_mut().force_highest_possible_version();
        }
        if let Some(state) = self.get_endpoint_state(endpoint) {
            self.mark_dead(endpoint, state);
        }
        self.failure_detector.force_conviction(endpoint);
    }

    // ------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------

    fn notify_failure_detector(&self, endpoint: SocketAddr, remote: &EndpointState) {
        let Some(local) = self.endpoints.get(&endpoint) else {
            return;
        };
        let local_gen = local.generation();
        let remote_gen = remote.generation();
        if remote_gen > local_gen
            || (remote_gen == local_gen && remote.max_version() > local.max_version())
        {
            drop(local);
            self.failure_detector.report(endpoint, self.monotonic_nanos());
        }
    }

    /// The merge algorithm. Merges snapshot a peer's record, decide
    /// outside any guard, and re-validate the generation under the
    /// write guard before applying, so concurrent merges and restart
    /// installs for the same peer never interleave a write based on a
    /// stale generation. Unrelated peers' merges never serialize on a
    /// shared lock.
    pub(crate) fn apply_state_locally(
        self: &Arc<Self>,
        states: Vec<(SocketAddr, EndpointState)>,
    ) {
        for (endpoint, remote) in states {
            // a node never accepts gossip about itself
            if endpoint == self.local_addr {
                continue;
            }
            if self.is_quarantined(endpoint) {
                debug!(%endpoint, "ignoring gossip for quarantined endpoint");
                continue;
            }

            let local_gen = self.endpoints.get(&endpoint).map(|e| e.generation());
            match local_gen {
                None => {
                    self.failure_detector.report(endpoint, self.monotonic_nanos());
                    self.handle_major_state_change(endpoint, remote);
                }
                Some(local_gen) => {
                    let remote_gen = remote.generation();
                    if remote_gen
                        > local_gen.saturating_add(self.config.max_generation_difference)
                    {
                        warn!(
                            %endpoint, remote_gen, local_gen,
                            "ignoring implausible generation advance"
                        );
                    } else if remote_gen > local_gen {
                        self.handle_major_state_change(endpoint, remote);
                    } else if remote_gen == local_gen {
                        self.apply_new_states(endpoint, remote);
                    } else {
                        trace!(%endpoint, "ignoring state from stale generation");
                    }
                }
            }
        }
    }

    /// Same-generation merge: per-key max-version-wins. Updates are
    /// decided and notified in separate passes so subscribers never see
    /// a partially updated record; the write pass bails if the record
    /// was swapped to another generation after the decision snapshot.
    fn apply_new_states(self: &Arc<Self>, endpoint: SocketAddr, remote: EndpointState) {
        let (old_state, updates, heartbeat_newer) = {
            let Some(local) = self.endpoints.get(&endpoint) else {
                return;
            };
            let old = local.clone();
            let heartbeat_newer =
                remote.heart_beat_state().version() > old.heart_beat_state().version();
            let mut updates: Vec<(ApplicationState, VersionedValue)> = Vec::new();
            for (key, value) in remote.application_states() {
                let newer = old
                    .application_state(key)
                    .map_or(true, |current| value.version > current.version);
                if newer {
                    updates.push((key, value.clone()));
                }
            }
            (old, updates, heartbeat_newer)
        };

        if !heartbeat_newer && updates.is_empty() {
            // no-op merge: no timestamp refresh, no notifications
            return;
        }

        for (key, value) in &updates {
            for subscriber in self.subscribers.read().iter() {
                subscriber.before_change(endpoint, &old_state, *key, value);
            }
        }

        {
            let Some(mut local) = self.endpoints.get_mut(&endpoint) else {
                return;
            };
            // the record may have been replaced by a newer generation
            // between the snapshot and this guard; a stale merge must
            // never write over it
            if local.generation() != remote.generation() {
                debug!(
                    %endpoint,
                    merge_generation = remote.generation(),
                    stored_generation = local.generation(),
                    "record replaced during merge, discarding"
                );
                return;
            }
            if heartbeat_newer
                && remote.heart_beat_state().version() > local.heart_beat_state().version()
            {
                local.set_heart_beat_state(remote.heart_beat_state());
            }
            for (key, value) in &updates {
                let still_newer = local
                    .application_state(*key)
                    .map_or(true, |current| value.version > current.version);
                if still_newer {
                    local.add_application_state(*key, value.clone());
                }
            }
            local.touch();
        }

        for (key, value) in &updates {
            for subscriber in self.subscribers.read().iter() {
                subscriber.on_change(endpoint, *key, value);
            }
        }

        if let Some(state) = self.get_endpoint_state(endpoint) {
            if let Some(expire) = state.expire_time_ms() {
                self.expire_times.insert(endpoint, expire);
            }
            if !state.is_alive() && !state.is_dead_state() {
                self.mark_alive(endpoint, state);
            }
        }
    }

    /// Install a brand-new or restarted record: the entire previous
    /// state for the peer is superseded atomically. The swap happens
    /// under one entry guard and only while the incoming generation is
    /// still strictly newer, so a concurrent install of an even newer
    /// record is never clobbered.
    fn handle_major_state_change(self: &Arc<Self>, endpoint: SocketAddr, remote: EndpointState) {
        let mut incoming = remote;
        incoming.set_alive(false);
        incoming.touch();
        let snapshot = incoming.clone();

        let old_state = match self.endpoints.entry(endpoint) {
            Entry::Occupied(mut occupied) => {
                if incoming.generation() <= occupied.get().generation() {
                    debug!(
                        %endpoint,
                        incoming_generation = incoming.generation(),
                        stored_generation = occupied.get().generation(),
                        "newer record installed concurrently, discarding"
                    );
                    return;
                }
                Some(occupied.insert(incoming))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(incoming);
                None
            }
        };

        if let Some(ref old) = old_state {
            info!(
                %endpoint,
                old_generation = old.generation(),
                new_generation = snapshot.generation(),
                "endpoint has restarted"
            );
            for subscriber in self.subscribers.read().iter() {
                subscriber.on_restart(endpoint, old);
            }
            // a new generation resets the arrival history
            self.failure_detector.remove(endpoint);
            self.failure_detector.report(endpoint, self.monotonic_nanos());
        } else {
            debug!(%endpoint, generation = snapshot.generation(), "new endpoint discovered");
        }

        self.live.remove(&endpoint);
        self.unreachable.remove(&endpoint);
        self.peer_store.save_peer(endpoint);

        if let Some(expire) = snapshot.expire_time_ms() {
            self.expire_times.insert(endpoint, expire);
        }

        if snapshot.is_dead_state() {
            self.mark_dead(endpoint, snapshot.clone());
        } else {
            self.mark_alive(endpoint, snapshot.clone());
        }

        for subscriber in self.subscribers.read().iter() {
            subscriber.on_join(endpoint, &snapshot);
        }

        if snapshot.status().map_or(false, |s| s.is_shutdown()) {
            self.failure_detector.force_conviction(endpoint);
        }
    }

    // ------------------------------------------------------------------
    // Liveness transitions
    // ------------------------------------------------------------------

    /// Fresh data alone does not prove the direct link works: state may
    /// have arrived transitively. Current-protocol peers get alive only
    /// after an ECHO round-trip; older peers are granted it directly.
    fn mark_alive(self: &Arc<Self>, endpoint: SocketAddr, _state: EndpointState) {
        if self.live.contains(&endpoint) {
            return;
        }
        let needs_echo = self
            .transport
            .protocol_version(endpoint)
            .map_or(true, |v| v >= ECHO_PROTOCOL_VERSION);
        if !needs_echo {
            self.real_mark_alive(endpoint);
            return;
        }

        trace!(%endpoint, "confirming liveness with ECHO");
        let this = Arc::clone(self);
        let timeout = self.config.ring_delay;
        tokio::spawn(async move {
            match this.transport.echo(endpoint, timeout).await {
                Ok(()) => this.real_mark_alive(endpoint),
                Err(e) => debug!(%endpoint, error = %e, "echo failed, leaving endpoint down"),
            }
        });
    }

    fn real_mark_alive(&self, endpoint: SocketAddr) {
        {
            let Some(mut local) = self.endpoints.get_mut(&endpoint) else {
                return;
            };
            if local.is_alive() {
                return;
            }
            local.set_alive(true);
            local.touch();
        }
        self.unreachable.remove(&endpoint);
        self.live.insert(endpoint);
        info!(%endpoint, "endpoint is now UP");

        if let Some(state) = self.get_endpoint_state(endpoint) {
            for subscriber in self.subscribers.read().iter() {
                subscriber.on_alive(endpoint, &state);
            }
        }
    }

    fn mark_dead(&self, endpoint: SocketAddr, state: EndpointState) {
        {
            let Some(mut local) = self.endpoints.get_mut(&endpoint) else {
                return;
            };
            local.set_alive(false);
        }
        self.live.remove(&endpoint);
        self.unreachable.entry(endpoint).or_insert_with(Instant::now);
        info!(%endpoint, "endpoint is now DOWN");

        for subscriber in self.subscribers.read().iter() {
            subscriber.on_dead(endpoint, &state);
        }
    }

    /// Failure-detector conviction: mark the peer dead. Idempotent, so
    /// repeat convictions for a still-silent peer are harmless.
    fn convict(&self, endpoint: SocketAddr, phi: f64) {
        let Some(state) = self.get_endpoint_state(endpoint) else {
            return;
        };
        if !state.is_alive() {
            return;
        }
        debug!(%endpoint, phi, "convicting endpoint");
        self.mark_dead(endpoint, state);
    }

    // ------------------------------------------------------------------
    // Status sweep
    // ------------------------------------------------------------------

    fn status_check(&self) {
        let now_nanos = self.monotonic_nanos();
        let now_ms = Self::wall_millis();

        struct PeerView {
            endpoint: SocketAddr,
            is_alive: bool,
            silent_for: Duration,
            bootstrapping: bool,
            expire_time_ms: Option<i64>,
        }

        let peers: Vec<PeerView> = self
            .endpoints
            .iter()
            .filter(|e| *e.key() != self.local_addr)
            .map(|e| PeerView {
                endpoint: *e.key(),
                is_alive: e.is_alive(),
                silent_for: e.update_timestamp().elapsed(),
                bootstrapping: matches!(e.status(), Some(NodeStatus::Bootstrapping { .. })),
                expire_time_ms: self
                    .expire_times
                    .get(e.key())
                    .map(|x| *x)
                    .or_else(|| e.expire_time_ms()),
            })
            .collect();

        for peer in peers {
            self.failure_detector.interpret(peer.endpoint, now_nanos);

            let is_member = self.topology.is_member(peer.endpoint);

            // fat client: gossips but owns no tokens. Evict after
            // prolonged silence so coordinator-only nodes that left
            // without ceremony do not linger forever. A bootstrapping
            // peer can transiently look token-less and is exempt.
            let fat_client = !is_member
                && !self.topology.owns_tokens(peer.endpoint)
                && !peer.bootstrapping;
            if fat_client
                && !self.is_quarantined(peer.endpoint)
                && peer.silent_for > self.config.fat_client_timeout
            {
                info!(endpoint = %peer.endpoint, "evicting silent fat client");
                let _ = self.remove_endpoint(peer.endpoint);
                self.evict_from_membership(peer.endpoint);
                continue;
            }

            // dead non-members whose tombstone has expired
            if !peer.is_alive && !is_member {
                if let Some(expire) = peer.expire_time_ms {
                    if now_ms > expire {
                        info!(endpoint = %peer.endpoint, "evicting expired endpoint");
                        self.evict_from_membership(peer.endpoint);
                    }
                }
            }
        }

        let now = Instant::now();
        self.quarantined.retain(|endpoint, expiry| {
            let keep = *expiry > now;
            if !keep {
                debug!(%endpoint, "quarantine window elapsed");
            }
            keep
        });
    }

    fn evict_from_membership(&self, endpoint: SocketAddr) {
        self.live.remove(&endpoint);
        self.unreachable.remove(&endpoint);
        self.endpoints.remove(&endpoint);
        self.expire_times.remove(&endpoint);
        self.failure_detector.remove(endpoint);
        self.peer_store.forget_peer(endpoint);
        self.quarantine_endpoint(endpoint, self.config.quarantine_delay);
        debug!(%endpoint, "evicted from membership");
    }

    fn quarantine_endpoint(&self, endpoint: SocketAddr, delay: Duration) {
        self.quarantined.insert(endpoint, Instant::now() + delay);
    }

    pub fn is_quarantined(&self, endpoint: SocketAddr) -> bool {
        match self.quarantined.get(&endpoint) {
            Some(expiry) => *expiry > Instant::now(),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Administrative operations
    // ------------------------------------------------------------------

    /// Graceful departure: forget liveness, quarantine the address so
    /// transient re-gossip cannot resurrect it, but keep the record
    /// until the window lapses.
    pub fn remove_endpoint(&self, endpoint: SocketAddr) -> Result<()> {
        if endpoint == self.local_addr {
            return Err(Error::Gossip(GossipError::LocalEndpoint(endpoint)));
        }
        if !self.endpoints.contains_key(&endpoint) {
            return Err(Error::unknown_endpoint(endpoint));
        }

        for subscriber in self.subscribers.read().iter() {
            subscriber.on_remove(endpoint);
        }
        self.live.remove(&endpoint);
        self.unreachable.remove(&endpoint);
        if let Some(mut state) = self.endpoints.get_mut(&endpoint) {
            state.set_alive(false);
        }
        self.failure_detector.remove(endpoint);
        self.quarantine_endpoint(endpoint, self.config.quarantine_delay);
        self.peer_store.forget_peer(endpoint);
        info!(%endpoint, "removed endpoint");
        Ok(())
    }

    /// A new physical node took over this identity: evict immediately,
    /// then hold a double-length quarantine against resurrection.
    pub fn replaced_endpoint(&self, endpoint: SocketAddr) -> Result<()> {
        if !self.endpoints.contains_key(&endpoint) {
            return Err(Error::unknown_endpoint(endpoint));
        }
        for subscriber in self.subscribers.read().iter() {
            subscriber.on_remove(endpoint);
        }
        self.live.remove(&endpoint);
        self.unreachable.remove(&endpoint);
        self.endpoints.remove(&endpoint);
        self.expire_times.remove(&endpoint);
        self.failure_detector.remove(endpoint);
        self.peer_store.forget_peer(endpoint);
        self.quarantine_endpoint(endpoint, self.config.quarantine_delay * 2);
        info!(%endpoint, "replaced endpoint evicted with extended quarantine");
        Ok(())
    }

    /// Phase one of coordinator-driven removal of a third-party node:
    /// bump its generation locally so the new record outruns anything
    /// it last gossiped, and advertise REMOVING.
    pub fn advertise_removing(
        &self,
        endpoint: SocketAddr,
        host_id: HostId,
        coordinator: HostId,
    ) -> Result<()> {
        let mut state = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or_else(|| Error::unknown_endpoint(endpoint))?;
        state.heart_beat_state_mut().force_newer_generation();
        state.add_application_state(
            NodeStatus::key(),
            NodeStatus::Removing { host_id }.to_versioned_value(&self.version_gen),
        );
        state.add_application_state(
            ApplicationState::RemovalCoordinator,
            VersionedValue::new(&self.version_gen, format!("REMOVER,{coordinator}")),
        );
        state.touch();
        info!(%endpoint, "advertising token removal in progress");
        Ok(())
    }

    /// Phase two: advertise REMOVED with an expire horizon.
    pub fn advertise_token_removed(&self, endpoint: SocketAddr, host_id: HostId) -> Result<()> {
        let expire_time_ms = Self::wall_millis() + VERY_LONG_TIME_MS;
        {
            let mut state = self
                .endpoints
                .get_mut(&endpoint)
                .ok_or_else(|| Error::unknown_endpoint(endpoint))?;
            state.heart_beat_state_mut().force_newer_generation();
            state.add_application_state(
                NodeStatus::key(),
                NodeStatus::Removed { host_id, expire_time_ms }
                    .to_versioned_value(&self.version_gen),
            );
            state.touch();
        }
        self.expire_times.insert(endpoint, expire_time_ms);
        info!(%endpoint, "advertising token removed");
        Ok(())
    }

    /// Operator escape hatch: force the endpoint to LEFT regardless of
    /// consistency. Works even for endpoints never heard of.
    pub fn assassinate_endpoint(self: &Arc<Self>, endpoint: SocketAddr) {
        let mut state = self.endpoints.get(&endpoint).map(|e| e.clone()).unwrap_or_else(|| {
            warn!(%endpoint, "assassinating endpoint we have never heard of");
            EndpointState::new(HeartBeatState::new(Self::wall_seconds() as i32))
        });

        let token = state
            .application_state(ApplicationState::Tokens)
            .and_then(|v| v.value.split(',').next().map(str::to_string))
            .unwrap_or_default();
        let expire_time_ms = Self::wall_millis() + VERY_LONG_TIME_MS;

        state.heart_beat_state_mut().force_newer_generation();
        state.add_application_state(
            NodeStatus::key(),
            NodeStatus::Left { token, expire_time_ms }.to_versioned_value(&self.version_gen),
        );
        self.expire_times.insert(endpoint, expire_time_ms);
        self.handle_major_state_change(endpoint, state);
        warn!(%endpoint, "assassinated endpoint");
    }

    // ------------------------------------------------------------------
    // Shadow round
    // ------------------------------------------------------------------

    /// Solicit the full cluster state from the seeds without joining
    /// gossip. Blocks in bounded sleeps until the first ACK arrives;
    /// fails bootstrap after `shadow_round_wait`.
    pub async fn do_shadow_round(&self) -> Result<HashMap<SocketAddr, EndpointState>> {
        let seeds: Vec<SocketAddr> = self
            .config
            .seeds
            .iter()
            .copied()
            .filter(|s| *s != self.local_addr)
            .collect();
        if seeds.is_empty() {
            return Err(Error::Gossip(GossipError::NoSeeds));
        }

        info!(seeds = seeds.len(), "starting shadow round");
        self.shadow_states.lock().clear();
        self.in_shadow_round.store(true, Ordering::SeqCst);

        let syn = GossipMessage::Syn {
            cluster: self.config.cluster_name.clone(),
            partitioner: self.config.partitioner.clone(),
            digests: Vec::new(),
        };

        let deadline = Instant::now() + self.config.shadow_round_wait;
        let mut next_send = Instant::now();
        while self.in_shadow_round.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                self.in_shadow_round.store(false, Ordering::SeqCst);
                return Err(Error::Gossip(GossipError::ShadowRoundTimeout(
                    self.config.shadow_round_wait,
                )));
            }
            if Instant::now() >= next_send {
                for seed in &seeds {
                    if let Err(e) = self.transport.send_one_way(*seed, syn.clone()).await {
                        debug!(seed = %seed, error = %e, "shadow round send failed");
                    }
                }
                next_send = Instant::now() + self.config.gossip_interval;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let states = std::mem::take(&mut *self.shadow_states.lock());
        info!(peers = states.len(), "shadow round finished");
        Ok(states)
    }

    // ------------------------------------------------------------------
    // Queries and local state
    // ------------------------------------------------------------------

    pub fn is_alive(&self, endpoint: SocketAddr) -> bool {
        if endpoint == self.local_addr {
            return self.started.load(Ordering::SeqCst);
        }
        self.live.contains(&endpoint)
    }

    pub fn get_endpoint_state(&self, endpoint: SocketAddr) -> Option<EndpointState> {
        self.endpoints.get(&endpoint).map(|e| e.clone())
    }

    /// Snapshot of the whole peer table, for diagnostics.
    pub fn endpoint_states(&self) -> Vec<(SocketAddr, EndpointState)> {
        self.endpoints.iter().map(|e| (*e.key(), e.clone())).collect()
    }

    pub fn live_members(&self) -> Vec<SocketAddr> {
        let mut members: Vec<SocketAddr> = self.live.iter().map(|e| *e).collect();
        if self.started.load(Ordering::SeqCst) {
            members.push(self.local_addr);
        }
        members
    }

    pub fn unreachable_members(&self) -> Vec<SocketAddr> {
        self.unreachable.iter().map(|e| *e.key()).collect()
    }

    pub fn register_subscriber(&self, subscriber: Arc<dyn EndpointStateChangeSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn unregister_subscriber(&self, subscriber: &Arc<dyn EndpointStateChangeSubscriber>) {
        self.subscribers
            .write()
            .retain(|s| !Arc::ptr_eq(s, subscriber));
    }

    /// Attach or replace an application state on the local record and
    /// let the next rounds disseminate it.
    pub fn add_local_application_state(
        &self,
        key: ApplicationState,
        value: String,
    ) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::Gossip(GossipError::NotStarted));
        }
        let _task = self.task_lock.lock();

        let old_state = self
            .endpoints
            .get(&self.local_addr)
            .map(|e| e.clone())
            .ok_or(Error::Gossip(GossipError::NotStarted))?;
        let versioned = VersionedValue::new(&self.version_gen, value);

        for subscriber in self.subscribers.read().iter() {
            subscriber.before_change(self.local_addr, &old_state, key, &versioned);
        }
        {
            let Some(mut local) = self.endpoints.get_mut(&self.local_addr) else {
                return Err(Error::Gossip(GossipError::NotStarted));
            };
            local.add_application_state(key, versioned.clone());
            local.touch();
        }
        for subscriber in self.subscribers.read().iter() {
            subscriber.on_change(self.local_addr, key, &versioned);
        }
        Ok(())
    }

    pub fn add_local_status(&self, status: NodeStatus) -> Result<()> {
        self.add_local_application_state(NodeStatus::key(), status.to_string())
    }

    // ------------------------------------------------------------------
    // Clocks
    // ------------------------------------------------------------------

    fn monotonic_nanos(&self) -> i64 {
        self.clock_base.elapsed().as_nanos() as i64
    }

    fn wall_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn wall_seconds() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}
