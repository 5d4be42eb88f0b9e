//! Cluster state synchronization.
//!
//! SWIM-style membership over UDP plus push/pull/push-pull gossip of
//! health, circuit and drain states. Remote states pass per-type
//! conflict resolution before they are committed locally and handed to
//! the owning subsystem.

mod gossip;
mod lamport;
mod membership;
mod messages;
mod providers;
mod state;

pub use lamport::LamportClock;
pub use membership::{ClusterNode, Membership, NodeStatus};
pub use messages::GossipMessage;
pub use providers::{CircuitStateProvider, DrainStateProvider, HealthStateProvider};
pub use state::{remote_wins, StateProvider, StateStore, StateType, SyncableState};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::circuit::now_ns;
use crate::config::ClusterConfig;
use crate::error::{LbError, Result};
use crate::telemetry::Metrics;

/// Direct probes per prober round.
const PROBE_FANOUT: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub node_id: String,
    pub incarnation: u64,
    pub nodes_alive: usize,
    pub nodes_suspect: usize,
    pub nodes_dead: usize,
    pub known_states: usize,
    pub lamport: u64,
}

pub struct ClusterRuntime {
    config: ClusterConfig,
    clock: Arc<LamportClock>,
    store: Arc<StateStore>,
    membership: Arc<Membership>,
    providers: Vec<Arc<dyn StateProvider>>,
    socket: OnceLock<Arc<UdpSocket>>,
    seq: AtomicU64,
    ack_waiters: DashMap<u64, oneshot::Sender<()>>,
    /// In-flight indirect probes: our probe seq -> (requester address,
    /// requester's original seq).
    indirect: DashMap<u64, (String, u64)>,
    metrics: Option<Arc<Metrics>>,
    running: AtomicBool,
}

impl ClusterRuntime {
    pub fn new(
        config: ClusterConfig,
        providers: Vec<Arc<dyn StateProvider>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let node_id = config.effective_node_id();
        let ping_interval = Duration::from_millis(config.ping_interval_ms.max(1));
        let membership = Arc::new(Membership::new(node_id, ping_interval, config.suspicion_mult));
        Arc::new(Self {
            config,
            clock: Arc::new(LamportClock::new()),
            store: Arc::new(StateStore::new()),
            membership,
            providers,
            socket: OnceLock::new(),
            seq: AtomicU64::new(0),
            ack_waiters: DashMap::new(),
            indirect: DashMap::new(),
            metrics,
            running: AtomicBool::new(false),
        })
    }

    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the gossip socket, seed the store from the providers and
    /// spawn the receiver, gossip, anti-entropy and prober tasks. A bind
    /// failure is fatal for startup.
    pub async fn start(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bind = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let socket = UdpSocket::bind(&bind).await.map_err(|e| {
            LbError::OperationFailed(format!("cluster bind {bind} failed: {e}"))
        })?;
        let socket = Arc::new(socket);
        if self.socket.set(socket).is_err() {
            return Err(LbError::OperationFailed("cluster already started".to_string()));
        }

        for provider in &self.providers {
            for (key, value) in provider.snapshot() {
                self.publish(provider.state_type(), &key, value)?;
            }
        }
        // Seeding is local state, not news worth pushing.
        self.store.take_dirty();

        self.running.store(true, Ordering::SeqCst);
        info!(
            node = self.membership.local_id(),
            %bind,
            seeds = self.config.seeds.len(),
            "cluster started"
        );

        let runtime = self.clone();
        let c = cancel.clone();
        tracker.spawn(async move { runtime.run_receiver(c).await });
        let runtime = self.clone();
        let c = cancel.clone();
        tracker.spawn(async move { runtime.run_gossip(c).await });
        let runtime = self.clone();
        let c = cancel.clone();
        tracker.spawn(async move { runtime.run_push_pull(c).await });
        let runtime = self.clone();
        let c = cancel.clone();
        tracker.spawn(async move { runtime.run_prober(c).await });
        Ok(())
    }

    /// Version and record a local state mutation; the next gossip round
    /// pushes it.
    pub fn publish(
        &self,
        state_type: StateType,
        key: &str,
        value: serde_json::Value,
    ) -> Result<u64> {
        let version = self.clock.next_version();
        self.store.local_update(SyncableState {
            state_type,
            key: key.to_string(),
            value,
            version,
            source_node: self.membership.local_id().to_string(),
            timestamp_ns: now_ns(),
        })?;
        Ok(version)
    }

    /// Immediate anti-entropy round with every alive peer. Returns how
    /// many peers were addressed.
    pub async fn sync_now(&self) -> Result<usize> {
        if !self.is_running() {
            return Err(LbError::ClusterNotRunning);
        }
        let peers = self.membership.alive_nodes();
        let states = self.store.all();
        let digest = self.store.digest();
        for peer in &peers {
            self.send(
                &peer.address,
                &GossipMessage::PushPull {
                    sender_id: self.membership.local_id().to_string(),
                    states: states.clone(),
                    digest: digest.clone(),
                },
            )
            .await;
        }
        Ok(peers.len())
    }

    pub fn status(&self) -> Result<ClusterStatus> {
        if !self.is_running() {
            return Err(LbError::ClusterNotRunning);
        }
        let nodes = self.membership.nodes();
        Ok(ClusterStatus {
            node_id: self.membership.local_id().to_string(),
            incarnation: self.membership.local_incarnation(),
            nodes_alive: nodes.iter().filter(|n| n.status == NodeStatus::Alive).count(),
            nodes_suspect: nodes.iter().filter(|n| n.status == NodeStatus::Suspect).count(),
            nodes_dead: nodes.iter().filter(|n| n.status == NodeStatus::Dead).count(),
            known_states: self.store.len(),
            lamport: self.clock.current(),
        })
    }

    /// Peer table plus an entry for the local node.
    pub fn nodes(&self) -> Result<Vec<ClusterNode>> {
        if !self.is_running() {
            return Err(LbError::ClusterNotRunning);
        }
        let mut nodes = self.membership.nodes();
        nodes.push(ClusterNode {
            node_id: self.membership.local_id().to_string(),
            address: format!("{}:{}", self.config.bind_address, self.config.bind_port),
            incarnation: self.membership.local_incarnation(),
            last_seen_ns: now_ns(),
            join_time_ns: 0,
            status: NodeStatus::Alive,
        });
        Ok(nodes)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}
