//! Gossip and probe task loops plus the datagram dispatch.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::GossipMessage;
use super::state::SyncableState;
use super::ClusterRuntime;

/// Push batches are split so each datagram stays under the UDP bound.
const PUSH_CHUNK: usize = 32;

impl ClusterRuntime {
    pub(super) async fn run_receiver(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let Some(socket) = self.socket.get().cloned() else {
            return;
        };
        let mut buf = vec![0u8; 65_536];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("gossip receiver stopped");
                    return;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, src)) => match GossipMessage::decode(&buf[..n]) {
                            Ok(msg) => self.handle_message(msg, src).await,
                            Err(err) => debug!(%src, %err, "dropping undecodable datagram"),
                        },
                        Err(err) => {
                            warn!(%err, "gossip socket receive failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
    }

    /// Messages are handled sequentially on the receiver task, so states
    /// for the same (type, key) are applied in receipt order.
    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) {
        if let Some(metrics) = &self.metrics {
            metrics
                .gossip_messages_total
                .with_label_values(&[msg.kind(), "rx"])
                .inc();
        }
        let local_id = self.membership.local_id().to_string();
        match msg {
            GossipMessage::Ping { sender_id, incarnation, seq } => {
                self.membership.observe_alive(&sender_id, &src.to_string(), incarnation);
                self.send(
                    &src.to_string(),
                    &GossipMessage::Ack {
                        sender_id: local_id,
                        incarnation: self.membership.local_incarnation(),
                        seq,
                    },
                )
                .await;
            }
            GossipMessage::Ack { sender_id, incarnation, seq } => {
                self.membership.observe_alive(&sender_id, &src.to_string(), incarnation);
                if let Some((_, waiter)) = self.ack_waiters.remove(&seq) {
                    let _ = waiter.send(());
                } else if let Some((_, (requester, orig_seq))) = self.indirect.remove(&seq) {
                    // Relay the indirect probe result to the node that
                    // asked for it.
                    self.send(
                        &requester,
                        &GossipMessage::Ack { sender_id, incarnation, seq: orig_seq },
                    )
                    .await;
                }
            }
            GossipMessage::PingReq { sender_id, target, seq } => {
                self.membership.observe_alive(&sender_id, &src.to_string(), 0);
                let probe_seq = self.next_seq();
                self.indirect.insert(probe_seq, (src.to_string(), seq));
                self.send(
                    &target,
                    &GossipMessage::Ping {
                        sender_id: local_id,
                        incarnation: self.membership.local_incarnation(),
                        seq: probe_seq,
                    },
                )
                .await;
            }
            GossipMessage::Push { sender_id, states } => {
                self.membership.observe_alive(&sender_id, &src.to_string(), 0);
                self.apply_states(states);
            }
            GossipMessage::Pull { sender_id, digest } => {
                self.membership.observe_alive(&sender_id, &src.to_string(), 0);
                let missing = self.store.missing_from(&digest);
                self.send_states(&src.to_string(), missing).await;
            }
            GossipMessage::PushPull { sender_id, states, digest } => {
                self.membership.observe_alive(&sender_id, &src.to_string(), 0);
                self.apply_states(states);
                let missing = self.store.missing_from(&digest);
                self.send_states(&src.to_string(), missing).await;
            }
        }
    }

    /// Commit remote states that win conflict resolution and hand them
    /// to the owning subsystem.
    pub(super) fn apply_states(&self, states: Vec<SyncableState>) {
        for state in states {
            self.clock.observe(state.version);
            if state.source_node == self.membership.local_id() {
                continue;
            }
            if !self.store.apply_remote(state.clone()) {
                continue;
            }
            let Some(provider) =
                self.providers.iter().find(|p| p.state_type() == state.state_type)
            else {
                continue;
            };
            if let Err(err) = provider.apply(&state.key, &state.value) {
                debug!(key = %state.key, %err, "remote state not applied locally");
            }
        }
    }

    pub(super) async fn run_gossip(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.gossip_interval_ms.max(10)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let dirty = self.store.take_dirty();
            if dirty.is_empty() {
                continue;
            }
            let peers = self.membership.random_alive(self.config.gossip_fanout);
            for peer in &peers {
                self.send_states(&peer.address, dirty.clone()).await;
            }
        }
    }

    pub(super) async fn run_push_pull(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.config.push_pull_interval_ms.max(100),
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(peer) = self.membership.random_alive(1).into_iter().next() else {
                continue;
            };
            let msg = GossipMessage::PushPull {
                sender_id: self.membership.local_id().to_string(),
                states: self.store.all(),
                digest: self.store.digest(),
            };
            self.send(&peer.address, &msg).await;
        }
    }

    pub(super) async fn run_prober(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.ping_interval_ms.max(10)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.membership.tick();

            // Seeds we have not identified yet get a plain ping; their
            // ack introduces them into the table.
            let known: Vec<String> =
                self.membership.nodes().iter().map(|n| n.address.clone()).collect();
            for seed in &self.config.seeds {
                if !known.contains(seed) {
                    let msg = GossipMessage::Ping {
                        sender_id: self.membership.local_id().to_string(),
                        incarnation: self.membership.local_incarnation(),
                        seq: self.next_seq(),
                    };
                    self.send(seed, &msg).await;
                }
            }

            for peer in self.membership.random_alive(super::PROBE_FANOUT) {
                self.probe_peer(&peer.node_id, &peer.address).await;
            }
        }
    }

    /// Direct probe, then indirect probes through other peers, then
    /// suspicion.
    async fn probe_peer(&self, node_id: &str, address: &str) {
        let timeout = Duration::from_millis(self.config.ping_timeout_ms.max(1));
        if self.await_ack(address).await {
            return;
        }
        debug!(node = node_id, "direct probe timed out, trying indirect");
        let helpers: Vec<_> = self
            .membership
            .random_alive(self.config.ping_req_count + 1)
            .into_iter()
            .filter(|n| n.node_id != node_id)
            .take(self.config.ping_req_count)
            .collect();
        if !helpers.is_empty() {
            let seq = self.next_seq();
            let (tx, rx) = oneshot::channel();
            self.ack_waiters.insert(seq, tx);
            for helper in &helpers {
                self.send(
                    &helper.address,
                    &GossipMessage::PingReq {
                        sender_id: self.membership.local_id().to_string(),
                        target: address.to_string(),
                        seq,
                    },
                )
                .await;
            }
            let acked = matches!(tokio::time::timeout(timeout * 2, rx).await, Ok(Ok(())));
            self.ack_waiters.remove(&seq);
            if acked {
                return;
            }
        }
        self.membership.mark_suspect(node_id);
    }

    /// Send a ping and wait for its ack. Returns whether the ack
    /// arrived in time.
    async fn await_ack(&self, address: &str) -> bool {
        let timeout = Duration::from_millis(self.config.ping_timeout_ms.max(1));
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.ack_waiters.insert(seq, tx);
        self.send(
            address,
            &GossipMessage::Ping {
                sender_id: self.membership.local_id().to_string(),
                incarnation: self.membership.local_incarnation(),
                seq,
            },
        )
        .await;
        let acked = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));
        self.ack_waiters.remove(&seq);
        acked
    }

    pub(super) async fn send_states(&self, address: &str, states: Vec<SyncableState>) {
        if states.is_empty() {
            return;
        }
        for chunk in states.chunks(PUSH_CHUNK) {
            let msg = GossipMessage::Push {
                sender_id: self.membership.local_id().to_string(),
                states: chunk.to_vec(),
            };
            self.send(address, &msg).await;
        }
    }

    pub(super) async fn send(&self, address: &str, msg: &GossipMessage) {
        let Some(socket) = self.socket.get() else {
            return;
        };
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, kind = msg.kind(), "gossip message not sent");
                return;
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .gossip_messages_total
                .with_label_values(&[msg.kind(), "tx"])
                .inc();
        }
        if let Err(err) = socket.send_to(&bytes, address).await {
            debug!(address, %err, "gossip send failed");
        }
    }
}
