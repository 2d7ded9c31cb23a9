use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, mpsc};
use tracing::info;

use super::types::{GossipMessage, Node, NodeId, NodeState};
use super::{PubSub, Subscription, TopicSubscribers};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SEEN_MESSAGES: usize = 10_000;
const MAX_DATAGRAM_SIZE: usize = 65_507;

struct Outbound {
    topic: String,
    message_id: String,
    payload: Vec<u8>,
}

/// UDP gossip transport.
///
/// Membership follows the SWIM-like Join / Ping / Ack / Suspect / Alive exchange.
/// Topic messages are sent directly to every alive member; receivers deduplicate by
/// `message_id` and deliver to their local subscribers.
pub struct GossipPubSub {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    subscribers: TopicSubscribers,
    seen_messages: Mutex<HashSet<String>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
}

impl GossipPubSub {
    pub async fn new(bind_addr: SocketAddr, seed_nodes: Vec<SocketAddr>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let incarnation_counter = Arc::new(RwLock::new(1));
        let current_inc = *incarnation_counter.read().await;
        let local_node = Node {
            id: NodeId::new(),
            addr: local_addr,
            state: NodeState::Alive,
            incarnation: current_inc,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            info!("Joining broadcast group via {} seed node(s)", seed_nodes.len());

            let msg = GossipMessage::Join {
                node: local_node.clone(),
            };
            let encoded = bincode::serialize(&msg)?;

            for seed_node in seed_nodes.iter() {
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: incarnation_counter,
            subscribers: TopicSubscribers::new(),
            seen_messages: Mutex::new(HashSet::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting gossip transport...");

        let _gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let _receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let _failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        let outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(outbound_rx) = outbound_rx {
            let service = self.clone();
            tokio::spawn(async move {
                service.outbound_loop(outbound_rx).await;
            });
        } else {
            tracing::warn!("Gossip transport already started");
        }

        tracing::info!("All background tasks started");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_node.addr
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Returns `true` the first time a message id is observed.
    fn should_process(&self, message_id: &str) -> bool {
        let mut seen = self
            .seen_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if seen.contains(message_id) {
            return false;
        }

        if seen.len() >= MAX_SEEN_MESSAGES {
            seen.clear();
        }

        seen.insert(message_id.to_string());
        true
    }

    async fn outbound_loop(self: Arc<Self>, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(outbound) = outbound_rx.recv().await {
            let msg = GossipMessage::Publish {
                from: self.local_node.id.clone(),
                message_id: outbound.message_id,
                topic: outbound.topic,
                payload: outbound.payload,
            };

            self.broadcast_message(msg).await;
        }

        tracing::debug!("Outbound queue closed");
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            let target = {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..alive_members.len());
                alive_members[idx].clone()
            };

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.id, e);
                    } else {
                        tracing::trace!("Sent ping to {}", target.id);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await?;
            }

            GossipMessage::Join { node } => {
                self.handle_join(node, src).await?;
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await?;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation).await?;
            }

            GossipMessage::Publish {
                from,
                message_id,
                topic,
                payload,
            } => {
                self.handle_publish(from, message_id, topic, payload);
            }
        }

        Ok(())
    }

    fn handle_publish(&self, from: NodeId, message_id: String, topic: String, payload: Vec<u8>) {
        if from == self.local_node.id || !self.should_process(&message_id) {
            return;
        }

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
        }

        let delivered = self.subscribers.deliver(&topic, &payload);
        tracing::trace!(
            "Delivered message {} on {} from {} to {} subscribers",
            message_id,
            topic,
            from,
            delivered
        );
    }

    async fn membership_ack(&self) -> Result<Vec<u8>> {
        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        };

        Ok(bincode::serialize(&reply)?)
    }

    async fn handle_ping(&self, from: NodeId, from_incarnation: u64, src: SocketAddr) -> Result<()> {
        tracing::trace!("Received ping from {}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());

            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
            if member.state != NodeState::Alive && from_incarnation >= member.incarnation {
                member.state = NodeState::Alive;
            }
        } else {
            tracing::info!("Discovered new peer via ping: {} at {}", from, src);

            let new_node = Node {
                id: from.clone(),
                addr: src,
                state: NodeState::Alive,
                incarnation: from_incarnation,
                last_seen: Some(Instant::now()),
            };

            self.members.insert(new_node.id.clone(), new_node);
        }

        let encoded = self.membership_ack().await?;
        self.socket.send_to(&encoded, src).await?;

        tracing::trace!("Sent ack to {} with {} members", from, self.members.len());

        Ok(())
    }

    async fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) -> Result<()> {
        tracing::trace!(
            "Received ack from {} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }

        Ok(())
    }

    fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }

        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::info!("Discovered new peer: {} at {}", new_member.id, new_member.addr);

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());

                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
            }
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        if node_id == self.local_node.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                if incarnation >= *inc {
                    *inc = incarnation + 1;
                }
                *inc
            };

            tracing::info!("Refuting suspicion of local peer (inc={})", my_incarnation);

            if let Some(mut local) = self.members.get_mut(&node_id) {
                local.incarnation = my_incarnation;
                local.state = NodeState::Alive;
            }

            let msg = GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            };
            self.broadcast_message(msg).await;

            return Ok(());
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    tracing::info!("Peer {} at {} suspected", existing.id, existing.addr);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            None => {
                tracing::debug!("Suspected peer {} is unknown", node_id);
            }
        }

        Ok(())
    }

    async fn handle_alive(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation {
                    tracing::info!(
                        "Peer {} at {} is now Alive (inc={})",
                        existing.id,
                        existing.addr,
                        incarnation
                    );
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if incarnation == existing.incarnation
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("Peer {} at {} refuted suspicion", existing.id, existing.addr);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown peer {}", node_id);
            }
        }

        Ok(())
    }

    async fn handle_join(&self, mut node: Node, src: SocketAddr) -> Result<()> {
        tracing::info!("Peer {} joining at {}", node.id, node.addr);

        if node.addr.ip().is_unspecified() {
            node.addr = src;
        }
        node.state = NodeState::Alive;
        node.last_seen = Some(Instant::now());

        let addr = node.addr;
        self.members.insert(node.id.clone(), node);

        let encoded = self.membership_ack().await?;
        self.socket.send_to(&encoded, addr).await?;

        tracing::info!("Group size now: {}", self.members.len());

        Ok(())
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut messages_to_broadcast = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };

                let elapsed = now.duration_since(last_seen);

                match member.state {
                    NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                        tracing::warn!("Peer {} suspected (no contact for {:?})", member.id, elapsed);

                        member.state = NodeState::Suspect;
                        messages_to_broadcast.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        tracing::warn!("Peer {} declared dead (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Dead;
                    }
                    _ => {}
                }
            }

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize gossip message: {}", e);
                return;
            }
        };

        if encoded.len() > MAX_DATAGRAM_SIZE {
            tracing::error!("Gossip message of {} bytes exceeds datagram size", encoded.len());
            return;
        }

        let targets: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect();

        for member in targets {
            if let Err(e) = self.socket.send_to(&encoded, member.addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", member.id, e);
            }
        }
    }
}

impl PubSub for GossipPubSub {
    fn local_node_id(&self) -> NodeId {
        self.local_node.id.clone()
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.subscribers.deliver(topic, &payload);

        self.outbound_tx
            .send(Outbound {
                topic: topic.to_string(),
                message_id,
                payload,
            })
            .map_err(|_| anyhow::anyhow!("gossip outbound queue closed"))
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.subscribers.subscribe(topic)
    }

    fn active_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.get_alive_members().into_iter().map(|n| n.id).collect();
        nodes.sort();
        nodes
    }
}
