//! # Gossip Overlay
//!
//! Topic-based publish/subscribe over the connected peer set. Each subscribed
//! topic keeps a bounded mesh of peers that receive full messages; the rest
//! of the topic's peers learn about messages lazily through IHAVE.
//!
//! ## Message Flow
//!
//! | Step | Frame | Sent to |
//! |------|-------|---------|
//! | Publish | DATA | mesh peers (all topic peers with flood publish) |
//! | Forward | DATA | mesh peers except the sender and the source |
//! | Gossip | IHAVE | up to `gossip_lazy` non-mesh topic peers per heartbeat |
//! | Repair | IWANT | the peer that advertised the missing ids |
//! | Mesh join | GRAFT | peers chosen by score |
//! | Mesh leave | PRUNE | peers dropped by score or degree, with peer exchange |
//!
//! ## Mesh Degree
//!
//! Every heartbeat drives each mesh towards exactly `mesh_n` peers: peers
//! below `mesh_prune_threshold` are pruned, the best-scoring candidates are
//! grafted while the mesh is short, and the lowest-scoring members are
//! pruned while it is over.
//!
//! ## Peer Scoring
//!
//! | Component | Effect |
//! |-----------|--------|
//! | Time in mesh | small positive, capped |
//! | First deliveries | positive, capped |
//! | Invalid messages | negative, squared |
//! | Behaviour penalty | negative, squared (graft during backoff, broken IWANT promise, protocol error) |
//!
//! Counters decay every heartbeat. Peers below the graylist threshold are
//! ignored entirely.
//!
//! ## Delivery
//!
//! Messages are handed to the [`Subscribers`] registry synchronously on the
//! overlay actor, in registration order, and to the message channel returned
//! by [`GossipSub::spawn`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::crypto::{GOSSIP_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::discovery::{DISCOVERY_TOPIC, RecordStore};
use crate::error::ApplicationError;
use crate::identity::{Identity, Keypair, PeerRecord, now_ms};
use crate::protocols::GossipRpc;
use crate::wire::{DataFrame, GossipFrame, MAX_PAYLOAD_SIZE, MessageId, compute_message_id};

// ============================================================================
// Configuration
// ============================================================================

pub const DEFAULT_MESH_N: usize = 6;
pub const DEFAULT_GOSSIP_LAZY: usize = 6;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HISTORY_GOSSIP: usize = 3;
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 500;
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_MESSAGE_CACHE_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_SEEN_CAPACITY: usize = 100_000;
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_IWANT_FOLLOWUP: Duration = Duration::from_secs(3);
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

pub const DEFAULT_GRAYLIST_THRESHOLD: f64 = -100.0;
pub const DEFAULT_PUBLISH_THRESHOLD: f64 = -50.0;
pub const DEFAULT_GOSSIP_THRESHOLD: f64 = -25.0;
pub const DEFAULT_MESH_PRUNE_THRESHOLD: f64 = 0.0;

pub const MAX_TOPIC_LENGTH: usize = 256;
pub const MAX_SUBSCRIPTIONS_PER_PEER: usize = 100;
pub const MAX_PX_PEERS: usize = 16;
pub const MAX_IWANT_IDS: usize = 500;
const MAX_SCORED_PEERS: usize = 10_000;
const MAX_BACKOFF_ENTRIES: usize = 10_000;
const MAX_PENDING_PROMISES: usize = 5_000;
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Capacity of the delivered-message channel.
const MESSAGE_CHANNEL_SIZE: usize = 1_024;

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_TOPIC_LENGTH
}

#[derive(Debug, Clone)]
pub struct ScoreParams {
    /// Per second in mesh, summed over topics.
    pub time_in_mesh_weight: f64,
    pub time_in_mesh_cap: f64,
    pub first_delivery_weight: f64,
    pub first_delivery_cap: f64,
    pub first_delivery_decay: f64,
    pub invalid_message_weight: f64,
    pub invalid_message_decay: f64,
    pub behaviour_penalty_weight: f64,
    pub behaviour_penalty_decay: f64,
    pub decay_to_zero: f64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            time_in_mesh_weight: 0.01,
            time_in_mesh_cap: 3600.0,
            first_delivery_weight: 1.0,
            first_delivery_cap: 100.0,
            first_delivery_decay: 0.99,
            invalid_message_weight: -100.0,
            invalid_message_decay: 0.99,
            behaviour_penalty_weight: -10.0,
            behaviour_penalty_decay: 0.99,
            decay_to_zero: 0.01,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GossipSubConfig {
    /// Target mesh degree D.
    pub mesh_n: usize,
    /// Non-mesh peers that receive IHAVE per topic per heartbeat.
    pub gossip_lazy: usize,
    pub heartbeat_interval: Duration,
    /// Heartbeat windows of message ids advertised in IHAVE.
    pub history_gossip: usize,
    pub max_ihave_length: usize,
    pub message_cache_size: usize,
    pub message_cache_ttl: Duration,
    pub seen_ttl: Duration,
    pub seen_capacity: usize,
    pub fanout_ttl: Duration,
    /// Deadline for an IWANT'd message to arrive from its advertiser.
    pub iwant_followup: Duration,
    pub prune_backoff: Duration,
    /// Publish to every topic peer above the publish threshold, not just the mesh.
    pub flood_publish: bool,
    pub graylist_threshold: f64,
    pub publish_threshold: f64,
    pub gossip_threshold: f64,
    pub mesh_prune_threshold: f64,
    pub score: ScoreParams,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            history_gossip: DEFAULT_HISTORY_GOSSIP,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            message_cache_ttl: DEFAULT_MESSAGE_CACHE_TTL,
            seen_ttl: DEFAULT_SEEN_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            iwant_followup: DEFAULT_IWANT_FOLLOWUP,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            flood_publish: true,
            graylist_threshold: DEFAULT_GRAYLIST_THRESHOLD,
            publish_threshold: DEFAULT_PUBLISH_THRESHOLD,
            gossip_threshold: DEFAULT_GOSSIP_THRESHOLD,
            mesh_prune_threshold: DEFAULT_MESH_PRUNE_THRESHOLD,
            score: ScoreParams::default(),
        }
    }
}

// ============================================================================
// Peer Scoring
// ============================================================================

#[derive(Debug, Clone, Default)]
struct PeerScore {
    mesh_since: HashMap<String, Instant>,
    first_deliveries: f64,
    invalid_messages: f64,
    behaviour_penalty: f64,
}

impl PeerScore {
    fn calculate(&self, params: &ScoreParams) -> f64 {
        let time_in_mesh: f64 = self
            .mesh_since
            .values()
            .map(|since| since.elapsed().as_secs_f64().min(params.time_in_mesh_cap))
            .sum();
        params.time_in_mesh_weight * time_in_mesh
            + params.first_delivery_weight * self.first_deliveries.min(params.first_delivery_cap)
            + params.invalid_message_weight * self.invalid_messages * self.invalid_messages
            + params.behaviour_penalty_weight * self.behaviour_penalty * self.behaviour_penalty
    }

    fn decay(&mut self, params: &ScoreParams) {
        fn decayed(value: f64, factor: f64, floor: f64) -> f64 {
            let v = value * factor;
            if v.abs() < floor { 0.0 } else { v }
        }
        self.first_deliveries = decayed(self.first_deliveries, params.first_delivery_decay, params.decay_to_zero);
        self.invalid_messages = decayed(self.invalid_messages, params.invalid_message_decay, params.decay_to_zero);
        self.behaviour_penalty = decayed(self.behaviour_penalty, params.behaviour_penalty_decay, params.decay_to_zero);
    }
}

// ============================================================================
// Seen Set
// ============================================================================

/// One entry of the seen set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub seen_at: Instant,
}

/// Insertion-ordered set of seen message ids with a TTL and a hard cap.
#[derive(Debug)]
pub struct SeenCache {
    order: VecDeque<MessageRecord>,
    ids: HashSet<MessageId>,
    ttl: Duration,
    capacity: usize,
}

impl SeenCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.insert_at(id, Instant::now())
    }

    fn insert_at(&mut self, id: MessageId, now: Instant) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(MessageRecord {
            message_id: id,
            seen_at: now,
        });
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted.message_id);
            }
        }
        true
    }

    /// Drop records older than the TTL.
    pub fn purge(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            if now.duration_since(front.seen_at) < self.ttl {
                break;
            }
            self.ids.remove(&front.message_id);
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ============================================================================
// Subscribers
// ============================================================================

/// A message delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    /// The peer that originally published the message.
    pub from: Identity,
    pub data: Vec<u8>,
    pub id: MessageId,
}

pub type HandlerId = u64;

/// Receives delivered messages. Runs on the overlay actor, so it must not
/// block.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self(message)
    }
}

type HandlerEntry = (HandlerId, Arc<dyn MessageHandler>);

#[derive(Default)]
struct SubscriberTable {
    next_id: HandlerId,
    by_topic: HashMap<String, Vec<HandlerEntry>>,
    any: Vec<HandlerEntry>,
}

/// Registry of per-topic and catch-all message handlers. Cheap to clone.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<RwLock<SubscriberTable>>,
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers").finish_non_exhaustive()
    }
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_topic(&self, topic: &str, handler: impl MessageHandler + 'static) -> HandlerId {
        let Ok(mut table) = self.inner.write() else {
            return 0;
        };
        table.next_id += 1;
        let id = table.next_id;
        table
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Handler for every application topic. Never sees discovery traffic.
    pub fn on_any(&self, handler: impl MessageHandler + 'static) -> HandlerId {
        let Ok(mut table) = self.inner.write() else {
            return 0;
        };
        table.next_id += 1;
        let id = table.next_id;
        table.any.push((id, Arc::new(handler)));
        id
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let Ok(mut table) = self.inner.write() else {
            return false;
        };
        let before = table.any.len() + table.by_topic.values().map(Vec::len).sum::<usize>();
        table.any.retain(|(h, _)| *h != id);
        for handlers in table.by_topic.values_mut() {
            handlers.retain(|(h, _)| *h != id);
        }
        table.by_topic.retain(|_, handlers| !handlers.is_empty());
        let after = table.any.len() + table.by_topic.values().map(Vec::len).sum::<usize>();
        after < before
    }

    /// Run every matching handler in registration order. Returns how many ran.
    pub fn deliver(&self, message: &Message) -> usize {
        let handlers: Vec<HandlerEntry> = {
            let Ok(table) = self.inner.read() else {
                return 0;
            };
            let mut handlers: Vec<HandlerEntry> = table.by_topic.get(&message.topic).cloned().unwrap_or_default();
            if message.topic != DISCOVERY_TOPIC {
                handlers.extend(table.any.iter().cloned());
                handlers.sort_by_key(|(id, _)| *id);
            }
            handlers
        };

        for (id, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(handler = id, topic = %message.topic, error = %e, "message handler failed"),
                Err(_) => warn!(handler = id, topic = %message.topic, "message handler panicked"),
            }
        }
        handlers.len()
    }
}

// ============================================================================
// Message Signing
// ============================================================================

fn sign_message(keypair: &Keypair, msg_id: &MessageId) -> Vec<u8> {
    sign_with_domain(keypair, GOSSIP_SIGNATURE_DOMAIN, msg_id)
}

/// Recompute the id from the content and check the source's signature over it.
fn validate_data(frame: &DataFrame) -> Result<(), &'static str> {
    if !is_valid_topic(&frame.topic) {
        return Err("invalid topic");
    }
    if frame.data.len() > MAX_PAYLOAD_SIZE {
        return Err("payload too large");
    }
    let expected = compute_message_id(&frame.topic, &frame.source, frame.seqno, &frame.data);
    if expected != frame.msg_id {
        return Err("message id does not match content");
    }
    verify_with_domain(&frame.source, GOSSIP_SIGNATURE_DOMAIN, &frame.msg_id, &frame.signature)
        .map_err(|_| "invalid signature")
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Unsubscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Publish(String, Vec<u8>, oneshot::Sender<anyhow::Result<MessageId>>),
    Inbound(Identity, GossipFrame),
    PeerConnected(Identity),
    PeerDisconnected(Identity),
    Penalize(Identity, f64),
    GetSubscriptions(oneshot::Sender<Vec<String>>),
    GetMeshPeers(String, oneshot::Sender<Vec<Identity>>),
    GetTopicPeers(String, oneshot::Sender<Vec<Identity>>),
    GetPeerScore(Identity, oneshot::Sender<f64>),
    Quit,
}

// ============================================================================
// GossipSub Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct GossipSub {
    cmd_tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for GossipSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipSub")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

fn closed() -> anyhow::Error {
    anyhow!("gossip actor closed")
}

impl GossipSub {
    /// Start the overlay actor. Returns the handle and the channel of
    /// messages delivered on application topics.
    pub fn spawn<N: GossipRpc>(
        network: Arc<N>,
        keypair: Keypair,
        config: GossipSubConfig,
        subscribers: Subscribers,
        records: RecordStore,
        px_tx: mpsc::Sender<Vec<PeerRecord>>,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1_024);
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CHANNEL_SIZE);
        let actor = GossipSubActor::new(network, keypair, config, subscribers, records, msg_tx, px_tx);
        tokio::spawn(actor.run(cmd_rx));
        (Self { cmd_tx }, msg_rx)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.request(|tx| Command::Subscribe(topic.to_string(), tx)).await?
    }

    /// Fails with [`ApplicationError::NotSubscribed`] if not subscribed.
    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.request(|tx| Command::Unsubscribe(topic.to_string(), tx)).await?
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> anyhow::Result<MessageId> {
        self.request(|tx| Command::Publish(topic.to_string(), data, tx)).await?
    }

    /// Feed a frame received from `from`.
    pub async fn inbound(&self, from: Identity, frame: GossipFrame) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::Inbound(from, frame))
            .await
            .map_err(|_| closed())
    }

    pub async fn peer_connected(&self, peer: Identity) {
        let _ = self.cmd_tx.send(Command::PeerConnected(peer)).await;
    }

    pub async fn peer_disconnected(&self, peer: Identity) {
        let _ = self.cmd_tx.send(Command::PeerDisconnected(peer)).await;
    }

    /// Add a behaviour penalty, e.g. after a protocol violation.
    pub async fn penalize(&self, peer: Identity, penalty: f64) {
        let _ = self.cmd_tx.send(Command::Penalize(peer, penalty)).await;
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.request(Command::GetSubscriptions).await.unwrap_or_default()
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<Identity> {
        self.request(|tx| Command::GetMeshPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    /// Connected peers known to be subscribed to `topic`.
    pub async fn topic_peers(&self, topic: &str) -> Vec<Identity> {
        self.request(|tx| Command::GetTopicPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    pub async fn peer_score(&self, peer: Identity) -> f64 {
        self.request(|tx| Command::GetPeerScore(peer, tx)).await.unwrap_or(0.0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// GossipSub Actor (owns state)
// ============================================================================

#[derive(Debug, Default)]
struct TopicState {
    mesh: HashSet<Identity>,
    /// Message ids per heartbeat window, newest first.
    history: VecDeque<Vec<MessageId>>,
}

struct FanoutState {
    peers: HashSet<Identity>,
    last_publish: Instant,
}

struct CachedMessage {
    frame: DataFrame,
    cached_at: Instant,
}

/// Key for backoff tracking: (peer, topic).
type BackoffKey = (Identity, String);

struct GossipSubActor<N: GossipRpc> {
    network: Arc<N>,
    keypair: Keypair,
    local: Identity,
    config: GossipSubConfig,
    subscribers: Subscribers,
    records: RecordStore,
    msg_tx: mpsc::Sender<Message>,
    px_tx: mpsc::Sender<Vec<PeerRecord>>,

    subscriptions: HashSet<String>,
    topics: HashMap<String, TopicState>,
    /// Connected peers and the topics they announced.
    peers: HashMap<Identity, HashSet<String>>,
    fanout: HashMap<String, FanoutState>,
    seen: SeenCache,
    message_cache: LruCache<MessageId, CachedMessage>,
    /// IWANT promises: id -> (advertiser, requested at).
    promises: HashMap<MessageId, (Identity, Instant)>,
    /// Backoff expiry per (peer, topic).
    backoff: LruCache<BackoffKey, Instant>,
    scores: LruCache<Identity, PeerScore>,
    seqno: u64,
}

impl<N: GossipRpc> GossipSubActor<N> {
    fn new(
        network: Arc<N>,
        keypair: Keypair,
        config: GossipSubConfig,
        subscribers: Subscribers,
        records: RecordStore,
        msg_tx: mpsc::Sender<Message>,
        px_tx: mpsc::Sender<Vec<PeerRecord>>,
    ) -> Self {
        let cache_cap = NonZeroUsize::new(config.message_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let backoff_cap = NonZeroUsize::new(MAX_BACKOFF_ENTRIES).expect("MAX_BACKOFF_ENTRIES must be non-zero");
        let scores_cap = NonZeroUsize::new(MAX_SCORED_PEERS).expect("MAX_SCORED_PEERS must be non-zero");
        Self {
            network,
            local: keypair.identity(),
            keypair,
            seen: SeenCache::new(config.seen_ttl, config.seen_capacity),
            config,
            subscribers,
            records,
            msg_tx,
            px_tx,
            subscriptions: HashSet::new(),
            topics: HashMap::new(),
            peers: HashMap::new(),
            fanout: HashMap::new(),
            message_cache: LruCache::new(cache_cap),
            promises: HashMap::new(),
            backoff: LruCache::new(backoff_cap),
            scores: LruCache::new(scores_cap),
            // Seeded from the clock so a restarted node does not reuse ids.
            seqno: now_ms(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_subscribe_cmd(&topic).await);
                        }
                        Some(Command::Unsubscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_unsubscribe_cmd(&topic).await);
                        }
                        Some(Command::Publish(topic, data, reply)) => {
                            let _ = reply.send(self.handle_publish_cmd(&topic, data).await);
                        }
                        Some(Command::Inbound(from, frame)) => self.handle_frame(from, frame).await,
                        Some(Command::PeerConnected(peer)) => self.handle_peer_connected(peer).await,
                        Some(Command::PeerDisconnected(peer)) => self.handle_peer_disconnected(&peer),
                        Some(Command::Penalize(peer, penalty)) => self.add_penalty(&peer, penalty),
                        Some(Command::GetSubscriptions(reply)) => {
                            let mut topics: Vec<String> = self.subscriptions.iter().cloned().collect();
                            topics.sort();
                            let _ = reply.send(topics);
                        }
                        Some(Command::GetMeshPeers(topic, reply)) => {
                            let peers = self
                                .topics
                                .get(&topic)
                                .map(|s| s.mesh.iter().copied().collect())
                                .unwrap_or_default();
                            let _ = reply.send(peers);
                        }
                        Some(Command::GetTopicPeers(topic, reply)) => {
                            let _ = reply.send(self.topic_peers(&topic));
                        }
                        Some(Command::GetPeerScore(peer, reply)) => {
                            let _ = reply.send(self.score(&peer));
                        }
                        Some(Command::Quit) => {
                            debug!("gossip actor quitting");
                            break;
                        }
                        None => {
                            debug!("gossip handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }
    }

    async fn send(&self, to: &Identity, frame: GossipFrame) {
        if let Err(e) = self.network.send_gossip(to, frame).await {
            trace!(peer = %to.short(), error = %e, "failed to queue gossip frame");
        }
    }

    fn topic_peers(&self, topic: &str) -> Vec<Identity> {
        self.peers
            .iter()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(peer, _)| *peer)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Scoring helpers
    // ------------------------------------------------------------------------

    fn score(&mut self, peer: &Identity) -> f64 {
        let params = &self.config.score;
        self.scores.get(peer).map(|s| s.calculate(params)).unwrap_or(0.0)
    }

    fn score_entry(&mut self, peer: &Identity) -> &mut PeerScore {
        self.scores.get_or_insert_mut(*peer, PeerScore::default)
    }

    fn is_graylisted(&mut self, peer: &Identity) -> bool {
        self.score(peer) < self.config.graylist_threshold
    }

    fn add_penalty(&mut self, peer: &Identity, penalty: f64) {
        self.score_entry(peer).behaviour_penalty += penalty;
        debug!(peer = %peer.short(), penalty, "behaviour penalty applied");
    }

    fn mesh_joined(&mut self, peer: &Identity, topic: &str) {
        self.score_entry(peer)
            .mesh_since
            .entry(topic.to_string())
            .or_insert_with(Instant::now);
    }

    fn mesh_left(&mut self, peer: &Identity, topic: &str) {
        if let Some(score) = self.scores.get_mut(peer) {
            score.mesh_since.remove(topic);
        }
    }

    fn decay_scores(&mut self) {
        let params = self.config.score.clone();
        for (_, score) in self.scores.iter_mut() {
            score.decay(&params);
        }
    }

    // ------------------------------------------------------------------------
    // Backoff
    // ------------------------------------------------------------------------

    fn record_backoff(&mut self, peer: &Identity, topic: &str, duration: Duration) {
        let until = Instant::now() + duration.min(MAX_BACKOFF);
        let key = (*peer, topic.to_string());
        let current = self.backoff.get(&key).copied();
        if current.is_none_or(|c| c < until) {
            self.backoff.put(key, until);
        }
    }

    fn is_in_backoff(&mut self, peer: &Identity, topic: &str) -> bool {
        let key = (*peer, topic.to_string());
        self.backoff.get(&key).is_some_and(|until| *until > Instant::now())
    }

    fn cleanup_backoff(&mut self) {
        let now = Instant::now();
        let expired: Vec<BackoffKey> = self
            .backoff
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.backoff.pop(&key);
        }
    }

    /// Peer exchange records for a PRUNE: other mesh/topic peers with known
    /// signed records.
    fn px_records(&mut self, topic: &str, exclude: &Identity) -> Vec<PeerRecord> {
        let mut candidates: Vec<Identity> = self
            .topic_peers(topic)
            .into_iter()
            .filter(|p| p != exclude)
            .collect();
        candidates.retain(|p| self.score(p) >= 0.0);
        candidates.truncate(MAX_PX_PEERS);
        self.records.records_for(&candidates)
    }

    async fn send_prune(&mut self, peer: &Identity, topic: &str, with_px: bool) {
        let peers = if with_px {
            self.px_records(topic, peer)
        } else {
            Vec::new()
        };
        let backoff = self.config.prune_backoff;
        self.record_backoff(peer, topic, backoff);
        self.send(
            peer,
            GossipFrame::Prune {
                topic: topic.to_string(),
                backoff_secs: backoff.as_secs(),
                peers,
            },
        )
        .await;
    }

    // ------------------------------------------------------------------------
    // Local commands
    // ------------------------------------------------------------------------

    async fn handle_subscribe_cmd(&mut self, topic: &str) -> anyhow::Result<()> {
        if !is_valid_topic(topic) {
            return Err(ApplicationError::InvalidTopic {
                topic: topic.to_string(),
                reason: "topic must be 1 to 256 bytes",
            }
            .into());
        }
        if !self.subscriptions.insert(topic.to_string()) {
            return Ok(());
        }
        let mut state = TopicState::default();
        state.history.push_front(Vec::new());
        self.topics.insert(topic.to_string(), state);

        let connected: Vec<Identity> = self.peers.keys().copied().collect();
        for peer in &connected {
            self.send(peer, GossipFrame::Subscribe { topic: topic.to_string() }).await;
        }

        // Seed the mesh from fanout first, then other topic peers.
        let fanout: Vec<Identity> = self
            .fanout
            .remove(topic)
            .map(|f| f.peers.into_iter().collect())
            .unwrap_or_default();
        let mut candidates = fanout;
        for peer in self.topic_peers(topic) {
            if !candidates.contains(&peer) {
                candidates.push(peer);
            }
        }
        self.graft_candidates(topic, candidates).await;

        debug!(topic = %topic, "subscribed");
        Ok(())
    }

    async fn handle_unsubscribe_cmd(&mut self, topic: &str) -> anyhow::Result<()> {
        if !self.subscriptions.remove(topic) {
            return Err(ApplicationError::NotSubscribed(topic.to_string()).into());
        }
        let mesh = self.topics.remove(topic).map(|s| s.mesh).unwrap_or_default();
        for peer in mesh {
            self.mesh_left(&peer, topic);
            self.send_prune(&peer, topic, false).await;
        }
        let connected: Vec<Identity> = self.peers.keys().copied().collect();
        for peer in &connected {
            self.send(peer, GossipFrame::Unsubscribe { topic: topic.to_string() }).await;
        }
        debug!(topic = %topic, "unsubscribed");
        Ok(())
    }

    async fn handle_publish_cmd(&mut self, topic: &str, data: Vec<u8>) -> anyhow::Result<MessageId> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(ApplicationError::PayloadTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        if !is_valid_topic(topic) {
            return Err(ApplicationError::InvalidTopic {
                topic: topic.to_string(),
                reason: "topic must be 1 to 256 bytes",
            }
            .into());
        }

        let targets = self.publish_targets(topic);
        if !self.subscriptions.contains(topic) && targets.is_empty() {
            return Err(ApplicationError::NotSubscribed(topic.to_string()).into());
        }

        self.seqno = self.seqno.wrapping_add(1);
        let msg_id = compute_message_id(topic, &self.local, self.seqno, &data);
        let frame = DataFrame {
            topic: topic.to_string(),
            msg_id,
            source: self.local,
            seqno: self.seqno,
            data,
            signature: sign_message(&self.keypair, &msg_id),
        };

        self.seen.insert(msg_id);
        self.remember(&frame);

        for peer in &targets {
            self.send(peer, GossipFrame::Data(frame.clone())).await;
        }
        trace!(
            topic = %topic,
            msg_id = %hex::encode(&msg_id[..8]),
            peers = targets.len(),
            "published message"
        );
        Ok(msg_id)
    }

    fn publish_targets(&mut self, topic: &str) -> Vec<Identity> {
        let mut targets: HashSet<Identity> = HashSet::new();
        if let Some(state) = self.topics.get(topic) {
            targets.extend(state.mesh.iter().copied());
        } else {
            let known: Option<Vec<Identity>> = self
                .fanout
                .get(topic)
                .map(|f| f.peers.iter().copied().collect());
            let peers = match known {
                Some(peers) if !peers.is_empty() => peers,
                _ => {
                    let mut candidates = self.topic_peers(topic);
                    candidates.retain(|p| self.score(p) >= self.config.publish_threshold);
                    candidates.shuffle(&mut rand::thread_rng());
                    candidates.truncate(self.config.mesh_n);
                    candidates
                }
            };
            if !peers.is_empty() {
                let entry = self.fanout.entry(topic.to_string()).or_insert_with(|| FanoutState {
                    peers: HashSet::new(),
                    last_publish: Instant::now(),
                });
                entry.peers.extend(peers.iter().copied());
                entry.last_publish = Instant::now();
            }
            targets.extend(peers);
        }
        if self.config.flood_publish {
            for peer in self.topic_peers(topic) {
                if self.score(&peer) >= self.config.publish_threshold {
                    targets.insert(peer);
                }
            }
        }
        targets.into_iter().collect()
    }

    fn remember(&mut self, frame: &DataFrame) {
        self.message_cache.put(
            frame.msg_id,
            CachedMessage {
                frame: frame.clone(),
                cached_at: Instant::now(),
            },
        );
        if let Some(state) = self.topics.get_mut(&frame.topic) {
            if state.history.is_empty() {
                state.history.push_front(Vec::new());
            }
            if let Some(window) = state.history.front_mut() {
                window.push(frame.msg_id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------------

    async fn handle_peer_connected(&mut self, peer: Identity) {
        if peer == self.local {
            return;
        }
        self.peers.entry(peer).or_default();
        let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
        for topic in topics {
            self.send(&peer, GossipFrame::Subscribe { topic }).await;
        }
        trace!(peer = %peer.short(), "peer joined overlay");
    }

    fn handle_peer_disconnected(&mut self, peer: &Identity) {
        self.peers.remove(peer);
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        for topic in topics {
            if let Some(state) = self.topics.get_mut(&topic)
                && state.mesh.remove(peer)
            {
                self.mesh_left(peer, &topic);
            }
        }
        for fanout in self.fanout.values_mut() {
            fanout.peers.remove(peer);
        }
        self.promises.retain(|_, (advertiser, _)| advertiser != peer);
        trace!(peer = %peer.short(), "peer left overlay");
    }

    // ------------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------------

    async fn handle_frame(&mut self, from: Identity, frame: GossipFrame) {
        if self.is_graylisted(&from) {
            trace!(peer = %from.short(), "ignoring frame from graylisted peer");
            return;
        }
        // Frames can trail a disconnect; only connected peers take part.
        if !self.peers.contains_key(&from) {
            trace!(peer = %from.short(), "ignoring frame from unconnected peer");
            return;
        }
        match frame {
            GossipFrame::Data(data) => self.handle_data(&from, data).await,
            GossipFrame::Subscribe { topic } => self.handle_subscribe(&from, topic).await,
            GossipFrame::Unsubscribe { topic } => self.handle_unsubscribe(&from, &topic),
            GossipFrame::Graft { topic } => self.handle_graft(&from, &topic).await,
            GossipFrame::Prune { topic, backoff_secs, peers } => self.handle_prune(&from, &topic, backoff_secs, peers),
            GossipFrame::IHave { topic, msg_ids } => self.handle_ihave(&from, &topic, msg_ids).await,
            GossipFrame::IWant { msg_ids } => self.handle_iwant(&from, msg_ids).await,
        }
    }

    async fn handle_subscribe(&mut self, from: &Identity, topic: String) {
        if !is_valid_topic(&topic) {
            return;
        }
        let Some(topics) = self.peers.get_mut(from) else {
            return;
        };
        if topics.len() >= MAX_SUBSCRIPTIONS_PER_PEER && !topics.contains(&topic) {
            debug!(peer = %from.short(), "peer exceeded subscription limit");
            return;
        }
        topics.insert(topic.clone());

        let short = self
            .topics
            .get(&topic)
            .is_some_and(|s| s.mesh.len() < self.config.mesh_n && !s.mesh.contains(from));
        if short {
            self.graft_candidates(&topic, vec![*from]).await;
        }
    }

    fn handle_unsubscribe(&mut self, from: &Identity, topic: &str) {
        if let Some(topics) = self.peers.get_mut(from) {
            topics.remove(topic);
        }
        if let Some(state) = self.topics.get_mut(topic)
            && state.mesh.remove(from)
        {
            self.mesh_left(from, topic);
        }
        if let Some(fanout) = self.fanout.get_mut(topic) {
            fanout.peers.remove(from);
        }
    }

    async fn handle_graft(&mut self, from: &Identity, topic: &str) {
        if !self.subscriptions.contains(topic) {
            self.send_prune(from, topic, false).await;
            return;
        }
        if self.is_in_backoff(from, topic) {
            debug!(peer = %from.short(), topic = %topic, "graft during backoff");
            self.add_penalty(from, 1.0);
            self.send_prune(from, topic, false).await;
            return;
        }
        if self.score(from) < 0.0 {
            self.send_prune(from, topic, false).await;
            return;
        }
        // A graft implies the peer is subscribed.
        let Some(topics) = self.peers.get_mut(from) else {
            return;
        };
        topics.insert(topic.to_string());
        if let Some(state) = self.topics.get_mut(topic)
            && state.mesh.insert(*from)
        {
            self.mesh_joined(from, topic);
            trace!(peer = %from.short(), topic = %topic, "peer grafted us");
        }
    }

    fn handle_prune(&mut self, from: &Identity, topic: &str, backoff_secs: u64, peers: Vec<PeerRecord>) {
        if let Some(state) = self.topics.get_mut(topic)
            && state.mesh.remove(from)
        {
            self.mesh_left(from, topic);
        }
        let backoff = Duration::from_secs(backoff_secs).max(self.config.prune_backoff);
        self.record_backoff(from, topic, backoff);

        if !peers.is_empty() && self.score(from) >= 0.0 {
            let mut peers = peers;
            peers.truncate(MAX_PX_PEERS);
            if self.px_tx.try_send(peers).is_err() {
                trace!("peer exchange channel full, dropping records");
            }
        }
        trace!(peer = %from.short(), topic = %topic, "pruned by peer");
    }

    async fn handle_data(&mut self, from: &Identity, frame: DataFrame) {
        if self.seen.contains(&frame.msg_id) {
            self.promises.remove(&frame.msg_id);
            return;
        }
        if let Err(reason) = validate_data(&frame) {
            debug!(
                peer = %from.short(),
                topic = %frame.topic,
                reason,
                "rejecting invalid message"
            );
            self.score_entry(from).invalid_messages += 1.0;
            return;
        }

        self.seen.insert(frame.msg_id);
        self.promises.remove(&frame.msg_id);
        if !self.subscriptions.contains(&frame.topic) {
            trace!(topic = %frame.topic, "message for unsubscribed topic");
            return;
        }
        self.score_entry(from).first_deliveries += 1.0;
        self.remember(&frame);

        if frame.source != self.local {
            self.deliver(&frame);
        }

        let forward: Vec<Identity> = self
            .topics
            .get(&frame.topic)
            .map(|s| {
                s.mesh
                    .iter()
                    .filter(|p| *p != from && **p != frame.source)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for peer in &forward {
            self.send(peer, GossipFrame::Data(frame.clone())).await;
        }
    }

    fn deliver(&mut self, frame: &DataFrame) {
        let message = Message {
            topic: frame.topic.clone(),
            from: frame.source,
            data: frame.data.clone(),
            id: frame.msg_id,
        };
        trace!(
            topic = %message.topic,
            source = %message.from.short(),
            msg_id = %hex::encode(&message.id[..8]),
            "delivering message"
        );
        self.subscribers.deliver(&message);
        if message.topic != DISCOVERY_TOPIC
            && let Err(mpsc::error::TrySendError::Full(_)) = self.msg_tx.try_send(message)
        {
            warn!("message channel full, dropping delivery");
        }
    }

    async fn handle_ihave(&mut self, from: &Identity, topic: &str, msg_ids: Vec<MessageId>) {
        if self.score(from) < self.config.gossip_threshold || !self.subscriptions.contains(topic) {
            return;
        }
        if self.promises.len() >= MAX_PENDING_PROMISES {
            return;
        }
        let now = Instant::now();
        let wanted: Vec<MessageId> = msg_ids
            .into_iter()
            .take(self.config.max_ihave_length)
            .filter(|id| !self.seen.contains(id) && !self.promises.contains_key(id))
            .collect();
        if wanted.is_empty() {
            return;
        }
        for id in &wanted {
            self.promises.insert(*id, (*from, now));
        }
        trace!(peer = %from.short(), count = wanted.len(), "requesting advertised messages");
        self.send(from, GossipFrame::IWant { msg_ids: wanted }).await;
    }

    async fn handle_iwant(&mut self, from: &Identity, msg_ids: Vec<MessageId>) {
        if self.score(from) < self.config.gossip_threshold {
            return;
        }
        let frames: Vec<DataFrame> = msg_ids
            .iter()
            .take(MAX_IWANT_IDS)
            .filter_map(|id| self.message_cache.peek(id).map(|c| c.frame.clone()))
            .collect();
        for frame in frames {
            self.send(from, GossipFrame::Data(frame)).await;
        }
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    async fn heartbeat(&mut self) {
        let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
        for topic in &topics {
            self.mesh_maintenance(topic).await;
        }
        self.fanout_maintenance();
        for topic in &topics {
            self.emit_gossip(topic).await;
        }

        let now = Instant::now();
        self.seen.purge(now);
        self.purge_message_cache(now);
        self.check_promises(now);
        self.cleanup_backoff();
        self.decay_scores();
    }

    /// Graft up to the mesh deficit from `candidates`, best score first.
    async fn graft_candidates(&mut self, topic: &str, candidates: Vec<Identity>) {
        let Some(state) = self.topics.get(topic) else {
            return;
        };
        let needed = self.config.mesh_n.saturating_sub(state.mesh.len());
        if needed == 0 {
            return;
        }
        let mesh = state.mesh.clone();
        let mut scored: Vec<(Identity, f64)> = Vec::new();
        for peer in candidates {
            if mesh.contains(&peer) || !self.peers.contains_key(&peer) || self.is_in_backoff(&peer, topic) {
                continue;
            }
            let score = self.score(&peer);
            if score < self.config.mesh_prune_threshold {
                continue;
            }
            scored.push((peer, score));
        }
        scored.shuffle(&mut rand::thread_rng());
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (peer, _) in scored.into_iter().take(needed) {
            if let Some(state) = self.topics.get_mut(topic) {
                state.mesh.insert(peer);
            }
            self.mesh_joined(&peer, topic);
            self.send(&peer, GossipFrame::Graft { topic: topic.to_string() }).await;
            trace!(peer = %peer.short(), topic = %topic, "grafted peer");
        }
    }

    async fn mesh_maintenance(&mut self, topic: &str) {
        let Some(state) = self.topics.get(topic) else {
            return;
        };
        let mesh: Vec<Identity> = state.mesh.iter().copied().collect();

        // Low scorers and peers that are gone or no longer subscribed.
        for peer in &mesh {
            let subscribed = self.peers.get(peer).is_some_and(|t| t.contains(topic));
            let low = self.score(peer) < self.config.mesh_prune_threshold;
            if !subscribed || low {
                if let Some(state) = self.topics.get_mut(topic) {
                    state.mesh.remove(peer);
                }
                self.mesh_left(peer, topic);
                if low && subscribed {
                    debug!(peer = %peer.short(), topic = %topic, "pruning low-scoring mesh peer");
                    self.send_prune(peer, topic, false).await;
                }
            }
        }

        let size = self.topics.get(topic).map_or(0, |s| s.mesh.len());
        if size < self.config.mesh_n {
            let candidates = self.topic_peers(topic);
            self.graft_candidates(topic, candidates).await;
            let size = self.topics.get(topic).map_or(0, |s| s.mesh.len());
            if size < self.config.mesh_n {
                debug!(topic = %topic, size, target = self.config.mesh_n, "mesh below degree, no graft candidates");
            }
        } else if size > self.config.mesh_n {
            let mut members: Vec<(Identity, f64)> = self
                .topics
                .get(topic)
                .map(|s| s.mesh.iter().copied().collect::<Vec<_>>())
                .unwrap_or_default()
                .into_iter()
                .map(|p| (p, 0.0))
                .collect();
            for (peer, score) in members.iter_mut() {
                *score = self.score(peer);
            }
            members.shuffle(&mut rand::thread_rng());
            members.sort_by(|a, b| a.1.total_cmp(&b.1));
            let excess = size - self.config.mesh_n;
            for (peer, _) in members.into_iter().take(excess) {
                if let Some(state) = self.topics.get_mut(topic) {
                    state.mesh.remove(&peer);
                }
                self.mesh_left(&peer, topic);
                self.send_prune(&peer, topic, true).await;
                trace!(peer = %peer.short(), topic = %topic, "pruned excess mesh peer");
            }
        }
    }

    fn fanout_maintenance(&mut self) {
        let ttl = self.config.fanout_ttl;
        self.fanout.retain(|_, f| f.last_publish.elapsed() < ttl);
        let peers = &self.peers;
        for (topic, fanout) in self.fanout.iter_mut() {
            fanout
                .peers
                .retain(|p| peers.get(p).is_some_and(|t| t.contains(topic)));
        }
    }

    async fn emit_gossip(&mut self, topic: &str) {
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        let mut ids: Vec<MessageId> = state.history.iter().flatten().copied().collect();
        state.history.push_front(Vec::new());
        state.history.truncate(self.config.history_gossip.max(1));
        if ids.is_empty() {
            return;
        }
        ids.truncate(self.config.max_ihave_length);
        let mesh = state.mesh.clone();

        let mut candidates: Vec<Identity> = self
            .topic_peers(topic)
            .into_iter()
            .filter(|p| !mesh.contains(p))
            .collect();
        candidates.retain(|p| self.score(p) >= self.config.gossip_threshold);
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.config.gossip_lazy);

        for peer in &candidates {
            self.send(
                peer,
                GossipFrame::IHave {
                    topic: topic.to_string(),
                    msg_ids: ids.clone(),
                },
            )
            .await;
        }
    }

    fn purge_message_cache(&mut self, now: Instant) {
        let ttl = self.config.message_cache_ttl;
        let expired: Vec<MessageId> = self
            .message_cache
            .iter()
            .filter(|(_, c)| now.duration_since(c.cached_at) >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.message_cache.pop(&id);
        }
    }

    fn check_promises(&mut self, now: Instant) {
        let followup = self.config.iwant_followup;
        let mut broken: HashMap<Identity, usize> = HashMap::new();
        self.promises.retain(|_, (advertiser, asked)| {
            if now.duration_since(*asked) >= followup {
                *broken.entry(*advertiser).or_default() += 1;
                false
            } else {
                true
            }
        });
        for (peer, count) in broken {
            debug!(peer = %peer.short(), count, "IWANT promises broken");
            self.add_penalty(&peer, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingNetwork {
        sent: Mutex<Vec<(Identity, GossipFrame)>>,
    }

    impl RecordingNetwork {
        fn sent(&self) -> Vec<(Identity, GossipFrame)> {
            self.sent.lock().unwrap().clone()
        }

        fn sent_to(&self, peer: &Identity) -> Vec<GossipFrame> {
            self.sent()
                .into_iter()
                .filter(|(to, _)| to == peer)
                .map(|(_, f)| f)
                .collect()
        }

        fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    #[async_trait::async_trait]
    impl GossipRpc for RecordingNetwork {
        async fn send_gossip(&self, to: &Identity, frame: GossipFrame) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((*to, frame));
            Ok(())
        }
    }

    struct Harness {
        gossip: GossipSub,
        network: Arc<RecordingNetwork>,
        subscribers: Subscribers,
        messages: mpsc::Receiver<Message>,
        px: mpsc::Receiver<Vec<PeerRecord>>,
    }

    fn slow_config() -> GossipSubConfig {
        GossipSubConfig {
            // Keep heartbeats out of the way unless a test wants them.
            heartbeat_interval: Duration::from_secs(3600),
            ..GossipSubConfig::default()
        }
    }

    fn harness(config: GossipSubConfig) -> Harness {
        let network = Arc::new(RecordingNetwork::default());
        let subscribers = Subscribers::new();
        let (px_tx, px) = mpsc::channel(8);
        let (gossip, messages) = GossipSub::spawn(
            network.clone(),
            Keypair::generate(),
            config,
            subscribers.clone(),
            RecordStore::new(64),
            px_tx,
        );
        Harness {
            gossip,
            network,
            subscribers,
            messages,
            px,
        }
    }

    fn signed_data(source: &Keypair, topic: &str, seqno: u64, data: &[u8]) -> DataFrame {
        let msg_id = compute_message_id(topic, &source.identity(), seqno, data);
        DataFrame {
            topic: topic.to_string(),
            msg_id,
            source: source.identity(),
            seqno,
            data: data.to_vec(),
            signature: sign_message(source, &msg_id),
        }
    }

    async fn join(h: &Harness, peer: Identity, topic: &str) {
        h.gossip.peer_connected(peer).await;
        h.gossip
            .inbound(peer, GossipFrame::Subscribe { topic: topic.to_string() })
            .await
            .unwrap();
    }

    fn application_error(err: anyhow::Error) -> ApplicationError {
        err.downcast::<ApplicationError>().expect("application error")
    }

    #[test]
    fn seen_cache_expires_and_caps() {
        let mut seen = SeenCache::new(Duration::from_secs(120), 3);
        let start = Instant::now();
        assert!(seen.insert_at([1; 32], start));
        assert!(!seen.insert_at([1; 32], start));
        seen.insert_at([2; 32], start + Duration::from_secs(60));
        seen.insert_at([3; 32], start + Duration::from_secs(61));
        seen.insert_at([4; 32], start + Duration::from_secs(62));
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&[1; 32]), "oldest evicted at capacity");

        seen.purge(start + Duration::from_secs(181));
        assert!(!seen.contains(&[2; 32]));
        assert!(!seen.contains(&[3; 32]));
        assert!(seen.contains(&[4; 32]));
    }

    #[test]
    fn score_penalties_are_squared_and_decay() {
        let params = ScoreParams::default();
        let mut score = PeerScore {
            behaviour_penalty: 2.0,
            ..PeerScore::default()
        };
        assert_eq!(score.calculate(&params), -40.0);
        score.invalid_messages = 1.0;
        assert!(score.calculate(&params) < DEFAULT_GRAYLIST_THRESHOLD);

        for _ in 0..1_000 {
            score.decay(&params);
        }
        assert_eq!(score.calculate(&params), 0.0);
    }

    #[test]
    fn subscribers_run_in_order_and_isolate_failures() {
        let subscribers = Subscribers::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = calls.clone();
        subscribers.on_topic("chat", move |_: &Message| -> anyhow::Result<()> {
            c.lock().unwrap().push("first");
            Err(anyhow!("handler error"))
        });
        subscribers.on_topic("chat", |_: &Message| -> anyhow::Result<()> { panic!("boom") });
        let c = calls.clone();
        let any = subscribers.on_any(move |_: &Message| -> anyhow::Result<()> {
            c.lock().unwrap().push("any");
            Ok(())
        });

        let message = Message {
            topic: "chat".into(),
            from: Keypair::generate().identity(),
            data: b"hi".to_vec(),
            id: [0; 32],
        };
        assert_eq!(subscribers.deliver(&message), 3);
        assert_eq!(*calls.lock().unwrap(), vec!["first", "any"]);

        let discovery = Message {
            topic: DISCOVERY_TOPIC.into(),
            ..message.clone()
        };
        assert_eq!(subscribers.deliver(&discovery), 0, "catch-all never sees discovery");

        assert!(subscribers.remove(any));
        assert!(!subscribers.remove(any));
        calls.lock().unwrap().clear();
        subscribers.deliver(&message);
        assert_eq!(*calls.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_fails() {
        let h = harness(slow_config());
        let err = h.gossip.unsubscribe("nope").await.unwrap_err();
        assert_eq!(application_error(err), ApplicationError::NotSubscribed("nope".into()));
    }

    #[tokio::test]
    async fn publish_without_subscription_or_peers_fails() {
        let h = harness(slow_config());
        let err = h.gossip.publish("lonely", b"x".to_vec()).await.unwrap_err();
        assert_eq!(application_error(err), ApplicationError::NotSubscribed("lonely".into()));

        let err = h.gossip.publish("big", vec![0; MAX_PAYLOAD_SIZE + 1]).await.unwrap_err();
        assert!(matches!(application_error(err), ApplicationError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn publish_signs_and_reaches_topic_peers() {
        let h = harness(slow_config());
        let peer = Keypair::generate().identity();
        h.gossip.subscribe("chat").await.unwrap();
        join(&h, peer, "chat").await;

        let id = h.gossip.publish("chat", b"hello".to_vec()).await.unwrap();
        let data: Vec<DataFrame> = h
            .network
            .sent_to(&peer)
            .into_iter()
            .filter_map(|f| match f {
                GossipFrame::Data(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].msg_id, id);
        validate_data(&data[0]).unwrap();
    }

    #[tokio::test]
    async fn fanout_publish_when_not_subscribed() {
        let h = harness(slow_config());
        let peer = Keypair::generate().identity();
        join(&h, peer, "news").await;

        h.gossip.publish("news", b"update".to_vec()).await.unwrap();
        assert!(
            h.network
                .sent_to(&peer)
                .iter()
                .any(|f| matches!(f, GossipFrame::Data(d) if d.data == b"update"))
        );
        assert!(h.gossip.mesh_peers("news").await.is_empty());
    }

    #[tokio::test]
    async fn inbound_message_is_delivered_once_and_forwarded() {
        let mut h = harness(slow_config());
        h.gossip.subscribe("chat").await.unwrap();
        let (p1, p2) = (Keypair::generate().identity(), Keypair::generate().identity());
        join(&h, p1, "chat").await;
        join(&h, p2, "chat").await;
        assert_eq!(h.gossip.mesh_peers("chat").await.len(), 2);

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        h.subscribers.on_topic("chat", move |_: &Message| -> anyhow::Result<()> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let source = Keypair::generate();
        let frame = signed_data(&source, "chat", 1, b"hi");
        h.network.clear();
        h.gossip.inbound(p1, GossipFrame::Data(frame.clone())).await.unwrap();
        h.gossip.inbound(p2, GossipFrame::Data(frame.clone())).await.unwrap();
        h.gossip.subscriptions().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let delivered = h.messages.recv().await.unwrap();
        assert_eq!(delivered.from, source.identity());
        assert_eq!(delivered.data, b"hi");
        assert!(h.messages.try_recv().is_err());

        assert!(h.network.sent_to(&p1).is_empty(), "never echoed to the sender");
        assert_eq!(h.network.sent_to(&p2).len(), 1, "forwarded once to the other mesh peer");
    }

    #[tokio::test]
    async fn invalid_message_is_penalized_and_not_marked_seen() {
        let h = harness(slow_config());
        h.gossip.subscribe("chat").await.unwrap();
        let peer = Keypair::generate().identity();
        join(&h, peer, "chat").await;

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        h.subscribers.on_topic("chat", move |_: &Message| -> anyhow::Result<()> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let source = Keypair::generate();
        let good = signed_data(&source, "chat", 7, b"payload");
        let mut forged = good.clone();
        forged.signature[0] ^= 0xff;

        h.gossip.inbound(peer, GossipFrame::Data(forged)).await.unwrap();
        assert!(h.gossip.peer_score(peer).await < 0.0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let honest = Keypair::generate().identity();
        join(&h, honest, "chat").await;
        h.gossip.inbound(honest, GossipFrame::Data(good)).await.unwrap();
        h.gossip.subscriptions().await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "valid copy still delivered");
    }

    #[tokio::test]
    async fn mesh_converges_to_exact_degree() {
        let config = GossipSubConfig {
            mesh_n: 3,
            heartbeat_interval: Duration::from_millis(20),
            ..GossipSubConfig::default()
        };
        let h = harness(config);
        let peers: Vec<Identity> = (0..8).map(|_| Keypair::generate().identity()).collect();
        for peer in &peers {
            join(&h, *peer, "topic").await;
        }
        h.gossip.subscribe("topic").await.unwrap();
        assert_eq!(h.gossip.mesh_peers("topic").await.len(), 3);

        // Peers grafting us push the mesh over D; the heartbeat prunes back.
        for peer in &peers {
            h.gossip
                .inbound(*peer, GossipFrame::Graft { topic: "topic".into() })
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.gossip.mesh_peers("topic").await.len() != 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("mesh pruned back to D");

        let prunes = h
            .network
            .sent()
            .into_iter()
            .filter(|(_, f)| matches!(f, GossipFrame::Prune { .. }))
            .count();
        assert!(prunes >= 5);
    }

    #[tokio::test]
    async fn graft_when_unsubscribed_is_pruned() {
        let h = harness(slow_config());
        let peer = Keypair::generate().identity();
        h.gossip.peer_connected(peer).await;
        h.gossip
            .inbound(peer, GossipFrame::Graft { topic: "other".into() })
            .await
            .unwrap();
        h.gossip.subscriptions().await;
        assert!(
            h.network
                .sent_to(&peer)
                .iter()
                .any(|f| matches!(f, GossipFrame::Prune { topic, .. } if topic == "other"))
        );
    }

    #[tokio::test]
    async fn graft_during_backoff_is_penalized() {
        let h = harness(slow_config());
        let peer = Keypair::generate().identity();
        h.gossip.subscribe("t").await.unwrap();
        join(&h, peer, "t").await;
        h.gossip
            .inbound(
                peer,
                GossipFrame::Prune {
                    topic: "t".into(),
                    backoff_secs: 60,
                    peers: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert!(h.gossip.mesh_peers("t").await.is_empty());

        h.gossip
            .inbound(peer, GossipFrame::Graft { topic: "t".into() })
            .await
            .unwrap();
        assert!(h.gossip.mesh_peers("t").await.is_empty());
        assert!(h.gossip.peer_score(peer).await < 0.0);
    }

    #[tokio::test]
    async fn prune_peer_exchange_reaches_discovery() {
        let mut h = harness(slow_config());
        let peer = Keypair::generate().identity();
        h.gossip.subscribe("t").await.unwrap();
        join(&h, peer, "t").await;

        let record = Keypair::generate().create_record(vec!["/ip4/127.0.0.1/tcp/4001".into()]);
        h.gossip
            .inbound(
                peer,
                GossipFrame::Prune {
                    topic: "t".into(),
                    backoff_secs: 60,
                    peers: vec![record.clone()],
                },
            )
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), h.px.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, vec![record]);
    }

    #[tokio::test]
    async fn ihave_iwant_repair() {
        let h = harness(slow_config());
        h.gossip.subscribe("t").await.unwrap();
        let peer = Keypair::generate().identity();
        join(&h, peer, "t").await;

        // We publish, the peer asks for it by id.
        let id = h.gossip.publish("t", b"cached".to_vec()).await.unwrap();
        h.network.clear();
        h.gossip
            .inbound(peer, GossipFrame::IWant { msg_ids: vec![id] })
            .await
            .unwrap();
        h.gossip.subscriptions().await;
        assert!(
            h.network
                .sent_to(&peer)
                .iter()
                .any(|f| matches!(f, GossipFrame::Data(d) if d.msg_id == id))
        );

        // The peer advertises an id we have not seen: we ask for it.
        h.network.clear();
        h.gossip
            .inbound(
                peer,
                GossipFrame::IHave {
                    topic: "t".into(),
                    msg_ids: vec![[9; 32], id],
                },
            )
            .await
            .unwrap();
        h.gossip.subscriptions().await;
        let iwants: Vec<Vec<MessageId>> = h
            .network
            .sent_to(&peer)
            .into_iter()
            .filter_map(|f| match f {
                GossipFrame::IWant { msg_ids } => Some(msg_ids),
                _ => None,
            })
            .collect();
        assert_eq!(iwants, vec![vec![[9; 32]]]);
    }

    #[tokio::test]
    async fn broken_iwant_promise_is_penalized() {
        let config = GossipSubConfig {
            heartbeat_interval: Duration::from_millis(20),
            iwant_followup: Duration::from_millis(50),
            ..GossipSubConfig::default()
        };
        let h = harness(config);
        h.gossip.subscribe("t").await.unwrap();
        let peer = Keypair::generate().identity();
        join(&h, peer, "t").await;
        h.gossip
            .inbound(
                peer,
                GossipFrame::IHave {
                    topic: "t".into(),
                    msg_ids: vec![[5; 32]],
                },
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.gossip.peer_score(peer).await >= 0.0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("advertiser penalized");
    }

    #[tokio::test]
    async fn new_peer_learns_our_subscriptions() {
        let h = harness(slow_config());
        h.gossip.subscribe("a").await.unwrap();
        h.gossip.subscribe("b").await.unwrap();
        let peer = Keypair::generate().identity();
        h.gossip.peer_connected(peer).await;
        h.gossip.subscriptions().await;

        let mut announced: Vec<String> = h
            .network
            .sent_to(&peer)
            .into_iter()
            .filter_map(|f| match f {
                GossipFrame::Subscribe { topic } => Some(topic),
                _ => None,
            })
            .collect();
        announced.sort();
        assert_eq!(announced, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_clears_peer_state() {
        let h = harness(slow_config());
        h.gossip.subscribe("t").await.unwrap();
        let peer = Keypair::generate().identity();
        join(&h, peer, "t").await;
        assert_eq!(h.gossip.mesh_peers("t").await, vec![peer]);

        h.gossip.peer_disconnected(peer).await;
        assert!(h.gossip.mesh_peers("t").await.is_empty());
        assert!(h.gossip.topic_peers("t").await.is_empty());
    }

    #[tokio::test]
    async fn frames_from_unconnected_peers_never_enter_the_mesh() {
        let h = harness(slow_config());
        h.gossip.subscribe("t").await.unwrap();

        let departed = Keypair::generate().identity();
        h.gossip.peer_connected(departed).await;
        h.gossip.peer_disconnected(departed).await;
        h.gossip
            .inbound(departed, GossipFrame::Graft { topic: "t".into() })
            .await
            .unwrap();

        let stranger = Keypair::generate().identity();
        h.gossip
            .inbound(stranger, GossipFrame::Subscribe { topic: "t".into() })
            .await
            .unwrap();
        h.gossip
            .inbound(stranger, GossipFrame::Graft { topic: "t".into() })
            .await
            .unwrap();

        assert!(h.gossip.mesh_peers("t").await.is_empty());
        assert!(h.gossip.topic_peers("t").await.is_empty());
        assert!(h.network.sent_to(&stranger).is_empty());
    }
}
