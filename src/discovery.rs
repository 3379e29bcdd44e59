//! # Peer Discovery
//!
//! Peers find each other by gossiping signed [`PeerRecord`]s on a reserved
//! topic. Every node periodically publishes its own record, and every record
//! that passes validation is remembered in a bounded [`RecordStore`].
//!
//! A record is accepted when it:
//! - is structurally sound (bounded address list, 64-byte signature)
//! - was published by the peer it describes (gossip source == `peer_id`)
//! - carries a valid signature and a timestamp inside the freshness window
//! - does not describe the local node
//!
//! Records learned through PRUNE peer exchange skip only the author rule.
//!
//! The first sighting of a peer is broadcast to every
//! [`DiscoveredPeers`] receiver exactly once; later records for the same
//! peer refresh the stored address set silently.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use lru::LruCache;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::gossipsub::{GossipSub, Message, Subscribers};
use crate::identity::{FreshnessError, Identity, Keypair, PeerRecord};
use crate::wire::{deserialize_bounded, serialize_bounded};

/// Reserved topic carrying peer records.
pub const DISCOVERY_TOPIC: &str = "_peer-discovery._p2p._pubsub";

pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RECORD_FRESHNESS: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RECORDS: usize = 1_024;

/// Inbound records waiting for the discovery actor.
const INBOUND_QUEUE: usize = 256;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How often the local record is republished.
    pub interval: Duration,
    /// Records older than this are discarded.
    pub freshness: Duration,
    pub max_records: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_DISCOVERY_INTERVAL,
            freshness: DEFAULT_RECORD_FRESHNESS,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

// ============================================================================
// Record Store
// ============================================================================

/// Bounded store of the freshest known record per peer. Cheap to clone.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<Mutex<LruCache<Identity, PeerRecord>>>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").field("len", &self.len()).finish()
    }
}

impl RecordStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn get(&self, peer: &Identity) -> Option<PeerRecord> {
        self.inner.lock().ok()?.get(peer).cloned()
    }

    /// Store `record` unless an equally fresh one is held. Returns `true` on
    /// the first sighting of the peer.
    pub fn insert(&self, record: PeerRecord) -> bool {
        let Ok(mut records) = self.inner.lock() else {
            return false;
        };
        match records.get(&record.peer_id) {
            Some(existing) => {
                if record.timestamp_ms > existing.timestamp_ms {
                    records.put(record.peer_id, record);
                }
                false
            }
            None => {
                records.put(record.peer_id, record);
                true
            }
        }
    }

    /// Known records for `peers`, in the given order.
    pub fn records_for(&self, peers: &[Identity]) -> Vec<PeerRecord> {
        let Ok(mut records) = self.inner.lock() else {
            return Vec::new();
        };
        peers.iter().filter_map(|p| records.get(p).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecordRejection {
    #[error("malformed record")]
    Malformed,
    #[error("record published by a peer other than its author")]
    WrongAuthor,
    #[error("record describes the local node")]
    SelfRecord,
    #[error("{0}")]
    Freshness(FreshnessError),
}

/// Check a record. `source` is the gossip publisher when the record arrived
/// on the discovery topic, and `None` for peer exchange.
pub fn validate_record(
    record: &PeerRecord,
    source: Option<&Identity>,
    local: &Identity,
    freshness: Duration,
) -> Result<(), RecordRejection> {
    if !record.validate_structure() {
        return Err(RecordRejection::Malformed);
    }
    if let Some(source) = source
        && *source != record.peer_id
    {
        return Err(RecordRejection::WrongAuthor);
    }
    if record.peer_id == *local {
        return Err(RecordRejection::SelfRecord);
    }
    record.verify_fresh(freshness).map_err(RecordRejection::Freshness)
}

// ============================================================================
// Discovered Peers
// ============================================================================

/// Lazy sequence of newly discovered peers.
pub struct DiscoveredPeers {
    rx: broadcast::Receiver<PeerRecord>,
}

impl DiscoveredPeers {
    /// Next newly discovered peer. `None` once discovery has stopped.
    pub async fn next(&mut self) -> Option<PeerRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) => return Some(record),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "discovered peer receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Current addresses to advertise for the local node.
pub type AddressSource = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Announce,
    Quit,
}

// ============================================================================
// Discovery Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Discovery {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<PeerRecord>,
    records: RecordStore,
}

impl Discovery {
    /// Subscribe `gossip` to the discovery topic and start the actor.
    ///
    /// Records arrive through a handler registered on `subscribers` and, for
    /// peer exchange, through `px_rx`.
    pub async fn spawn(
        keypair: Keypair,
        config: DiscoveryConfig,
        gossip: GossipSub,
        subscribers: &Subscribers,
        records: RecordStore,
        px_rx: mpsc::Receiver<Vec<PeerRecord>>,
        addrs: AddressSource,
    ) -> anyhow::Result<(Self, crate::gossipsub::HandlerId)> {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let handler = subscribers.on_topic(DISCOVERY_TOPIC, move |message: &Message| {
            inbound_tx
                .try_send(message.clone())
                .map_err(|_| anyhow!("discovery queue full"))
        });
        gossip.subscribe(DISCOVERY_TOPIC).await?;

        let actor = DiscoveryActor {
            local: keypair.identity(),
            keypair,
            config,
            gossip,
            records: records.clone(),
            events: events.clone(),
            addrs,
        };
        tokio::spawn(actor.run(cmd_rx, inbound_rx, px_rx));

        Ok((
            Self {
                cmd_tx,
                events,
                records,
            },
            handler,
        ))
    }

    pub fn discovered_peers(&self) -> DiscoveredPeers {
        DiscoveredPeers {
            rx: self.events.subscribe(),
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Publish the local record now instead of waiting for the next interval.
    pub fn announce(&self) {
        let _ = self.cmd_tx.try_send(Command::Announce);
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Discovery Actor
// ============================================================================

struct DiscoveryActor {
    keypair: Keypair,
    local: Identity,
    config: DiscoveryConfig,
    gossip: GossipSub,
    records: RecordStore,
    events: broadcast::Sender<PeerRecord>,
    addrs: AddressSource,
}

impl DiscoveryActor {
    async fn run(
        self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut inbound_rx: mpsc::Receiver<Message>,
        mut px_rx: mpsc::Receiver<Vec<PeerRecord>>,
    ) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Announce) => self.publish_record().await,
                    Some(Command::Quit) | None => {
                        debug!("discovery actor quitting");
                        break;
                    }
                },
                Some(message) = inbound_rx.recv() => self.handle_message(&message),
                Some(batch) = px_rx.recv() => {
                    for record in batch {
                        self.accept(record, None);
                    }
                }
                _ = ticker.tick() => self.publish_record().await,
            }
        }
    }

    async fn publish_record(&self) {
        let addrs = (self.addrs)();
        if addrs.is_empty() {
            return;
        }
        let record = self.keypair.create_record(addrs);
        let payload = match serialize_bounded(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode local peer record");
                return;
            }
        };
        match self.gossip.publish(DISCOVERY_TOPIC, payload).await {
            Ok(_) => trace!(addrs = record.addrs.len(), "published peer record"),
            Err(e) => trace!(error = %e, "peer record not published"),
        }
    }

    fn handle_message(&self, message: &Message) {
        match deserialize_bounded::<PeerRecord>(&message.data) {
            Ok(record) => self.accept(record, Some(&message.from)),
            Err(e) => debug!(source = %message.from.short(), error = %e, "undecodable peer record"),
        }
    }

    fn accept(&self, record: PeerRecord, source: Option<&Identity>) {
        if let Err(reason) = validate_record(&record, source, &self.local, self.config.freshness) {
            if reason != RecordRejection::SelfRecord {
                debug!(peer = %record.peer_id.short(), %reason, "rejected peer record");
            }
            return;
        }
        let peer = record.peer_id;
        if self.records.insert(record.clone()) {
            debug!(peer = %peer.short(), addrs = ?record.addrs, "discovered peer");
            let _ = self.events.send(record);
        }
    }
}
