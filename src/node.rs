//! # Node Controller
//!
//! A [`Node`] composes the transport, secure channel and multiplexer
//! capabilities with the gossip overlay and peer discovery, and drives them
//! through a simple lifecycle:
//!
//! ```text
//! Stopped ──start()──► Starting ──► Running ──stop()──► Stopping ──► Stopped
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::new(Keypair::generate(), NodeConfig::default());
//! let addrs = node.start().await?;
//!
//! node.on_message("chat", |msg: &Message| -> anyhow::Result<()> {
//!     println!("{}: {:?}", msg.from, msg.data);
//!     Ok(())
//! });
//! node.subscribe("chat").await?;
//! node.publish("chat", b"hello".to_vec()).await?;
//!
//! node.stop().await?;
//! ```
//!
//! `start()` returns once every listen socket is bound; it does not wait for
//! peers. Bootstrap dials, discovery and mesh building continue in the
//! background. Pub/sub calls fail with [`ApplicationError::NotStarted`]
//! unless the node is running, and a stopped node can be started again with
//! the same identity.

use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::PeerAddr;
use crate::config::NodeConfig;
use crate::connection::{Capabilities, Connector, PeerNetwork, bootstrap_loop, discovery_dial_loop};
use crate::discovery::{AddressSource, DISCOVERY_TOPIC, DiscoveredPeers, Discovery, RecordStore};
use crate::error::{ApplicationError, NodeError};
use crate::gossipsub::{GossipSub, HandlerId, Message, MessageHandler, Subscribers, is_valid_topic};
use crate::identity::{Identity, Keypair};
use crate::mux::FrameMux;
use crate::relay::{RelayClient, RelayServer};
use crate::secure::Negotiator;
use crate::transport::TcpTransport;
use crate::wire::{MAX_PAYLOAD_SIZE, MessageId};

/// Capacity of the application message channel.
const MESSAGE_CHANNEL_SIZE: usize = 1_024;

/// Peer exchange batches waiting for discovery.
const PX_CHANNEL_SIZE: usize = 64;

const RELAY_INBOUND_BACKLOG: usize = 64;

/// A receiver that can be taken exactly once.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Everything that exists only while the node runs.
struct Running {
    gossip: GossipSub,
    discovery: Discovery,
    connector: Connector,
    network: PeerNetwork,
    relay_client: Option<RelayClient>,
    relay_server: Option<RelayServer>,
    local_addrs: Vec<PeerAddr>,
    discovery_handler: HandlerId,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    async fn shutdown(mut self, grace: std::time::Duration, subscribers: &Subscribers) {
        // Listeners and dial loops first, so nothing new arrives while closing.
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.network.close_all(grace).await;
        self.discovery.quit().await;
        self.gossip.quit().await;
        if let Some(mut client) = self.relay_client.take() {
            client.shutdown();
        }
        if let Some(server) = self.relay_server.take() {
            server.quit().await;
        }
        subscribers.remove(self.discovery_handler);
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct Node {
    keypair: Keypair,
    config: NodeConfig,
    /// Injected capabilities. `None` builds the standard TCP stack per start.
    caps: Option<Capabilities>,
    subscribers: Subscribers,
    status: RwLock<NodeStatus>,
    running: Mutex<Option<Running>>,
    message_tx: mpsc::Sender<Message>,
    message_rx: TakeOnce<Message>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.keypair.identity())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Map overlay errors to the node taxonomy.
fn lift(e: anyhow::Error) -> NodeError {
    match e.downcast::<ApplicationError>() {
        Ok(app) => NodeError::Application(app),
        Err(other) => NodeError::Internal(other),
    }
}

/// Application topics: valid and not reserved.
fn check_topic(topic: &str) -> Result<(), ApplicationError> {
    if topic == DISCOVERY_TOPIC {
        return Err(ApplicationError::InvalidTopic {
            topic: topic.to_string(),
            reason: "reserved for peer discovery",
        });
    }
    if !is_valid_topic(topic) {
        return Err(ApplicationError::InvalidTopic {
            topic: topic.to_string(),
            reason: "topic must be 1 to 256 bytes",
        });
    }
    Ok(())
}

impl Node {
    /// A node using the standard TCP transport, secure channel and multiplexer.
    pub fn new(keypair: Keypair, config: NodeConfig) -> Self {
        Self::build(keypair, config, None)
    }

    /// A node composed from the given capabilities. The relay server and
    /// relay client settings only apply to the standard transport.
    pub fn with_capabilities(keypair: Keypair, config: NodeConfig, caps: Capabilities) -> Self {
        Self::build(keypair, config, Some(caps))
    }

    fn build(keypair: Keypair, config: NodeConfig, caps: Option<Capabilities>) -> Self {
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_SIZE);
        Self {
            keypair,
            config,
            caps,
            subscribers: Subscribers::new(),
            status: RwLock::new(NodeStatus::Stopped),
            running: Mutex::new(None),
            message_tx,
            message_rx: Mutex::new(Some(message_rx)),
        }
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn status(&self) -> NodeStatus {
        self.status.read().map(|s| *s).unwrap_or(NodeStatus::Stopped)
    }

    fn set_status(&self, status: NodeStatus) {
        if let Ok(mut current) = self.status.write() {
            *current = status;
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Bind the listen sockets and start the overlay. Returns the bound
    /// addresses, each carrying the node identity.
    pub async fn start(&self) -> Result<Vec<PeerAddr>, NodeError> {
        let mut running = self.running.lock().await;
        if running.is_some() || self.status() != NodeStatus::Stopped {
            return Err(ApplicationError::AlreadyRunning.into());
        }
        self.config.validate()?;

        self.set_status(NodeStatus::Starting);
        match self.launch().await {
            Ok(state) => {
                let addrs = state.local_addrs.clone();
                *running = Some(state);
                self.set_status(NodeStatus::Running);
                let shown: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
                info!(identity = %self.identity(), addrs = ?shown, "node running");
                Ok(addrs)
            }
            Err(e) => {
                self.set_status(NodeStatus::Stopped);
                warn!(error = %e, "node failed to start");
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running, NodeError> {
        let identity = self.identity();
        let config = &self.config;

        let relay_server = (config.relay_server && self.caps.is_none()).then(RelayServer::spawn);
        if self.caps.is_some() && (config.relay_server || !config.relays.is_empty()) {
            warn!("relay settings require the standard transport, ignoring them");
        }
        let caps = match &self.caps {
            Some(caps) => caps.clone(),
            None => {
                let mut transport = TcpTransport::new(config.retry.clone());
                if let Some(server) = &relay_server {
                    transport = transport.with_relay_server(server.clone());
                }
                Capabilities {
                    transport: Arc::new(transport),
                    secure: Arc::new(Negotiator::new(self.keypair.clone())),
                    muxer: Arc::new(FrameMux::new(config.mux.clone())),
                }
            }
        };

        let mut listeners = Vec::with_capacity(config.listen.len());
        for addr in &config.listen {
            match caps.transport.listen(*addr).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    if let Some(server) = &relay_server {
                        server.quit().await;
                    }
                    return Err(e.into());
                }
            }
        }
        let local_addrs: Vec<PeerAddr> = listeners
            .iter()
            .map(|l| PeerAddr::advertised(l.local_addr(), identity))
            .collect();

        let network = PeerNetwork::new(identity, config.max_peers);
        let records = RecordStore::new(config.discovery.max_records);
        let (px_tx, px_rx) = mpsc::channel(PX_CHANNEL_SIZE);
        let (gossip, mut gossip_rx) = GossipSub::spawn(
            Arc::new(network.clone()),
            self.keypair.clone(),
            config.gossip.clone(),
            self.subscribers.clone(),
            records.clone(),
            px_tx,
        );

        let (relay_client, relay_rx) = if config.relays.is_empty() || self.caps.is_some() {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(RELAY_INBOUND_BACKLOG);
            let client = RelayClient::spawn(self.keypair.clone(), config.relay_addrs()?, config.retry.clone(), tx);
            (Some(client), Some(rx))
        };

        let addrs = self.address_source(&local_addrs, relay_client.as_ref());
        let (discovery, discovery_handler) = match Discovery::spawn(
            self.keypair.clone(),
            config.discovery.clone(),
            gossip.clone(),
            &self.subscribers,
            records,
            px_rx,
            addrs,
        )
        .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                gossip.quit().await;
                if let Some(server) = &relay_server {
                    server.quit().await;
                }
                return Err(lift(e));
            }
        };

        let connector = Connector::new(
            identity,
            caps,
            network.clone(),
            gossip.clone(),
            discovery.clone(),
            config.connect_timeout,
        );

        let mut tasks: Vec<JoinHandle<()>> = listeners.into_iter().map(|l| connector.serve(l)).collect();
        if let Some(rx) = relay_rx {
            tasks.push(connector.serve_channel(rx));
        }
        let message_tx = self.message_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(message) = gossip_rx.recv().await {
                if message_tx.send(message).await.is_err() {
                    break;
                }
            }
        }));
        tasks.push(tokio::spawn(bootstrap_loop(
            connector.clone(),
            config.bootstrap_addrs()?,
            config.bootstrap_interval,
        )));
        tasks.push(tokio::spawn(discovery_dial_loop(
            connector.clone(),
            discovery.discovered_peers(),
        )));

        Ok(Running {
            gossip,
            discovery,
            connector,
            network,
            relay_client,
            relay_server,
            local_addrs,
            discovery_handler,
            tasks,
        })
    }

    /// Addresses advertised in discovery: bound listeners, configured
    /// external addresses, and live relay circuits.
    fn address_source(&self, local: &[PeerAddr], relay: Option<&RelayClient>) -> AddressSource {
        let mut fixed: Vec<String> = local.iter().map(|a| a.to_string()).collect();
        for external in &self.config.external_addrs {
            if let Ok(addr) = external.parse::<PeerAddr>() {
                fixed.push(addr.with_peer(self.identity()).to_string());
            }
        }
        let circuits = relay.map(RelayClient::circuits);
        Arc::new(move || {
            let mut addrs = fixed.clone();
            if let Some(circuits) = &circuits
                && let Ok(list) = circuits.read()
            {
                addrs.extend(list.iter().map(|c| c.to_string()));
            }
            addrs
        })
    }

    /// Close every connection gracefully and stop all background work.
    /// Stopping a stopped node does nothing.
    pub async fn stop(&self) -> Result<(), NodeError> {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return Ok(());
        };
        self.set_status(NodeStatus::Stopping);
        state.shutdown(self.config.shutdown_grace, &self.subscribers).await;
        self.set_status(NodeStatus::Stopped);
        info!(identity = %self.identity(), "node stopped");
        Ok(())
    }

    async fn gossip(&self) -> Result<GossipSub, NodeError> {
        match self.running.lock().await.as_ref() {
            Some(state) => Ok(state.gossip.clone()),
            None => Err(ApplicationError::NotStarted.into()),
        }
    }

    // ------------------------------------------------------------------------
    // Pub/Sub
    // ------------------------------------------------------------------------

    pub async fn subscribe(&self, topic: &str) -> Result<(), NodeError> {
        let gossip = self.gossip().await?;
        check_topic(topic)?;
        gossip.subscribe(topic).await.map_err(lift)
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), NodeError> {
        let gossip = self.gossip().await?;
        check_topic(topic)?;
        gossip.unsubscribe(topic).await.map_err(lift)
    }

    /// Publish `data` on `topic`. The local node's own handlers do not see it.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId, NodeError> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(ApplicationError::PayloadTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        let gossip = self.gossip().await?;
        check_topic(topic)?;
        gossip.publish(topic, data).await.map_err(lift)
    }

    /// Application topics currently subscribed.
    pub async fn subscriptions(&self) -> Result<Vec<String>, NodeError> {
        let gossip = self.gossip().await?;
        let mut topics = gossip.subscriptions().await;
        topics.retain(|t| t != DISCOVERY_TOPIC);
        Ok(topics)
    }

    pub async fn mesh_peers(&self, topic: &str) -> Result<Vec<Identity>, NodeError> {
        Ok(self.gossip().await?.mesh_peers(topic).await)
    }

    /// Register a handler for `topic`. Handlers survive restarts.
    pub fn on_message(&self, topic: &str, handler: impl MessageHandler + 'static) -> HandlerId {
        self.subscribers.on_topic(topic, handler)
    }

    /// Register a handler for every application topic.
    pub fn on_any_message(&self, handler: impl MessageHandler + 'static) -> HandlerId {
        self.subscribers.on_any(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.subscribers.remove(id)
    }

    /// The channel of delivered application messages. Can be taken once.
    pub async fn messages(&self) -> Result<mpsc::Receiver<Message>, NodeError> {
        self.message_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| NodeError::Internal(anyhow!("message receiver already taken")))
    }

    // ------------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------------

    pub async fn local_addrs(&self) -> Vec<PeerAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|s| s.local_addrs.clone())
            .unwrap_or_default()
    }

    pub async fn connected_peers(&self) -> Vec<Identity> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|s| s.network.connected_peers())
            .unwrap_or_default()
    }

    /// Newly discovered peers, from now on.
    pub async fn discovered_peers(&self) -> Result<DiscoveredPeers, NodeError> {
        match self.running.lock().await.as_ref() {
            Some(state) => Ok(state.discovery.discovered_peers()),
            None => Err(ApplicationError::NotStarted.into()),
        }
    }

    /// Dial `addr` and wait until the peer is connected.
    pub async fn connect(&self, addr: &PeerAddr) -> Result<Identity, NodeError> {
        let connector = match self.running.lock().await.as_ref() {
            Some(state) => state.connector.clone(),
            None => return Err(ApplicationError::NotStarted.into()),
        };
        let peer = connector.dial(std::slice::from_ref(addr)).await?;
        debug!(peer = %peer.short(), addr = %addr, "connected");
        Ok(peer)
    }

    /// Reservations held by this node's relay server, if it runs one.
    pub async fn relay_reservations(&self) -> Option<usize> {
        let server = self.running.lock().await.as_ref()?.relay_server.clone()?;
        Some(server.reservation_count().await)
    }

    /// Relay circuit addresses this node is currently reachable at.
    pub async fn circuit_addrs(&self) -> Vec<PeerAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.relay_client.as_ref().map(RelayClient::circuit_addrs))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::net::SocketAddr;

    fn local_config() -> NodeConfig {
        NodeConfig {
            listen: vec![SocketAddr::from(([127, 0, 0, 1], 0))],
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn pubsub_requires_running_node() {
        let node = Node::new(Keypair::generate(), local_config());
        assert_eq!(node.status(), NodeStatus::Stopped);

        let err = node.publish("chat", b"hi".to_vec()).await.unwrap_err();
        assert_eq!(err.application(), Some(&ApplicationError::NotStarted));
        let err = node.subscribe("chat").await.unwrap_err();
        assert_eq!(err.application(), Some(&ApplicationError::NotStarted));
        let err = node.unsubscribe("chat").await.unwrap_err();
        assert_eq!(err.application(), Some(&ApplicationError::NotStarted));
        assert!(node.discovered_peers().await.is_err());

        let err = node.publish("chat", vec![0; MAX_PAYLOAD_SIZE + 1]).await.unwrap_err();
        assert!(matches!(
            err.application(),
            Some(ApplicationError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn start_stop_restart_keeps_identity() {
        let node = Node::new(Keypair::generate(), local_config());
        let addrs = node.start().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].peer_id(), Some(node.identity()));
        assert_eq!(node.status(), NodeStatus::Running);

        let err = node.start().await.unwrap_err();
        assert_eq!(err.application(), Some(&ApplicationError::AlreadyRunning));

        node.stop().await.unwrap();
        assert_eq!(node.status(), NodeStatus::Stopped);
        assert!(node.local_addrs().await.is_empty());
        node.stop().await.unwrap();

        let again = node.start().await.unwrap();
        assert_eq!(again[0].peer_id(), Some(node.identity()));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_returns_to_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = NodeConfig {
            listen: vec![taken.local_addr().unwrap()],
            ..NodeConfig::default()
        };
        let node = Node::new(Keypair::generate(), config);
        let err = node.start().await.unwrap_err();
        assert!(matches!(err, NodeError::Transport(TransportError::Bind { .. })));
        assert_eq!(node.status(), NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn reserved_and_invalid_topics_are_rejected() {
        let node = Node::new(Keypair::generate(), local_config());
        node.start().await.unwrap();

        let err = node.subscribe(DISCOVERY_TOPIC).await.unwrap_err();
        assert!(matches!(err.application(), Some(ApplicationError::InvalidTopic { .. })));
        let err = node.subscribe("").await.unwrap_err();
        assert!(matches!(err.application(), Some(ApplicationError::InvalidTopic { .. })));

        node.subscribe("chat").await.unwrap();
        assert_eq!(node.subscriptions().await.unwrap(), vec!["chat".to_string()]);

        let err = node.unsubscribe("other").await.unwrap_err();
        assert_eq!(
            err.application(),
            Some(&ApplicationError::NotSubscribed("other".into()))
        );
        let err = node.publish("nobody-here", b"x".to_vec()).await.unwrap_err();
        assert_eq!(
            err.application(),
            Some(&ApplicationError::NotSubscribed("nobody-here".into()))
        );
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn message_receiver_is_taken_once() {
        let node = Node::new(Keypair::generate(), local_config());
        assert!(node.messages().await.is_ok());
        assert!(node.messages().await.is_err());
    }
}
