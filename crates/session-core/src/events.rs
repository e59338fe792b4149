//! Event bus (C8): fan-out of node/link/config/event/throughput
//! notifications to registered subscribers. Broadcast never fails; a
//! slow subscriber is dropped rather than buffered unboundedly (spec
//! §7), mirroring the observability crate's bounded-channel recorder
//! pattern rather than an unbounded mpsc.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::ids::{InterfaceId, NetworkId, NodeId, SessionId};
use crate::session::SessionState;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Topic {
    Node,
    Link,
    Config,
    Event,
    Throughput,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeEvent {
    Created { node: NodeId },
    Deleted { node: NodeId },
    Edited { node: NodeId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LinkEvent {
    Added {
        node_a: NodeId,
        iface_a: InterfaceId,
        node_b: NodeId,
        iface_b: InterfaceId,
    },
    Changed {
        node_a: NodeId,
        iface_a: InterfaceId,
        node_b: NodeId,
        iface_b: InterfaceId,
    },
    Deleted {
        node_a: NodeId,
        iface_a: InterfaceId,
        node_b: NodeId,
        iface_b: InterfaceId,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigEvent {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session: SessionId,
    pub state: SessionState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThroughputEvent {
    pub node: NodeId,
    pub interface: InterfaceId,
    pub rx_bps: u64,
    pub tx_bps: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Event {
    Node(NodeEvent),
    Link(LinkEvent),
    Config(ConfigEvent),
    Session(SessionEvent),
    Throughput(ThroughputEvent),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Node(_) => Topic::Node,
            Event::Link(_) => Topic::Link,
            Event::Config(_) => Topic::Config,
            Event::Session(_) => Topic::Event,
            Event::Throughput(_) => Topic::Throughput,
        }
    }
}

/// Bounded per-session broadcast bus. Each topic gets its own channel so
/// delivery is ordered per-topic (spec §4.7) and a subscriber that falls
/// behind on one topic doesn't stall others; `broadcast::Sender::send`
/// on a full/lagging receiver drops the oldest entries for that
/// receiver rather than blocking the publisher.
pub struct EventBus {
    node: broadcast::Sender<NodeEvent>,
    link: broadcast::Sender<LinkEvent>,
    config: broadcast::Sender<ConfigEvent>,
    session: broadcast::Sender<SessionEvent>,
    throughput: broadcast::Sender<ThroughputEvent>,
}

const CHANNEL_CAPACITY: usize = 256;

impl EventBus {
    pub fn new() -> Self {
        Self {
            node: broadcast::channel(CHANNEL_CAPACITY).0,
            link: broadcast::channel(CHANNEL_CAPACITY).0,
            config: broadcast::channel(CHANNEL_CAPACITY).0,
            session: broadcast::channel(CHANNEL_CAPACITY).0,
            throughput: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_node(&self) -> broadcast::Receiver<NodeEvent> {
        self.node.subscribe()
    }
    pub fn subscribe_link(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }
    pub fn subscribe_config(&self) -> broadcast::Receiver<ConfigEvent> {
        self.config.subscribe()
    }
    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }
    pub fn subscribe_throughput(&self) -> broadcast::Receiver<ThroughputEvent> {
        self.throughput.subscribe()
    }

    pub fn publish_node(&self, event: NodeEvent) {
        // No receivers is not an error: broadcast never fails (spec §7).
        if self.node.send(event).is_err() {
            warn!("node event published with no subscribers");
        }
    }

    pub fn publish_link(&self, event: LinkEvent) {
        let _ = self.link.send(event);
    }

    pub fn publish_config(&self, event: ConfigEvent) {
        let _ = self.config.send(event);
    }

    pub fn publish_session(&self, event: SessionEvent) {
        let _ = self.session.send(event);
    }

    pub fn publish_throughput(&self, event: ThroughputEvent) {
        let _ = self.throughput.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_session();
        bus.publish_session(SessionEvent {
            session: SessionId(1),
            state: SessionState::Definition,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session, SessionId(1));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_node(NodeEvent::Created { node: NodeId(1) });
    }
}
