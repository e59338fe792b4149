//! Distributed peer (C9): forwards a subset of C1-C4 operations to a
//! peer host over a framed TCP control channel, and splices bridges
//! across hosts with a GRE tunnel (brief per spec §4.8).

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};
use tracing::{info, warn};

use futures::{SinkExt, StreamExt};

use crate::ids::NodeId;
use crate::node::NodeSpec;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer '{0}' is unknown")]
    UnknownPeer(String),

    #[error("peer '{0}' is degraded (last error: {1})")]
    Degraded(String, String),

    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    #[error("framing error: {0}")]
    Codec(std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("peer closed the connection")]
    Closed,
}

/// Operations forwarded to a peer host. A thin subset of C1-C4,
/// serialized as length-delimited JSON frames (spec §4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    CreateNode { session: u32, spec: PeerNodeSpec },
    AttachInterface { session: u32, node: u32, network: u32 },
    UpdateImpairment { session: u32, node_a: u32, iface_a: u32, node_b: u32, iface_b: u32, impairment: PeerImpairment },
    SpliceGreTunnel { session: u32, local_bridge: String, remote_bridge: String, local_addr: String, remote_addr: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerNodeSpec {
    pub id: u32,
    pub name: String,
}

impl From<&NodeSpec> for PeerNodeSpec {
    fn from(spec: &NodeSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerImpairment {
    pub bandwidth_bps: u64,
    pub delay_us: u32,
    pub jitter_us: u32,
    pub loss_ppm: u32,
    pub duplicate_ppm: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerResponse {
    Ok,
    NodeCreated { node_id: u32 },
    InterfaceAttached { interface_id: u32 },
    Error { message: String },
}

/// JSON-over-length-delimited-frames codec, the same shape as the
/// teacher's tokio_util framing use for its control channel, just
/// carrying JSON instead of a binary struct.
struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: std::marker::PhantomData<T>,
}

impl<T> JsonCodec<T> {
    fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: for<'de> Deserialize<'de>> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, PeerError> {
        match self.inner.decode(src).map_err(PeerError::Codec)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = PeerError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), PeerError> {
        let payload = serde_json::to_vec(&item)?;
        self.inner.encode(Bytes::from(payload), dst).map_err(PeerError::Codec)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum PeerHealth {
    Connected,
    Degraded,
}

struct PeerConnection {
    addr: SocketAddr,
    health: PeerHealth,
    last_error: Option<String>,
}

/// One peer host's control channel plus health state. Failures abort
/// only the specific forwarded operation and mark the peer Degraded
/// until a reconnect succeeds (spec §7).
pub struct PeerHost {
    name: String,
    conn: PeerConnection,
}

impl PeerHost {
    pub fn new(name: String, addr: SocketAddr) -> Self {
        Self {
            name,
            conn: PeerConnection {
                addr,
                health: PeerHealth::Connected,
                last_error: None,
            },
        }
    }

    pub async fn send(&mut self, request: PeerRequest) -> Result<PeerResponse, PeerError> {
        if self.conn.health == PeerHealth::Degraded {
            return Err(PeerError::Degraded(
                self.name.clone(),
                self.conn.last_error.clone().unwrap_or_default(),
            ));
        }

        match self.try_send(request).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.conn.health = PeerHealth::Degraded;
                self.conn.last_error = Some(e.to_string());
                warn!("peer '{}' marked degraded: {}", self.name, e);
                Err(e)
            }
        }
    }

    async fn try_send(&mut self, request: PeerRequest) -> Result<PeerResponse, PeerError> {
        let stream = TcpStream::connect(self.conn.addr).await.map_err(PeerError::Connect)?;
        let mut framed = Framed::new(stream, JsonCodec::<PeerRequest>::new());
        framed.send(request).await?;

        let mut response_framed = framed.map_codec(|_| JsonCodec::<PeerResponse>::new());
        match response_framed.next().await {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(e)) => Err(e),
            None => Err(PeerError::Closed),
        }
    }

    /// Clears Degraded status after a successful probe, the only way a
    /// peer returns to Connected (spec §7: "until a reconnect
    /// succeeds").
    pub fn mark_reconnected(&mut self) {
        self.conn.health = PeerHealth::Connected;
        self.conn.last_error = None;
        info!("peer '{}' reconnected", self.name);
    }
}

/// Registry of peer hosts keyed by the stable name used in Session
/// config (spec §4.8).
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerHost>,
    /// node -> peer name, for nodes tagged as remote.
    node_peers: HashMap<NodeId, String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: String, addr: SocketAddr) {
        self.peers.insert(name.clone(), PeerHost::new(name, addr));
    }

    pub fn tag_node(&mut self, node: NodeId, peer: String) {
        self.node_peers.insert(node, peer);
    }

    pub fn peer_for_node(&self, node: NodeId) -> Option<&str> {
        self.node_peers.get(&node).map(|s| s.as_str())
    }

    pub async fn forward(&mut self, peer_name: &str, request: PeerRequest) -> Result<PeerResponse, PeerError> {
        let peer = self
            .peers
            .get_mut(peer_name)
            .ok_or_else(|| PeerError::UnknownPeer(peer_name.to_string()))?;
        peer.send(request).await
    }
}

/// Splice two hosts' bridges with a GRE tunnel, created on both sides as
/// part of the first cross-host link (spec §4.8). The local half is run
/// directly; the remote half goes through `PeerRequest::SpliceGreTunnel`.
pub async fn create_gre_tunnel(
    local_bridge: &str,
    tunnel_name: &str,
    local_addr: std::net::IpAddr,
    remote_addr: std::net::IpAddr,
) -> Result<(), PeerError> {
    use tokio::process::Command;

    let status = Command::new("ip")
        .args([
            "link", "add", tunnel_name, "type", "gretap",
            "local", &local_addr.to_string(),
            "remote", &remote_addr.to_string(),
        ])
        .status()
        .await
        .map_err(PeerError::Codec)?;
    if !status.success() {
        return Err(PeerError::Codec(std::io::Error::other("gretap creation failed")));
    }

    let status = Command::new("ip")
        .args(["link", "set", tunnel_name, "master", local_bridge])
        .status()
        .await
        .map_err(PeerError::Codec)?;
    if !status.success() {
        return Err(PeerError::Codec(std::io::Error::other("failed to attach gretap to bridge")));
    }

    Command::new("ip")
        .args(["link", "set", tunnel_name, "up"])
        .status()
        .await
        .map_err(PeerError::Codec)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peer_tag_returns_none() {
        let registry = PeerRegistry::new();
        assert!(registry.peer_for_node(NodeId(1)).is_none());
    }

    #[test]
    fn tagged_node_resolves_to_peer_name() {
        let mut registry = PeerRegistry::new();
        registry.tag_node(NodeId(1), "east".to_string());
        assert_eq!(registry.peer_for_node(NodeId(1)), Some("east"));
    }
}
