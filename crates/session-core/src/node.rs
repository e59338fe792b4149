//! Node registry and lifecycle (C2): id/name-unique store of Nodes, each
//! owning a dense interface table.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{InterfaceId, NetworkId, NodeId};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum NodeKind {
    Default,
    Switch,
    Hub,
    PointToPoint,
    Wlan,
    ExternalWlan,
    Tunnel,
    Physical,
    RawEthernet,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Interface {
    pub id: InterfaceId,
    pub name: String,
    pub mac: [u8; 6],
    pub ipv4: Option<(std::net::Ipv4Addr, u8)>,
    pub ipv6: Option<(std::net::Ipv6Addr, u8)>,
    pub network: Option<NetworkId>,
    /// Host-side veth name; `None` until `attachInterface` realizes it.
    pub host_veth: Option<String>,
}

impl Interface {
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Deterministic MAC per spec §4.2: `00:00:00:aa:NN:NN` where the two NN
/// bytes are `node_id as u8` and `interface_id as u8`. The session id
/// doesn't fit in the 48 bits available, so it is carried in the
/// host-side veth name instead (see `host_ifname`).
pub fn generate_mac(node_id: NodeId, interface_id: InterfaceId) -> [u8; 6] {
    [0x00, 0x00, 0x00, 0xaa, node_id.0 as u8, interface_id.0 as u8]
}

/// Host-side veth name encoding session/node/interface, truncated to fit
/// IFNAMSIZ (15 bytes) the way the teacher's veth validator requires.
pub fn host_ifname(session_id: crate::ids::SessionId, node_id: NodeId, interface_id: InterfaceId) -> String {
    let full = format!("veth.n{}.{}.s{}", node_id.0, interface_id.0, session_id.0);
    truncate_ifname(&full)
}

pub fn truncate_ifname(name: &str) -> String {
    const IFNAMSIZ: usize = 15;
    if name.len() <= IFNAMSIZ {
        return name.to_string();
    }
    // Keep a short hash suffix so truncated names stay distinct.
    let hash = fnv1a(name.as_bytes());
    let suffix = format!("{:06x}", hash & 0xff_ffff);
    let keep = IFNAMSIZ - suffix.len();
    format!("{}{}", &name[..keep], suffix)
}

/// Parses a colon-separated MAC string back into its six bytes, the
/// inverse of `Interface::mac_string`, used by XML import.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub model: String,
    pub position: Position,
    pub geo: Option<GeoPosition>,
    pub services: Vec<String>,
    pub fs_root: Option<PathBuf>,
    pub interfaces: HashMap<InterfaceId, Interface>,
    pub realized: bool,
    pub namespace: Option<String>,
    pub peer: Option<String>,
    next_interface_id: u32,
}

impl Node {
    fn new(id: NodeId, name: String, kind: NodeKind) -> Self {
        Self {
            id,
            name,
            kind,
            model: String::new(),
            position: Position::default(),
            geo: None,
            services: Vec::new(),
            fs_root: None,
            interfaces: HashMap::new(),
            realized: false,
            namespace: None,
            peer: None,
            next_interface_id: 0,
        }
    }

    pub fn next_interface_id(&mut self) -> InterfaceId {
        let id = InterfaceId(self.next_interface_id);
        self.next_interface_id += 1;
        id
    }

    /// Raises the next-assigned interface id so it stays past `at_least`,
    /// used by XML import after inserting interfaces with explicit ids.
    pub fn bump_interface_id(&mut self, at_least: u32) {
        if self.next_interface_id <= at_least {
            self.next_interface_id = at_least + 1;
        }
    }
}

/// `node.edit` patch (spec §6): only position and the service set can be
/// revised after creation; everything else is fixed at `node.create`.
#[derive(Debug, Default)]
pub struct NodePatch {
    pub position: Option<Position>,
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct NodeSpec {
    pub id: u32,
    pub name: String,
    pub kind: NodeKind,
    pub model: String,
    pub position: Position,
    pub geo: Option<GeoPosition>,
    pub services: Vec<String>,
}

impl Default for NodeKind {
    fn default() -> Self {
        NodeKind::Default
    }
}

/// Node registry (C2): enforces id/name uniqueness and owns the
/// per-session node table. Interface ids within a node stay dense from 0
/// (spec §4.2 invariant) because `Node::next_interface_id` only
/// increments, never reuses a freed slot.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, Node>,
    names: HashMap<String, NodeId>,
    next_id: u32,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            names: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn create(&mut self, spec: NodeSpec) -> Result<NodeId, String> {
        if self.names.contains_key(&spec.name) {
            return Err(format!("node name '{}' already in use", spec.name));
        }

        let id = if spec.id == 0 {
            self.allocate_id()
        } else {
            let id = NodeId(spec.id);
            if self.nodes.contains_key(&id) {
                return Err(format!("node id {} already in use", spec.id));
            }
            id
        };

        let mut node = Node::new(id, spec.name.clone(), spec.kind);
        node.model = spec.model;
        node.position = spec.position;
        node.geo = spec.geo;
        node.services = spec.services;

        self.names.insert(spec.name, id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    fn allocate_id(&mut self) -> NodeId {
        loop {
            let candidate = NodeId(self.next_id);
            self.next_id += 1;
            if !self.nodes.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.names.remove(&node.name);
        Some(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_uniqueness_enforced() {
        let mut reg = NodeRegistry::new();
        reg.create(NodeSpec {
            name: "n1".into(),
            ..Default::default()
        })
        .unwrap();
        let err = reg.create(NodeSpec {
            name: "n1".into(),
            ..Default::default()
        });
        assert!(err.is_err());
    }

    #[test]
    fn ids_assigned_smallest_free() {
        let mut reg = NodeRegistry::new();
        let a = reg
            .create(NodeSpec {
                name: "a".into(),
                ..Default::default()
            })
            .unwrap();
        let b = reg
            .create(NodeSpec {
                name: "b".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(a.0, 1);
        assert_eq!(b.0, 2);
    }

    #[test]
    fn mac_generation_deterministic() {
        let mac1 = generate_mac(NodeId(3), InterfaceId(2));
        let mac2 = generate_mac(NodeId(3), InterfaceId(2));
        assert_eq!(mac1, mac2);
        assert_eq!(mac1, [0x00, 0x00, 0x00, 0xaa, 3, 2]);
    }

    #[test]
    fn ifname_truncated_to_ifnamsiz() {
        let name = host_ifname(crate::ids::SessionId(123456), NodeId(7), InterfaceId(2));
        assert!(name.len() <= 15);
    }

    #[test]
    fn mac_string_and_parse_mac_round_trip() {
        let mac = generate_mac(NodeId(9), InterfaceId(4));
        let iface = Interface {
            id: InterfaceId(4),
            name: "eth4".into(),
            mac,
            ipv4: None,
            ipv6: None,
            network: None,
            host_veth: None,
        };
        let parsed = parse_mac(&iface.mac_string()).unwrap();
        assert_eq!(parsed, mac);
    }

    #[test]
    fn parse_mac_rejects_malformed_input() {
        assert!(parse_mac("not-a-mac").is_none());
        assert!(parse_mac("00:00:00:aa:00").is_none());
    }

    #[test]
    fn interface_ids_dense_from_zero() {
        let mut node = Node::new(NodeId(1), "n1".into(), NodeKind::Default);
        assert_eq!(node.next_interface_id().0, 0);
        assert_eq!(node.next_interface_id().0, 1);
        assert_eq!(node.next_interface_id().0, 2);
    }
}
