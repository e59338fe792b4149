//! XML session import/export (spec §6). `xml.export . xml.import`
//! round-trips a session byte-equivalent modulo whitespace and attribute
//! order (spec §8), so the on-disk shape is a plain serde-derived
//! struct tree serialized with `quick-xml` rather than a hand-rolled
//! writer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link::Endpoint;
use crate::mobility::{MobilityScript, Waypoint};
use crate::network::{EbtablesPolicy, Impairment, NetworkKind};
use crate::node::{NodeKind, Position};
use crate::session::SessionState;

#[derive(Error, Debug)]
pub enum XmlError {
    #[error("deserialize failed: {0}")]
    De(#[from] quick_xml::DeError),

    #[error("serialize failed: {0}")]
    Se(quick_xml::DeError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "session")]
pub struct SessionDocument {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@state")]
    pub state: SessionState,
    #[serde(default, rename = "config")]
    pub config: Vec<ConfigEntryXml>,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeXml>,
    #[serde(default, rename = "network")]
    pub networks: Vec<NetworkXml>,
    #[serde(default, rename = "link")]
    pub links: Vec<LinkXml>,
    #[serde(default, rename = "hook")]
    pub hooks: Vec<HookXml>,
    #[serde(default, rename = "mobility")]
    pub mobility_scripts: Vec<MobilityXml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntryXml {
    #[serde(rename = "@key")]
    pub key: String,
    #[serde(rename = "@value")]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeXml {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@kind")]
    pub kind: NodeKind,
    #[serde(default, rename = "@model")]
    pub model: String,
    #[serde(rename = "@x")]
    pub x: f64,
    #[serde(rename = "@y")]
    pub y: f64,
    #[serde(rename = "@z")]
    pub z: f64,
    #[serde(default)]
    pub geo: Option<GeoXml>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceRefXml>,
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceXml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoXml {
    #[serde(rename = "@lat")]
    pub lat: f64,
    #[serde(rename = "@lon")]
    pub lon: f64,
    #[serde(rename = "@alt")]
    pub alt: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRefXml {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceXml {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@mac")]
    pub mac: String,
    #[serde(default, rename = "@ipv4")]
    pub ipv4: Option<String>,
    #[serde(default, rename = "@ipv4-prefix")]
    pub ipv4_prefix: Option<u8>,
    #[serde(default, rename = "@ipv6")]
    pub ipv6: Option<String>,
    #[serde(default, rename = "@ipv6-prefix")]
    pub ipv6_prefix: Option<u8>,
    #[serde(rename = "@network")]
    pub network: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkXml {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@kind")]
    pub kind: NetworkKind,
    #[serde(rename = "@policy")]
    pub policy: EbtablesPolicy,
    #[serde(rename = "@bridge")]
    pub bridge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkXml {
    #[serde(rename = "@node-a")]
    pub node_a: u32,
    #[serde(rename = "@iface-a")]
    pub iface_a: u32,
    #[serde(rename = "@node-b")]
    pub node_b: u32,
    #[serde(rename = "@iface-b")]
    pub iface_b: u32,
    #[serde(rename = "@bandwidth-bps")]
    pub bandwidth_bps: u64,
    #[serde(rename = "@delay-us")]
    pub delay_us: u32,
    #[serde(rename = "@jitter-us")]
    pub jitter_us: u32,
    #[serde(rename = "@loss-ppm")]
    pub loss_ppm: u32,
    #[serde(rename = "@duplicate-ppm")]
    pub duplicate_ppm: u32,
    #[serde(rename = "@unidirectional")]
    pub unidirectional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookXml {
    #[serde(rename = "@target-state")]
    pub target_state: SessionState,
    #[serde(rename = "$text")]
    pub script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobilityXml {
    #[serde(rename = "@node")]
    pub node: u32,
    #[serde(rename = "@loop")]
    pub loop_enabled: bool,
    #[serde(rename = "@refresh-ms")]
    pub refresh_ms: u64,
    #[serde(default, rename = "waypoint")]
    pub waypoints: Vec<WaypointXml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaypointXml {
    #[serde(rename = "@t")]
    pub t: u64,
    #[serde(rename = "@x")]
    pub x: f64,
    #[serde(rename = "@y")]
    pub y: f64,
    #[serde(rename = "@z")]
    pub z: f64,
}

pub fn export(doc: &SessionDocument) -> Result<String, XmlError> {
    quick_xml::se::to_string(doc).map_err(XmlError::Se)
}

pub fn import(xml: &str) -> Result<SessionDocument, XmlError> {
    Ok(quick_xml::de::from_str(xml)?)
}

impl From<&LinkXml> for (Endpoint, Endpoint, Impairment) {
    fn from(l: &LinkXml) -> Self {
        (
            Endpoint {
                node: crate::ids::NodeId(l.node_a),
                interface: crate::ids::InterfaceId(l.iface_a),
            },
            Endpoint {
                node: crate::ids::NodeId(l.node_b),
                interface: crate::ids::InterfaceId(l.iface_b),
            },
            Impairment {
                bandwidth_bps: l.bandwidth_bps,
                delay_us: l.delay_us,
                jitter_us: l.jitter_us,
                loss_ppm: l.loss_ppm,
                duplicate_ppm: l.duplicate_ppm,
                unidirectional: l.unidirectional,
            },
        )
    }
}

impl From<&MobilityXml> for MobilityScript {
    fn from(m: &MobilityXml) -> Self {
        MobilityScript {
            waypoints: m
                .waypoints
                .iter()
                .map(|w| Waypoint {
                    time_offset_ms: w.t,
                    position: Position { x: w.x, y: w.y, z: w.z },
                })
                .collect(),
            loop_enabled: m.loop_enabled,
            refresh_ms: m.refresh_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> SessionDocument {
        SessionDocument {
            id: 1,
            state: SessionState::Definition,
            config: vec![ConfigEntryXml {
                key: "prefix".into(),
                value: "emu".into(),
            }],
            nodes: vec![NodeXml {
                id: 1,
                name: "n1".into(),
                kind: NodeKind::Default,
                model: "host".into(),
                x: 0.0,
                y: 0.0,
                z: 0.0,
                geo: None,
                services: vec![],
                interfaces: vec![],
            }],
            networks: vec![],
            links: vec![],
            hooks: vec![],
            mobility_scripts: vec![],
        }
    }

    #[test]
    fn export_then_import_round_trips() {
        let doc = sample_doc();
        let xml = export(&doc).unwrap();
        let reimported = import(&xml).unwrap();
        assert_eq!(reimported.id, doc.id);
        assert_eq!(reimported.nodes.len(), 1);
        assert_eq!(reimported.nodes[0].name, "n1");
    }

    #[test]
    fn round_trips_networks_links_hooks_and_mobility() {
        let mut doc = sample_doc();
        doc.nodes[0].interfaces.push(InterfaceXml {
            id: 0,
            name: "eth0".into(),
            mac: "00:00:00:aa:01:00".into(),
            ipv4: Some("10.0.0.1".into()),
            ipv4_prefix: Some(24),
            ipv6: None,
            ipv6_prefix: None,
            network: 1 << 16,
        });
        doc.networks.push(NetworkXml {
            id: 1 << 16,
            kind: NetworkKind::PointToPoint,
            policy: EbtablesPolicy::Accept,
            bridge: "b.1.65536".into(),
        });
        doc.links.push(LinkXml {
            node_a: 1,
            iface_a: 0,
            node_b: 2,
            iface_b: 0,
            bandwidth_bps: 0,
            delay_us: 0,
            jitter_us: 0,
            loss_ppm: 250_000,
            duplicate_ppm: 0,
            unidirectional: false,
        });
        doc.hooks.push(HookXml {
            target_state: SessionState::Runtime,
            script: "echo hi".into(),
        });
        doc.mobility_scripts.push(MobilityXml {
            node: 1,
            loop_enabled: true,
            refresh_ms: 50,
            waypoints: vec![WaypointXml { t: 0, x: 0.0, y: 0.0, z: 0.0 }],
        });

        let xml = export(&doc).unwrap();
        let reimported = import(&xml).unwrap();

        assert_eq!(reimported.networks.len(), 1);
        assert_eq!(reimported.links[0].loss_ppm, 250_000);
        assert_eq!(reimported.hooks[0].script, "echo hi");
        assert_eq!(reimported.mobility_scripts[0].waypoints.len(), 1);
        assert_eq!(reimported.nodes[0].interfaces[0].mac, "00:00:00:aa:01:00");
    }
}
