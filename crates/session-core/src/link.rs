//! Link engine (C4): computes and applies per-direction impairments and
//! maintains each WLAN's reachability matrix.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{InterfaceId, NodeId};
use crate::network::{Impairment, Network, NetworkFabric, NetworkKind, QdiscError};

/// An endpoint identifies one Interface by its owning node.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: NodeId,
    pub interface: InterfaceId,
}

/// Unordered pair key so (i1,i2) and (i2,i1) resolve to the same link.
fn link_key(a: Endpoint, b: Endpoint) -> (Endpoint, Endpoint) {
    if (a.node.0, a.interface.0) <= (b.node.0, b.interface.0) {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Clone, Debug)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
    pub impairment: Impairment,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Added { a: Endpoint, b: Endpoint },
    Changed { a: Endpoint, b: Endpoint },
    Deleted { a: Endpoint, b: Endpoint },
}

#[derive(Default)]
pub struct LinkEngine {
    links: HashMap<(Endpoint, Endpoint), Link>,
}

impl LinkEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, a: Endpoint, b: Endpoint) -> Option<&Link> {
        self.links.get(&link_key(a, b))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Records a link without touching the kernel side -- used by XML
    /// import, which only repopulates the in-memory topology; kernel
    /// realization of imported interfaces/links happens later through
    /// the normal `setState(Instantiation)` path.
    pub fn import_link(&mut self, a: Endpoint, b: Endpoint, impairment: Impairment) {
        let key = link_key(a, b);
        self.links.insert(
            key,
            Link {
                a: key.0,
                b: key.1,
                impairment,
            },
        );
    }

    /// `linkAdd` (spec §4.4). Applies impairments to both host-side veth
    /// ends of a non-wireless network, then records the link.
    pub async fn link_add(
        &mut self,
        fabric: &NetworkFabric,
        network: &Network,
        a: Endpoint,
        a_veth: &str,
        b: Endpoint,
        b_veth: &str,
        impairment: Impairment,
    ) -> Result<LinkEvent, QdiscError> {
        self.apply_impairment(fabric, a_veth, b_veth, &impairment).await?;
        let key = link_key(a, b);
        self.links.insert(
            key,
            Link {
                a: key.0,
                b: key.1,
                impairment,
            },
        );
        let _ = network;
        Ok(LinkEvent::Added { a, b })
    }

    /// `linkUpdate` (spec §4.4, and the round-trip law in §8: a second
    /// `linkUpdate` fully replaces the prior impairment set, it does not
    /// merge with it).
    pub async fn link_update(
        &mut self,
        fabric: &NetworkFabric,
        a: Endpoint,
        a_veth: &str,
        b: Endpoint,
        b_veth: &str,
        impairment: Impairment,
    ) -> Result<LinkEvent, QdiscError> {
        self.apply_impairment(fabric, a_veth, b_veth, &impairment).await?;
        let key = link_key(a, b);
        if let Some(link) = self.links.get_mut(&key) {
            link.impairment = impairment;
        } else {
            self.links.insert(
                key,
                Link {
                    a: key.0,
                    b: key.1,
                    impairment,
                },
            );
        }
        Ok(LinkEvent::Changed { a, b })
    }

    pub async fn link_delete(
        &mut self,
        fabric: &NetworkFabric,
        a: Endpoint,
        a_veth: &str,
        b: Endpoint,
        b_veth: &str,
    ) -> Result<LinkEvent, QdiscError> {
        let _ = fabric.remove_qdisc(a_veth).await;
        let _ = fabric.remove_qdisc(b_veth).await;
        self.links.remove(&link_key(a, b));
        Ok(LinkEvent::Deleted { a, b })
    }

    async fn apply_impairment(
        &self,
        fabric: &NetworkFabric,
        a_veth: &str,
        b_veth: &str,
        imp: &Impairment,
    ) -> Result<(), QdiscError> {
        // The characteristic is per-direction (spec §4.3): impairment
        // leaving `a` toward the bridge is netem on a's veth end;
        // leaving `b` is netem on b's end. Unidirectional impairments
        // apply to `a`'s end only.
        fabric.apply_netem(a_veth, imp).await?;
        if !imp.unidirectional {
            fabric.apply_netem(b_veth, imp).await?;
        }
        Ok(())
    }

    /// Ephemeral WLAN links exist only while R[a][b] is true (spec
    /// §4.4). Call after a reachability transition to keep the link
    /// table consistent with the matrix.
    pub fn sync_wireless_link(&mut self, network: &Network, a: Endpoint, b: Endpoint) -> Option<LinkEvent> {
        debug_assert_eq!(network.kind, NetworkKind::Wlan);
        let up = network.reachable(a.node, b.node);
        let key = link_key(a, b);
        let existed = self.links.contains_key(&key);
        if up && !existed {
            self.links.insert(
                key,
                Link {
                    a: key.0,
                    b: key.1,
                    impairment: network.default_impairment,
                },
            );
            Some(LinkEvent::Added { a, b })
        } else if !up && existed {
            self.links.remove(&key);
            Some(LinkEvent::Deleted { a, b })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(node: u32, iface: u32) -> Endpoint {
        Endpoint {
            node: NodeId(node),
            interface: InterfaceId(iface),
        }
    }

    #[test]
    fn link_key_order_independent() {
        let a = ep(1, 0);
        let b = ep(2, 0);
        assert_eq!(link_key(a, b), link_key(b, a));
    }

    #[test]
    fn wireless_link_sync_added_then_removed() {
        let mut network = Network::new(crate::ids::NetworkId(1 << 16), NetworkKind::Wlan, "wl0".into());
        let mut engine = LinkEngine::new();
        let a = ep(1, 0);
        let b = ep(2, 0);

        network.set_reachable(a.node, b.node, true);
        let event = engine.sync_wireless_link(&network, a, b);
        assert!(matches!(event, Some(LinkEvent::Added { .. })));
        assert!(engine.get(a, b).is_some());

        network.set_reachable(a.node, b.node, false);
        let event = engine.sync_wireless_link(&network, a, b);
        assert!(matches!(event, Some(LinkEvent::Deleted { .. })));
        assert!(engine.get(a, b).is_none());
    }

    #[test]
    fn import_link_is_visible_through_get_and_iter() {
        let mut engine = LinkEngine::new();
        let a = ep(1, 0);
        let b = ep(2, 0);
        engine.import_link(a, b, Impairment { loss_ppm: 250_000, ..Default::default() });
        assert!(engine.get(a, b).is_some());
        assert_eq!(engine.iter().count(), 1);
    }

    #[test]
    fn wireless_link_sync_idempotent_when_unchanged() {
        let mut network = Network::new(crate::ids::NetworkId(1 << 16), NetworkKind::Wlan, "wl0".into());
        let mut engine = LinkEngine::new();
        let a = ep(1, 0);
        let b = ep(2, 0);

        network.set_reachable(a.node, b.node, true);
        engine.sync_wireless_link(&network, a, b);
        let event = engine.sync_wireless_link(&network, a, b);
        assert!(event.is_none());
    }
}
