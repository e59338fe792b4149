//! Network fabric (C3): bridge-backed network objects (switch, hub,
//! point-to-point, WLAN) with per-bridge ebtables policy and
//! per-interface netem, grounded on the teacher's `qdisc.rs` shell-tc
//! approach generalized from two test namespaces to an arbitrary bridge.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;

use rtnetlink::Handle;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::ids::{InterfaceId, NetworkId, NodeId};

#[derive(Error, Debug)]
pub enum QdiscError {
    #[error("failed to create bridge: {0}")]
    BridgeCreate(rtnetlink::Error),

    #[error("failed to delete bridge: {0}")]
    BridgeDelete(rtnetlink::Error),

    #[error("failed to apply qdisc: {0}")]
    Apply(std::io::Error),

    #[error("tc command failed with status {0}: {1}")]
    CommandFailed(i32, String),

    #[error("ebtables command failed: {0}")]
    Ebtables(std::io::Error),

    #[error("ebtables rule failed with status {0}: {1}")]
    EbtablesFailed(i32, String),

    #[error("invalid impairment value: {0}")]
    InvalidValue(String),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum NetworkKind {
    PointToPoint,
    Switch,
    Hub,
    Wlan,
}

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum EbtablesPolicy {
    Accept,
    Drop,
}

/// Per-direction impairment spec (spec §4.3). Loss/duplicate are
/// parts-per-million; delay/jitter are microseconds; bandwidth is
/// bits/second with 0 meaning unlimited.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct Impairment {
    pub bandwidth_bps: u64,
    pub delay_us: u32,
    pub jitter_us: u32,
    pub loss_ppm: u32,
    pub duplicate_ppm: u32,
    pub unidirectional: bool,
}

impl Impairment {
    pub fn loss_percent(&self) -> f64 {
        ppm_to_percent(self.loss_ppm)
    }

    pub fn duplicate_percent(&self) -> f64 {
        ppm_to_percent(self.duplicate_ppm)
    }
}

/// Parts-per-million to a percentage with six-decimal precision, per
/// spec §4.3.
pub fn ppm_to_percent(ppm: u32) -> f64 {
    (ppm as f64 / 1_000_000.0 * 100.0 * 1_000_000.0).round() / 1_000_000.0
}

pub struct Network {
    pub id: NetworkId,
    pub kind: NetworkKind,
    pub bridge_name: String,
    pub policy: EbtablesPolicy,
    pub default_impairment: Impairment,
    pub members: HashSet<InterfaceId>,
    /// Attached (node, interface) pairs, needed to address ebtables
    /// rules and the reachability matrix by MAC.
    pub attached: Vec<(NodeId, InterfaceId)>,
    /// Wireless reachability matrix, keyed by unordered node pair.
    /// Populated only for `NetworkKind::Wlan`.
    pub reachability: HashMap<(NodeId, NodeId), bool>,
}

impl Network {
    pub fn new(id: NetworkId, kind: NetworkKind, bridge_name: String) -> Self {
        let policy = if kind == NetworkKind::Wlan {
            EbtablesPolicy::Drop
        } else {
            EbtablesPolicy::Accept
        };
        Self {
            id,
            kind,
            bridge_name,
            policy,
            default_impairment: Impairment::default(),
            members: HashSet::new(),
            attached: Vec::new(),
            reachability: HashMap::new(),
        }
    }

    fn pair_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a.0 <= b.0 {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Reachability R(a,b). Always false on the diagonal (spec §8).
    pub fn reachable(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return false;
        }
        self.reachability.get(&Self::pair_key(a, b)).copied().unwrap_or(false)
    }

    /// Set R(a,b); returns true if this flipped the value (so the caller
    /// knows whether to emit a transition). Self-pairs are rejected.
    pub fn set_reachable(&mut self, a: NodeId, b: NodeId, up: bool) -> Option<bool> {
        if a == b {
            return None;
        }
        let key = Self::pair_key(a, b);
        let previous = self.reachability.insert(key, up);
        Some(previous != Some(up))
    }
}

/// Network fabric manager: realizes bridges and applies per-bridge
/// ebtables policy / per-interface netem.
pub struct NetworkFabric {
    handle: Handle,
}

impl NetworkFabric {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub async fn create_bridge(&self, name: &str, kind: NetworkKind) -> Result<(), QdiscError> {
        debug!("creating bridge {} ({:?})", name, kind);
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(QdiscError::BridgeCreate)?;

        // Switch: STP on, forwarding-delay 0. Hub: STP off (no MAC
        // learning, repeater semantics). Point-to-point behaves like a
        // two-member switch. WLAN starts with default DROP handled by
        // ebtables below, STP left off since membership is ephemeral.
        let stp_on = kind == NetworkKind::Switch;
        run_bridge_command(name, "stp_state", if stp_on { "1" } else { "0" }).await?;
        run_bridge_command(name, "forward_delay", "0").await?;
        if kind == NetworkKind::Hub {
            run_bridge_command(name, "ageing_time", "0").await?;
        }

        let index = self.find_index(name).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(QdiscError::BridgeCreate)?;

        if kind == NetworkKind::Wlan {
            run_ebtables(&["-N", &chain_name(name), "-P", "DROP"]).await?;
            run_ebtables(&["-A", "FORWARD", "--logical-in", name, "-j", &chain_name(name)]).await?;
        }

        Ok(())
    }

    pub async fn delete_bridge(&self, name: &str, kind: NetworkKind) -> Result<(), QdiscError> {
        if kind == NetworkKind::Wlan {
            let _ = run_ebtables(&["-D", "FORWARD", "--logical-in", name, "-j", &chain_name(name)]).await;
            let _ = run_ebtables(&["-F", &chain_name(name)]).await;
            let _ = run_ebtables(&["-X", &chain_name(name)]).await;
        }
        if let Ok(index) = self.find_index(name).await {
            let _ = self.handle.link().set(index).down().execute().await;
            self.handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(QdiscError::BridgeDelete)?;
        }
        Ok(())
    }

    pub async fn attach_to_bridge(&self, bridge: &str, iface: &str) -> Result<(), QdiscError> {
        let iface_index = self.find_index(iface).await?;
        let bridge_index = self.find_index(bridge).await?;
        self.handle
            .link()
            .set(iface_index)
            .controller(bridge_index)
            .execute()
            .await
            .map_err(QdiscError::BridgeCreate)?;
        Ok(())
    }

    pub async fn detach_from_bridge(&self, iface: &str) -> Result<(), QdiscError> {
        if let Ok(index) = self.find_index(iface).await {
            let _ = self.handle.link().set(index).nocontroller().execute().await;
        }
        Ok(())
    }

    /// ebtables ACCEPT rule for one ordered MAC pair, as the WLAN's
    /// exception to its default DROP policy (spec §4.3).
    pub async fn add_reachability_rule(&self, bridge: &str, mac_a: &str, mac_b: &str) -> Result<(), QdiscError> {
        run_ebtables(&[
            "-A",
            &chain_name(bridge),
            "-s",
            mac_a,
            "-d",
            mac_b,
            "-j",
            "ACCEPT",
        ])
        .await
    }

    pub async fn remove_reachability_rule(&self, bridge: &str, mac_a: &str, mac_b: &str) -> Result<(), QdiscError> {
        let _ = run_ebtables(&[
            "-D",
            &chain_name(bridge),
            "-s",
            mac_a,
            "-d",
            mac_b,
            "-j",
            "ACCEPT",
        ])
        .await;
        Ok(())
    }

    /// Apply a netem qdisc to `iface`'s egress queue, replacing any
    /// existing one. Mirrors the teacher's `apply_netem_in_namespace`
    /// command shape without the namespace indirection — the caller is
    /// already expected to be running with the right namespace fd, or
    /// the interface lives in the host namespace (bridge side).
    pub async fn apply_netem(&self, iface: &str, imp: &Impairment) -> Result<(), QdiscError> {
        let mut args: Vec<String> = vec![
            "qdisc".into(),
            "replace".into(),
            "dev".into(),
            iface.into(),
            "root".into(),
            "netem".into(),
        ];

        if imp.delay_us > 0 || imp.jitter_us > 0 {
            args.push("delay".into());
            args.push(format!("{}us", imp.delay_us));
            if imp.jitter_us > 0 {
                args.push(format!("{}us", imp.jitter_us));
            }
        }
        if imp.loss_ppm > 0 {
            args.push("loss".into());
            args.push(format!("{:.6}%", imp.loss_percent()));
        }
        if imp.duplicate_ppm > 0 {
            args.push("duplicate".into());
            args.push(format!("{:.6}%", imp.duplicate_percent()));
        }
        if imp.bandwidth_bps > 0 {
            args.push("rate".into());
            args.push(format!("{}bit", imp.bandwidth_bps));
        }

        run_tc(&args).await
    }

    pub async fn remove_qdisc(&self, iface: &str) -> Result<(), QdiscError> {
        let output = Command::new("tc")
            .args(["qdisc", "del", "dev", iface, "root"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(QdiscError::Apply)?;
        if !output.success() {
            debug!("tc qdisc del on {} returned non-zero (likely already absent)", iface);
        }
        Ok(())
    }

    async fn find_index(&self, name: &str) -> Result<u32, QdiscError> {
        use futures::TryStreamExt;
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        links
            .try_next()
            .await
            .map_err(QdiscError::BridgeCreate)?
            .map(|l| l.header.index)
            .ok_or_else(|| QdiscError::InvalidValue(format!("interface '{name}' not found")))
    }
}

fn chain_name(bridge: &str) -> String {
    format!("wl_{bridge}")
}

async fn run_bridge_command(bridge: &str, attr: &str, value: &str) -> Result<(), QdiscError> {
    let path = format!("/sys/class/net/{bridge}/bridge/{attr}");
    match tokio::fs::write(&path, value).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("could not set bridge attribute {} on {}: {}", attr, bridge, e);
            Ok(())
        }
    }
}

async fn run_tc(args: &[impl AsRef<str>]) -> Result<(), QdiscError> {
    let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
    let output = Command::new("tc")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(QdiscError::Apply)?;
    if !output.status.success() {
        return Err(QdiscError::CommandFailed(
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(())
}

async fn run_ebtables(args: &[&str]) -> Result<(), QdiscError> {
    let output = Command::new("ebtables")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(QdiscError::Ebtables)?;
    if !output.status.success() {
        return Err(QdiscError::EbtablesFailed(
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppm_conversion_precision() {
        assert_eq!(ppm_to_percent(250_000), 25.0);
        assert_eq!(ppm_to_percent(1), 0.0001);
        assert_eq!(ppm_to_percent(0), 0.0);
    }

    #[test]
    fn reachability_matrix_symmetric_and_diagonal_false() {
        let mut net = Network::new(NetworkId(1 << 16), NetworkKind::Wlan, "wl0".into());
        let a = NodeId(1);
        let b = NodeId(2);
        assert!(!net.reachable(a, a));
        net.set_reachable(a, b, true);
        assert!(net.reachable(a, b));
        assert!(net.reachable(b, a));
    }

    #[test]
    fn reachability_set_reports_transition_only() {
        let mut net = Network::new(NetworkId(1 << 16), NetworkKind::Wlan, "wl0".into());
        let a = NodeId(1);
        let b = NodeId(2);
        assert_eq!(net.set_reachable(a, b, true), Some(true));
        assert_eq!(net.set_reachable(a, b, true), Some(false));
        assert_eq!(net.set_reachable(a, b, false), Some(true));
        assert_eq!(net.set_reachable(a, a, true), None);
    }
}
