//! Session state machine (C7) and the orchestrator that ties the node
//! registry, network fabric, link engine, service scheduler, mobility
//! engine, event bus, peer registry, and address allocator together
//! behind the driver-facing operations in spec §6.

use std::collections::HashMap;
use std::path::PathBuf;

use rtnetlink::new_connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::addr::AddressAllocator;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{ConfigEvent, Event, EventBus, NodeEvent, SessionEvent};
use crate::host::{CommandOutcome, NamespaceManager, VethManager};
use crate::ids::{HookId, InterfaceId, NetworkId, NodeId, SessionId, NETWORK_ID_BASE};
use crate::link::{Endpoint, LinkEngine};
use crate::mobility::{MobilityControl, MobilityEngine, MobilityScript, MobilityTick};
use crate::network::{Impairment, Network, NetworkFabric, NetworkKind};
use crate::node::{
    generate_mac, host_ifname, parse_mac, GeoPosition, Interface, Node, NodeKind, NodePatch, NodeRegistry, NodeSpec,
    Position,
};
use crate::peer::PeerRegistry;
use crate::service::{topological_order, Service};

/// The seven session states plus the transient mobility-only signals
/// (spec §4.1). `Start`/`Stop`/`Pause` are not reachable via
/// `session.setState`; they exist only so `SessionEvent` and
/// `MobilityControl` can share a vocabulary in logs.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum SessionState {
    Definition,
    Configuration,
    Instantiation,
    Runtime,
    DataCollect,
    Shutdown,
}

impl SessionState {
    /// Permitted edges (spec §4.1): the linear progression, Shutdown
    /// from anywhere, and Definition <-> Configuration re-edit.
    pub fn can_transition_to(self, target: SessionState) -> bool {
        use SessionState::*;
        if target == Shutdown {
            return true;
        }
        matches!(
            (self, target),
            (Definition, Configuration)
                | (Configuration, Definition)
                | (Configuration, Instantiation)
                | (Instantiation, Runtime)
                | (Runtime, DataCollect)
                | (DataCollect, Shutdown)
        )
    }
}

pub struct Hook {
    pub id: HookId,
    pub target_state: SessionState,
    pub script: Vec<u8>,
    pub fired: bool,
}

/// One emulation's worth of state: the owner of every Node, Network,
/// Service, Hook, and allocator pool (spec §3 Ownership).
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub config: HashMap<String, String>,
    pub engine_config: EngineConfig,

    pub nodes: NodeRegistry,
    pub networks: HashMap<NetworkId, Network>,
    pub services: HashMap<String, Service>,
    pub hooks: Vec<Hook>,
    pub mobility_scripts: HashMap<NodeId, MobilityScript>,

    pub allocator: AddressAllocator,
    pub link_engine: LinkEngine,
    pub peers: PeerRegistry,
    pub events: EventBus,

    ns_manager: NamespaceManager,
    veth_manager: VethManager,
    fabric: NetworkFabric,
    mobility: MobilityEngine,
    mobility_ticks: tokio::sync::mpsc::Receiver<MobilityTick>,
    mobility_task: tokio::task::JoinHandle<()>,

    next_network_id: u32,
    next_hook_id: u32,
    fs_root: PathBuf,
}

impl Session {
    pub async fn new(id: SessionId, engine_config: EngineConfig) -> Result<Self> {
        let fs_root = engine_config.session_root(id.0);
        tokio::fs::create_dir_all(&fs_root).await?;

        let ns_manager = NamespaceManager::new(fs_root.join("netns"))?;
        let veth_manager = VethManager::new().await.map_err(Error::Veth)?;
        let (connection, handle, _) = new_connection()?;
        tokio::spawn(connection);
        let fabric = NetworkFabric::new(handle);
        let (mobility, tick_rx) = MobilityEngine::new(50);
        let mobility_task = mobility.spawn();

        Ok(Self {
            id,
            state: SessionState::Definition,
            config: HashMap::new(),
            engine_config,
            nodes: NodeRegistry::new(),
            networks: HashMap::new(),
            services: HashMap::new(),
            hooks: Vec::new(),
            mobility_scripts: HashMap::new(),
            allocator: AddressAllocator::new(),
            link_engine: LinkEngine::new(),
            peers: PeerRegistry::new(),
            events: EventBus::new(),
            ns_manager,
            veth_manager,
            fabric,
            mobility,
            mobility_ticks: tick_rx,
            mobility_task,
            next_network_id: NETWORK_ID_BASE,
            next_hook_id: 1,
            fs_root,
        })
    }

    pub fn mobility_engine(&self) -> &MobilityEngine {
        &self.mobility
    }

    // ---- session.setConfig / addHook -------------------------------

    pub fn set_config(&mut self, key: String, value: String) {
        self.events.publish_config(ConfigEvent {
            key: key.clone(),
            value: value.clone(),
        });
        self.config.insert(key, value);
    }

    pub fn add_hook(&mut self, target_state: SessionState, script: Vec<u8>) -> HookId {
        let id = HookId(self.next_hook_id);
        self.next_hook_id += 1;
        self.hooks.push(Hook {
            id,
            target_state,
            script,
            fired: false,
        });
        id
    }

    // ---- session.setState -------------------------------------------

    /// `setState` (spec §4.1): validates the edge, enforces
    /// preconditions, realizes/tears down resources for Instantiation
    /// and Shutdown, fires hooks in insertion order, and emits exactly
    /// one session-state event. A target further ahead than one edge
    /// (e.g. Definition -> Runtime, spec §8 scenario 6) cascades through
    /// each intermediate state in order rather than being rejected.
    pub async fn set_state(&mut self, target: SessionState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return self.cascade_to(target).await;
        }
        self.set_state_step(target).await
    }

    /// Walks the canonical Definition..Shutdown ordering from the
    /// current state to `target`, one permitted edge at a time.
    async fn cascade_to(&mut self, target: SessionState) -> Result<()> {
        const ORDER: [SessionState; 6] = [
            SessionState::Definition,
            SessionState::Configuration,
            SessionState::Instantiation,
            SessionState::Runtime,
            SessionState::DataCollect,
            SessionState::Shutdown,
        ];
        let current_idx = ORDER.iter().position(|s| *s == self.state);
        let target_idx = ORDER.iter().position(|s| *s == target);
        if let (Some(ci), Some(ti)) = (current_idx, target_idx) {
            if ti > ci {
                for &step in &ORDER[ci + 1..=ti] {
                    self.set_state_step(step).await?;
                }
                return Ok(());
            }
        }
        Err(Error::Validation(format!(
            "cannot transition from {:?} to {:?}",
            self.state, target
        )))
    }

    async fn set_state_step(&mut self, target: SessionState) -> Result<()> {
        if target == SessionState::Runtime && self.nodes.is_empty() {
            return Err(Error::Validation("Runtime requires at least one node".into()));
        }

        if target == SessionState::Instantiation {
            if let Err(e) = self.instantiate_all().await {
                warn!("instantiation failed, forcing shutdown: {}", e);
                self.state = SessionState::Instantiation;
                let _ = self.teardown().await;
                self.state = SessionState::Shutdown;
                self.fire_hooks(SessionState::Shutdown);
                self.events.publish_session(SessionEvent {
                    session: self.id,
                    state: self.state,
                });
                return Err(e);
            }
        }

        if target == SessionState::Shutdown {
            self.teardown().await;
        }

        self.state = target;
        self.fire_hooks(target);
        self.events.publish_session(SessionEvent {
            session: self.id,
            state: self.state,
        });
        Ok(())
    }

    fn fire_hooks(&mut self, target: SessionState) {
        for hook in self.hooks.iter_mut() {
            if hook.target_state == target && !hook.fired {
                hook.fired = true;
                info!("hook {} fired entering {:?}", hook.id, target);
                // Script execution is dispatched by the driver (the
                // hook only records firing order/state here); the
                // engine's contract is "fires hooks", not "interprets
                // hook script syntax" (non-goal: service template
                // contents).
            }
        }
    }

    /// Instantiation realizes every not-yet-realized node and starts
    /// services in dependency order (spec §4.1). Node/service failures
    /// are reported but do not abort the rest (spec §4.1 Failure
    /// semantics); the caller only sees an Err if the whole phase cannot
    /// proceed (currently: none, everything here is best-effort per
    /// node).
    async fn instantiate_all(&mut self) -> Result<()> {
        let node_ids: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        for node_id in node_ids {
            if let Err(e) = self.realize_node(node_id).await {
                warn!("node {} failed to realize: {}", node_id, e);
                continue;
            }
            if let Err(e) = self.start_services(node_id).await {
                warn!("services failed to start on node {}: {}", node_id, e);
            }
        }
        Ok(())
    }

    // ---- node.create / node.delete / node.command -------------------

    pub fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        let id = self.nodes.create(spec).map_err(Error::Validation)?;
        self.events.publish_node(NodeEvent::Created { node: id });
        if self.state == SessionState::Runtime {
            // "In Runtime, realization happens immediately" (spec §4.2).
            // The caller is async; this sync method cannot realize
            // in-line, so it is the driver's responsibility to call
            // `realize_node` right after when state is already Runtime.
        }
        Ok(id)
    }

    /// `realize` (spec §4.2): creates the node's private filesystem
    /// root and network namespace. Idempotent.
    pub async fn realize_node(&mut self, node_id: NodeId) -> Result<()> {
        let already_realized = self
            .nodes
            .get(node_id)
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?
            .realized;
        if already_realized {
            return Ok(());
        }

        let fs_root = self.fs_root.join(format!("node.{}", node_id.0));
        tokio::fs::create_dir_all(&fs_root).await?;

        let namespace = format!("n{}", node_id.0);
        self.ns_manager.create_namespace(&namespace).await?;

        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        node.fs_root = Some(fs_root);
        node.namespace = Some(namespace);
        node.realized = true;
        Ok(())
    }

    pub async fn run_in_node(
        &self,
        node_id: NodeId,
        argv: Vec<String>,
        wait: bool,
    ) -> Result<CommandOutcome> {
        let node = self.nodes.get(node_id).ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        let namespace = node.namespace.as_ref().ok_or_else(|| Error::Validation("node not realized".into()))?;
        let cwd = node.fs_root.clone().unwrap_or_else(|| self.fs_root.clone());
        Ok(self.ns_manager.run_in_node(namespace, &argv, &cwd, wait, None).await?)
    }

    /// `node.edit` (spec §6): applies a position/services patch to an
    /// existing node and emits one node-edited event.
    pub fn edit_node(&mut self, node_id: NodeId, patch: NodePatch) -> Result<()> {
        let node = self.nodes.get_mut(node_id).ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        if let Some(position) = patch.position {
            node.position = position;
        }
        if let Some(services) = patch.services {
            node.services = services;
        }
        self.events.publish_node(NodeEvent::Edited { node: node_id });
        Ok(())
    }

    /// `node.terminal` (spec §6): a command string the driver can hand to
    /// a real terminal emulator to open a shell attached to the node's
    /// namespace. The engine's contract stops at producing this string;
    /// spawning a terminal emulator is the driver's job (non-goal:
    /// rendering).
    pub fn node_terminal(&self, node_id: NodeId) -> Result<String> {
        let node = self.nodes.get(node_id).ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        let namespace = node.namespace.as_ref().ok_or_else(|| Error::Validation("node not realized".into()))?;
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        Ok(format!("ip netns exec {namespace} {shell}"))
    }

    /// `deleteNode` (spec §4.2): idempotent; detaches interfaces,
    /// terminates the container, removes the filesystem root.
    pub async fn delete_node(&mut self, node_id: NodeId) -> Result<()> {
        let node = match self.nodes.get(node_id) {
            Some(n) => n.clone(),
            None => return Ok(()),
        };

        for (iface_id, iface) in node.interfaces {
            if let Some(net_id) = iface.network {
                let _ = self.detach_interface_inner(node_id, iface_id, net_id).await;
            }
        }

        if let Some(namespace) = &node.namespace {
            let _ = self.ns_manager.delete_namespace(namespace).await;
        }
        if let Some(fs_root) = &node.fs_root {
            let _ = tokio::fs::remove_dir_all(fs_root).await;
        }

        self.nodes.remove(node_id);
        self.events.publish_node(NodeEvent::Deleted { node: node_id });
        Ok(())
    }

    // ---- iface.add / link.add/update/delete -------------------------

    /// `attachInterface` (spec §4.2): allocates an interface id, creates
    /// a veth pair, moves one end into the node and renames it
    /// `eth{id}`, attaches the other end to the network's bridge,
    /// assigns MAC and addresses, brings both ends up. Any failed step
    /// unwinds everything created so far.
    pub async fn attach_interface(
        &mut self,
        node_id: NodeId,
        network_id: NetworkId,
        want_v4: bool,
        want_v6: bool,
    ) -> Result<InterfaceId> {
        let namespace = self
            .nodes
            .get(node_id)
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?
            .namespace
            .clone()
            .ok_or_else(|| Error::Validation("node not realized".into()))?;

        let network = self
            .networks
            .get(&network_id)
            .ok_or_else(|| Error::NotFound(format!("network {network_id}")))?;
        let bridge_name = network.bridge_name.clone();

        let iface_id = self
            .nodes
            .get_mut(node_id)
            .unwrap()
            .next_interface_id();

        let host_name = host_ifname(self.id, node_id, iface_id);
        let container_name = format!("eth{}", iface_id.0);
        let mac = generate_mac(node_id, iface_id);

        // Step 1: veth pair.
        if let Err(e) = self.veth_manager.create_pair(&host_name, &container_name).await {
            return Err(e.into());
        }

        // Step 2: move one end into the node's namespace, rename to its
        // final eth{id} name, program MAC/addresses, bring both ends up,
        // attach the host end to the bridge. Unwind the veth pair and any
        // allocated address on failure from here on.
        let mut ipv4 = None;
        let mut ipv6 = None;
        let result: Result<()> = async {
            self.veth_manager
                .move_to_namespace(&container_name, &namespace, &self.ns_manager)
                .await?;
            self.veth_manager
                .rename_in_namespace(&container_name, &container_name, &namespace, &self.ns_manager)
                .await?;
            self.veth_manager
                .set_address(&container_name, mac, &namespace, &self.ns_manager)
                .await?;

            if want_v4 {
                if self.allocator.allocate_v4(network_id).is_err() {
                    self.allocator.provision_ipv4(network_id, self.engine_config.default_ipv4_prefix_len)?;
                }
                let addr = self.allocator.allocate_v4(network_id)?;
                if let Err(e) = self
                    .veth_manager
                    .add_address(&container_name, addr.0.into(), addr.1, &namespace, &self.ns_manager)
                    .await
                {
                    self.allocator.deallocate_v4(network_id, addr.0);
                    return Err(e.into());
                }
                ipv4 = Some(addr);
            }
            if want_v6 {
                if self.allocator.allocate_v6(network_id).is_err() {
                    self.allocator.provision_ipv6(network_id, 64)?;
                }
                let addr = self.allocator.allocate_v6(network_id)?;
                if let Err(e) = self
                    .veth_manager
                    .add_address(&container_name, addr.0.into(), addr.1, &namespace, &self.ns_manager)
                    .await
                {
                    self.allocator.deallocate_v6(network_id, addr.0);
                    return Err(e.into());
                }
                ipv6 = Some(addr);
            }

            self.veth_manager.set_up(&container_name, Some(&self.ns_manager)).await?;
            self.veth_manager.set_up(&host_name, None).await?;
            self.fabric.attach_to_bridge(&bridge_name, &host_name).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            if let Some((addr, _)) = ipv4 {
                self.allocator.deallocate_v4(network_id, addr);
            }
            if let Some((addr, _)) = ipv6 {
                self.allocator.deallocate_v6(network_id, addr);
            }
            let _ = self.veth_manager.delete_if_exists(&host_name).await;
            return Err(e);
        }

        let interface = Interface {
            id: iface_id,
            name: container_name,
            mac,
            ipv4,
            ipv6,
            network: Some(network_id),
            host_veth: Some(host_name.clone()),
        };

        let node = self.nodes.get_mut(node_id).unwrap();
        node.interfaces.insert(iface_id, interface);

        let network = self.networks.get_mut(&network_id).unwrap();
        network.members.insert(iface_id);
        network.attached.push((node_id, iface_id));

        Ok(iface_id)
    }

    async fn detach_interface_inner(&mut self, node_id: NodeId, iface_id: InterfaceId, network_id: NetworkId) -> Result<()> {
        if let Some(network) = self.networks.get_mut(&network_id) {
            network.members.remove(&iface_id);
            network.attached.retain(|(n, i)| !(*n == node_id && *i == iface_id));
        }
        if let Some(node) = self.nodes.get_mut(node_id) {
            if let Some(iface) = node.interfaces.remove(&iface_id) {
                if let Some(addr) = iface.ipv4 {
                    self.allocator.deallocate_v4(network_id, addr.0);
                }
                if let Some(addr) = iface.ipv6 {
                    self.allocator.deallocate_v6(network_id, addr.0);
                }
                if let Some(veth) = iface.host_veth {
                    let _ = self.fabric.detach_from_bridge(&veth).await;
                    let _ = self.veth_manager.delete_if_exists(&veth).await;
                }
            }
        }
        Ok(())
    }

    /// `createNetwork`: allocates a network id from the disjoint range
    /// and realizes its bridge (spec §3, §4.3).
    pub async fn create_network(&mut self, kind: NetworkKind) -> Result<NetworkId> {
        let id = NetworkId(self.next_network_id);
        self.next_network_id += 1;

        let bridge_name = crate::node::truncate_ifname(&format!("b.{}.{}", self.id.0, id.0));
        self.fabric.create_bridge(&bridge_name, kind).await?;

        self.networks.insert(id, Network::new(id, kind, bridge_name));
        Ok(id)
    }

    pub async fn link_add(
        &mut self,
        a: Endpoint,
        b: Endpoint,
        impairment: Impairment,
    ) -> Result<()> {
        let a_veth = self.veth_for(a)?;
        let b_veth = self.veth_for(b)?;
        let network = self.network_of(a)?;
        let event = self
            .link_engine
            .link_add(&self.fabric, network, a, &a_veth, b, &b_veth, impairment)
            .await?;
        self.publish_link_event(event);
        Ok(())
    }

    pub async fn link_update(&mut self, a: Endpoint, b: Endpoint, impairment: Impairment) -> Result<()> {
        let a_veth = self.veth_for(a)?;
        let b_veth = self.veth_for(b)?;
        let event = self.link_engine.link_update(&self.fabric, a, &a_veth, b, &b_veth, impairment).await?;
        self.publish_link_event(event);
        Ok(())
    }

    pub async fn link_delete(&mut self, a: Endpoint, b: Endpoint) -> Result<()> {
        let a_veth = self.veth_for(a)?;
        let b_veth = self.veth_for(b)?;
        let event = self.link_engine.link_delete(&self.fabric, a, &a_veth, b, &b_veth).await?;
        self.publish_link_event(event);
        Ok(())
    }

    fn publish_link_event(&self, event: crate::link::LinkEvent) {
        use crate::link::LinkEvent as LE;
        let mapped = match event {
            LE::Added { a, b } => crate::events::LinkEvent::Added {
                node_a: a.node,
                iface_a: a.interface,
                node_b: b.node,
                iface_b: b.interface,
            },
            LE::Changed { a, b } => crate::events::LinkEvent::Changed {
                node_a: a.node,
                iface_a: a.interface,
                node_b: b.node,
                iface_b: b.interface,
            },
            LE::Deleted { a, b } => crate::events::LinkEvent::Deleted {
                node_a: a.node,
                iface_a: a.interface,
                node_b: b.node,
                iface_b: b.interface,
            },
        };
        self.events.publish_link(mapped);
    }

    fn veth_for(&self, ep: Endpoint) -> Result<String> {
        self.nodes
            .get(ep.node)
            .and_then(|n| n.interfaces.get(&ep.interface))
            .and_then(|i| i.host_veth.clone())
            .ok_or_else(|| Error::NotFound(format!("interface {}/{}", ep.node, ep.interface)))
    }

    fn network_of(&self, ep: Endpoint) -> Result<&Network> {
        let net_id = self
            .nodes
            .get(ep.node)
            .and_then(|n| n.interfaces.get(&ep.interface))
            .and_then(|i| i.network)
            .ok_or_else(|| Error::NotFound(format!("interface {}/{} has no network", ep.node, ep.interface)))?;
        self.networks.get(&net_id).ok_or_else(|| Error::NotFound(format!("network {net_id}")))
    }

    // ---- wireless.linkState / mobility recomputation ----------------

    /// `wireless.linkState` (spec §4.4): a policy-plugin pairwise
    /// up/down push. "Last writer wins per pair" (spec §9 open question
    /// b) falls out of `Network::set_reachable` simply overwriting.
    pub async fn wireless_link_state(&mut self, wlan: NetworkId, a: NodeId, b: NodeId, up: bool) -> Result<()> {
        let endpoints = self.wlan_endpoints(wlan, a, b)?;
        let network = self.networks.get_mut(&wlan).ok_or_else(|| Error::NotFound(format!("network {wlan}")))?;
        if network.kind != NetworkKind::Wlan {
            return Err(Error::Validation(format!("network {wlan} is not a WLAN")));
        }
        if network.set_reachable(a, b, up) == Some(true) {
            self.sync_reachability(wlan, endpoints).await?;
        }
        Ok(())
    }

    /// Applies a mobility tick (spec §4.6): update positions, then
    /// recompute reachability for every WLAN, posting only transitions.
    pub async fn apply_mobility_tick(&mut self, updates: Vec<(NodeId, Position)>, range: f64) -> Result<()> {
        for (node_id, pos) in &updates {
            if let Some(node) = self.nodes.get_mut(*node_id) {
                node.position = *pos;
            }
        }

        let wlan_ids: Vec<NetworkId> = self
            .networks
            .iter()
            .filter(|(_, n)| n.kind == NetworkKind::Wlan)
            .map(|(id, _)| *id)
            .collect();

        for wlan_id in wlan_ids {
            let members: Vec<NodeId> = self
                .networks
                .get(&wlan_id)
                .map(|n| n.attached.iter().map(|(node, _)| *node).collect())
                .unwrap_or_default();

            for (idx, &a) in members.iter().enumerate() {
                for &b in &members[idx + 1..] {
                    let (pa, pb) = match (self.nodes.get(a), self.nodes.get(b)) {
                        (Some(na), Some(nb)) => (na.position, nb.position),
                        _ => continue,
                    };
                    let dist = distance(pa, pb);
                    let reachable = dist <= range;
                    let endpoints = self.wlan_endpoints(wlan_id, a, b)?;
                    let flipped = self
                        .networks
                        .get_mut(&wlan_id)
                        .and_then(|n| n.set_reachable(a, b, reachable));
                    if flipped == Some(true) {
                        self.sync_reachability(wlan_id, endpoints).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn wlan_endpoints(&self, wlan: NetworkId, a: NodeId, b: NodeId) -> Result<(Endpoint, Endpoint)> {
        let network = self.networks.get(&wlan).ok_or_else(|| Error::NotFound(format!("network {wlan}")))?;
        let iface_a = network
            .attached
            .iter()
            .find(|(n, _)| *n == a)
            .map(|(_, i)| *i)
            .ok_or_else(|| Error::NotFound(format!("node {a} not attached to {wlan}")))?;
        let iface_b = network
            .attached
            .iter()
            .find(|(n, _)| *n == b)
            .map(|(_, i)| *i)
            .ok_or_else(|| Error::NotFound(format!("node {b} not attached to {wlan}")))?;
        Ok((
            Endpoint { node: a, interface: iface_a },
            Endpoint { node: b, interface: iface_b },
        ))
    }

    async fn sync_reachability(&mut self, wlan: NetworkId, (a, b): (Endpoint, Endpoint)) -> Result<()> {
        let network = self.networks.get(&wlan).ok_or_else(|| Error::NotFound(format!("network {wlan}")))?;
        let up = network.reachable(a.node, b.node);
        let bridge = network.bridge_name.clone();

        let mac_a = self.nodes.get(a.node).and_then(|n| n.interfaces.get(&a.interface)).map(|i| i.mac_string());
        let mac_b = self.nodes.get(b.node).and_then(|n| n.interfaces.get(&b.interface)).map(|i| i.mac_string());
        if let (Some(mac_a), Some(mac_b)) = (mac_a, mac_b) {
            if up {
                self.fabric.add_reachability_rule(&bridge, &mac_a, &mac_b).await?;
                self.fabric.add_reachability_rule(&bridge, &mac_b, &mac_a).await?;
            } else {
                self.fabric.remove_reachability_rule(&bridge, &mac_a, &mac_b).await?;
                self.fabric.remove_reachability_rule(&bridge, &mac_b, &mac_a).await?;
            }
        }

        let network = self.networks.get(&wlan).unwrap();
        if let Some(event) = self.link_engine.sync_wireless_link(network, a, b) {
            self.publish_link_event(event);
        }
        Ok(())
    }

    // ---- mobility.loadScript / mobility.control ---------------------

    pub async fn load_mobility_script(&mut self, node: NodeId, script: MobilityScript) -> Result<()> {
        self.mobility.load_script(node, script.clone()).await;
        self.mobility_scripts.insert(node, script);
        Ok(())
    }

    pub async fn mobility_control(&mut self, signal: MobilityControl) -> Result<()> {
        self.mobility.control(signal).await;
        Ok(())
    }

    /// Drains every mobility tick published so far and applies it (spec
    /// §5: the tick driver runs on its own task and publishes results
    /// back to the session thread through a single-consumer queue; this
    /// is that queue's consumer side). The driver calls this on its own
    /// cadence -- there's nothing to apply between ticks.
    pub async fn pump_mobility(&mut self) -> Result<()> {
        let range = self.engine_config.default_wireless_range;
        while let Ok(tick) = self.mobility_ticks.try_recv() {
            self.apply_mobility_tick(tick.updates, range).await?;
        }
        Ok(())
    }

    // ---- service scheduler -------------------------------------------

    async fn start_services(&mut self, node_id: NodeId) -> Result<()> {
        let node = self.nodes.get(node_id).ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        let order = topological_order(&node.services, &self.services);
        for name in order {
            let service = match self.services.get(&name) {
                Some(s) => s.clone(),
                None => continue,
            };
            if let Err(e) = self.materialize_service(node_id, &service).await {
                warn!("service '{}' template materialization failed on node {}: {}", name, node_id, e);
            }
            for cmd in &service.startup {
                if cmd.is_empty() {
                    continue;
                }
                if let Err(e) = self.run_in_node(node_id, cmd.clone(), false).await {
                    warn!("service '{}' startup command failed on node {}: {}", name, node_id, e);
                }
            }
            self.validate_service(node_id, &service).await;
        }
        Ok(())
    }

    /// Builds the name->value map for template rendering out of session
    /// config, node attributes, and the node's interface table (spec
    /// §4.5), creates the service's declared directories, renders its
    /// templates, and writes them into the node's private filesystem
    /// root.
    async fn materialize_service(&self, node_id: NodeId, service: &Service) -> Result<()> {
        let node = self.nodes.get(node_id).ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        let fs_root = node.fs_root.clone().ok_or_else(|| Error::Validation("node not realized".into()))?;

        let mut vars: HashMap<String, serde_json::Value> = HashMap::new();
        for (key, value) in &self.config {
            vars.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        vars.insert("node_id".into(), serde_json::Value::from(node.id.0));
        vars.insert("node_name".into(), serde_json::Value::String(node.name.clone()));
        vars.insert("node_model".into(), serde_json::Value::String(node.model.clone()));
        let interfaces: Vec<serde_json::Value> = node
            .interfaces
            .values()
            .map(|iface| {
                serde_json::json!({
                    "id": iface.id.0,
                    "name": iface.name,
                    "mac": iface.mac_string(),
                    "ipv4": iface.ipv4.map(|(a, p)| format!("{a}/{p}")),
                    "ipv6": iface.ipv6.map(|(a, p)| format!("{a}/{p}")),
                })
            })
            .collect();
        vars.insert("interfaces".into(), serde_json::Value::Array(interfaces));

        for dir in &service.directories {
            let target = join_under_root(&fs_root, dir);
            tokio::fs::create_dir_all(&target).await?;
        }

        let rendered = crate::service::render_templates(service, &vars)?;
        for (path, contents) in rendered {
            let target = join_under_root(&fs_root, &path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, contents).await?;
        }
        Ok(())
    }

    async fn validate_service(&mut self, node_id: NodeId, service: &Service) {
        use crate::service::ValidationMode;
        match service.validation_mode {
            ValidationMode::NonBlocking => {}
            ValidationMode::Blocking => {
                for cmd in &service.validate {
                    if cmd.is_empty() {
                        continue;
                    }
                    match self.run_in_node(node_id, cmd.clone(), true).await {
                        Ok(CommandOutcome::Exited { exit_code: Some(0), .. }) => {}
                        Ok(_) => warn!("service '{}' validate command returned non-zero on node {}", service.name, node_id),
                        Err(e) => warn!("service '{}' validate command failed on node {}: {}", service.name, node_id, e),
                    }
                }
            }
            ValidationMode::Timer => {
                // Reported asynchronously (spec §4.5); the driver polls
                // node state after `validation_timer_ms` rather than the
                // engine blocking instantiation on it.
            }
        }
    }

    // ---- xml.export / xml.import -------------------------------------

    /// `xml.export` (spec §6): serializes the full session -- config,
    /// node graph with interfaces/services/positions, networks, links,
    /// hooks, and mobility scripts -- into the persisted document shape.
    pub fn to_xml_document(&self) -> crate::xml::SessionDocument {
        use crate::xml::{ConfigEntryXml, GeoXml, HookXml, InterfaceXml, LinkXml, MobilityXml, NetworkXml, NodeXml, ServiceRefXml, SessionDocument, WaypointXml};

        let mut config: Vec<ConfigEntryXml> = self
            .config
            .iter()
            .map(|(k, v)| ConfigEntryXml { key: k.clone(), value: v.clone() })
            .collect();
        config.sort_by(|a, b| a.key.cmp(&b.key));

        let mut nodes: Vec<NodeXml> = self
            .nodes
            .iter()
            .map(|node| {
                let mut interfaces: Vec<&Interface> = node.interfaces.values().collect();
                interfaces.sort_by_key(|i| i.id.0);
                NodeXml {
                    id: node.id.0,
                    name: node.name.clone(),
                    kind: node.kind,
                    model: node.model.clone(),
                    x: node.position.x,
                    y: node.position.y,
                    z: node.position.z,
                    geo: node.geo.map(|g| GeoXml { lat: g.lat, lon: g.lon, alt: g.alt }),
                    services: node.services.iter().map(|s| ServiceRefXml { name: s.clone() }).collect(),
                    interfaces: interfaces
                        .into_iter()
                        .map(|iface| InterfaceXml {
                            id: iface.id.0,
                            name: iface.name.clone(),
                            mac: iface.mac_string(),
                            ipv4: iface.ipv4.map(|(a, _)| a.to_string()),
                            ipv4_prefix: iface.ipv4.map(|(_, p)| p),
                            ipv6: iface.ipv6.map(|(a, _)| a.to_string()),
                            ipv6_prefix: iface.ipv6.map(|(_, p)| p),
                            network: iface.network.map(|n| n.0).unwrap_or(0),
                        })
                        .collect(),
                }
            })
            .collect();
        nodes.sort_by_key(|n| n.id);

        let mut networks: Vec<NetworkXml> = self
            .networks
            .values()
            .map(|n| NetworkXml { id: n.id.0, kind: n.kind, policy: n.policy, bridge: n.bridge_name.clone() })
            .collect();
        networks.sort_by_key(|n| n.id);

        let mut links: Vec<LinkXml> = self
            .link_engine
            .iter()
            .map(|l| LinkXml {
                node_a: l.a.node.0,
                iface_a: l.a.interface.0,
                node_b: l.b.node.0,
                iface_b: l.b.interface.0,
                bandwidth_bps: l.impairment.bandwidth_bps,
                delay_us: l.impairment.delay_us,
                jitter_us: l.impairment.jitter_us,
                loss_ppm: l.impairment.loss_ppm,
                duplicate_ppm: l.impairment.duplicate_ppm,
                unidirectional: l.impairment.unidirectional,
            })
            .collect();
        links.sort_by_key(|l| (l.node_a, l.iface_a, l.node_b, l.iface_b));

        let hooks: Vec<HookXml> = self
            .hooks
            .iter()
            .map(|h| HookXml {
                target_state: h.target_state,
                script: String::from_utf8_lossy(&h.script).into_owned(),
            })
            .collect();

        let mut mobility_scripts: Vec<MobilityXml> = self
            .mobility_scripts
            .iter()
            .map(|(node, script)| MobilityXml {
                node: node.0,
                loop_enabled: script.loop_enabled,
                refresh_ms: script.refresh_ms,
                waypoints: script
                    .waypoints
                    .iter()
                    .map(|w| WaypointXml { t: w.time_offset_ms, x: w.position.x, y: w.position.y, z: w.position.z })
                    .collect(),
            })
            .collect();
        mobility_scripts.sort_by_key(|m| m.node);

        SessionDocument {
            id: self.id.0,
            state: self.state,
            config,
            nodes,
            networks,
            links,
            hooks,
            mobility_scripts,
        }
    }

    /// `xml.import` (spec §6): repopulates this session's data model from
    /// a parsed document, including the state it was exported in. Only
    /// in-memory topology is restored here -- kernel objects (namespaces,
    /// veths, bridges) are not recreated by import itself, so a document
    /// exported at Runtime and re-imported still needs `setState` calls
    /// to re-realize anything, but the state machine's own position
    /// (spec §8 scenario 6) carries across the export/import round trip
    /// instead of resetting every CLI invocation.
    pub fn apply_xml_document(&mut self, doc: &crate::xml::SessionDocument) -> Result<()> {
        self.state = doc.state;

        for entry in &doc.config {
            self.set_config(entry.key.clone(), entry.value.clone());
        }

        for node_xml in &doc.nodes {
            let spec = NodeSpec {
                id: node_xml.id,
                name: node_xml.name.clone(),
                kind: node_xml.kind,
                model: node_xml.model.clone(),
                position: Position { x: node_xml.x, y: node_xml.y, z: node_xml.z },
                geo: node_xml.geo.as_ref().map(|g| GeoPosition { lat: g.lat, lon: g.lon, alt: g.alt }),
                services: node_xml.services.iter().map(|s| s.name.clone()).collect(),
            };
            self.nodes.create(spec).map_err(Error::Validation)?;
        }

        for net_xml in &doc.networks {
            let network_id = NetworkId(net_xml.id);
            let mut network = Network::new(network_id, net_xml.kind, net_xml.bridge.clone());
            network.policy = net_xml.policy;
            self.networks.insert(network_id, network);
            if net_xml.id >= self.next_network_id {
                self.next_network_id = net_xml.id + 1;
            }
        }

        for node_xml in &doc.nodes {
            let node_id = NodeId(node_xml.id);
            for iface_xml in &node_xml.interfaces {
                let iface_id = InterfaceId(iface_xml.id);
                let mac = parse_mac(&iface_xml.mac).ok_or_else(|| Error::Xml(format!("bad mac '{}'", iface_xml.mac)))?;
                let ipv4 = match (&iface_xml.ipv4, iface_xml.ipv4_prefix) {
                    (Some(a), Some(p)) => Some((
                        a.parse().map_err(|_| Error::Xml(format!("bad ipv4 address '{a}'")))?,
                        p,
                    )),
                    _ => None,
                };
                let ipv6 = match (&iface_xml.ipv6, iface_xml.ipv6_prefix) {
                    (Some(a), Some(p)) => Some((
                        a.parse().map_err(|_| Error::Xml(format!("bad ipv6 address '{a}'")))?,
                        p,
                    )),
                    _ => None,
                };
                let network_id = NetworkId(iface_xml.network);

                let interface = Interface {
                    id: iface_id,
                    name: iface_xml.name.clone(),
                    mac,
                    ipv4,
                    ipv6,
                    network: Some(network_id),
                    host_veth: None,
                };

                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.interfaces.insert(iface_id, interface);
                    node.bump_interface_id(iface_id.0);
                }
                if let Some(network) = self.networks.get_mut(&network_id) {
                    network.members.insert(iface_id);
                    network.attached.push((node_id, iface_id));
                }
            }
        }

        for link_xml in &doc.links {
            let (a, b, impairment): (Endpoint, Endpoint, Impairment) = link_xml.into();
            self.link_engine.import_link(a, b, impairment);
        }

        for hook_xml in &doc.hooks {
            self.add_hook(hook_xml.target_state, hook_xml.script.clone().into_bytes());
        }

        for mobility_xml in &doc.mobility_scripts {
            let node_id = NodeId(mobility_xml.node);
            let script: MobilityScript = mobility_xml.into();
            self.mobility_scripts.insert(node_id, script);
        }

        Ok(())
    }

    // ---- teardown ------------------------------------------------------

    /// Destroys everything in reverse dependency order: mobility ->
    /// services on running nodes -> nodes -> networks -> filesystem
    /// roots (spec §3 Ownership).
    async fn teardown(&mut self) {
        self.mobility.control(MobilityControl::Stop).await;
        self.mobility_task.abort();

        let node_ids: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        for node_id in node_ids {
            if let Some(node) = self.nodes.get(node_id) {
                let order = topological_order(&node.services, &self.services);
                for name in order.into_iter().rev() {
                    if let Some(service) = self.services.get(&name).cloned() {
                        for cmd in &service.shutdown {
                            if cmd.is_empty() {
                                continue;
                            }
                            let _ = self.run_in_node(node_id, cmd.clone(), true).await;
                        }
                    }
                }
            }
            let _ = self.delete_node(node_id).await;
        }

        let network_ids: Vec<NetworkId> = self.networks.keys().copied().collect();
        for net_id in network_ids {
            if let Some(network) = self.networks.remove(&net_id) {
                let _ = self.fabric.delete_bridge(&network.bridge_name, network.kind).await;
            }
        }

        let _ = tokio::fs::remove_dir_all(&self.fs_root).await;
    }
}

/// Joins a service-declared path (typically absolute, e.g. `/etc/hostname`)
/// under the node's private filesystem root rather than the host's real
/// root.
fn join_under_root(root: &std::path::Path, declared: &str) -> PathBuf {
    root.join(declared.trim_start_matches('/'))
}

fn distance(a: Position, b: Position) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2) + (a.z - b.z).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_follow_the_permitted_edges() {
        use SessionState::*;
        assert!(Definition.can_transition_to(Configuration));
        assert!(Configuration.can_transition_to(Definition));
        assert!(Configuration.can_transition_to(Instantiation));
        assert!(!Instantiation.can_transition_to(Definition));
        assert!(!Runtime.can_transition_to(Configuration));
        assert!(Runtime.can_transition_to(Shutdown));
        assert!(Definition.can_transition_to(Shutdown));
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Position { x: 0.0, y: 0.0, z: 0.0 };
        let b = Position { x: 3.0, y: 4.0, z: 0.0 };
        assert_eq!(distance(a, b), 5.0);
    }
}
