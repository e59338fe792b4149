//! Command implementations, one function per spec §6 driver operation.
//! Every command opens a session store -- an `xml.export`ed document
//! named by `--file`, created fresh by `session init` -- applies one
//! operation to the in-memory `Session`, and writes the document back.
//! A fresh `Session` (and, for real kernel operations, its namespace and
//! netlink handle) is built per invocation; nothing is kept running
//! between commands, the way a one-shot `ip` or `tc` invocation works.

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use session_core::config::EngineConfig;
use session_core::error::Result;
use session_core::link::Endpoint;
use session_core::mobility::{parse_script, MobilityControl};
use session_core::network::{Impairment, NetworkKind};
use session_core::node::{NodeKind, NodePatch, NodeSpec, Position};
use session_core::{xml, Error, InterfaceId, NetworkId, NodeId, Session, SessionId, SessionState};

fn parse_state(s: &str) -> std::result::Result<SessionState, String> {
    match s.to_ascii_lowercase().as_str() {
        "definition" => Ok(SessionState::Definition),
        "configuration" => Ok(SessionState::Configuration),
        "instantiation" => Ok(SessionState::Instantiation),
        "runtime" => Ok(SessionState::Runtime),
        "datacollect" => Ok(SessionState::DataCollect),
        "shutdown" => Ok(SessionState::Shutdown),
        other => Err(format!("unknown session state '{other}'")),
    }
}

fn parse_node_kind(s: &str) -> std::result::Result<NodeKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "default" => Ok(NodeKind::Default),
        "switch" => Ok(NodeKind::Switch),
        "hub" => Ok(NodeKind::Hub),
        "point-to-point" | "p2p" => Ok(NodeKind::PointToPoint),
        "wlan" => Ok(NodeKind::Wlan),
        "external-wlan" => Ok(NodeKind::ExternalWlan),
        "tunnel" => Ok(NodeKind::Tunnel),
        "physical" => Ok(NodeKind::Physical),
        "raw-ethernet" => Ok(NodeKind::RawEthernet),
        other => Err(format!("unknown node kind '{other}'")),
    }
}

fn parse_network_kind(s: &str) -> std::result::Result<NetworkKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "point-to-point" | "p2p" => Ok(NetworkKind::PointToPoint),
        "switch" => Ok(NetworkKind::Switch),
        "hub" => Ok(NetworkKind::Hub),
        "wlan" => Ok(NetworkKind::Wlan),
        other => Err(format!("unknown network kind '{other}'")),
    }
}

/// Loads the session named by `path` if it exists (replaying its XML
/// document through `apply_xml_document`), or starts a brand new one
/// with `id` when the store doesn't exist yet.
async fn open_session(path: &Path, id: Option<u32>) -> Result<Session> {
    let cfg = engine_config()?;
    if path.exists() {
        let text = tokio::fs::read_to_string(path).await?;
        let doc = xml::import(&text).map_err(|e| Error::Xml(e.to_string()))?;
        let mut session = Session::new(SessionId(doc.id), cfg).await?;
        session.apply_xml_document(&doc)?;
        Ok(session)
    } else {
        let id = id.ok_or_else(|| Error::Validation("store does not exist yet; pass --id to create it".into()))?;
        Session::new(SessionId(id), cfg).await
    }
}

async fn save_session(path: &Path, session: &Session) -> Result<()> {
    let doc = session.to_xml_document();
    let text = xml::export(&doc).map_err(|e| Error::Xml(e.to_string()))?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

fn engine_config() -> Result<EngineConfig> {
    session_core::config::load(std::env::var("SESSION_CONFIG_FILE").ok().as_deref()).map_err(Error::Config)
}

// ---------------------------------------------------------------- session

#[derive(Args)]
pub struct SessionArgs {
    #[command(subcommand)]
    action: SessionAction,
}

#[derive(Subcommand)]
enum SessionAction {
    /// session.create: initializes a new, empty session store.
    Init {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        id: u32,
    },
    /// session.setState
    SetState {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_parser = parse_state)]
        state: SessionState,
    },
    /// session.setConfig
    SetConfig {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    /// session.addHook
    AddHook {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_parser = parse_state)]
        state: SessionState,
        /// Path to the hook script; its bytes are stored verbatim.
        #[arg(long)]
        script: PathBuf,
    },
}

pub async fn dispatch_session(args: SessionArgs) -> Result<()> {
    match args.action {
        SessionAction::Init { file, id } => {
            let session = Session::new(SessionId(id), engine_config()?).await?;
            save_session(&file, &session).await?;
            tracing::info!("initialized session {} at {}", id, file.display());
        }
        SessionAction::SetState { file, state } => {
            let mut session = open_session(&file, None).await?;
            session.set_state(state).await?;
            save_session(&file, &session).await?;
        }
        SessionAction::SetConfig { file, key, value } => {
            let mut session = open_session(&file, None).await?;
            session.set_config(key, value);
            save_session(&file, &session).await?;
        }
        SessionAction::AddHook { file, state, script } => {
            let mut session = open_session(&file, None).await?;
            let bytes = tokio::fs::read(&script).await?;
            session.add_hook(state, bytes);
            save_session(&file, &session).await?;
        }
    }
    Ok(())
}

// ------------------------------------------------------------------ node

#[derive(Args)]
pub struct NodeArgs {
    #[command(subcommand)]
    action: NodeAction,
}

#[derive(Subcommand)]
enum NodeAction {
    /// node.create
    Create {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, value_parser = parse_node_kind, default_value = "default")]
        kind: NodeKind,
        #[arg(long, default_value = "")]
        model: String,
        #[arg(long, default_value_t = 0.0)]
        x: f64,
        #[arg(long, default_value_t = 0.0)]
        y: f64,
        #[arg(long, default_value_t = 0.0)]
        z: f64,
        #[arg(long = "service")]
        services: Vec<String>,
    },
    /// node.edit
    Edit {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        id: u32,
        #[arg(long)]
        x: Option<f64>,
        #[arg(long)]
        y: Option<f64>,
        #[arg(long)]
        z: Option<f64>,
        #[arg(long = "service")]
        services: Vec<String>,
    },
    /// node.delete
    Delete {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        id: u32,
    },
    /// node.command: runs argv inside the node's namespace.
    Command {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        id: u32,
        #[arg(long)]
        wait: bool,
        argv: Vec<String>,
    },
    /// node.terminal: prints the shell-attach command for a terminal
    /// emulator to run; the engine itself never spawns one.
    Terminal {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        id: u32,
    },
}

pub async fn dispatch_node(args: NodeArgs) -> Result<()> {
    match args.action {
        NodeAction::Create {
            file,
            name,
            kind,
            model,
            x,
            y,
            z,
            services,
        } => {
            let mut session = open_session(&file, None).await?;
            let id = session.create_node(NodeSpec {
                id: 0,
                name,
                kind,
                model,
                position: Position { x, y, z },
                geo: None,
                services,
            })?;
            if session.state == SessionState::Runtime {
                session.realize_node(id).await?;
            }
            save_session(&file, &session).await?;
            println!("{}", id.0);
        }
        NodeAction::Edit { file, id, x, y, z, services } => {
            let mut session = open_session(&file, None).await?;
            let position = match (x, y, z) {
                (None, None, None) => None,
                (x, y, z) => {
                    let current = session
                        .nodes
                        .get(NodeId(id))
                        .ok_or_else(|| Error::NotFound(format!("node {id}")))?
                        .position;
                    Some(Position {
                        x: x.unwrap_or(current.x),
                        y: y.unwrap_or(current.y),
                        z: z.unwrap_or(current.z),
                    })
                }
            };
            let patch = NodePatch {
                position,
                services: if services.is_empty() { None } else { Some(services) },
            };
            session.edit_node(NodeId(id), patch)?;
            save_session(&file, &session).await?;
        }
        NodeAction::Delete { file, id } => {
            let mut session = open_session(&file, None).await?;
            session.delete_node(NodeId(id)).await?;
            save_session(&file, &session).await?;
        }
        NodeAction::Command { file, id, wait, argv } => {
            let session = open_session(&file, None).await?;
            let outcome = session.run_in_node(NodeId(id), argv, wait).await?;
            println!("{outcome:?}");
        }
        NodeAction::Terminal { file, id } => {
            let session = open_session(&file, None).await?;
            println!("{}", session.node_terminal(NodeId(id))?);
        }
    }
    Ok(())
}

// --------------------------------------------------------------- network

#[derive(Args)]
pub struct NetworkArgs {
    #[command(subcommand)]
    action: NetworkAction,
}

#[derive(Subcommand)]
enum NetworkAction {
    /// createNetwork
    Create {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_parser = parse_network_kind)]
        kind: NetworkKind,
    },
    /// iface.add / attachInterface
    IfaceAdd {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        node: u32,
        #[arg(long)]
        network: u32,
        #[arg(long)]
        v4: bool,
        #[arg(long)]
        v6: bool,
    },
    /// link.add
    LinkAdd(LinkArgs),
    /// link.update
    LinkUpdate(LinkArgs),
    /// link.delete
    LinkDelete {
        #[arg(long)]
        file: PathBuf,
        #[arg(long = "node-a")]
        node_a: u32,
        #[arg(long = "iface-a")]
        iface_a: u32,
        #[arg(long = "node-b")]
        node_b: u32,
        #[arg(long = "iface-b")]
        iface_b: u32,
    },
}

#[derive(Args)]
struct LinkArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long = "node-a")]
    node_a: u32,
    #[arg(long = "iface-a")]
    iface_a: u32,
    #[arg(long = "node-b")]
    node_b: u32,
    #[arg(long = "iface-b")]
    iface_b: u32,
    #[arg(long, default_value_t = 0)]
    bandwidth_bps: u64,
    #[arg(long, default_value_t = 0)]
    delay_us: u32,
    #[arg(long, default_value_t = 0)]
    jitter_us: u32,
    #[arg(long, default_value_t = 0)]
    loss_ppm: u32,
    #[arg(long, default_value_t = 0)]
    duplicate_ppm: u32,
    #[arg(long)]
    unidirectional: bool,
}

impl From<&LinkArgs> for Impairment {
    fn from(a: &LinkArgs) -> Self {
        Impairment {
            bandwidth_bps: a.bandwidth_bps,
            delay_us: a.delay_us,
            jitter_us: a.jitter_us,
            loss_ppm: a.loss_ppm,
            duplicate_ppm: a.duplicate_ppm,
            unidirectional: a.unidirectional,
        }
    }
}

fn endpoints(node_a: u32, iface_a: u32, node_b: u32, iface_b: u32) -> (Endpoint, Endpoint) {
    (
        Endpoint {
            node: NodeId(node_a),
            interface: InterfaceId(iface_a),
        },
        Endpoint {
            node: NodeId(node_b),
            interface: InterfaceId(iface_b),
        },
    )
}

pub async fn dispatch_network(args: NetworkArgs) -> Result<()> {
    match args.action {
        NetworkAction::Create { file, kind } => {
            let mut session = open_session(&file, None).await?;
            let id = session.create_network(kind).await?;
            save_session(&file, &session).await?;
            println!("{}", id.0);
        }
        NetworkAction::IfaceAdd { file, node, network, v4, v6 } => {
            let mut session = open_session(&file, None).await?;
            let id = session
                .attach_interface(NodeId(node), NetworkId(network), v4, v6)
                .await?;
            save_session(&file, &session).await?;
            println!("{}", id.0);
        }
        NetworkAction::LinkAdd(a) => {
            let mut session = open_session(&a.file, None).await?;
            let (ep_a, ep_b) = endpoints(a.node_a, a.iface_a, a.node_b, a.iface_b);
            let impairment = Impairment::from(&a);
            session.link_add(ep_a, ep_b, impairment).await?;
            save_session(&a.file, &session).await?;
        }
        NetworkAction::LinkUpdate(a) => {
            let mut session = open_session(&a.file, None).await?;
            let (ep_a, ep_b) = endpoints(a.node_a, a.iface_a, a.node_b, a.iface_b);
            let impairment = Impairment::from(&a);
            session.link_update(ep_a, ep_b, impairment).await?;
            save_session(&a.file, &session).await?;
        }
        NetworkAction::LinkDelete {
            file,
            node_a,
            iface_a,
            node_b,
            iface_b,
        } => {
            let mut session = open_session(&file, None).await?;
            let (ep_a, ep_b) = endpoints(node_a, iface_a, node_b, iface_b);
            session.link_delete(ep_a, ep_b).await?;
            save_session(&file, &session).await?;
        }
    }
    Ok(())
}

// -------------------------------------------------------------- wireless

#[derive(Args)]
pub struct WirelessArgs {
    #[command(subcommand)]
    action: WirelessAction,
}

#[derive(Subcommand)]
enum WirelessAction {
    /// wireless.linkState
    LinkState {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        network: u32,
        #[arg(long = "node-a")]
        node_a: u32,
        #[arg(long = "node-b")]
        node_b: u32,
        #[arg(long)]
        up: bool,
    },
}

pub async fn dispatch_wireless(args: WirelessArgs) -> Result<()> {
    let WirelessAction::LinkState { file, network, node_a, node_b, up } = args.action;
    let mut session = open_session(&file, None).await?;
    session
        .wireless_link_state(NetworkId(network), NodeId(node_a), NodeId(node_b), up)
        .await?;
    save_session(&file, &session).await?;
    Ok(())
}

// -------------------------------------------------------------- mobility

#[derive(Args)]
pub struct MobilityArgs {
    #[command(subcommand)]
    action: MobilityAction,
}

#[derive(Subcommand)]
enum MobilityAction {
    /// mobility.loadScript
    LoadScript {
        #[arg(long)]
        file: PathBuf,
        /// Waypoint script path (spec §4.6 line format).
        #[arg(long)]
        script: PathBuf,
    },
    /// mobility.control
    Control {
        #[arg(long)]
        file: PathBuf,
        #[arg(value_enum)]
        signal: MobilitySignal,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum MobilitySignal {
    Start,
    Stop,
    Pause,
}

impl From<MobilitySignal> for MobilityControl {
    fn from(s: MobilitySignal) -> Self {
        match s {
            MobilitySignal::Start => MobilityControl::Start,
            MobilitySignal::Stop => MobilityControl::Stop,
            MobilitySignal::Pause => MobilityControl::Pause,
        }
    }
}

pub async fn dispatch_mobility(args: MobilityArgs) -> Result<()> {
    match args.action {
        MobilityAction::LoadScript { file, script } => {
            let mut session = open_session(&file, None).await?;
            let text = tokio::fs::read_to_string(&script).await?;
            let per_node = parse_script(&text);
            for (node, script) in per_node {
                session.load_mobility_script(node, script).await?;
            }
            save_session(&file, &session).await?;
        }
        MobilityAction::Control { file, signal } => {
            let mut session = open_session(&file, None).await?;
            session.mobility_control(signal.into()).await?;
            save_session(&file, &session).await?;
        }
    }
    Ok(())
}

// ------------------------------------------------------------------- xml

#[derive(Args)]
pub struct XmlArgs {
    #[command(subcommand)]
    action: XmlAction,
}

#[derive(Subcommand)]
enum XmlAction {
    /// xml.export: writes the canonical round-tripped document to `--out`.
    Export {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// xml.import: seeds a session store from an externally authored
    /// document, including the `state` attribute it was exported with
    /// (spec §8 scenario 6).
    Import {
        #[arg(long)]
        from: PathBuf,
        #[arg(long)]
        file: PathBuf,
    },
}

pub async fn dispatch_xml(args: XmlArgs) -> Result<()> {
    match args.action {
        XmlAction::Export { file, out } => {
            let session = open_session(&file, None).await?;
            let doc = session.to_xml_document();
            let text = xml::export(&doc).map_err(|e| Error::Xml(e.to_string()))?;
            tokio::fs::write(&out, text).await?;
        }
        XmlAction::Import { from, file } => {
            let text = tokio::fs::read_to_string(&from).await?;
            let doc = xml::import(&text).map_err(|e| Error::Xml(e.to_string()))?;
            let mut session = Session::new(SessionId(doc.id), engine_config()?).await?;
            session.apply_xml_document(&doc)?;
            save_session(&file, &session).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parser_accepts_every_variant_case_insensitively() {
        for s in ["Definition", "configuration", "INSTANTIATION", "runtime", "DataCollect", "shutdown"] {
            assert!(parse_state(s).is_ok(), "expected '{s}' to parse");
        }
        assert!(parse_state("bogus").is_err());
    }

    #[test]
    fn node_kind_parser_accepts_hyphenated_and_aliases() {
        assert!(matches!(parse_node_kind("point-to-point"), Ok(NodeKind::PointToPoint)));
        assert!(matches!(parse_node_kind("p2p"), Ok(NodeKind::PointToPoint)));
        assert!(parse_node_kind("nonsense").is_err());
    }

    #[test]
    fn network_kind_parser_accepts_every_variant() {
        for s in ["point-to-point", "switch", "hub", "wlan"] {
            assert!(parse_network_kind(s).is_ok(), "expected '{s}' to parse");
        }
    }

    #[test]
    fn endpoints_preserve_node_and_interface_ids() {
        let (a, b) = endpoints(1, 2, 3, 4);
        assert_eq!(a.node.0, 1);
        assert_eq!(a.interface.0, 2);
        assert_eq!(b.node.0, 3);
        assert_eq!(b.interface.0, 4);
    }
}
