mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;

use commands::{MobilityArgs, NetworkArgs, NodeArgs, SessionArgs, WirelessArgs, XmlArgs};

/// Driver for the session engine: every subcommand opens the session
/// store named by `--file`, applies one operation from spec §6, and
/// writes the updated document back (creating it with `session init`).
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// session.create / setState / setConfig / addHook
    Session(SessionArgs),
    /// node.create / node.edit / node.delete / node.command / node.terminal
    Node(NodeArgs),
    /// createNetwork / iface.add / link.add / link.update / link.delete
    Network(NetworkArgs),
    /// wireless.linkState
    Wireless(WirelessArgs),
    /// mobility.loadScript / mobility.control
    Mobility(MobilityArgs),
    /// xml.export / xml.import
    Xml(XmlArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let result = match cli.command {
        Commands::Session(args) => commands::dispatch_session(args).await,
        Commands::Node(args) => commands::dispatch_node(args).await,
        Commands::Network(args) => commands::dispatch_network(args).await,
        Commands::Wireless(args) => commands::dispatch_wireless(args).await,
        Commands::Mobility(args) => commands::dispatch_mobility(args).await,
        Commands::Xml(args) => commands::dispatch_xml(args).await,
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(e.exit_code());
    }
}
