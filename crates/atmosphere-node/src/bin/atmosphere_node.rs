use std::net::SocketAddr;
use std::path::PathBuf;

use atmosphere_node::{InviteToken, Node, NodeConfig, NodeError};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "atmosphere-node", about = "Atmosphere mesh node daemon", rename_all = "kebab-case")]
struct Opts {
    /// Directory holding identity.json, mesh.json and the replicated store.
    /// Falls back to $ATMOSPHERE_DATA_DIR, then ./data.
    #[structopt(long, global = true, env = "ATMOSPHERE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Application id embedded in invites minted by this node.
    #[structopt(long, global = true, default_value = "atmosphere.default")]
    app_id: String,

    /// Output logs as JSON objects (one per line).
    #[structopt(long, global = true)]
    log_json: bool,

    /// Disable ANSI color sequences in log output.
    #[structopt(long, global = true)]
    log_no_color: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Start the node and block until interrupted.
    Start {
        #[structopt(long, default_value = "0")]
        listen: u16,
        #[structopt(long)]
        relay: Option<SocketAddr>,
        #[structopt(long)]
        no_lan: bool,
    },
    /// Print this node's identity, mesh and health as JSON, then exit.
    Status,
    /// List currently connected peers as JSON, then exit.
    Peers,
    /// Mint an invite for this node's mesh and print it to stdout.
    Invite {
        #[structopt(long)]
        wide_area_url: Option<String>,
    },
    /// Apply an invite token, switching this node's mesh membership.
    Join { token: String },
}

fn init_logging(json: bool, no_color: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("ATMOSPHERE_LOG_LEVEL").unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(!no_color);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run() -> Result<(), NodeError> {
    let opts = Opts::from_args();
    init_logging(opts.log_json, opts.log_no_color);

    let mut config = NodeConfig::from_env(opts.app_id.clone()).map_err(|err| NodeError::Internal(anyhow::anyhow!(err)))?;
    if let Some(dir) = opts.data_dir {
        config.data_dir = dir;
    }
    config.log_json = opts.log_json;
    config.log_no_color = opts.log_no_color;

    match opts.command {
        Command::Start { listen, relay, no_lan } => {
            config.listen_port = listen;
            config.relay_addr = relay.or(config.relay_addr);
            config.enable_lan = !no_lan;

            let node = Node::create(&config)?;
            let rt = tokio::runtime::Runtime::new().map_err(|err| NodeError::Internal(err.into()))?;
            rt.block_on(async {
                node.start().await?;
                tracing::info!(peer_id = %node.peer_id(), mesh_id = %node.mesh_id(), "atmosphere-node started");
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("shutdown signal received");
                node.stop().await
            })
        }
        Command::Status => {
            let node = Node::create(&config)?;
            let health = node.health();
            println!("{}", serde_json::to_string_pretty(&health).unwrap_or_default());
            Ok(())
        }
        Command::Peers => {
            let node = Node::create(&config)?;
            let peers = node.connected_peers();
            println!("{}", serde_json::to_string_pretty(&peers).unwrap_or_default());
            Ok(())
        }
        Command::Invite { wide_area_url } => {
            let node = Node::create(&config)?;
            let invite = node.generate_invite(wide_area_url);
            println!("{}", invite.to_base64());
            Ok(())
        }
        Command::Join { token } => {
            let invite = InviteToken::from_base64(&token)?;
            let node = Node::join(&config, &invite)?;
            println!("joined mesh {} as peer {}", node.mesh_id(), node.peer_id());
            Ok(())
        }
    }
}

fn main() {
    match run() {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("atmosphere-node: {err}");
            std::process::exit(err.exit_code());
        }
    }
}
