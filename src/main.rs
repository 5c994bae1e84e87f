use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use farmhand::client::NodeClient;
use farmhand::config::Config;
use farmhand::node::{MacAddress, Node, NodeChange};
use farmhand::protocol::{Compression, RenderSettings};
use farmhand::transport::TcpConnector;

#[derive(Parser, Debug)]
#[command(name = "farmhand", about = "Drive a render node from the command line")]
struct Cli {
    /// Node address as host:port
    #[arg(long, short = 'a')]
    address: String,

    /// Display name for the node
    #[arg(long, default_value = "node")]
    name: String,

    /// Password, if the node requires authentication
    #[arg(long, short = 'p')]
    pass: Option<String>,

    /// MAC address for a wake-on-LAN packet before connecting
    #[arg(long)]
    mac: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, print node facts, and disconnect
    Info,
    /// Install a Blender version on the node
    Prepare {
        #[arg(long)]
        version: String,
    },
    /// Upload a scene file into a session
    Sync {
        #[arg(long)]
        session: String,
        #[arg(long)]
        file_id: i64,
        path: PathBuf,
    },
    /// Render one frame of a previously synced session
    Render {
        #[arg(long)]
        session: String,
        #[arg(long, default_value_t = 1)]
        frame: i64,
        #[arg(long, default_value_t = 1920)]
        width: u32,
        #[arg(long, default_value_t = 1080)]
        height: u32,
        /// Write the returned frame here
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Inspect the scene without rendering
    Peek {
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let mut node = Node::new(cli.name.clone(), cli.address.clone());
    if let Some(pass) = cli.pass.clone() {
        node = node.with_pass(pass);
    }
    if let Some(mac) = cli.mac.as_deref() {
        let mac: MacAddress = mac.parse().context("invalid --mac")?;
        node = node.with_mac(mac);
    }

    let connector = Arc::new(TcpConnector {
        address: cli.address.clone(),
        timeout: config.connect_timeout,
    });
    let client = NodeClient::new(node, connector, config);

    // Mirror activity changes to the terminal while commands run.
    let mut changes = client.node().subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            if let NodeChange::Activity(activity) = change {
                if !activity.is_empty() {
                    tracing::info!(target = "farmhand", %activity, "node");
                }
            }
        }
    });

    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", cli.address))?;

    let outcome = run_command(&client, cli.command).await;
    client.disconnect().await;
    outcome
}

async fn run_command(client: &NodeClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Info => {
            let node = client.node();
            println!("name:     {}", node.computer_name());
            println!("os:       {}", node.os());
            println!("cores:    {}", node.cores());
            println!("busy:     {}", client.is_busy().await?);
        }
        Command::Prepare { version } => {
            client.prepare(&version).await?;
            println!("prepared {version}");
        }
        Command::Sync {
            session,
            file_id,
            path,
        } => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            let total = file.metadata().await?.len();
            client
                .node()
                .select_session(session.clone());
            client
                .sync_file(
                    &session,
                    file_id,
                    file,
                    total,
                    Compression::None,
                    &CancellationToken::new(),
                )
                .await?;
            println!("synced {} as file {file_id}", path.display());
        }
        Command::Render {
            session,
            frame,
            width,
            height,
            output,
        } => {
            let settings = RenderSettings {
                frame,
                cores: client.node().cores(),
                device: client.node().render_type(),
                width,
                height,
                samples: None,
                crop: None,
            };
            let task_id = uuid::Uuid::new_v4().to_string();
            let rendered = client.render(&session, &task_id, settings).await?;
            match (rendered.frame, output) {
                (Some(bytes), Some(path)) => {
                    tokio::fs::write(&path, &bytes).await?;
                    println!("rendered frame {frame} -> {}", path.display());
                }
                (Some(bytes), None) => {
                    println!("rendered frame {frame} ({} bytes, no --output given)", bytes.len());
                }
                (None, _) => println!("render finished: {}", rendered.message),
            }
        }
        Command::Peek { session } => {
            let info = client.peek(&session).await?;
            println!(
                "resolution: {}x{}  frames: {}..{}",
                info.resolution_x, info.resolution_y, info.frame_start, info.frame_end
            );
            for camera in info.cameras {
                println!("camera: {camera}");
            }
        }
    }
    Ok(())
}
