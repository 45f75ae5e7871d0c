use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod agent_cmd;
mod config;
mod server_cmd;

use config::CommonArgs;

#[derive(Parser)]
#[command(name = "nms", version, about = "NMS agent/server")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    debug: bool,

    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a server, authenticate and report metrics
    Agent {
        /// Identity sent in task frames (overrides the config file)
        #[arg(long)]
        agent_id: Option<u32>,

        /// Seconds between metrics reports
        #[arg(long, default_value_t = 10)]
        report_secs: u64,
    },

    /// Accept agents: TCP greeting on --port, UDP handshake on --port + 1
    Server,

    /// Print the effective configuration and exit
    Config,
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut cfg = config::load(&cli.common)?;
    cfg.debug_banner();

    match cli.command {
        Commands::Agent {
            agent_id,
            report_secs,
        } => {
            if let Some(id) = agent_id {
                cfg.agent_id = id;
            }
            agent_cmd::run(cfg, Duration::from_secs(report_secs.max(1))).await
        }
        Commands::Server => server_cmd::run(cfg).await,
        Commands::Config => {
            println!("config file: {}", config::config_path(&cli.common).display());
            println!("{cfg:#?}");
            Ok(())
        }
    }
}
