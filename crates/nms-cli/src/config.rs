use anyhow::{Context, Result};
use clap::Args;
use nms_net::NetConfig;
use std::path::PathBuf;

/// Flags shared by every subcommand. Anything set here wins over the file.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Config file (default: $NMS_HOME/config.toml or ~/.nms/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// TCP port; UDP listens on port + 1
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// 32-byte frame signature key as hex
    #[arg(long, global = true)]
    pub network_key: Option<String>,
}

pub fn config_path(args: &CommonArgs) -> PathBuf {
    args.config.clone().unwrap_or_else(NetConfig::default_path)
}

/// File (or defaults) with command-line overrides applied.
pub fn load(args: &CommonArgs) -> Result<NetConfig> {
    let path = config_path(args);
    let mut cfg = NetConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    if let Some(h) = &args.host {
        cfg.host = h.clone();
    }
    if let Some(p) = args.port {
        cfg.port = p;
    }
    if let Some(k) = &args.network_key {
        cfg.network_key_hex = Some(k.clone());
    }

    // Fail early on values that only get parsed later.
    cfg.signer().context("network key")?;
    cfg.udp_target().context("server address")?;
    Ok(cfg)
}
