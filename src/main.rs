use anyhow::Context;
use clap::Parser;
use fairway::config::Config;
use fairway::server;
use std::path::PathBuf;

/// Caching, rate-limiting reverse proxy for golf data feeds
#[derive(Debug, Parser)]
#[command(name = "fairway", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "FAIRWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overriding the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Development mode: relaxed key requirements, error detail blocks
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if args.dev {
        config.server.dev_mode = true;
    }

    // A missing master key or upstream key outside dev mode is fatal
    config.validate().context("validating configuration")?;

    server::run(config).await
}
