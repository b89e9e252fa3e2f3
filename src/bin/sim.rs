//! DCP 3000 device simulator
//!
//! Serves the simulated controller over TCP so drivers can be exercised
//! without hardware:
//!
//! ```text
//! dcp3000-sim --bind 127.0.0.1:10001
//! ```
//!
//! Canned replies can be overridden from a TOML file:
//!
//! ```toml
//! remote = true
//!
//! [replies]
//! IN_VER = "DCP 3000  V2.41"
//! IN_PV_S1 = "0042 mbar"
//! ```

use anyhow::Context;
use clap::Parser;
use dcp3000::{Simulator, SimulatorConfig, SimulatorServer};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// DCP 3000 device simulator
#[derive(Parser, Debug)]
#[command(name = "dcp3000-sim", version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:10001", env = "DCP3000_SIM_BIND")]
    bind: String,

    /// TOML file overriding canned replies and initial state
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output (log every request and reply)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "dcp3000=debug" } else { "dcp3000=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            toml::from_str::<SimulatorConfig>(&text)
                .with_context(|| format!("invalid config in {}", path.display()))?
        }
        None => SimulatorConfig::default(),
    };

    let server = SimulatorServer::bind(&args.bind, Simulator::with_config(config))
        .await
        .with_context(|| format!("cannot bind {}", args.bind))?;

    server.run().await?;
    Ok(())
}
