use clap::Parser;
use std::path::PathBuf;

use proxy_core::NatType;

#[derive(Parser, Debug)]
#[command(name = "flurry", version, about = "Volunteer circumvention proxy")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "flurry.yaml")]
    pub config: PathBuf,

    /// Broker URL (overrides config file setting)
    #[arg(long)]
    pub broker: Option<String>,

    /// Default relay URL (overrides config file setting)
    #[arg(long)]
    pub relay: Option<String>,

    /// Outbound rate limit in bytes per second (overrides config file setting)
    #[arg(long)]
    pub rate_limit: Option<u64>,

    /// NAT classification established by an external probe
    #[arg(long)]
    pub nat: Option<NatType>,

    /// Append activity events to this JSON-lines file
    #[arg(long)]
    pub event_log: Option<PathBuf>,
}
