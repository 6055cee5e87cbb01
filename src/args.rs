use callbridge::config;
use callbridge::registry::RelayPolicy;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "callbridge")]
#[command(author = "Callbridge Team")]
#[command(version = "0.1.0")]
#[command(about = "Two-party WebRTC call signaling relay", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/callbridge.toml")]
    pub config: PathBuf,

    /// Listen address
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP/signaling port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory with the built web client
    #[arg(long)]
    pub web_root: Option<PathBuf>,

    /// Signal routing: paired or broadcast
    #[arg(long)]
    pub relay_policy: Option<RelayPolicy>,

    /// Maximum concurrent participants
    #[arg(long)]
    pub max_participants: Option<usize>,

    /// Comma-separated origins allowed to open the signaling socket
    #[arg(long)]
    pub allowed_origins: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
