use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use bookie::config::{Config, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "bookie")]
#[command(about = "Ledger storage node", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the storage node and its admin API
    Server(ServerArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(clap::Args, Debug)]
pub struct ConfigArgs {
    /// Configuration file (defaults to $BOOKIE_CONFIG or config/bookie.toml)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<Config, ConfigError> {
        match &self.config {
            Some(path) => {
                let _ = dotenvy::dotenv();
                Config::load_from_path(path.clone())
            }
            None => Config::load(),
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Start without accepting writes
    #[arg(long)]
    pub readonly: bool,

    /// Address to bind the admin API to (overrides server.admin_addr)
    #[arg(long)]
    pub admin_addr: Option<SocketAddr>,
}

impl ServerArgs {
    /// Configuration with command-line overrides applied.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut config = self.config.load()?;
        if self.readonly {
            config.server.readonly = true;
        }
        if let Some(address) = self.admin_addr {
            config.server.admin_addr = address;
        }
        Ok(config)
    }
}
