mod cli;
mod server;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    bookie::observability::init_tracing("info");

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => server::run(args.load()?).await?,
        Commands::Config(args) => print!("{}", args.load()?.to_toml()?),
    }

    Ok(())
}
