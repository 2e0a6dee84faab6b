mod simulate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use simulate::Simulate;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tributary-cli")]
#[command(about = "A command-line tool to explore Tributary partition load balancing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Simulate processor instances balancing partitions over a shared store")]
    Simulate(Simulate),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(simulate) => simulate::handle_simulate(simulate).await?,
    }

    Ok(())
}
