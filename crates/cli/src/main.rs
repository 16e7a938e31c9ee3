mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vmbroker")]
#[command(about = "Operator tools for the vmbroker VM lease broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a broker configuration file and list its fleet
    Validate(commands::validate::ValidateArgs),

    /// Probe the health endpoint of fleet VMs
    Health(commands::health::HealthArgs),

    /// Ask the hypervisor to start, stop or reset a VM
    State(commands::state::StateArgs),

    /// Show version information
    Version(commands::version::VersionArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate(args) => commands::validate::run(args)?,
        Commands::Health(args) => commands::health::run(args).await?,
        Commands::State(args) => commands::state::run(args).await?,
        Commands::Version(args) => commands::version::run(args),
    }

    Ok(())
}
