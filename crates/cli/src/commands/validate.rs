//! The `validate` command - checks a configuration file and prints the fleet.

use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the broker configuration file
    #[arg(long, short)]
    config: PathBuf,
}

pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let (config, fleet) = super::load_fleet(&args.config)?;

    println!("{}: OK", args.config.display());
    println!();
    println!("Virtual machines ({}):", fleet.len());
    for vm in &fleet {
        println!("  {} ({})", vm.name, vm.id);
        println!("    Address: {}", vm.socket_addr(config.application_port));
        println!("    Pipe: {}", vm.pipe_name);
    }
    println!();

    let recycle = &config.recycle;
    println!("Health endpoint: {}", config.health_endpoint);
    println!(
        "Recycle workers: {} initial, {} max (scale when backlog > {} every {:?})",
        recycle.initial_workers,
        recycle.max_workers,
        recycle.queue_depth_threshold,
        recycle.scale_interval
    );
    println!("Recycle channel capacity: {}", recycle.channel_capacity);
    println!(
        "Health gate: {} attempts, {:?} per attempt",
        config.health.attempts, config.health.attempt_timeout
    );
    println!(
        "Sticky paths: expire after {:?} idle, {:?} grace",
        config.sticky.idle_expiry, config.sticky.grace_period
    );

    Ok(())
}
