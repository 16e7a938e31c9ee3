//! The `health` command - probes fleet VMs the way the recycler does.

use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use vmbroker::{HealthGate, HttpHealthCheck};

#[derive(Args)]
pub struct HealthArgs {
    /// Path to the broker configuration file
    #[arg(long, short)]
    config: PathBuf,

    /// Only probe this VM (name or id)
    vm: Option<String>,
}

pub async fn run(args: HealthArgs) -> anyhow::Result<()> {
    let (config, fleet) = super::load_fleet(&args.config)?;
    let targets = match &args.vm {
        Some(selector) => vec![super::find_vm(&fleet, selector)?.clone()],
        None => fleet,
    };

    let check = HttpHealthCheck::new(config.application_port, config.health_endpoint.clone())?;
    let gate = HealthGate::new(Arc::new(check), &config.health);

    let mut unhealthy = 0;
    for vm in &targets {
        match gate.wait_healthy(vm).await {
            Ok(()) => println!("{vm}: healthy"),
            Err(e) => {
                unhealthy += 1;
                println!("{vm}: {e}");
            }
        }
    }

    if unhealthy > 0 {
        anyhow::bail!("{unhealthy} of {} virtual machines are unhealthy", targets.len());
    }
    Ok(())
}
