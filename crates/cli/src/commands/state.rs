//! The `state` command - requests a VM state change from the hypervisor.

use clap::Args;
use std::path::PathBuf;
use vmbroker::{CommandControl, HypervisorControl, VmState};

fn parse_state(s: &str) -> Result<VmState, String> {
    match s {
        "start" => Ok(VmState::Start),
        "stop" => Ok(VmState::Stop),
        "reset" => Ok(VmState::Reset),
        other => Err(format!(
            "invalid state '{other}', expected 'start', 'stop' or 'reset'"
        )),
    }
}

#[derive(Args)]
pub struct StateArgs {
    /// Path to the broker configuration file
    #[arg(long, short)]
    config: PathBuf,

    /// VM name or id
    vm: String,

    /// Target state (start, stop or reset)
    #[arg(value_parser = parse_state)]
    state: VmState,
}

pub async fn run(args: StateArgs) -> anyhow::Result<()> {
    let (config, fleet) = super::load_fleet(&args.config)?;
    let vm = super::find_vm(&fleet, &args.vm)?;

    let control = CommandControl::new(&config.hypervisor);
    tracing::debug!(vm = %vm.name, state = %args.state, hypervisor = control.name(), "requesting state change");
    control.request_state_change(vm.id, args.state).await?;

    println!("{vm}: {} requested", args.state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_states() {
        assert_eq!(parse_state("start"), Ok(VmState::Start));
        assert_eq!(parse_state("stop"), Ok(VmState::Stop));
        assert_eq!(parse_state("reset"), Ok(VmState::Reset));
    }

    #[test]
    fn rejects_unknown_state() {
        assert!(parse_state("Reset").is_err());
        assert!(parse_state("pause").is_err());
    }
}
