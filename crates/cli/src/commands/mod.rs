//! Subcommands of the `vmbroker` binary.

pub mod health;
pub mod state;
pub mod validate;
pub mod version;

use anyhow::Context;
use std::path::Path;
use vmbroker::{BrokerConfig, VmDescriptor};

/// Loads and validates `path`, returning the config and its fleet.
pub fn load_fleet(path: &Path) -> anyhow::Result<(BrokerConfig, Vec<VmDescriptor>)> {
    let config = BrokerConfig::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let fleet = config
        .validate()
        .map_err(vmbroker::Error::from)
        .with_context(|| format!("{} is not a valid broker configuration", path.display()))?;
    Ok((config, fleet))
}

/// Finds a fleet VM by name or id.
pub fn find_vm<'a>(fleet: &'a [VmDescriptor], selector: &str) -> anyhow::Result<&'a VmDescriptor> {
    fleet
        .iter()
        .find(|vm| vm.name == selector || vm.id.to_string().eq_ignore_ascii_case(selector))
        .ok_or_else(|| anyhow::anyhow!("no virtual machine named or with id '{selector}' in the fleet"))
}
