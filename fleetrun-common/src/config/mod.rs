//! Configuration for fleetrun.
//!
//! Everything comes from the process environment. The fleet topology has no
//! defaults; operational knobs (agent binary name, ssh connect timeout) do.

pub mod env;

pub use env::{EnvError, EnvParser};

use crate::errors::ConfigError;
use crate::exec::ExecConfig;
use crate::topology::FleetTopology;
use crate::transport::SshOptions;
use std::time::Duration;

/// Default agent binary name on remote hosts.
pub const DEFAULT_AGENT_BIN: &str = "renet";

/// Default ssh `ConnectTimeout` in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Fully validated process configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub topology: FleetTopology,
    pub default_timeout: Duration,
    pub agent_bin: String,
    pub connect_timeout_secs: u64,
}

impl FleetConfig {
    /// Load from `VM_*`, `BRIDGE_TIMEOUT` and `FLEETRUN_*` variables.
    ///
    /// Every missing or malformed variable is reported in one
    /// [`ConfigError::Env`]; topology validation runs only once all
    /// variables parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut vm = EnvParser::with_prefix("VM_");
        let prefix = vm.require_string("NET_BASE");
        let offset = vm.require_u32("NET_OFFSET");
        let relay = vm.require_u32("BRIDGE");
        let workers = vm.require_id_list("WORKERS");
        let storage = vm.optional_id_list("CEPH_NODES");

        let mut bridge = EnvParser::with_prefix("BRIDGE_");
        let timeout_ms = bridge.require_u64_range("TIMEOUT", 1, 24 * 60 * 60 * 1000);

        let mut own = EnvParser::with_prefix("FLEETRUN_");
        let agent_bin = own.get_string("AGENT_BIN", DEFAULT_AGENT_BIN);
        let connect_timeout_secs =
            own.get_u64_range("CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT_SECS, 1, 300);

        let mut errors = vm.take_errors();
        errors.extend(bridge.take_errors());
        errors.extend(own.take_errors());

        match (prefix, offset, relay, workers, timeout_ms) {
            (Some(prefix), Some(offset), Some(relay), Some(workers), Some(timeout_ms))
                if errors.is_empty() =>
            {
                let topology = FleetTopology::new(prefix, offset, relay, workers, storage)?;
                Ok(Self {
                    topology,
                    default_timeout: Duration::from_millis(timeout_ms),
                    agent_bin,
                    connect_timeout_secs,
                })
            }
            _ => Err(ConfigError::Env(errors)),
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }

    /// Executor settings derived from this configuration.
    pub fn exec_config(&self) -> ExecConfig {
        ExecConfig {
            default_timeout: self.default_timeout,
            ssh: self.ssh_options(),
            agent_bin: self.agent_bin.clone(),
            max_parallel: crate::exec::DEFAULT_MAX_PARALLEL,
        }
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
