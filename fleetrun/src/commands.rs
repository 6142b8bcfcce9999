//! Subcommand handlers.

use anyhow::{Context, Result, bail};
use fleetrun_common::{
    FleetConfig, FleetOrchestrator, FleetTopology, HostRole, OrchestratorSettings, ShellRunner,
};
use serde::Serialize;
use std::borrow::Cow;
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;

/// Where `exec` runs its command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecTarget {
    /// On the relay host itself.
    Relay,
    /// Single hop to this host.
    Direct(String),
    /// Through the relay to this host.
    Relayed(String),
}

#[derive(Debug, Serialize)]
struct HostView {
    role: HostRole,
    id: u32,
    address: String,
}

#[derive(Debug, Serialize)]
struct TopologyView<'a> {
    prefix: &'a str,
    offset: u32,
    hosts: Vec<HostView>,
}

fn hosts(topology: &FleetTopology, include_storage: bool) -> Vec<HostView> {
    let mut roles = vec![HostRole::Relay, HostRole::Worker];
    if include_storage {
        roles.push(HostRole::StorageNode);
    }
    roles
        .into_iter()
        .flat_map(|role| {
            topology.ids_for(role).into_iter().map(move |id| HostView {
                role,
                id,
                address: topology.address(id),
            })
        })
        .collect()
}

fn orchestrator(config: &FleetConfig, settings: OrchestratorSettings) -> FleetOrchestrator {
    FleetOrchestrator::from_config(config, ShellRunner::new(), settings)
}

/// Shell line for `exec` arguments. One argument is taken verbatim so
/// pipes and redirects still work; several are each quoted.
pub fn command_line(args: &[String]) -> String {
    match args {
        [single] => single.clone(),
        _ => args
            .iter()
            .map(|arg| shell_escape::unix::escape(Cow::Borrowed(arg.as_str())))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Remote exit codes outside 0..=255 map to 1.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

pub fn topology(config: &FleetConfig, json: bool) -> Result<ExitCode> {
    let topology = &config.topology;
    let view = TopologyView {
        prefix: topology.prefix(),
        offset: topology.offset(),
        hosts: hosts(topology, true),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!("Fleet {}.x (offset {})", view.prefix, view.offset);
        for host in &view.hosts {
            println!("  {:<14} {:>4}  {}", host.role.to_string(), host.id, host.address);
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn status(config: &FleetConfig, json: bool, include_storage: bool) -> Result<ExitCode> {
    let o = orchestrator(
        config,
        OrchestratorSettings {
            include_storage,
            ..OrchestratorSettings::default()
        },
    );
    let statuses = o.status().await;
    let all_ready = statuses.values().all(|s| s.is_ready());

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        for host in hosts(o.topology(), include_storage) {
            let Some(status) = statuses.get(&host.address) else {
                continue;
            };
            let state = match status.first_failure() {
                None => "ready".to_string(),
                Some(check) => check.to_string(),
            };
            println!(
                "{:<15} {:<14} {:<20} {}",
                host.address,
                host.role.to_string(),
                state,
                status.agent_version.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(if all_ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub async fn verify(config: &FleetConfig, include_storage: bool) -> Result<ExitCode> {
    let o = orchestrator(
        config,
        OrchestratorSettings {
            include_storage,
            ..OrchestratorSettings::default()
        },
    );
    let addresses = o.fleet_addresses();
    o.poller()
        .verify_fleet_ready(&addresses)
        .await
        .context("Fleet verification failed")?;
    println!("All {} hosts ready", addresses.len());
    Ok(ExitCode::SUCCESS)
}

pub async fn wait(
    config: &FleetConfig,
    timeout_secs: u64,
    interval_secs: u64,
    include_storage: bool,
) -> Result<ExitCode> {
    let o = orchestrator(
        config,
        OrchestratorSettings {
            wait_deadline: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_secs(interval_secs.max(1)),
            include_storage,
            ..OrchestratorSettings::default()
        },
    );
    if o.wait_for_fleet().await {
        println!("All {} hosts reachable", o.fleet_addresses().len());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Not every host became reachable within {timeout_secs}s");
        Ok(ExitCode::FAILURE)
    }
}

fn resolve(topology: &FleetTopology, name: &str) -> Result<String> {
    match topology.resolve(name) {
        Some(address) => Ok(address),
        None => bail!("Unknown host '{name}' (use an address, bridge, workerN or cephN)"),
    }
}

pub async fn exec(
    config: &FleetConfig,
    target: ExecTarget,
    timeout_ms: Option<u64>,
    command: &str,
) -> Result<ExitCode> {
    let o = orchestrator(config, OrchestratorSettings::default());
    let executor = o.executor();
    let timeout = timeout_ms.map(Duration::from_millis);
    debug!(?target, "Dispatching command");

    let result = match target {
        ExecTarget::Relay => executor.execute_on_relay(command, timeout).await?,
        ExecTarget::Direct(name) => {
            let address = resolve(o.topology(), &name)?;
            executor.execute(&address, command, timeout).await?
        }
        ExecTarget::Relayed(name) => {
            let address = resolve(o.topology(), &name)?;
            executor
                .with_target(address)
                .execute_via_relay(command, timeout)
                .await?
        }
    };

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    Ok(ExitCode::from(exit_status(result.exit_code)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> FleetTopology {
        FleetTopology::new("192.168.111", 0, 1, vec![11, 12], vec![21]).unwrap()
    }

    #[test]
    fn test_hosts_lists_roles_in_order() {
        let views = hosts(&topology(), false);
        let addresses: Vec<_> = views.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(
            addresses,
            ["192.168.111.1", "192.168.111.11", "192.168.111.12"]
        );
        assert_eq!(hosts(&topology(), true).len(), 4);
    }

    #[test]
    fn test_resolve_names() {
        let t = topology();
        assert_eq!(resolve(&t, "worker2").unwrap(), "192.168.111.12");
        assert_eq!(resolve(&t, "bridge").unwrap(), "192.168.111.1");
        assert_eq!(resolve(&t, "10.1.2.3").unwrap(), "10.1.2.3");
        assert!(resolve(&t, "worker9").is_err());
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_line_quotes_each_argument() {
        assert_eq!(command_line(&args(&["echo", "a  b"])), "echo 'a  b'");
        assert_eq!(command_line(&args(&["ls", "-la", "/mnt"])), "ls -la /mnt");
        assert_eq!(command_line(&args(&["echo", "it's"])), r"echo 'it'\''s'");
    }

    #[test]
    fn test_command_line_single_argument_is_verbatim() {
        assert_eq!(
            command_line(&args(&["df -h | grep /mnt"])),
            "df -h | grep /mnt"
        );
    }

    #[test]
    fn test_exit_status_clamps() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(124), 124);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(300), 1);
    }
}
