//! Fleet topology: numeric host ids to network addresses.
//!
//! `address(id) = prefix + "." + (offset + id)`. One relay host, one or more
//! workers and an optional storage cluster. Construction validates once;
//! every accessor afterwards is pure and infallible.

use crate::errors::TopologyError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Role a host plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    Relay,
    Worker,
    StorageNode,
}

impl HostRole {
    pub const ALL: [HostRole; 3] = [HostRole::Relay, HostRole::Worker, HostRole::StorageNode];

    /// Short name used by [`FleetTopology::resolve`] (`bridge`, `worker2`, `ceph1`).
    pub fn short_name(self) -> &'static str {
        match self {
            HostRole::Relay => "bridge",
            HostRole::Worker => "worker",
            HostRole::StorageNode => "ceph",
        }
    }

    /// Alternative name [`FleetTopology::resolve`] also accepts.
    fn alias(self) -> &'static str {
        match self {
            HostRole::Relay => "relay",
            HostRole::Worker => "worker",
            HostRole::StorageNode => "storage",
        }
    }
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostRole::Relay => "relay",
            HostRole::Worker => "worker",
            HostRole::StorageNode => "storage node",
        };
        f.write_str(s)
    }
}

/// Immutable fleet layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetTopology {
    prefix: String,
    offset: u32,
    relay_id: u32,
    worker_ids: Vec<u32>,
    storage_ids: Vec<u32>,
}

impl FleetTopology {
    pub fn new(
        prefix: impl Into<String>,
        offset: u32,
        relay_id: u32,
        worker_ids: Vec<u32>,
        storage_ids: Vec<u32>,
    ) -> Result<Self, TopologyError> {
        let prefix = prefix.into().trim().trim_end_matches('.').to_string();
        if prefix.is_empty() {
            return Err(TopologyError::EmptyPrefix);
        }
        if worker_ids.is_empty() {
            return Err(TopologyError::NoWorkers);
        }

        let mut seen: BTreeMap<u32, HostRole> = BTreeMap::new();
        let assignments = std::iter::once((relay_id, HostRole::Relay))
            .chain(worker_ids.iter().map(|&id| (id, HostRole::Worker)))
            .chain(storage_ids.iter().map(|&id| (id, HostRole::StorageNode)));
        for (id, role) in assignments {
            if let Some(&first) = seen.get(&id) {
                return Err(TopologyError::DuplicateId {
                    id,
                    first,
                    second: role,
                });
            }
            seen.insert(id, role);
        }

        Ok(Self {
            prefix,
            offset,
            relay_id,
            worker_ids,
            storage_ids,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn relay_id(&self) -> u32 {
        self.relay_id
    }

    pub fn worker_ids(&self) -> &[u32] {
        &self.worker_ids
    }

    pub fn storage_ids(&self) -> &[u32] {
        &self.storage_ids
    }

    /// Address for an arbitrary id. Computed in u64 so the sum never wraps.
    pub fn address(&self, id: u32) -> String {
        format!("{}.{}", self.prefix, u64::from(self.offset) + u64::from(id))
    }

    pub fn relay_address(&self) -> String {
        self.address(self.relay_id)
    }

    pub fn worker_addresses(&self) -> Vec<String> {
        self.worker_ids.iter().map(|&id| self.address(id)).collect()
    }

    pub fn storage_addresses(&self) -> Vec<String> {
        self.storage_ids.iter().map(|&id| self.address(id)).collect()
    }

    /// Relay followed by workers.
    pub fn all_addresses(&self) -> Vec<String> {
        let mut all = Vec::with_capacity(1 + self.worker_ids.len());
        all.push(self.relay_address());
        all.extend(self.worker_addresses());
        all
    }

    /// Relay, workers, then storage nodes.
    pub fn all_addresses_including_storage(&self) -> Vec<String> {
        let mut all = self.all_addresses();
        all.extend(self.storage_addresses());
        all
    }

    pub fn has_storage_cluster(&self) -> bool {
        !self.storage_ids.is_empty()
    }

    /// Ids assigned to `role`, in configuration order.
    pub fn ids_for(&self, role: HostRole) -> Vec<u32> {
        match role {
            HostRole::Relay => vec![self.relay_id],
            HostRole::Worker => self.worker_ids.clone(),
            HostRole::StorageNode => self.storage_ids.clone(),
        }
    }

    pub fn role_of(&self, id: u32) -> Option<HostRole> {
        if id == self.relay_id {
            Some(HostRole::Relay)
        } else if self.worker_ids.contains(&id) {
            Some(HostRole::Worker)
        } else if self.storage_ids.contains(&id) {
            Some(HostRole::StorageNode)
        } else {
            None
        }
    }

    /// Address of the `index`-th host of `role`, 1-based.
    pub fn address_of(&self, role: HostRole, index: usize) -> Option<String> {
        let ids = self.ids_for(role);
        let id = ids.get(index.checked_sub(1)?)?;
        Some(self.address(*id))
    }

    /// Resolve a host name to an address.
    ///
    /// Accepts `bridge`/`relay`, `workerN`, `cephN`/`storageN` (1-based) and
    /// literal addresses containing a `.`.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let name = name.trim();
        if name.contains('.') {
            return Some(name.to_string());
        }
        let lower = name.to_ascii_lowercase();
        for role in HostRole::ALL {
            for prefix in [role.short_name(), role.alias()] {
                let Some(digits) = lower.strip_prefix(prefix) else {
                    continue;
                };
                if role == HostRole::Relay {
                    if digits.is_empty() {
                        return Some(self.relay_address());
                    }
                    continue;
                }
                let index = digits.parse::<usize>().ok()?;
                return self.address_of(role, index);
            }
        }
        None
    }
}
