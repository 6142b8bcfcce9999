//! Resource lifecycle tracking with ordered teardown.
//!
//! A resource is tracked only after its creating agent call succeeded and
//! untracked only after its destroying call succeeded. [`ResourceTracker::cleanup`]
//! drains everything in reverse dependency order:
//!
//! ```text
//! mounted clone → clone → snapshot (unprotect, delete) → image → pool
//! container → daemon → mounted repository → repository
//! ```
//!
//! One tracker per test run; it is not shared between tasks.

use crate::agent::{AgentCall, AgentClient, AgentFunction, AgentInvocation};
use crate::errors::{ExecError, StackError};
use crate::transport::{ProcessRunner, ShellRunner};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// One resource created during a test run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackedResource {
    Repository { name: String },
    MountedRepository { name: String },
    RunningDaemon { repository: String },
    StartedContainer { name: String, repository: String },
    CephPool { name: String },
    CephImage { pool: String, name: String },
    CephSnapshot { pool: String, image: String, name: String },
    CephClone { pool: String, name: String },
    MountedClone { name: String },
}

impl TrackedResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            TrackedResource::Repository { .. } => ResourceKind::Repository,
            TrackedResource::MountedRepository { .. } => ResourceKind::MountedRepository,
            TrackedResource::RunningDaemon { .. } => ResourceKind::RunningDaemon,
            TrackedResource::StartedContainer { .. } => ResourceKind::StartedContainer,
            TrackedResource::CephPool { .. } => ResourceKind::CephPool,
            TrackedResource::CephImage { .. } => ResourceKind::CephImage,
            TrackedResource::CephSnapshot { .. } => ResourceKind::CephSnapshot,
            TrackedResource::CephClone { .. } => ResourceKind::CephClone,
            TrackedResource::MountedClone { .. } => ResourceKind::MountedClone,
        }
    }

    /// Agent calls that undo this resource, in order.
    fn teardown_steps(
        &self,
        inv: impl Fn(AgentFunction) -> AgentInvocation,
    ) -> Vec<AgentInvocation> {
        match self {
            TrackedResource::MountedClone { name } => {
                vec![inv(AgentFunction::CephCloneUnmount).flag("clone", name)]
            }
            TrackedResource::CephClone { pool, name } => vec![
                inv(AgentFunction::CephCloneDelete)
                    .flag("pool", pool)
                    .flag("clone", name),
            ],
            TrackedResource::CephSnapshot { pool, image, name } => vec![
                inv(AgentFunction::CephSnapshotUnprotect)
                    .flag("pool", pool)
                    .flag("image", image)
                    .flag("snapshot", name),
                inv(AgentFunction::CephSnapshotDelete)
                    .flag("pool", pool)
                    .flag("image", image)
                    .flag("snapshot", name),
            ],
            TrackedResource::CephImage { pool, name } => vec![
                inv(AgentFunction::CephImageDelete)
                    .flag("pool", pool)
                    .flag("image", name),
            ],
            TrackedResource::CephPool { name } => {
                vec![inv(AgentFunction::CephPoolDelete).flag("pool", name)]
            }
            TrackedResource::StartedContainer { name, repository } => vec![
                inv(AgentFunction::ContainerStop)
                    .flag("repository", repository)
                    .flag("container", name),
            ],
            TrackedResource::RunningDaemon { repository } => {
                vec![inv(AgentFunction::DaemonStop).flag("repository", repository)]
            }
            TrackedResource::MountedRepository { name } => {
                vec![inv(AgentFunction::RepositoryUnmount).flag("repository", name)]
            }
            TrackedResource::Repository { name } => {
                vec![inv(AgentFunction::RepositoryRm).flag("repository", name)]
            }
        }
    }
}

impl fmt::Display for TrackedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedResource::Repository { name } => write!(f, "repository {name}"),
            TrackedResource::MountedRepository { name } => write!(f, "mounted repository {name}"),
            TrackedResource::RunningDaemon { repository } => write!(f, "daemon of {repository}"),
            TrackedResource::StartedContainer { name, repository } => {
                write!(f, "container {name} in {repository}")
            }
            TrackedResource::CephPool { name } => write!(f, "pool {name}"),
            TrackedResource::CephImage { pool, name } => write!(f, "image {pool}/{name}"),
            TrackedResource::CephSnapshot { pool, image, name } => {
                write!(f, "snapshot {pool}/{image}@{name}")
            }
            TrackedResource::CephClone { pool, name } => write!(f, "clone {pool}/{name}"),
            TrackedResource::MountedClone { name } => write!(f, "mounted clone {name}"),
        }
    }
}

/// Discriminant of [`TrackedResource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Repository,
    MountedRepository,
    RunningDaemon,
    StartedContainer,
    CephPool,
    CephImage,
    CephSnapshot,
    CephClone,
    MountedClone,
}

impl ResourceKind {
    /// Cleanup phases. Each kind comes before everything it depends on.
    pub const TEARDOWN_ORDER: [ResourceKind; 9] = [
        ResourceKind::MountedClone,
        ResourceKind::CephClone,
        ResourceKind::CephSnapshot,
        ResourceKind::CephImage,
        ResourceKind::CephPool,
        ResourceKind::StartedContainer,
        ResourceKind::RunningDaemon,
        ResourceKind::MountedRepository,
        ResourceKind::Repository,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Repository => "repositories",
            ResourceKind::MountedRepository => "mounted repositories",
            ResourceKind::RunningDaemon => "daemons",
            ResourceKind::StartedContainer => "containers",
            ResourceKind::CephPool => "pools",
            ResourceKind::CephImage => "images",
            ResourceKind::CephSnapshot => "snapshots",
            ResourceKind::CephClone => "clones",
            ResourceKind::MountedClone => "mounted clones",
        }
    }
}

/// Outcome of [`ResourceTracker::cleanup`] or an explicit teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub success: bool,
    pub errors: Vec<String>,
}

impl CleanupReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            success: errors.is_empty(),
            errors,
        }
    }
}

/// Unique names for one test run: `test-<kind>-<run id>[-<suffix>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    run_id: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceNames {
    /// Run id from the current time in milliseconds, base 36.
    pub fn new() -> Self {
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self {
            run_id: to_base36(millis),
        }
    }

    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn name(&self, kind: &str, suffix: Option<&str>) -> String {
        match suffix {
            Some(s) if !s.is_empty() => format!("test-{}-{}-{}", kind, self.run_id, s),
            _ => format!("test-{}-{}", kind, self.run_id),
        }
    }

    pub fn pool(&self, suffix: Option<&str>) -> String {
        self.name("pool", suffix)
    }

    pub fn image(&self, suffix: Option<&str>) -> String {
        self.name("image", suffix)
    }

    pub fn snapshot(&self, suffix: Option<&str>) -> String {
        self.name("snap", suffix)
    }

    pub fn clone_name(&self, suffix: Option<&str>) -> String {
        self.name("clone", suffix)
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Names of a pool → image → snapshot → clone chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStack {
    pub pool: String,
    pub image: String,
    pub snapshot: String,
    pub clone: String,
}

/// Create-and-track wrappers plus ordered cleanup.
#[derive(Debug)]
pub struct ResourceTracker<R: ProcessRunner = ShellRunner> {
    agent: AgentClient<R>,
    repositories: Vec<TrackedResource>,
    mounted_repositories: Vec<TrackedResource>,
    running_daemons: Vec<TrackedResource>,
    started_containers: Vec<TrackedResource>,
    ceph_pools: Vec<TrackedResource>,
    ceph_images: Vec<TrackedResource>,
    ceph_snapshots: Vec<TrackedResource>,
    ceph_clones: Vec<TrackedResource>,
    mounted_clones: Vec<TrackedResource>,
}

impl<R: ProcessRunner> ResourceTracker<R> {
    pub fn new(agent: AgentClient<R>) -> Self {
        Self {
            agent,
            repositories: Vec::new(),
            mounted_repositories: Vec::new(),
            running_daemons: Vec::new(),
            started_containers: Vec::new(),
            ceph_pools: Vec::new(),
            ceph_images: Vec::new(),
            ceph_snapshots: Vec::new(),
            ceph_clones: Vec::new(),
            mounted_clones: Vec::new(),
        }
    }

    pub fn agent(&self) -> &AgentClient<R> {
        &self.agent
    }

    fn list(&self, kind: ResourceKind) -> &Vec<TrackedResource> {
        match kind {
            ResourceKind::Repository => &self.repositories,
            ResourceKind::MountedRepository => &self.mounted_repositories,
            ResourceKind::RunningDaemon => &self.running_daemons,
            ResourceKind::StartedContainer => &self.started_containers,
            ResourceKind::CephPool => &self.ceph_pools,
            ResourceKind::CephImage => &self.ceph_images,
            ResourceKind::CephSnapshot => &self.ceph_snapshots,
            ResourceKind::CephClone => &self.ceph_clones,
            ResourceKind::MountedClone => &self.mounted_clones,
        }
    }

    fn list_mut(&mut self, kind: ResourceKind) -> &mut Vec<TrackedResource> {
        match kind {
            ResourceKind::Repository => &mut self.repositories,
            ResourceKind::MountedRepository => &mut self.mounted_repositories,
            ResourceKind::RunningDaemon => &mut self.running_daemons,
            ResourceKind::StartedContainer => &mut self.started_containers,
            ResourceKind::CephPool => &mut self.ceph_pools,
            ResourceKind::CephImage => &mut self.ceph_images,
            ResourceKind::CephSnapshot => &mut self.ceph_snapshots,
            ResourceKind::CephClone => &mut self.ceph_clones,
            ResourceKind::MountedClone => &mut self.mounted_clones,
        }
    }

    /// Tracked resources of one kind, in creation order.
    pub fn tracked(&self, kind: ResourceKind) -> &[TrackedResource] {
        self.list(kind)
    }

    /// Everything still tracked, in teardown order.
    pub fn all_tracked(&self) -> Vec<TrackedResource> {
        ResourceKind::TEARDOWN_ORDER
            .iter()
            .flat_map(|&kind| self.list(kind).iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        ResourceKind::TEARDOWN_ORDER
            .iter()
            .all(|&kind| self.list(kind).is_empty())
    }

    /// Adopt a resource created outside the wrappers.
    pub fn track(&mut self, resource: TrackedResource) {
        debug!(resource = %resource, "Tracking resource");
        self.list_mut(resource.kind()).push(resource);
    }

    fn untrack(&mut self, resource: &TrackedResource) -> bool {
        let list = self.list_mut(resource.kind());
        match list.iter().position(|r| r == resource) {
            Some(idx) => {
                list.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Run `invocation` and track `resource` if it succeeded.
    async fn create(
        &mut self,
        invocation: AgentInvocation,
        resource: TrackedResource,
    ) -> Result<AgentCall, ExecError> {
        let call = self.agent.call(&invocation).await?;
        if call.succeeded() {
            self.track(resource);
        } else {
            debug!(resource = %resource, "Create failed, not tracking");
        }
        Ok(call)
    }

    pub async fn create_repository(
        &mut self,
        name: &str,
        size: &str,
        password: Option<&str>,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::RepositoryNew)
            .flag("repository", name)
            .flag_opt("password", password)
            .flag("size", size);
        let resource = TrackedResource::Repository {
            name: name.to_string(),
        };
        self.create(inv, resource).await
    }

    pub async fn mount_repository(
        &mut self,
        name: &str,
        password: Option<&str>,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::RepositoryMount)
            .flag("repository", name)
            .flag_opt("password", password);
        let resource = TrackedResource::MountedRepository {
            name: name.to_string(),
        };
        self.create(inv, resource).await
    }

    pub async fn start_daemon(&mut self, repository: &str) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::DaemonStart)
            .flag("repository", repository);
        let resource = TrackedResource::RunningDaemon {
            repository: repository.to_string(),
        };
        self.create(inv, resource).await
    }

    pub async fn start_container(
        &mut self,
        repository: &str,
        name: &str,
        command: Option<&str>,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::ContainerStart)
            .flag("repository", repository)
            .flag("container", name)
            .flag_opt("command", command);
        let resource = TrackedResource::StartedContainer {
            name: name.to_string(),
            repository: repository.to_string(),
        };
        self.create(inv, resource).await
    }

    pub async fn create_pool(
        &mut self,
        name: &str,
        pg_num: Option<u32>,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::CephPoolCreate)
            .flag("pool", name)
            .flag_opt("pg-num", pg_num);
        let resource = TrackedResource::CephPool {
            name: name.to_string(),
        };
        self.create(inv, resource).await
    }

    pub async fn create_image(
        &mut self,
        pool: &str,
        name: &str,
        size: &str,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::CephImageCreate)
            .flag("pool", pool)
            .flag("image", name)
            .flag("size", size);
        let resource = TrackedResource::CephImage {
            pool: pool.to_string(),
            name: name.to_string(),
        };
        self.create(inv, resource).await
    }

    pub async fn create_snapshot(
        &mut self,
        pool: &str,
        image: &str,
        name: &str,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::CephSnapshotCreate)
            .flag("pool", pool)
            .flag("image", image)
            .flag("snapshot", name);
        let resource = TrackedResource::CephSnapshot {
            pool: pool.to_string(),
            image: image.to_string(),
            name: name.to_string(),
        };
        self.create(inv, resource).await
    }

    /// Protect a snapshot so it can be cloned. Nothing new to track; the
    /// snapshot teardown always unprotects first.
    pub async fn protect_snapshot(
        &self,
        pool: &str,
        image: &str,
        name: &str,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::CephSnapshotProtect)
            .flag("pool", pool)
            .flag("image", image)
            .flag("snapshot", name);
        self.agent.call(&inv).await
    }

    pub async fn create_clone(
        &mut self,
        pool: &str,
        image: &str,
        snapshot: &str,
        name: &str,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::CephCloneCreate)
            .flag("pool", pool)
            .flag("image", image)
            .flag("snapshot", snapshot)
            .flag("clone", name);
        let resource = TrackedResource::CephClone {
            pool: pool.to_string(),
            name: name.to_string(),
        };
        self.create(inv, resource).await
    }

    /// Mount a clone with a copy-on-write overlay.
    pub async fn mount_clone(
        &mut self,
        name: &str,
        mount_point: &str,
        cow_size: Option<&str>,
    ) -> Result<AgentCall, ExecError> {
        let inv = self
            .agent
            .invocation(AgentFunction::CephCloneMount)
            .flag("clone", name)
            .flag("mount-point", mount_point)
            .flag_opt("cow-size", cow_size);
        let resource = TrackedResource::MountedClone {
            name: name.to_string(),
        };
        self.create(inv, resource).await
    }

    /// Create pool → image → snapshot → protect → clone, stopping at the
    /// first failing step.
    pub async fn create_storage_stack(
        &mut self,
        names: &ResourceNames,
        size: &str,
    ) -> Result<StorageStack, StackError> {
        let stack = StorageStack {
            pool: names.pool(None),
            image: names.image(None),
            snapshot: names.snapshot(None),
            clone: names.clone_name(None),
        };

        let call = self.create_pool(&stack.pool, None).await?;
        require(call)?;
        let call = self.create_image(&stack.pool, &stack.image, size).await?;
        require(call)?;
        let call = self
            .create_snapshot(&stack.pool, &stack.image, &stack.snapshot)
            .await?;
        require(call)?;
        let call = self
            .protect_snapshot(&stack.pool, &stack.image, &stack.snapshot)
            .await?;
        require(call)?;
        let call = self
            .create_clone(&stack.pool, &stack.image, &stack.snapshot, &stack.clone)
            .await?;
        require(call)?;

        info!(pool = %stack.pool, clone = %stack.clone, "Storage stack created");
        Ok(stack)
    }

    /// Run the teardown steps of one resource. Returns one message per
    /// failed step; every step is attempted.
    async fn teardown(&self, resource: &TrackedResource) -> Vec<String> {
        let mut errors = Vec::new();
        for step in resource.teardown_steps(|f| self.agent.invocation(f)) {
            match self.agent.call(&step).await {
                Ok(call) if call.succeeded_or_tolerated() => {}
                Ok(call) => errors.push(format!("{}: {}", resource, call.failure_summary())),
                Err(e) => errors.push(format!("{}: {}", resource, e)),
            }
        }
        errors
    }

    /// Tear down one resource now. It is untracked only if every step
    /// succeeded; otherwise it stays tracked for `cleanup`.
    pub async fn destroy(&mut self, resource: &TrackedResource) -> CleanupReport {
        let errors = self.teardown(resource).await;
        if errors.is_empty() {
            self.untrack(resource);
        } else {
            for e in &errors {
                warn!(resource = %resource, "Destroy failed: {}", e);
            }
        }
        CleanupReport::from_errors(errors)
    }

    pub async fn unmount_clone(&mut self, name: &str) -> CleanupReport {
        self.destroy(&TrackedResource::MountedClone {
            name: name.to_string(),
        })
        .await
    }

    pub async fn delete_clone(&mut self, pool: &str, name: &str) -> CleanupReport {
        self.destroy(&TrackedResource::CephClone {
            pool: pool.to_string(),
            name: name.to_string(),
        })
        .await
    }

    /// Unprotect, then delete.
    pub async fn delete_snapshot(&mut self, pool: &str, image: &str, name: &str) -> CleanupReport {
        self.destroy(&TrackedResource::CephSnapshot {
            pool: pool.to_string(),
            image: image.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn delete_image(&mut self, pool: &str, name: &str) -> CleanupReport {
        self.destroy(&TrackedResource::CephImage {
            pool: pool.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn delete_pool(&mut self, name: &str) -> CleanupReport {
        self.destroy(&TrackedResource::CephPool {
            name: name.to_string(),
        })
        .await
    }

    pub async fn stop_container(&mut self, repository: &str, name: &str) -> CleanupReport {
        self.destroy(&TrackedResource::StartedContainer {
            name: name.to_string(),
            repository: repository.to_string(),
        })
        .await
    }

    pub async fn stop_daemon(&mut self, repository: &str) -> CleanupReport {
        self.destroy(&TrackedResource::RunningDaemon {
            repository: repository.to_string(),
        })
        .await
    }

    pub async fn unmount_repository(&mut self, name: &str) -> CleanupReport {
        self.destroy(&TrackedResource::MountedRepository {
            name: name.to_string(),
        })
        .await
    }

    pub async fn delete_repository(&mut self, name: &str) -> CleanupReport {
        self.destroy(&TrackedResource::Repository {
            name: name.to_string(),
        })
        .await
    }

    /// Tear down a stack from [`Self::create_storage_stack`] right away:
    /// clone, snapshot, image, pool. Every step runs even after a failure.
    pub async fn teardown_storage_stack(&mut self, stack: &StorageStack) -> CleanupReport {
        let resources = [
            TrackedResource::CephClone {
                pool: stack.pool.clone(),
                name: stack.clone.clone(),
            },
            TrackedResource::CephSnapshot {
                pool: stack.pool.clone(),
                image: stack.image.clone(),
                name: stack.snapshot.clone(),
            },
            TrackedResource::CephImage {
                pool: stack.pool.clone(),
                name: stack.image.clone(),
            },
            TrackedResource::CephPool {
                name: stack.pool.clone(),
            },
        ];
        let mut errors = Vec::new();
        for resource in &resources {
            errors.extend(self.destroy(resource).await.errors);
        }
        CleanupReport::from_errors(errors)
    }

    /// Drain every tracked resource in teardown order.
    ///
    /// Never stops early. Each phase's collection is emptied when the phase
    /// ends whatever happened, so a second call has nothing to redo.
    pub async fn cleanup(&mut self) -> CleanupReport {
        let mut errors = Vec::new();
        for kind in ResourceKind::TEARDOWN_ORDER {
            let resources = std::mem::take(self.list_mut(kind));
            if resources.is_empty() {
                continue;
            }
            info!(phase = kind.label(), count = resources.len(), "Cleanup phase");
            for resource in &resources {
                let failed = self.teardown(resource).await;
                for e in &failed {
                    warn!(phase = kind.label(), "Cleanup step failed: {}", e);
                }
                errors.extend(failed);
            }
        }

        let report = CleanupReport::from_errors(errors);
        if report.success {
            info!("Cleanup complete");
        } else {
            warn!(errors = report.errors.len(), "Cleanup finished with errors");
        }
        report
    }
}

fn require(call: AgentCall) -> Result<AgentCall, StackError> {
    if call.succeeded() {
        Ok(call)
    } else {
        Err(StackError::Step {
            step: call.function,
            detail: call.failure_summary(),
        })
    }
}
