//! Container lifecycle.
//!
//! A container is a transient `.service` unit rooted in an overlay mount of
//! its image. The unit lands in its pod's delegated slice, joins the pod's
//! network namespace, and appends stdout/stderr to the container log file.
//! `RemainAfterExit=` keeps the unit around after the main process exits so
//! the exit status stays readable until the runtime collects it.
//!
//! Lifecycle operations serialize per container id. Idempotent operations
//! (`stop`, `remove`) return success when the target is already gone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use zvariant::{Array, Signature, StructureBuilder, Value};

use crate::error::{Code, Result, Status};
use crate::images::ImageStore;
use crate::locks::KeyLocks;
use crate::metrics::RuntimeMetrics;
use crate::pods::PodManager;
use crate::rootfs::RootfsAssembler;
use crate::state::{
    new_id, now, ContainerRecord, ContainerState, PodSandboxState, SecurityContext,
};
use crate::store::StateStore;
use crate::systemd::{
    prop_bool, prop_string, prop_string_array, prop_u64, JobResult, KillWho, SystemdManager,
    UnitProperty,
};
use crate::{log_error_status, log_info, log_warn};

/// Deadline for unit start/stop jobs.
const JOB_DEADLINE: Duration = Duration::from_secs(30);

/// Poll interval while watching a unit wind down.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a SIGKILL may take to become visible before stop gives up.
const KILL_WAIT: Duration = Duration::from_secs(5);

const SIGHUP: i32 = 1;
const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Sub-states in which a service's main process is finished.
const FINISHED_SUB_STATES: [&str; 3] = ["exited", "failed", "dead"];

/// Caller-supplied container settings, already validated by the API adapter.
#[derive(Clone, Debug, Default)]
pub struct ContainerSettings {
    pub name: String,
    /// Image reference as requested.
    pub image: String,
    /// Full argv: entrypoint followed by arguments.
    pub command: Vec<String>,
    pub working_dir: String,
    pub environment: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Absolute log path; empty selects the per-container default.
    pub log_path: String,
    /// User, capability, and device constraints from the CRI security
    /// context.
    pub security: SecurityContext,
}

/// Runtime-mutable resource limits.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceUpdate {
    /// CPU period and quota in microseconds, as Kubelet supplies them.
    pub cpu_period: Option<u64>,
    pub cpu_quota: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub tasks_max: Option<u64>,
}

/// Listing filter: conditions compose with AND; empty filter passes all.
#[derive(Clone, Debug, Default)]
pub struct ContainerFilter {
    pub id: Option<String>,
    pub pod_sandbox_id: Option<String>,
    pub state: Option<ContainerState>,
    pub labels: HashMap<String, String>,
}

#[derive(Clone)]
pub struct ContainerManager {
    inner: Arc<ContainerManagerInner>,
}

struct ContainerManagerInner {
    store: StateStore,
    systemd: SystemdManager,
    images: ImageStore,
    rootfs: RootfsAssembler,
    locks: KeyLocks,
    metrics: RuntimeMetrics,
}

impl ContainerManager {
    pub fn new(
        store: StateStore,
        systemd: SystemdManager,
        images: ImageStore,
        rootfs: RootfsAssembler,
        metrics: RuntimeMetrics,
    ) -> Self {
        ContainerManager {
            inner: Arc::new(ContainerManagerInner {
                store,
                systemd,
                images,
                rootfs,
                locks: KeyLocks::new(),
                metrics,
            }),
        }
    }

    /// Service unit name for a container id.
    pub fn unit_name(container_id: &str) -> String {
        format!("cri-container-{container_id}.service")
    }

    /// Create a container in its pod: resolve the image, compose the rootfs,
    /// and register the record as CREATED. The unit is not started yet.
    pub async fn create(&self, pod_id: &str, settings: ContainerSettings) -> Result<String> {
        let pod = self.inner.store.load_pod(pod_id)?;
        for sibling in self.inner.store.list_containers_for_pod(pod_id)? {
            if sibling.name == settings.name {
                return Err(Status::new(Code::AlreadyExists, "container-name-exists"));
            }
        }

        let normalized = crate::images::ImageReference::parse(&settings.image)?.normalized();
        let digest = self
            .inner
            .images
            .lookup(&normalized)
            .map_err(|_| Status::new(Code::NotFound, "image-not-found"))?;
        let lower = self
            .inner
            .images
            .machine_path(&digest)
            .map_err(|_| Status::new(Code::NotFound, "image-not-found"))?;

        let container_id = new_id();
        let _guard = self.inner.locks.lock(&container_id).await;

        let rootfs = {
            let assembler = self.inner.rootfs.clone();
            let id = container_id.clone();
            let lower_dirs = vec![PathBuf::from(lower)];
            tokio::task::spawn_blocking(move || assembler.assemble(&id, &lower_dirs))
                .await
                .unwrap_or_else(|_| Err(Status::new(Code::Internal, "rootfs-task-panicked")))?
        };

        let log_path = if settings.log_path.is_empty() {
            self.inner
                .rootfs
                .container_dir(&container_id)
                .join("container.log")
                .to_string_lossy()
                .into_owned()
        } else {
            settings.log_path
        };

        let record = ContainerRecord {
            id: container_id.clone(),
            pod_sandbox_id: String::from(pod_id),
            name: settings.name,
            image: normalized,
            image_ref: digest,
            state: ContainerState::Created,
            created_at: now(),
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            pid: None,
            unit_name: Self::unit_name(&container_id),
            rootfs_path: rootfs.to_string_lossy().into_owned(),
            log_path,
            command: settings.command,
            working_dir: settings.working_dir,
            environment: settings.environment,
            security: settings.security,
            labels: settings.labels,
            annotations: settings.annotations,
            unknown: Default::default(),
        };
        if let Err(error) = self.inner.store.save_container(&record) {
            let assembler = self.inner.rootfs.clone();
            let id = container_id.clone();
            let _ = tokio::task::spawn_blocking(move || assembler.teardown(&id)).await;
            return Err(error);
        }

        self.inner.metrics.containers_created_total.inc();
        log_info!(container: &container_id, pod = pod.id.as_str(), "Container created");
        Ok(container_id)
    }

    /// Start a CREATED container's service unit.
    pub async fn start(&self, container_id: &str) -> Result<()> {
        let _guard = self.inner.locks.lock(container_id).await;
        let mut record = self.inner.store.load_container(container_id)?;
        match record.state {
            ContainerState::Created => {}
            ContainerState::Running => {
                log_info!(container: container_id, "Idempotent container start");
                return Ok(());
            }
            ContainerState::Exited | ContainerState::Unknown => {
                return Err(Status::new(
                    Code::FailedPrecondition,
                    "container-state-transition",
                ));
            }
        }
        let pod = self.inner.store.load_pod(&record.pod_sandbox_id)?;
        if pod.state != PodSandboxState::Ready {
            return Err(Status::new(Code::FailedPrecondition, "pod-not-ready"));
        }

        if record.command.is_empty() {
            return Err(Status::new(Code::InvalidArgument, "container-command-empty"));
        }
        let properties = unit_properties(&record, &pod);

        let job_started = Instant::now();
        let result = self
            .inner
            .systemd
            .start_transient_unit_and_wait(&record.unit_name, properties, JOB_DEADLINE)
            .await;
        self.inner
            .metrics
            .bus_job_duration_seconds
            .observe(job_started.elapsed().as_secs_f64());
        match result {
            Ok(JobResult::Done) => {}
            Ok(other) => {
                let _ = self.inner.systemd.reset_failed_unit(&record.unit_name).await;
                return Err(log_error_status!(
                    container: container_id,
                    "container-start-failed"
                )(other));
            }
            Err(error) => return Err(error),
        }

        let pid = self
            .inner
            .systemd
            .service_main_pid(&record.unit_name)
            .await
            .ok()
            .filter(|pid| *pid > 0);

        record.state = ContainerState::Running;
        // The wall clock may step backwards; keep the ordering invariant.
        record.started_at = now().max(record.created_at + 1);
        record.pid = pid;
        self.inner.store.save_container(&record)?;
        self.inner.metrics.containers_running.inc();
        log_info!(container: container_id, "Container running");
        Ok(())
    }

    /// Stop a container: SIGTERM, wait up to `grace`, then SIGKILL.
    /// Idempotent when already exited or absent.
    pub async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        let _guard = self.inner.locks.lock(container_id).await;
        let record = match self.inner.store.load_container(container_id) {
            Ok(record) => record,
            Err(status) if status.code() == Code::NotFound => return Ok(()),
            Err(status) => return Err(status),
        };
        match record.state {
            ContainerState::Running => self.finalize_stop(record, grace).await,
            ContainerState::Exited => {
                log_info!(container: container_id, "Idempotent container stop");
                Ok(())
            }
            // Nothing is running; there is nothing to transition.
            ContainerState::Created | ContainerState::Unknown => Ok(()),
        }
    }

    async fn finalize_stop(&self, mut record: ContainerRecord, grace: Duration) -> Result<()> {
        let unit = record.unit_name.clone();
        let container_id = record.id.clone();

        if !grace.is_zero() {
            let _ = self
                .inner
                .systemd
                .kill_unit(&unit, KillWho::Main, SIGTERM)
                .await;
            if !self.wait_until_finished(&unit, grace).await {
                log_warn!(
                    container: &container_id,
                    "Container ignored SIGTERM for {} seconds",
                    grace.as_secs(),
                );
                let _ = self
                    .inner
                    .systemd
                    .kill_unit(&unit, KillWho::All, SIGKILL)
                    .await;
                self.wait_until_finished(&unit, KILL_WAIT).await;
            }
        } else {
            let _ = self
                .inner
                .systemd
                .kill_unit(&unit, KillWho::All, SIGKILL)
                .await;
            self.wait_until_finished(&unit, KILL_WAIT).await;
        }

        // Read the exit status while `RemainAfterExit=` still holds the unit,
        // then let the service manager collect it.
        let exit_code = self
            .inner
            .systemd
            .service_exit_status(&unit)
            .await
            .unwrap_or(0);
        let _ = self.inner.systemd.stop_unit_and_wait(&unit, JOB_DEADLINE).await;
        let _ = self.inner.systemd.reset_failed_unit(&unit).await;

        record.state = ContainerState::Exited;
        record.finished_at = now().max(record.started_at.max(record.created_at + 1));
        record.exit_code = exit_code;
        record.pid = None;
        self.inner.store.save_container(&record)?;
        self.inner.metrics.containers_running.dec();
        log_info!(container: &container_id, exit_code = exit_code, "Container stopped");
        Ok(())
    }

    /// True once the unit's main process is finished (or the unit is gone).
    async fn wait_until_finished(&self, unit: &str, deadline: Duration) -> bool {
        let started = Instant::now();
        loop {
            match self.inner.systemd.unit_sub_state(unit).await {
                Ok(sub_state) if FINISHED_SUB_STATES.contains(&sub_state.as_str()) => {
                    return true
                }
                Err(status) if status.code() == Code::NotFound => return true,
                Ok(_) | Err(_) => {}
            }
            if started.elapsed() >= deadline {
                return false;
            }
            sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Remove a container: force-stop if running, release the rootfs, delete
    /// the row. Idempotent when absent.
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        let _guard = self.inner.locks.lock(container_id).await;
        let record = match self.inner.store.load_container(container_id) {
            Ok(record) => record,
            Err(status) if status.code() == Code::NotFound => return Ok(()),
            Err(status) => return Err(status),
        };

        if record.state == ContainerState::Running {
            self.finalize_stop(record, Duration::ZERO).await?;
        }

        {
            let assembler = self.inner.rootfs.clone();
            let id = String::from(container_id);
            tokio::task::spawn_blocking(move || assembler.teardown(&id))
                .await
                .unwrap_or_else(|_| Err(Status::new(Code::Internal, "rootfs-task-panicked")))?;
        }

        self.inner.store.delete_container(container_id)?;
        log_info!(container: container_id, "Container removed");
        Ok(())
    }

    /// Apply runtime-mutable resource limits.
    ///
    /// The whole set is applied in one call; the result is verified by
    /// reading the properties back, and on partial application the already
    /// applied subset is reversed before the error surfaces.
    pub async fn update_resources(
        &self,
        container_id: &str,
        update: ResourceUpdate,
    ) -> Result<()> {
        let _guard = self.inner.locks.lock(container_id).await;
        let record = self.inner.store.load_container(container_id)?;
        if record.state != ContainerState::Running {
            return Err(Status::new(Code::FailedPrecondition, "container-not-running"));
        }

        let desired = resource_properties(&update);
        if desired.is_empty() {
            return Ok(());
        }

        // Capture the current values so a partial application can be undone.
        let mut previous: Vec<(&'static str, u64)> = Vec::with_capacity(desired.len());
        for (name, _) in &desired {
            let value = self
                .inner
                .systemd
                .service_property_u64(&record.unit_name, name)
                .await?;
            previous.push((name, value));
        }

        let properties: Vec<UnitProperty> = desired
            .iter()
            .map(|(name, value)| prop_u64(name, *value))
            .collect();
        self.inner
            .systemd
            .set_unit_properties(&record.unit_name, properties)
            .await?;

        // Verify by read-back; reverse everything on partial application.
        let mut applied_cleanly = true;
        for (name, value) in &desired {
            let observed = self
                .inner
                .systemd
                .service_property_u64(&record.unit_name, name)
                .await?;
            if observed != *value {
                applied_cleanly = false;
                break;
            }
        }
        if !applied_cleanly {
            let rollback: Vec<UnitProperty> = previous
                .iter()
                .map(|(name, value)| prop_u64(name, *value))
                .collect();
            let _ = self
                .inner
                .systemd
                .set_unit_properties(&record.unit_name, rollback)
                .await;
            return Err(Status::new(Code::Internal, "resource-update-partial"));
        }

        log_info!(container: container_id, "Container resources updated");
        Ok(())
    }

    /// Rotate the container log. A no-op (that creates no file) unless the
    /// container is running.
    pub async fn reopen_log(&self, container_id: &str) -> Result<()> {
        let _guard = self.inner.locks.lock(container_id).await;
        let record = self.inner.store.load_container(container_id)?;
        if record.state != ContainerState::Running {
            return Ok(());
        }

        let rotated = format!("{}.1", record.log_path);
        if let Err(error) = std::fs::rename(&record.log_path, &rotated) {
            if error.kind() != std::io::ErrorKind::NotFound {
                return Err(Status::new(Code::Internal, "log-rotate-failed"));
            }
        }
        // Fresh file for subsequent appends, then nudge the unit to reopen.
        std::fs::File::create(&record.log_path)
            .map_err(|_| Status::new(Code::Internal, "log-rotate-failed"))?;
        let _ = self
            .inner
            .systemd
            .kill_unit(&record.unit_name, KillWho::Main, SIGHUP)
            .await;
        log_info!(container: container_id, "Container log reopened");
        Ok(())
    }

    /// Current record, reconciled against the live unit.
    ///
    /// A RUNNING container whose unit finished is finalized as EXITED; one
    /// whose unit vanished entirely degrades to UNKNOWN.
    pub async fn status(&self, container_id: &str) -> Result<ContainerRecord> {
        let _guard = self.inner.locks.lock(container_id).await;
        let mut record = self.inner.store.load_container(container_id)?;
        if record.state != ContainerState::Running {
            return Ok(record);
        }

        match self.inner.systemd.unit_sub_state(&record.unit_name).await {
            Ok(sub_state) if FINISHED_SUB_STATES.contains(&sub_state.as_str()) => {
                let exit_code = self
                    .inner
                    .systemd
                    .service_exit_status(&record.unit_name)
                    .await
                    .unwrap_or(0);
                let _ = self
                    .inner
                    .systemd
                    .stop_unit_and_wait(&record.unit_name, JOB_DEADLINE)
                    .await;
                record.state = ContainerState::Exited;
                record.finished_at = now().max(record.started_at.max(record.created_at + 1));
                record.exit_code = exit_code;
                record.pid = None;
                self.inner.store.save_container(&record)?;
                self.inner.metrics.containers_running.dec();
            }
            Err(status) if status.code() == Code::NotFound => {
                log_warn!(container: container_id, "Container unit vanished externally");
                record.state = ContainerState::Unknown;
                record.pid = None;
                self.inner.store.save_container(&record)?;
                self.inner.metrics.containers_running.dec();
            }
            Ok(_) | Err(_) => {}
        }
        Ok(record)
    }

    /// List containers matching `filter`. Conditions compose with AND.
    pub fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>> {
        if let Some(id) = &filter.id {
            return match self.inner.store.load_container(id) {
                Ok(record) if matches_filter(&record, filter) => Ok(vec![record]),
                Ok(_) => Ok(Vec::new()),
                Err(status) if status.code() == Code::NotFound => Ok(Vec::new()),
                Err(status) => Err(status),
            };
        }
        let records = match &filter.pod_sandbox_id {
            Some(pod_id) => self.inner.store.list_containers_for_pod(pod_id)?,
            None => self.inner.store.list_containers()?,
        };
        Ok(records
            .into_iter()
            .filter(|record| matches_filter(record, filter))
            .collect())
    }
}

/// Transient service properties realizing a container record.
fn unit_properties(
    record: &ContainerRecord,
    pod: &crate::state::PodSandboxRecord,
) -> Vec<UnitProperty> {
    let mut properties = vec![
        prop_string(
            "Description",
            format!(
                "CRI container {}/{}/{}",
                pod.namespace, pod.name, record.name,
            ),
        ),
        prop_string("Slice", PodManager::slice_name(&pod.id)),
        crate::systemd::prop_exec_start(&record.command),
        prop_string("RootDirectory", record.rootfs_path.clone()),
        // /proc, /sys, and /dev inside the root.
        prop_bool("MountAPIVFS", true),
        prop_bool("NoNewPrivileges", record.security.no_new_privs),
        // Keep the unit loaded after exit so the exit status is readable.
        prop_bool("RemainAfterExit", true),
        prop_string("StandardOutput", format!("append:{}", record.log_path)),
        prop_string("StandardError", format!("append:{}", record.log_path)),
        prop_bind_ro_paths(&["/etc/resolv.conf", "/etc/hostname"]),
    ];
    if let Some(uid) = record.security.run_as_user {
        properties.push(prop_string("User", uid.to_string()));
    }
    if !record.security.add_capabilities.is_empty()
        || !record.security.drop_capabilities.is_empty()
    {
        let bounding = capability_bounding_set(
            &record.security.add_capabilities,
            &record.security.drop_capabilities,
        );
        properties.push(prop_u64("CapabilityBoundingSet", bounding));
        if !record.security.add_capabilities.is_empty() {
            properties.push(prop_u64(
                "AmbientCapabilities",
                capability_mask(&record.security.add_capabilities),
            ));
        }
    }
    if !record.security.device_allow.is_empty() {
        properties.push(prop_device_allow(&record.security.device_allow));
    }
    if !record.working_dir.is_empty() {
        properties.push(prop_string("WorkingDirectory", record.working_dir.clone()));
    }
    if !record.environment.is_empty() {
        let environment: Vec<String> = record
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        properties.push(prop_string_array("Environment", &environment));
    }
    if let Some(netns) = &pod.network_namespace {
        properties.push(prop_string("NetworkNamespacePath", netns.clone()));
    }
    properties
}

/// Capability bits as defined by `linux/capability.h`.
const CAPABILITY_BITS: [(&str, u64); 41] = [
    ("CHOWN", 0),
    ("DAC_OVERRIDE", 1),
    ("DAC_READ_SEARCH", 2),
    ("FOWNER", 3),
    ("FSETID", 4),
    ("KILL", 5),
    ("SETGID", 6),
    ("SETUID", 7),
    ("SETPCAP", 8),
    ("LINUX_IMMUTABLE", 9),
    ("NET_BIND_SERVICE", 10),
    ("NET_BROADCAST", 11),
    ("NET_ADMIN", 12),
    ("NET_RAW", 13),
    ("IPC_LOCK", 14),
    ("IPC_OWNER", 15),
    ("SYS_MODULE", 16),
    ("SYS_RAWIO", 17),
    ("SYS_CHROOT", 18),
    ("SYS_PTRACE", 19),
    ("SYS_PACCT", 20),
    ("SYS_ADMIN", 21),
    ("SYS_BOOT", 22),
    ("SYS_NICE", 23),
    ("SYS_RESOURCE", 24),
    ("SYS_TIME", 25),
    ("SYS_TTY_CONFIG", 26),
    ("MKNOD", 27),
    ("LEASE", 28),
    ("AUDIT_WRITE", 29),
    ("AUDIT_CONTROL", 30),
    ("SETFCAP", 31),
    ("MAC_OVERRIDE", 32),
    ("MAC_ADMIN", 33),
    ("SYSLOG", 34),
    ("WAKE_ALARM", 35),
    ("BLOCK_SUSPEND", 36),
    ("AUDIT_READ", 37),
    ("PERFMON", 38),
    ("BPF", 39),
    ("CHECKPOINT_RESTORE", 40),
];

/// Bit of a capability name. Accepts the CRI spelling with or without the
/// `CAP_` prefix, case-insensitive. Unknown names are ignored.
fn capability_bit(name: &str) -> Option<u64> {
    let name = name.to_ascii_uppercase();
    let name = name.strip_prefix("CAP_").unwrap_or(&name);
    CAPABILITY_BITS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, bit)| 1u64 << bit)
}

/// Bitmask of the named capabilities.
fn capability_mask(names: &[String]) -> u64 {
    names
        .iter()
        .filter_map(|name| capability_bit(name))
        .fold(0, |mask, bit| mask | bit)
}

/// `CapabilityBoundingSet=` value: the full set minus drops plus adds.
/// `ALL` in the drop list empties the set before additions apply.
fn capability_bounding_set(add: &[String], drop: &[String]) -> u64 {
    let all: u64 = CAPABILITY_BITS.iter().fold(0, |mask, (_, bit)| mask | (1u64 << bit));
    let base = if drop.iter().any(|name| name.eq_ignore_ascii_case("ALL")) {
        0
    } else {
        all & !capability_mask(drop)
    };
    base | capability_mask(add)
}

/// `DeviceAllow=` entries of (device path, permissions).
fn prop_device_allow(devices: &[crate::state::DeviceAccess]) -> UnitProperty {
    let mut entries = Array::new(Signature::from_static_str_unchecked("(ss)"));
    for device in devices {
        let permissions = if device.permissions.is_empty() {
            String::from("rwm")
        } else {
            device.permissions.clone()
        };
        let entry = StructureBuilder::new()
            .append_field(Value::from(device.host_path.clone()))
            .append_field(Value::from(permissions))
            .build();
        // The entry signature is statically correct for the array.
        entries.append(Value::Structure(entry)).unwrap();
    }
    ("DeviceAllow", Value::Array(entries))
}

/// `BindReadOnlyPaths=` entries of (source, destination, ignore-missing,
/// flags).
fn prop_bind_ro_paths(paths: &[&str]) -> UnitProperty {
    let mut entries = Array::new(Signature::from_static_str_unchecked("(ssbt)"));
    for path in paths {
        let entry = StructureBuilder::new()
            .append_field(Value::from(String::from(*path)))
            .append_field(Value::from(String::from(*path)))
            .append_field(Value::from(true))
            .append_field(Value::from(0u64))
            .build();
        // The entry signature is statically correct for the array.
        entries.append(Value::Structure(entry)).unwrap();
    }
    ("BindReadOnlyPaths", Value::Array(entries))
}

/// Resource-control properties for an update, in apply order.
fn resource_properties(update: &ResourceUpdate) -> Vec<(&'static str, u64)> {
    let mut properties = Vec::new();
    if let (Some(period), Some(quota)) = (update.cpu_period, update.cpu_quota) {
        if period > 0 && quota > 0 {
            properties.push(("CPUQuotaPerSecUSec", quota * 1_000_000 / period));
        }
    }
    if let Some(memory) = update.memory_limit_bytes {
        properties.push(("MemoryMax", memory));
    }
    if let Some(tasks) = update.tasks_max {
        properties.push(("TasksMax", tasks));
    }
    properties
}

fn matches_filter(record: &ContainerRecord, filter: &ContainerFilter) -> bool {
    if let Some(pod_id) = &filter.pod_sandbox_id {
        if &record.pod_sandbox_id != pod_id {
            return false;
        }
    }
    if let Some(state) = filter.state {
        if record.state != state {
            return false;
        }
    }
    filter.labels.iter().all(|(key, value)| {
        record
            .labels
            .get(key)
            .map_or(false, |actual| actual == value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(state: ContainerState) -> ContainerRecord {
        ContainerRecord {
            id: new_id(),
            pod_sandbox_id: new_id(),
            name: String::from("c"),
            image: String::from("busybox:latest"),
            image_ref: String::from("sha256:0011"),
            state,
            created_at: now(),
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            pid: None,
            unit_name: String::from("cri-container-x.service"),
            rootfs_path: String::from("/state/containers/x/rootfs"),
            log_path: String::from("/state/containers/x/container.log"),
            command: vec![String::from("/bin/sh"), String::from("-c"), String::from("true")],
            working_dir: String::from("/srv"),
            environment: vec![(String::from("A"), String::from("1"))],
            security: SecurityContext {
                run_as_user: Some(1000),
                add_capabilities: vec![String::from("NET_BIND_SERVICE")],
                drop_capabilities: vec![String::from("ALL")],
                no_new_privs: true,
                device_allow: vec![crate::state::DeviceAccess {
                    host_path: String::from("/dev/net/tun"),
                    permissions: String::from("rw"),
                }],
            },
            labels: HashMap::new(),
            annotations: HashMap::new(),
            unknown: BTreeMap::new(),
        }
    }

    fn pod() -> crate::state::PodSandboxRecord {
        crate::state::PodSandboxRecord {
            id: new_id(),
            name: String::from("p1"),
            namespace: String::from("default"),
            uid: String::from("u1"),
            state: PodSandboxState::Ready,
            created_at: now(),
            unit_name: String::from("cri-pod-x.scope"),
            network_namespace: Some(String::from("/run/netns/cri-x")),
            ip_address: Some(String::from("10.88.0.7")),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            unknown: BTreeMap::new(),
        }
    }

    #[test]
    fn unit_names_embed_the_container_id() {
        assert_eq!(
            ContainerManager::unit_name("abc"),
            "cri-container-abc.service",
        );
    }

    #[test]
    fn unit_properties_cover_the_container_contract() {
        let record = record(ContainerState::Created);
        let pod = pod();

        let properties = unit_properties(&record, &pod);
        let names: Vec<&str> = properties.iter().map(|(name, _)| *name).collect();

        for expected in [
            "Description",
            "Slice",
            "ExecStart",
            "RootDirectory",
            "MountAPIVFS",
            "NoNewPrivileges",
            "RemainAfterExit",
            "StandardOutput",
            "StandardError",
            "BindReadOnlyPaths",
            "User",
            "CapabilityBoundingSet",
            "AmbientCapabilities",
            "DeviceAllow",
            "WorkingDirectory",
            "Environment",
            "NetworkNamespacePath",
        ] {
            assert!(names.contains(&expected), "missing property {expected}");
        }
    }

    #[test]
    fn security_properties_are_omitted_without_a_context() {
        let mut record = record(ContainerState::Created);
        record.security = SecurityContext::default();

        let properties = unit_properties(&record, &pod());
        let names: Vec<&str> = properties.iter().map(|(name, _)| *name).collect();

        for absent in ["User", "CapabilityBoundingSet", "AmbientCapabilities", "DeviceAllow"] {
            assert!(!names.contains(&absent), "unexpected property {absent}");
        }
    }

    #[test]
    fn capability_names_resolve_with_or_without_prefix() {
        assert_eq!(capability_bit("NET_ADMIN"), Some(1 << 12));
        assert_eq!(capability_bit("CAP_NET_ADMIN"), Some(1 << 12));
        assert_eq!(capability_bit("net_bind_service"), Some(1 << 10));
        assert_eq!(capability_bit("NOT_A_CAPABILITY"), None);
    }

    #[test]
    fn drop_all_keeps_only_added_capabilities() {
        let add = vec![String::from("NET_BIND_SERVICE"), String::from("CHOWN")];
        let drop = vec![String::from("ALL")];

        assert_eq!(capability_bounding_set(&add, &drop), (1 << 10) | (1 << 0));
    }

    #[test]
    fn dropped_capabilities_leave_the_bounding_set() {
        let bounding = capability_bounding_set(&[], &[String::from("SYS_ADMIN")]);

        assert_eq!(bounding & (1 << 21), 0);
        assert_ne!(bounding & (1 << 0), 0);
    }

    #[test]
    fn cpu_quota_converts_to_usec_per_second() {
        let update = ResourceUpdate {
            cpu_period: Some(100_000),
            cpu_quota: Some(50_000),
            memory_limit_bytes: Some(1 << 30),
            tasks_max: Some(512),
        };

        let properties = resource_properties(&update);
        assert_eq!(
            properties,
            vec![
                ("CPUQuotaPerSecUSec", 500_000),
                ("MemoryMax", 1 << 30),
                ("TasksMax", 512),
            ],
        );
    }

    #[test]
    fn filters_compose_with_and() {
        let mut candidate = record(ContainerState::Running);
        candidate
            .labels
            .insert(String::from("app"), String::from("web"));

        let matching = ContainerFilter {
            pod_sandbox_id: Some(candidate.pod_sandbox_id.clone()),
            state: Some(ContainerState::Running),
            labels: [(String::from("app"), String::from("web"))].into_iter().collect(),
            ..ContainerFilter::default()
        };
        assert!(matches_filter(&candidate, &matching));

        let wrong_state = ContainerFilter {
            state: Some(ContainerState::Exited),
            ..ContainerFilter::default()
        };
        assert!(!matches_filter(&candidate, &wrong_state));

        let wrong_pod = ContainerFilter {
            pod_sandbox_id: Some(String::from("other")),
            ..ContainerFilter::default()
        };
        assert!(!matches_filter(&candidate, &wrong_pod));
    }
}
