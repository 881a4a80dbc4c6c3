//! Pod sandbox lifecycle.
//!
//! A pod sandbox is a delegated cgroup scope: a transient `.scope` unit in a
//! fresh slice, holding a placeholder pause process, plus a named network
//! namespace wired by CNI. Containers join the pod by landing their service
//! units in the same slice.
//!
//! Lifecycle operations serialize per pod id; rollback on a failed bring-up
//! tears resources down in reverse creation order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::cni::CniDriver;
use crate::error::{Code, Result, Status};
use crate::locks::KeyLocks;
use crate::metrics::RuntimeMetrics;
use crate::rootfs::RootfsAssembler;
use crate::state::{new_id, now, PodSandboxRecord, PodSandboxState};
use crate::store::StateStore;
use crate::systemd::{
    prop_bool, prop_pids, prop_string, prop_u64, JobResult, KillWho, SystemdManager,
};
use crate::{log_error_status, log_info, log_warn};

/// Deadline for scope start/stop jobs.
const JOB_DEADLINE: Duration = Duration::from_secs(30);

/// `TimeoutStopUSec=` for pod scopes, in microseconds.
const SCOPE_STOP_TIMEOUT_USEC: u64 = 10_000_000;

/// SIGKILL, for forced teardown of stray container units during removal.
const SIGKILL: i32 = 9;

/// Caller-supplied sandbox settings, already validated by the API adapter.
#[derive(Clone, Debug, Default)]
pub struct PodSandboxSettings {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Listing filter: conditions compose with AND; empty filter passes all.
#[derive(Clone, Debug, Default)]
pub struct PodFilter {
    pub id: Option<String>,
    pub state: Option<PodSandboxState>,
    pub labels: HashMap<String, String>,
}

#[derive(Clone)]
pub struct PodManager {
    inner: Arc<PodManagerInner>,
}

struct PodManagerInner {
    store: StateStore,
    systemd: SystemdManager,
    cni: CniDriver,
    rootfs: RootfsAssembler,
    locks: KeyLocks,
    metrics: RuntimeMetrics,
}

impl PodManager {
    pub fn new(
        store: StateStore,
        systemd: SystemdManager,
        cni: CniDriver,
        rootfs: RootfsAssembler,
        metrics: RuntimeMetrics,
    ) -> Self {
        PodManager {
            inner: Arc::new(PodManagerInner {
                store,
                systemd,
                cni,
                rootfs,
                locks: KeyLocks::new(),
                metrics,
            }),
        }
    }

    /// Scope unit name for a pod id.
    pub fn unit_name(pod_id: &str) -> String {
        format!("cri-pod-{pod_id}.scope")
    }

    /// Slice shared by the pod scope and its container services.
    pub fn slice_name(pod_id: &str) -> String {
        format!("cri-pod-{pod_id}.slice")
    }

    /// Bring up a sandbox and return its id.
    ///
    /// Order: allocate id, create the network namespace, start the scope
    /// around a pause process, then commit the record as READY. Any failure
    /// after id allocation unwinds the already-created resources in reverse.
    pub async fn run_pod_sandbox(&self, settings: PodSandboxSettings) -> Result<String> {
        let pod_id = new_id();
        let _guard = self.inner.locks.lock(&pod_id).await;

        let network = self.inner.cni.create_pod_network(&pod_id).await?;

        if let Err(error) = self.start_scope(&pod_id, &settings).await {
            let _ = self
                .inner
                .cni
                .destroy_pod_network(&pod_id, &network.netns_path)
                .await;
            return Err(error);
        }

        let record = PodSandboxRecord {
            id: pod_id.clone(),
            name: settings.name,
            namespace: settings.namespace,
            uid: settings.uid,
            state: PodSandboxState::Ready,
            created_at: now(),
            unit_name: Self::unit_name(&pod_id),
            network_namespace: Some(network.netns_path.clone()),
            ip_address: network.ip_address.map(|address| address.to_string()),
            labels: settings.labels,
            annotations: settings.annotations,
            unknown: Default::default(),
        };
        if let Err(error) = self.inner.store.save_pod(&record) {
            let _ = self
                .inner
                .systemd
                .stop_unit_and_wait(&record.unit_name, JOB_DEADLINE)
                .await;
            let _ = self
                .inner
                .cni
                .destroy_pod_network(&pod_id, &network.netns_path)
                .await;
            return Err(error);
        }

        self.inner.metrics.pods_created_total.inc();
        self.inner.metrics.pods_running.inc();
        log_info!(pod: &pod_id, "Pod sandbox ready");
        Ok(pod_id)
    }

    async fn start_scope(&self, pod_id: &str, settings: &PodSandboxSettings) -> Result<()> {
        let pause = Command::new("sleep")
            .arg("infinity")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(log_error_status!(pod: pod_id, Code::Unavailable, "pause-spawn-failed"))?;
        let pause_pid = pause
            .id()
            .ok_or_else(|| Status::new(Code::Internal, "pause-pid-missing"))?;

        let description = format!(
            "CRI pod sandbox {}/{}",
            settings.namespace, settings.name,
        );
        let properties = vec![
            prop_string("Description", description),
            prop_string("Slice", Self::slice_name(pod_id)),
            prop_bool("Delegate", true),
            prop_u64("TimeoutStopUSec", SCOPE_STOP_TIMEOUT_USEC),
            prop_pids("PIDs", &[pause_pid]),
        ];

        let job_started = tokio::time::Instant::now();
        let result = self
            .inner
            .systemd
            .start_transient_unit_and_wait(&Self::unit_name(pod_id), properties, JOB_DEADLINE)
            .await;
        self.inner
            .metrics
            .bus_job_duration_seconds
            .observe(job_started.elapsed().as_secs_f64());

        match result {
            Ok(JobResult::Done) => Ok(()),
            Ok(other) => {
                // The scope never came up; reap the orphaned pause process.
                kill_pid(pause_pid);
                Err(log_error_status!(pod: pod_id, "pod-scope-start-failed")(other))
            }
            Err(error) => {
                kill_pid(pause_pid);
                Err(error)
            }
        }
    }

    /// Stop a sandbox. Idempotent: stopping a NOT_READY or absent sandbox
    /// returns success.
    pub async fn stop_pod_sandbox(&self, pod_id: &str) -> Result<()> {
        let _guard = self.inner.locks.lock(pod_id).await;
        let mut record = match self.inner.store.load_pod(pod_id) {
            Ok(record) => record,
            Err(status) if status.code() == Code::NotFound => return Ok(()),
            Err(status) => return Err(status),
        };
        if record.state == PodSandboxState::NotReady {
            log_info!(pod: pod_id, "Idempotent pod stop");
            return Ok(());
        }

        self.stop_scope(pod_id, &record.unit_name).await?;

        record.state = PodSandboxState::NotReady;
        self.inner.store.save_pod(&record)?;
        self.inner.metrics.pods_running.dec();
        log_info!(pod: pod_id, "Pod sandbox stopped");
        Ok(())
    }

    async fn stop_scope(&self, pod_id: &str, unit_name: &str) -> Result<()> {
        match self
            .inner
            .systemd
            .stop_unit_and_wait(unit_name, JOB_DEADLINE)
            .await
        {
            Ok(JobResult::Done) | Ok(JobResult::Skipped) => Ok(()),
            Ok(other) => Err(log_error_status!(pod: pod_id, "pod-scope-stop-failed")(other)),
            // The scope may already be gone; that is what stopping wants.
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(status),
        }
    }

    /// Remove a sandbox and everything it owns. Implies stop. Idempotent.
    pub async fn remove_pod_sandbox(&self, pod_id: &str) -> Result<()> {
        let _guard = self.inner.locks.lock(pod_id).await;
        let record = match self.inner.store.load_pod(pod_id) {
            Ok(record) => record,
            Err(status) if status.code() == Code::NotFound => return Ok(()),
            Err(status) => return Err(status),
        };

        if record.state == PodSandboxState::Ready {
            self.stop_scope(pod_id, &record.unit_name).await?;
            self.inner.metrics.pods_running.dec();
        }

        // Stop stray container units and release their root filesystems.
        // Rows go away with the pod's atomic delete below.
        for container in self.inner.store.list_containers_for_pod(pod_id)? {
            let _ = self
                .inner
                .systemd
                .kill_unit(&container.unit_name, KillWho::All, SIGKILL)
                .await;
            let _ = self
                .inner
                .systemd
                .stop_unit_and_wait(&container.unit_name, JOB_DEADLINE)
                .await;
            let rootfs = self.inner.rootfs.clone();
            let container_id = container.id.clone();
            tokio::task::spawn_blocking(move || rootfs.teardown(&container_id))
                .await
                .unwrap_or_else(|_| Err(Status::new(Code::Internal, "rootfs-task-panicked")))?;
        }

        if let Some(netns) = &record.network_namespace {
            self.inner.cni.destroy_pod_network(pod_id, netns).await?;
        }

        self.inner.store.delete_pod(pod_id)?;
        log_info!(pod: pod_id, "Pod sandbox removed");
        Ok(())
    }

    /// Current record, refreshed against the live unit: a READY pod whose
    /// scope vanished is degraded to NOT_READY.
    pub async fn pod_sandbox_status(&self, pod_id: &str) -> Result<PodSandboxRecord> {
        let _guard = self.inner.locks.lock(pod_id).await;
        let mut record = self.inner.store.load_pod(pod_id)?;
        if record.state == PodSandboxState::Ready {
            let vanished = match self.inner.systemd.unit_active_state(&record.unit_name).await {
                Ok(state) => state.is_terminal(),
                Err(status) if status.code() == Code::NotFound => true,
                Err(_) => false,
            };
            if vanished {
                log_warn!(pod: pod_id, "Pod scope vanished externally");
                record.state = PodSandboxState::NotReady;
                self.inner.store.save_pod(&record)?;
                self.inner.metrics.pods_running.dec();
            }
        }
        Ok(record)
    }

    /// List sandboxes matching `filter`. Conditions compose with AND.
    pub fn list_pod_sandboxes(&self, filter: &PodFilter) -> Result<Vec<PodSandboxRecord>> {
        if let Some(id) = &filter.id {
            // An exact id condition skips the exhaustive scan.
            return match self.inner.store.load_pod(id) {
                Ok(record) if matches_filter(&record, filter) => Ok(vec![record]),
                Ok(_) => Ok(Vec::new()),
                Err(status) if status.code() == Code::NotFound => Ok(Vec::new()),
                Err(status) => Err(status),
            };
        }
        Ok(self
            .inner
            .store
            .list_pods()?
            .into_iter()
            .filter(|record| matches_filter(record, filter))
            .collect())
    }
}

fn matches_filter(record: &PodSandboxRecord, filter: &PodFilter) -> bool {
    if let Some(state) = filter.state {
        // READY is the only state Kubelet filters for; CREATED counts as
        // not-ready for filtering purposes.
        let ready = record.state == PodSandboxState::Ready;
        let wanted_ready = state == PodSandboxState::Ready;
        if ready != wanted_ready {
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

/// Best-effort SIGKILL of a stray process by pid.
fn kill_pid(pid: u32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(state: PodSandboxState, labels: &[(&str, &str)]) -> PodSandboxRecord {
        PodSandboxRecord {
            id: new_id(),
            name: String::from("p1"),
            namespace: String::from("default"),
            uid: String::from("u1"),
            state,
            created_at: now(),
            unit_name: String::from("cri-pod-x.scope"),
            network_namespace: None,
            ip_address: None,
            labels: labels
                .iter()
                .map(|(k, v)| (String::from(*k), String::from(*v)))
                .collect(),
            annotations: HashMap::new(),
            unknown: BTreeMap::new(),
        }
    }

    #[test]
    fn unit_and_slice_names_embed_the_pod_id() {
        assert_eq!(PodManager::unit_name("abc"), "cri-pod-abc.scope");
        assert_eq!(PodManager::slice_name("abc"), "cri-pod-abc.slice");
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = PodFilter::default();
        assert!(matches_filter(&record(PodSandboxState::Ready, &[]), &filter));
        assert!(matches_filter(&record(PodSandboxState::NotReady, &[]), &filter));
    }

    #[test]
    fn state_filter_splits_on_readiness() {
        let ready_only = PodFilter {
            state: Some(PodSandboxState::Ready),
            ..PodFilter::default()
        };
        assert!(matches_filter(&record(PodSandboxState::Ready, &[]), &ready_only));
        assert!(!matches_filter(
            &record(PodSandboxState::NotReady, &[]),
            &ready_only,
        ));
    }

    #[test]
    fn label_filter_requires_every_pair() {
        let filter = PodFilter {
            labels: [(String::from("app"), String::from("web"))].into_iter().collect(),
            ..PodFilter::default()
        };
        assert!(matches_filter(
            &record(PodSandboxState::Ready, &[("app", "web"), ("tier", "fe")]),
            &filter,
        ));
        assert!(!matches_filter(
            &record(PodSandboxState::Ready, &[("app", "db")]),
            &filter,
        ));
        assert!(!matches_filter(&record(PodSandboxState::Ready, &[]), &filter));
    }
}
