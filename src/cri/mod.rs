//! Implementation of the
//! [Container Runtime Interface](https://kubernetes.io/docs/concepts/architecture/cri/)
//! for the systemd-backed runtime.
//!
//! Business logic does not belong in these files. Their purpose is to accept
//! incoming CRI API requests from Kubelet, validate and convert request
//! fields, and delegate to the lifecycle managers. Surface this runtime does
//! not realize returns `Unimplemented` explicitly, never silent success.

use std::collections::HashMap;

use tonic::Response;

use crate::api::v1;
use crate::error::{Result, Status};
use crate::state::{ContainerRecord, ContainerState, PodSandboxRecord, PodSandboxState};

pub mod image;
pub mod runtime;

pub use image::CriImageService;
pub use runtime::CriRuntimeService;

/// Type boilerplate for a typical Tonic response result.
pub type TonicResult<T> = Result<Response<T>>;

/// "For now it expects 0.1.0." - https://github.com/cri-o/cri-o/blob/v1.31.3/server/version.go.
pub const KUBELET_API_VERSION: &str = "0.1.0";
/// Name of the container runtime.
pub const CONTAINER_RUNTIME_NAME: &str = "systemd-cri";
/// Version of the container runtime.
pub const CONTAINER_RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Version of the CRI API supported by the runtime.
pub const CONTAINER_RUNTIME_API_VERSION: &str = "v1";

// Required conditions for [`v1::StatusResponse`]:
pub(crate) const CONDITION_RUNTIME_READY: &str = "RuntimeReady";
pub(crate) const CONDITION_NETWORK_READY: &str = "NetworkReady";

/// Reject empty CRI ids before they reach the store.
pub(crate) fn require_id(id: &str, tag: &'static str) -> Result<()> {
    if id.is_empty() {
        return Err(Status::invalid_argument(tag));
    }
    Ok(())
}

pub(crate) fn pod_state_to_cri(state: PodSandboxState) -> v1::PodSandboxState {
    match state {
        PodSandboxState::Ready => v1::PodSandboxState::SandboxReady,
        PodSandboxState::Created | PodSandboxState::NotReady => {
            v1::PodSandboxState::SandboxNotready
        }
    }
}

pub(crate) fn container_state_to_cri(state: ContainerState) -> v1::ContainerState {
    match state {
        ContainerState::Created => v1::ContainerState::ContainerCreated,
        ContainerState::Running => v1::ContainerState::ContainerRunning,
        ContainerState::Exited => v1::ContainerState::ContainerExited,
        ContainerState::Unknown => v1::ContainerState::ContainerUnknown,
    }
}

pub(crate) fn cri_state_to_container_state(state: i32) -> Option<ContainerState> {
    match v1::ContainerState::try_from(state) {
        Ok(v1::ContainerState::ContainerCreated) => Some(ContainerState::Created),
        Ok(v1::ContainerState::ContainerRunning) => Some(ContainerState::Running),
        Ok(v1::ContainerState::ContainerExited) => Some(ContainerState::Exited),
        Ok(v1::ContainerState::ContainerUnknown) => Some(ContainerState::Unknown),
        Err(_) => None,
    }
}

fn pod_metadata(record: &PodSandboxRecord) -> v1::PodSandboxMetadata {
    v1::PodSandboxMetadata {
        name: record.name.clone(),
        uid: record.uid.clone(),
        namespace: record.namespace.clone(),
        attempt: 0,
    }
}

/// Convert the stored pod to a CRI [`v1::PodSandbox`] for `ListPodSandbox`.
pub(crate) fn cri_pod_sandbox(record: &PodSandboxRecord) -> v1::PodSandbox {
    v1::PodSandbox {
        id: record.id.clone(),
        metadata: Some(pod_metadata(record)),
        state: pod_state_to_cri(record.state) as i32,
        created_at: record.created_at,
        labels: record.labels.clone(),
        annotations: record.annotations.clone(),
        runtime_handler: String::new(),
    }
}

/// Convert the stored pod to a CRI [`v1::PodSandboxStatus`].
pub(crate) fn cri_pod_sandbox_status(record: &PodSandboxRecord) -> v1::PodSandboxStatus {
    v1::PodSandboxStatus {
        id: record.id.clone(),
        metadata: Some(pod_metadata(record)),
        state: pod_state_to_cri(record.state) as i32,
        created_at: record.created_at,
        network: record
            .ip_address
            .as_ref()
            .map(|ip| v1::PodSandboxNetworkStatus { ip: ip.clone() }),
        labels: record.labels.clone(),
        annotations: record.annotations.clone(),
        runtime_handler: String::new(),
    }
}

fn container_metadata(record: &ContainerRecord) -> v1::ContainerMetadata {
    v1::ContainerMetadata {
        name: record.name.clone(),
        attempt: 0,
    }
}

/// Convert the stored container to a CRI [`v1::Container`] for
/// `ListContainers`.
pub(crate) fn cri_container(record: &ContainerRecord) -> v1::Container {
    v1::Container {
        id: record.id.clone(),
        pod_sandbox_id: record.pod_sandbox_id.clone(),
        metadata: Some(container_metadata(record)),
        image: Some(v1::ImageSpec {
            image: record.image.clone(),
            annotations: HashMap::default(),
        }),
        image_ref: record.image_ref.clone(),
        state: container_state_to_cri(record.state) as i32,
        created_at: record.created_at,
        labels: record.labels.clone(),
        annotations: record.annotations.clone(),
    }
}

/// Convert the stored container to a CRI [`v1::ContainerStatus`].
pub(crate) fn cri_container_status(record: &ContainerRecord) -> v1::ContainerStatus {
    v1::ContainerStatus {
        id: record.id.clone(),
        metadata: Some(container_metadata(record)),
        state: container_state_to_cri(record.state) as i32,
        created_at: record.created_at,
        started_at: record.started_at,
        finished_at: record.finished_at,
        exit_code: record.exit_code,
        image: Some(v1::ImageSpec {
            image: record.image.clone(),
            annotations: HashMap::default(),
        }),
        image_ref: record.image_ref.clone(),
        reason: match record.state {
            ContainerState::Exited if record.exit_code == 0 => String::from("Completed"),
            ContainerState::Exited => String::from("Error"),
            _ => String::new(),
        },
        message: String::new(),
        labels: record.labels.clone(),
        annotations: record.annotations.clone(),
        mounts: Vec::new(),
        log_path: record.log_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{new_id, now};
    use std::collections::BTreeMap;

    #[test]
    fn pod_states_collapse_to_readiness() {
        assert_eq!(
            pod_state_to_cri(PodSandboxState::Ready),
            v1::PodSandboxState::SandboxReady,
        );
        assert_eq!(
            pod_state_to_cri(PodSandboxState::NotReady),
            v1::PodSandboxState::SandboxNotready,
        );
        assert_eq!(
            pod_state_to_cri(PodSandboxState::Created),
            v1::PodSandboxState::SandboxNotready,
        );
    }

    #[test]
    fn pod_status_reports_the_assigned_ip() {
        let mut record = PodSandboxRecord {
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
        };

        let status = cri_pod_sandbox_status(&record);
        assert_eq!(status.network.unwrap().ip, "10.88.0.7");

        record.ip_address = None;
        assert!(cri_pod_sandbox_status(&record).network.is_none());
    }

    #[test]
    fn exited_containers_report_a_reason() {
        let mut record = ContainerRecord {
            id: new_id(),
            pod_sandbox_id: new_id(),
            name: String::from("c"),
            image: String::from("busybox:latest"),
            image_ref: String::from("sha256:0011"),
            state: ContainerState::Exited,
            created_at: now(),
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            pid: None,
            unit_name: String::from("u.service"),
            rootfs_path: String::new(),
            log_path: String::new(),
            command: Vec::new(),
            working_dir: String::new(),
            environment: Vec::new(),
            security: Default::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            unknown: BTreeMap::new(),
        };

        assert_eq!(cri_container_status(&record).reason, "Completed");
        record.exit_code = 1;
        assert_eq!(cri_container_status(&record).reason, "Error");
    }
}
