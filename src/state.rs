//! Durable records for pod sandboxes and containers.
//!
//! Records are serialized as self-describing JSON with tagged fields, so new
//! fields can be added without breaking older rows. Fields unknown to this
//! build are captured on read and re-emitted on write.
//!
//! State transitions are validated on every store write; a write that does
//! not follow the lifecycle machines below is rejected before it reaches
//! disk.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Code, Result, Status};

/// Pod sandbox lifecycle.
///
/// Pods follow a simple linear lifecycle:
///     created → ready → not-ready → (removed)
/// with `created → not-ready` covering a failed bring-up. Removal deletes the
/// row instead of writing a terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PodSandboxState {
    Created,
    Ready,
    NotReady,
}

/// Container lifecycle.
///
/// Containers follow:
///     created → running → exited → (removed)
/// Any state may degrade to `unknown` when the backing unit vanishes
/// externally.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

/// True iff a stored pod may be rewritten from `from` to `to`.
/// Same-state writes are allowed (metadata updates).
pub fn pod_transition_allowed(from: PodSandboxState, to: PodSandboxState) -> bool {
    use PodSandboxState::*;
    match (from, to) {
        (a, b) if a == b => true,
        (Created, Ready) | (Created, NotReady) | (Ready, NotReady) => true,
        _ => false,
    }
}

/// True iff a stored container may be rewritten from `from` to `to`.
/// Same-state writes are allowed (metadata updates).
pub fn container_transition_allowed(from: ContainerState, to: ContainerState) -> bool {
    use ContainerState::*;
    match (from, to) {
        (a, b) if a == b => true,
        (Created, Running) | (Running, Exited) => true,
        // The backing unit can vanish under any state.
        (_, Unknown) => true,
        // A container found in limbo may still be observed to have exited.
        (Unknown, Exited) => true,
        _ => false,
    }
}

/// All information known about a pod sandbox throughout its lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PodSandboxRecord {
    /// 128-bit random id, lowercase hex.
    pub id: String,

    /// K8s pod name. Must be returned as-is for status requests.
    pub name: String,

    /// K8s namespace.
    pub namespace: String,

    /// K8s pod UID.
    pub uid: String,

    pub state: PodSandboxState,

    /// Creation timestamp in nanoseconds. Must be > 0.
    pub created_at: i64,

    /// The transient scope unit grouping this pod's containers.
    pub unit_name: String,

    /// Bind-mount path of the pod's network namespace, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_namespace: Option<String>,

    /// Address the CNI plugin assigned to the pod interface, reported back
    /// to Kubelet in status responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Fields written by a newer build; preserved verbatim.
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: BTreeMap<String, JsonValue>,
}

/// Host device a container may access, with its cgroup permission string
/// (some combination of `r`, `w`, `m`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceAccess {
    pub host_path: String,
    pub permissions: String,
}

/// The slice of the CRI security context this runtime realizes as unit
/// properties.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Numeric uid the container process runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,

    /// Capabilities added to / dropped from the bounding set.
    /// `ALL` in the drop list empties the set before additions apply.
    #[serde(default)]
    pub add_capabilities: Vec<String>,

    #[serde(default)]
    pub drop_capabilities: Vec<String>,

    #[serde(default)]
    pub no_new_privs: bool,

    /// Devices allowed through the unit's device policy.
    #[serde(default)]
    pub device_allow: Vec<DeviceAccess>,
}

/// All information known about a container throughout its lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// 128-bit random id, lowercase hex.
    pub id: String,

    /// Owning pod. Referential integrity is enforced on every write.
    pub pod_sandbox_id: String,

    /// Container name, unique within its pod.
    pub name: String,

    /// Image reference as requested by Kubelet.
    pub image: String,

    /// Resolved image digest.
    pub image_ref: String,

    pub state: ContainerState,

    /// Timestamps in nanoseconds. `created_at` is always > 0; the others are
    /// zero until the corresponding transition happens.
    pub created_at: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: i64,

    #[serde(default)]
    pub exit_code: i32,

    /// Main pid while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// The transient service unit realizing this container.
    pub unit_name: String,

    /// Mounted overlay root.
    pub rootfs_path: String,

    pub log_path: String,

    /// Full argv (entrypoint plus arguments).
    pub command: Vec<String>,

    #[serde(default)]
    pub working_dir: String,

    #[serde(default)]
    pub environment: Vec<(String, String)>,

    #[serde(default)]
    pub security: SecurityContext,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Fields written by a newer build; preserved verbatim.
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: BTreeMap<String, JsonValue>,
}

impl ContainerRecord {
    /// Enforce `created_at < started_at ≤ finished_at` for the nonzero
    /// fields.
    pub fn validate_timestamps(&self) -> Result<()> {
        if self.created_at <= 0 {
            return Err(Status::new(Code::Internal, "container-created-at-zero"));
        }
        if self.started_at != 0 && self.started_at <= self.created_at {
            return Err(Status::new(Code::Internal, "container-timestamp-order"));
        }
        if self.finished_at != 0 {
            let floor = if self.started_at != 0 {
                self.started_at
            } else {
                self.created_at
            };
            if self.finished_at < floor {
                return Err(Status::new(Code::Internal, "container-timestamp-order"));
            }
        }
        Ok(())
    }
}

/// Generate a fresh 128-bit random id rendered as lowercase hex.
pub fn new_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

// Return non-leap nanoseconds since 1970-01-01 00:00:00 UTC+0 as `i64`.
// Return zero if executed before 1970. Wraps around in 2262.
pub fn now() -> i64 {
    (SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
        % (i64::MAX as u64)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(state: ContainerState) -> ContainerRecord {
        ContainerRecord {
            id: new_id(),
            pod_sandbox_id: new_id(),
            name: String::from("c"),
            image: String::from("busybox:latest"),
            image_ref: String::from("sha256:0000"),
            state,
            created_at: 100,
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            pid: None,
            unit_name: String::from("cri-container-x.service"),
            rootfs_path: String::from("/tmp/rootfs"),
            log_path: String::from("/tmp/c.log"),
            command: vec![String::from("/bin/true")],
            working_dir: String::new(),
            environment: Vec::new(),
            security: SecurityContext::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            unknown: BTreeMap::new(),
        }
    }

    #[test]
    fn ids_are_lowercase_hex_128_bits() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, new_id());
    }

    #[test]
    fn pod_transitions() {
        use PodSandboxState::*;
        assert!(pod_transition_allowed(Created, Ready));
        assert!(pod_transition_allowed(Created, NotReady));
        assert!(pod_transition_allowed(Ready, NotReady));
        assert!(pod_transition_allowed(Ready, Ready));
        assert!(!pod_transition_allowed(NotReady, Ready));
        assert!(!pod_transition_allowed(Ready, Created));
    }

    #[test]
    fn container_transitions() {
        use ContainerState::*;
        assert!(container_transition_allowed(Created, Running));
        assert!(container_transition_allowed(Running, Exited));
        assert!(container_transition_allowed(Running, Unknown));
        assert!(container_transition_allowed(Unknown, Exited));
        assert!(!container_transition_allowed(Created, Exited));
        assert!(!container_transition_allowed(Exited, Running));
        assert!(!container_transition_allowed(Exited, Created));
    }

    #[test]
    fn timestamp_order_is_enforced() {
        let mut record = container(ContainerState::Running);
        record.started_at = 200;
        assert!(record.validate_timestamps().is_ok());

        record.finished_at = 150;
        assert!(record.validate_timestamps().is_err());

        record.finished_at = 200;
        assert!(record.validate_timestamps().is_ok());

        record.started_at = 50;
        assert!(record.validate_timestamps().is_err());
    }

    #[test]
    fn unknown_fields_round_trip() {
        let encoded = r#"{
            "id": "00112233445566778899aabbccddeeff",
            "name": "p1",
            "namespace": "default",
            "uid": "u1",
            "state": "ready",
            "created_at": 42,
            "unit_name": "cri-pod-x.scope",
            "labels": {},
            "annotations": {},
            "novel_field": {"nested": [1, 2, 3]}
        }"#;

        let record: PodSandboxRecord = serde_json::from_str(encoded).unwrap();
        assert_eq!(record.unknown.len(), 1);

        let reencoded = serde_json::to_string(&record).unwrap();
        assert!(reencoded.contains("novel_field"));
        assert!(reencoded.contains("nested"));
    }
}
