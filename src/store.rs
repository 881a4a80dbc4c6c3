//! Durable, crash-safe state store.
//!
//! Backed by an LSM key-value store with three prefixed keyspaces:
//!
//! | Prefix     | Key                      | Value                  |
//! |------------|--------------------------|------------------------|
//! | `pod/`     | pod id                   | serialized pod record  |
//! | `ctr/`     | container id             | serialized container   |
//! | `pod_ctr/` | pod id `/` container id  | empty                  |
//!
//! Every mutating operation commits a single write batch, so readers observe
//! either the pre- or post-state, never an intermediate. Listings iterate a
//! snapshot and are never partial under concurrent writes.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use crate::error::{Code, Result, Status};
use crate::state::{
    container_transition_allowed, pod_transition_allowed, ContainerRecord, PodSandboxRecord,
};

const POD_KEYSPACE: &str = "pod/";
const CONTAINER_KEYSPACE: &str = "ctr/";
const POD_CONTAINER_KEYSPACE: &str = "pod_ctr/";

/// Handle to the store. Cheap to clone; safe to share across tasks.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<DB>,
}

impl StateStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)
            .map_err(|error| Status::new(Code::Unavailable, format!("store-open: {error}")))?;
        Ok(StateStore { db: Arc::new(db) })
    }

    fn pod_key(id: &str) -> Vec<u8> {
        format!("{POD_KEYSPACE}{id}").into_bytes()
    }

    fn container_key(id: &str) -> Vec<u8> {
        format!("{CONTAINER_KEYSPACE}{id}").into_bytes()
    }

    fn index_key(pod_id: &str, container_id: &str) -> Vec<u8> {
        format!("{POD_CONTAINER_KEYSPACE}{pod_id}/{container_id}").into_bytes()
    }

    fn index_prefix(pod_id: &str) -> Vec<u8> {
        format!("{POD_CONTAINER_KEYSPACE}{pod_id}/").into_bytes()
    }

    /// Write (or rewrite) a pod record. Lifecycle transitions are validated
    /// against the stored row; out-of-machine writes are rejected.
    pub fn save_pod(&self, pod: &PodSandboxRecord) -> Result<()> {
        if let Some(existing) = self.read_pod(&pod.id)? {
            if !pod_transition_allowed(existing.state, pod.state) {
                return Err(Status::new(
                    Code::FailedPrecondition,
                    "pod-state-transition",
                ));
            }
        }
        let encoded = encode(pod)?;
        let mut batch = WriteBatch::default();
        batch.put(Self::pod_key(&pod.id), encoded);
        self.commit(batch)
    }

    pub fn load_pod(&self, id: &str) -> Result<PodSandboxRecord> {
        self.read_pod(id)?
            .ok_or_else(|| Status::new(Code::NotFound, "pod-not-found"))
    }

    fn read_pod(&self, id: &str) -> Result<Option<PodSandboxRecord>> {
        match self.get(&Self::pod_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write (or rewrite) a container record.
    ///
    /// Referential integrity is enforced here: the owning pod must exist.
    /// The row and its secondary-index entry commit in one batch.
    pub fn save_container(&self, container: &ContainerRecord) -> Result<()> {
        self.load_pod(&container.pod_sandbox_id)
            .map_err(|_| Status::new(Code::FailedPrecondition, "container-pod-missing"))?;
        container.validate_timestamps()?;
        if let Some(existing) = self.read_container(&container.id)? {
            if !container_transition_allowed(existing.state, container.state) {
                return Err(Status::new(
                    Code::FailedPrecondition,
                    "container-state-transition",
                ));
            }
        }
        let encoded = encode(container)?;
        let mut batch = WriteBatch::default();
        batch.put(Self::container_key(&container.id), encoded);
        batch.put(
            Self::index_key(&container.pod_sandbox_id, &container.id),
            Vec::new(),
        );
        self.commit(batch)
    }

    pub fn load_container(&self, id: &str) -> Result<ContainerRecord> {
        self.read_container(id)?
            .ok_or_else(|| Status::new(Code::NotFound, "container-not-found"))
    }

    fn read_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
        match self.get(&Self::container_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Atomically remove a pod, its index entries, and every container the
    /// index references. `NotFound` if the pod row is absent before the
    /// batch.
    pub fn delete_pod(&self, id: &str) -> Result<()> {
        if self.get(&Self::pod_key(id))?.is_none() {
            return Err(Status::new(Code::NotFound, "pod-not-found"));
        }

        let mut batch = WriteBatch::default();
        batch.delete(Self::pod_key(id));
        for key in self.scan_keys(&Self::index_prefix(id))? {
            // pod_ctr/<pod>/<container>
            if let Some(container_id) = key.rsplit('/').next() {
                batch.delete(Self::container_key(container_id));
            }
            batch.delete(key.into_bytes());
        }
        self.commit(batch)
    }

    /// Atomically remove a container row and its index entry.
    pub fn delete_container(&self, id: &str) -> Result<()> {
        let container = self.load_container(id)?;
        let mut batch = WriteBatch::default();
        batch.delete(Self::container_key(id));
        batch.delete(Self::index_key(&container.pod_sandbox_id, id));
        self.commit(batch)
    }

    pub fn list_pods(&self) -> Result<Vec<PodSandboxRecord>> {
        self.scan_values(POD_KEYSPACE.as_bytes())
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        self.scan_values(CONTAINER_KEYSPACE.as_bytes())
    }

    /// Containers of one pod, resolved through the secondary index against a
    /// single snapshot.
    pub fn list_containers_for_pod(&self, pod_id: &str) -> Result<Vec<ContainerRecord>> {
        let snapshot = self.db.snapshot();
        let prefix = Self::index_prefix(pod_id);
        let mut containers = Vec::new();
        for entry in snapshot.iterator(IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = entry
                .map_err(|error| Status::new(Code::Unavailable, format!("store-scan: {error}")))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let key = String::from_utf8_lossy(&key);
            let Some(container_id) = key.rsplit('/').next() else {
                continue;
            };
            // Read the row through the same snapshot the index scan uses.
            let Some(bytes) = snapshot
                .get(Self::container_key(container_id))
                .map_err(|error| Status::new(Code::Unavailable, format!("store-read: {error}")))?
            else {
                // An index entry without a row would mean a torn batch.
                return Err(Status::new(Code::Internal, "store-index-dangling"));
            };
            containers.push(decode(&bytes)?);
        }
        Ok(containers)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|error| Status::new(Code::Unavailable, format!("store-read: {error}")))
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|error| Status::new(Code::Unavailable, format!("store-write: {error}")))
    }

    fn scan_keys(&self, prefix: &[u8]) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = entry
                .map_err(|error| Status::new(Code::Unavailable, format!("store-scan: {error}")))?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    fn scan_values<T: serde::de::DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        let snapshot = self.db.snapshot();
        let mut values = Vec::new();
        for entry in snapshot.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = entry
                .map_err(|error| Status::new(Code::Unavailable, format!("store-scan: {error}")))?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }
}

fn encode<T: serde::Serialize>(record: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|_| Status::new(Code::Internal, "record-encoding"))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    // A row that no longer decodes means store corruption.
    serde_json::from_slice(bytes).map_err(|_| Status::new(Code::Internal, "record-decoding"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{new_id, now, ContainerState, PodSandboxState};
    use std::collections::{BTreeMap, HashMap};

    fn pod(id: &str) -> PodSandboxRecord {
        PodSandboxRecord {
            id: String::from(id),
            name: String::from("p1"),
            namespace: String::from("default"),
            uid: String::from("u1"),
            state: PodSandboxState::Ready,
            created_at: now(),
            unit_name: format!("cri-pod-{id}.scope"),
            network_namespace: None,
            ip_address: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            unknown: BTreeMap::new(),
        }
    }

    fn container(id: &str, pod_id: &str) -> ContainerRecord {
        ContainerRecord {
            id: String::from(id),
            pod_sandbox_id: String::from(pod_id),
            name: String::from("c"),
            image: String::from("busybox:latest"),
            image_ref: String::from("sha256:0011"),
            state: ContainerState::Created,
            created_at: now(),
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            pid: None,
            unit_name: format!("cri-container-{id}.service"),
            rootfs_path: String::from("/tmp/rootfs"),
            log_path: String::from("/tmp/c.log"),
            command: vec![String::from("/bin/true")],
            working_dir: String::new(),
            environment: Vec::new(),
            security: Default::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            unknown: BTreeMap::new(),
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::open(dir.path()).unwrap()
    }

    #[test]
    fn load_absent_pod_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let error = store.load_pod("missing").unwrap_err();
        assert_eq!(error.code(), Code::NotFound);
    }

    #[test]
    fn pod_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let record = pod(&new_id());

        store.save_pod(&record).unwrap();
        assert_eq!(store.load_pod(&record.id).unwrap(), record);
    }

    #[test]
    fn container_requires_extant_pod() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let orphan = container(&new_id(), "no-such-pod");
        let error = store.save_container(&orphan).unwrap_err();
        assert_eq!(error.code(), Code::FailedPrecondition);
    }

    #[test]
    fn delete_pod_removes_index_and_containers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let p = pod(&new_id());
        store.save_pod(&p).unwrap();
        let c1 = container(&new_id(), &p.id);
        let c2 = container(&new_id(), &p.id);
        store.save_container(&c1).unwrap();
        store.save_container(&c2).unwrap();

        store.delete_pod(&p.id).unwrap();

        assert_eq!(store.load_pod(&p.id).unwrap_err().code(), Code::NotFound);
        assert!(store.list_containers_for_pod(&p.id).unwrap().is_empty());
        assert_eq!(
            store.load_container(&c1.id).unwrap_err().code(),
            Code::NotFound,
        );
        assert_eq!(
            store.load_container(&c2.id).unwrap_err().code(),
            Code::NotFound,
        );
    }

    #[test]
    fn delete_absent_pod_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.delete_pod("missing").unwrap_err().code(), Code::NotFound);
    }

    #[test]
    fn delete_container_keeps_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let p = pod(&new_id());
        store.save_pod(&p).unwrap();
        let c1 = container(&new_id(), &p.id);
        let c2 = container(&new_id(), &p.id);
        store.save_container(&c1).unwrap();
        store.save_container(&c2).unwrap();

        store.delete_container(&c1.id).unwrap();

        let remaining = store.list_containers_for_pod(&p.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, c2.id);
    }

    #[test]
    fn out_of_machine_writes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut p = pod(&new_id());
        p.state = PodSandboxState::NotReady;
        store.save_pod(&p).unwrap();

        p.state = PodSandboxState::Ready;
        let error = store.save_pod(&p).unwrap_err();
        assert_eq!(error.code(), Code::FailedPrecondition);
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut written = Vec::new();
        {
            let store = open_store(&dir);
            for _ in 0..5 {
                let record = pod(&new_id());
                store.save_pod(&record).unwrap();
                written.push(record);
            }
        }

        let store = open_store(&dir);
        let mut listed = store.list_pods().unwrap();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        written.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(listed.len(), 5);
        assert_eq!(listed, written);
        for record in &written {
            assert_eq!(&store.load_pod(&record.id).unwrap(), record);
        }
    }
}
