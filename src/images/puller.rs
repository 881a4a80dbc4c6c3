//! Image pull pipeline.
//!
//! A pull fetches the image with the configured external fetcher, verifies
//! every blob while it enters the content store, records the manifest and
//! reference, and hands the flattened root filesystem to machined for
//! import.
//!
//! Pulls are idempotent: when the manifest, all layer blobs, and the machined
//! import are already present, the stored digest is returned without
//! invoking the fetcher. At most one pull per normalized reference is in
//! flight; duplicate callers await the same shared future.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::result::Result as StdResult;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};
use std::time::Duration;

use futures::future::Shared;
use futures::{Future, FutureExt};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::{timeout, Instant};

use crate::error::{Code, Result, Status};
use crate::images::reference::ImageReference;
use crate::images::store::{sha256_digest, ImageStore, Manifest};
use crate::machined::MachinedImporter;
use crate::metrics::{Counter, Histogram, RuntimeMetrics};
use crate::state::new_id;
use crate::{log_error_globally, log_info_globally};

/// Whole-pipeline deadline for one pull.
const PULL_DEADLINE: Duration = Duration::from_secs(600);

/// Deadline for the machined import alone.
const IMPORT_DEADLINE: Duration = Duration::from_secs(300);

/// Registry credentials forwarded to the fetcher.
#[derive(Clone, Debug, Default)]
pub struct PullAuth {
    pub username: String,
    pub password: String,
}

type SharedPull = Shared<Pin<Box<dyn Future<Output = StdResult<String, Status>> + Send>>>;

/// Cheap to clone; all clones share the in-flight table.
#[derive(Clone)]
pub struct ImagePuller {
    inner: Arc<PullerInner>,
}

struct PullerInner {
    store: ImageStore,
    machined: MachinedImporter,
    fetcher: PathBuf,
    inflight: SyncMutex<HashMap<String, SharedPull>>,
    pulls: Counter,
    fetches: Counter,
    pull_duration: Histogram,
}

impl ImagePuller {
    pub fn new(
        store: ImageStore,
        machined: MachinedImporter,
        fetcher: PathBuf,
        metrics: &RuntimeMetrics,
    ) -> Self {
        ImagePuller {
            inner: Arc::new(PullerInner {
                store,
                machined,
                fetcher,
                inflight: SyncMutex::new(HashMap::new()),
                pulls: metrics.image_pulls_total.clone(),
                fetches: metrics.image_fetches_total.clone(),
                pull_duration: metrics.image_pull_duration_seconds.clone(),
            }),
        }
    }

    /// Pull `reference`, returning the manifest digest.
    pub async fn pull(&self, reference: &str, auth: Option<PullAuth>) -> Result<String> {
        let parsed = ImageReference::parse(reference)?;
        let normalized = parsed.normalized();
        self.inner.pulls.inc();

        // Idempotent fast path: everything already present, no fetch.
        if let Ok(digest) = self.inner.store.lookup(&normalized) {
            if self.inner.store.is_complete(&digest) {
                return Ok(digest);
            }
        }

        let (pull, leader) = {
            let mut inflight = self.inflight();
            match inflight.get(&normalized) {
                Some(existing) => (existing.clone(), false),
                None => {
                    // Spawn so the pull progresses even while no caller is
                    // polling, and share so duplicate callers subscribe.
                    let task = tokio::task::spawn(run_pull(
                        self.inner.clone(),
                        normalized.clone(),
                        auth,
                    ));
                    let pull: SharedPull = task
                        .map(|joined| match joined {
                            Ok(result) => result,
                            Err(_) => Err(Status::new(Code::Internal, "pull-task-panicked")),
                        })
                        .boxed()
                        .shared();
                    inflight.insert(normalized.clone(), pull.clone());
                    (pull, true)
                }
            }
        };

        let result = pull.await;
        if leader {
            self.inflight().remove(&normalized);
        }
        result
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, SharedPull>> {
        // A poisoned lock only means another pull task panicked; the table
        // itself is still usable.
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Top-level entry of an OCI image layout.
#[derive(Deserialize)]
struct OciIndex {
    manifests: Vec<OciIndexEntry>,
}

#[derive(Deserialize)]
struct OciIndexEntry {
    digest: String,
}

async fn run_pull(
    inner: Arc<PullerInner>,
    normalized: String,
    auth: Option<PullAuth>,
) -> StdResult<String, Status> {
    let started = Instant::now();
    let scratch = inner.store.scratch_dir(&new_id())?;
    let result = timeout(
        PULL_DEADLINE,
        run_pull_in_scratch(&inner, &normalized, auth, &scratch),
    )
    .await
    .unwrap_or_else(|_elapsed| Err(Status::new(Code::DeadlineExceeded, "image-pull-deadline")));

    // Scratch contents are worthless whether the pull succeeded or not.
    let _ = tokio::fs::remove_dir_all(&scratch).await;

    if result.is_ok() {
        inner.pull_duration.observe(started.elapsed().as_secs_f64());
        log_info_globally!(image = normalized.as_str(), "Image pull complete");
    }
    result
}

async fn run_pull_in_scratch(
    inner: &PullerInner,
    normalized: &str,
    auth: Option<PullAuth>,
    scratch: &Path,
) -> StdResult<String, Status> {
    let oci_dir = scratch.join("oci");
    let rootfs_tar = scratch.join("rootfs.tar");

    fetch(inner, normalized, auth, &oci_dir, &rootfs_tar).await?;

    // Resolve the manifest through the layout's index.
    let index_bytes = tokio::fs::read(oci_dir.join("index.json"))
        .await
        .map_err(|_| Status::new(Code::Internal, "image-layout-corrupt"))?;
    let index: OciIndex = serde_json::from_slice(&index_bytes)
        .map_err(|_| Status::new(Code::Internal, "image-layout-corrupt"))?;
    let top = index
        .manifests
        .first()
        .ok_or_else(|| Status::new(Code::Internal, "image-layout-corrupt"))?;

    let (digest, manifest_bytes, manifest) = resolve_manifest(&oci_dir, &top.digest).await?;

    // Verify and ingest every blob the manifest names.
    for descriptor in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
        let bytes = read_layout_blob(&oci_dir, &descriptor.digest).await?;
        inner.store.store_blob(&descriptor.digest, &bytes)?;
    }
    inner.store.store_blob(&digest, &manifest_bytes)?;
    inner.store.put_manifest(&digest, &manifest_bytes)?;

    // Hand the flattened tree to machined, unless a prior pull already did.
    if inner.store.machine_path(&digest).is_err() {
        let machine_name = machine_image_name(&digest);
        let tar = std::fs::File::open(&rootfs_tar)
            .map_err(|_| Status::new(Code::Unavailable, "image-fetch-failed"))?;
        inner
            .machined
            .import_tar(&tar, &machine_name, IMPORT_DEADLINE)
            .await?;
        let path = inner.machined.image_path(&machine_name).await?;
        inner.store.put_machine_path(&digest, &path)?;
    }

    inner.store.put_ref(normalized, &digest)?;
    Ok(digest)
}

/// Invoke the external fetcher:
///     <fetcher> <ref> <oci-dir> <rootfs-tar>
/// It must materialize an OCI image layout and a flattened root-filesystem
/// tarball. Credentials travel via the environment.
async fn fetch(
    inner: &PullerInner,
    normalized: &str,
    auth: Option<PullAuth>,
    oci_dir: &Path,
    rootfs_tar: &Path,
) -> StdResult<(), Status> {
    inner.fetches.inc();
    let mut command = Command::new(&inner.fetcher);
    command
        .arg(normalized)
        .arg(oci_dir)
        .arg(rootfs_tar)
        .kill_on_drop(true);
    if let Some(auth) = auth {
        command
            .env("CRI_REGISTRY_USERNAME", auth.username)
            .env("CRI_REGISTRY_PASSWORD", auth.password);
    }

    let output = command
        .output()
        .await
        .map_err(|_| Status::new(Code::Unavailable, "image-fetch-failed"))?;
    if !output.status.success() {
        log_error_globally!(
            image = normalized,
            tag = "image-fetch-failed",
            "{}",
            String::from_utf8_lossy(&output.stderr),
        );
        return Err(Status::new(Code::Unavailable, "image-fetch-failed"));
    }
    Ok(())
}

/// Read the manifest named by `digest`, descending through one level of
/// multi-platform index if the layout has one.
async fn resolve_manifest(
    oci_dir: &Path,
    digest: &str,
) -> StdResult<(String, Vec<u8>, Manifest), Status> {
    let mut digest = String::from(digest);
    for _ in 0..2 {
        let bytes = read_layout_blob(oci_dir, &digest).await?;
        if let Ok(manifest) = serde_json::from_slice::<Manifest>(&bytes) {
            return Ok((digest, bytes, manifest));
        }
        let index: OciIndex = serde_json::from_slice(&bytes)
            .map_err(|_| Status::new(Code::Internal, "manifest-corrupt"))?;
        digest = index
            .manifests
            .first()
            .ok_or_else(|| Status::new(Code::Internal, "manifest-corrupt"))?
            .digest
            .clone();
    }
    Err(Status::new(Code::Internal, "manifest-corrupt"))
}

/// Read and checksum-verify a blob from the fetched OCI layout.
async fn read_layout_blob(oci_dir: &Path, digest: &str) -> StdResult<Vec<u8>, Status> {
    let Some(hex) = digest.strip_prefix("sha256:") else {
        return Err(Status::new(Code::Internal, "digest-mismatch"));
    };
    let bytes = tokio::fs::read(oci_dir.join("blobs").join("sha256").join(hex))
        .await
        .map_err(|_| Status::new(Code::Internal, "image-layout-corrupt"))?;
    if sha256_digest(&bytes) != digest {
        return Err(Status::new(Code::Internal, "digest-mismatch"));
    }
    Ok(bytes)
}

/// Machined image name for a manifest digest.
pub fn machine_image_name(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    format!("cri-img-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_names_are_stable_per_digest() {
        let digest = format!("sha256:{}", "ef".repeat(32));
        let name = machine_image_name(&digest);

        assert_eq!(name, format!("cri-img-{}", "ef".repeat(32)));
        assert_eq!(name, machine_image_name(&digest));
    }
}
