//! Content-addressed image storage.
//!
//! Layout rooted at `<state_dir>/images`:
//! - `blobs/<digest>`: blobs keyed by `sha256:<hex>`, stored only after the
//!   checksum verifies. Writes go to a `.tmp` sibling, are fsynced, then
//!   renamed into place.
//! - `refs/<escaped-ref>`: symbolic reference index; file content is the
//!   manifest digest.
//! - `manifests/<digest>`: manifest JSON, parsed to enumerate layers.
//! - `machines/<digest>`: machined-reported root path of the imported tree.
//! - `scratch/`: per-pull working directories.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Code, Result, Status};

const BLOBS_DIR: &str = "blobs";
const REFS_DIR: &str = "refs";
const MANIFESTS_DIR: &str = "manifests";
const MACHINES_DIR: &str = "machines";
const SCRATCH_DIR: &str = "scratch";

/// An OCI content descriptor, as found in manifests.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// The subset of an OCI image manifest this runtime consumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// A locally stored image, as reported to Kubelet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredImage {
    /// Manifest digest.
    pub id: String,
    /// References resolving to this digest.
    pub repo_tags: Vec<String>,
    /// Total layer bytes.
    pub size: u64,
    /// Where the unpacked tree lives once machined imported it.
    pub rootfs_path: Option<String>,
}

/// Directory-backed store. Cheap to clone.
#[derive(Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Open (and create, if needed) the store under `root`.
    pub fn open(root: PathBuf) -> Result<Self> {
        for dir in [BLOBS_DIR, REFS_DIR, MANIFESTS_DIR, MACHINES_DIR, SCRATCH_DIR] {
            fs::create_dir_all(root.join(dir))
                .map_err(|error| Status::new(Code::Unavailable, format!("image-store: {error}")))?;
        }
        Ok(ImageStore { root })
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest)
    }

    fn ref_path(&self, reference: &str) -> PathBuf {
        self.root.join(REFS_DIR).join(escape_ref(reference))
    }

    fn manifest_path(&self, digest: &str) -> PathBuf {
        self.root.join(MANIFESTS_DIR).join(digest)
    }

    fn machine_path_file(&self, digest: &str) -> PathBuf {
        self.root.join(MACHINES_DIR).join(digest)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store a blob, rejecting content whose checksum does not match the
    /// claimed digest.
    pub fn store_blob(&self, digest: &str, bytes: &[u8]) -> Result<()> {
        let computed = sha256_digest(bytes);
        if computed != digest {
            return Err(Status::new(Code::Internal, "digest-mismatch"));
        }
        durable_write(&self.blob_path(digest), bytes)
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest))
            .map_err(|_| Status::new(Code::NotFound, "blob-not-found"))
    }

    /// Record `reference → digest` in the symbolic index.
    pub fn put_ref(&self, reference: &str, digest: &str) -> Result<()> {
        durable_write(&self.ref_path(reference), digest.as_bytes())
    }

    /// Resolve a reference to its manifest digest.
    pub fn lookup(&self, reference: &str) -> Result<String> {
        let bytes = fs::read(self.ref_path(reference))
            .map_err(|_| Status::new(Code::NotFound, "image-not-found"))?;
        String::from_utf8(bytes).map_err(|_| Status::new(Code::Internal, "image-ref-corrupt"))
    }

    pub fn remove_ref(&self, reference: &str) -> Result<()> {
        match fs::remove_file(self.ref_path(reference)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(Status::new(
                Code::Unavailable,
                format!("image-store: {error}"),
            )),
        }
    }

    pub fn put_manifest(&self, digest: &str, bytes: &[u8]) -> Result<()> {
        // The manifest is also a blob; the manifests directory is the parsed
        // index of what is locally complete.
        durable_write(&self.manifest_path(digest), bytes)
    }

    pub fn read_manifest(&self, digest: &str) -> Result<Manifest> {
        let bytes = fs::read(self.manifest_path(digest))
            .map_err(|_| Status::new(Code::NotFound, "manifest-not-found"))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| Status::new(Code::Internal, "manifest-corrupt"))
    }

    pub fn put_machine_path(&self, digest: &str, path: &str) -> Result<()> {
        durable_write(&self.machine_path_file(digest), path.as_bytes())
    }

    pub fn machine_path(&self, digest: &str) -> Result<String> {
        let bytes = fs::read(self.machine_path_file(digest))
            .map_err(|_| Status::new(Code::NotFound, "machine-path-not-found"))?;
        String::from_utf8(bytes).map_err(|_| Status::new(Code::Internal, "machine-path-corrupt"))
    }

    /// True iff every artifact of the digest is locally present: manifest,
    /// all layer blobs, and the machined import.
    pub fn is_complete(&self, digest: &str) -> bool {
        let Ok(manifest) = self.read_manifest(digest) else {
            return false;
        };
        manifest.layers.iter().all(|layer| self.has_blob(&layer.digest))
            && self.machine_path_file(digest).is_file()
    }

    /// All references in the symbolic index, paired with their digests.
    pub fn list_refs(&self) -> Result<Vec<(String, String)>> {
        let mut refs = Vec::new();
        let entries = fs::read_dir(self.root.join(REFS_DIR))
            .map_err(|error| Status::new(Code::Unavailable, format!("image-store: {error}")))?;
        for entry in entries {
            let entry = entry
                .map_err(|error| Status::new(Code::Unavailable, format!("image-store: {error}")))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(reference) = unescape_ref(name) else { continue };
            let digest = self.lookup(&reference)?;
            refs.push((reference, digest));
        }
        Ok(refs)
    }

    /// Enumerate stored images, one entry per distinct manifest digest.
    pub fn list(&self) -> Result<Vec<StoredImage>> {
        let mut images: Vec<StoredImage> = Vec::new();
        for (reference, digest) in self.list_refs()? {
            if let Some(image) = images.iter_mut().find(|image| image.id == digest) {
                image.repo_tags.push(reference);
                continue;
            }
            let size = self
                .read_manifest(&digest)
                .map(|manifest| manifest.layers.iter().map(|layer| layer.size).sum())
                .unwrap_or(0);
            images.push(StoredImage {
                id: digest.clone(),
                repo_tags: vec![reference],
                size,
                rootfs_path: self.machine_path(&digest).ok(),
            });
        }
        Ok(images)
    }

    /// References currently resolving to `digest`.
    pub fn refs_for(&self, digest: &str) -> Result<Vec<String>> {
        Ok(self
            .list_refs()?
            .into_iter()
            .filter(|(_, d)| d == digest)
            .map(|(reference, _)| reference)
            .collect())
    }

    /// Drop every local artifact of a digest. The machined image itself is
    /// removed by the caller over the bus.
    pub fn remove_image(&self, digest: &str) -> Result<()> {
        for reference in self.refs_for(digest)? {
            self.remove_ref(&reference)?;
        }
        if let Ok(manifest) = self.read_manifest(digest) {
            for layer in &manifest.layers {
                let _ = fs::remove_file(self.blob_path(&layer.digest));
            }
            let _ = fs::remove_file(self.blob_path(&manifest.config.digest));
        }
        let _ = fs::remove_file(self.blob_path(digest));
        let _ = fs::remove_file(self.manifest_path(digest));
        let _ = fs::remove_file(self.machine_path_file(digest));
        Ok(())
    }

    /// A fresh scratch directory for one pull.
    pub fn scratch_dir(&self, token: &str) -> Result<PathBuf> {
        let dir = self.root.join(SCRATCH_DIR).join(token);
        fs::create_dir_all(&dir)
            .map_err(|error| Status::new(Code::Unavailable, format!("image-store: {error}")))?;
        Ok(dir)
    }

    /// Total bytes of stored blobs, for `ImageFsInfo`.
    pub fn blob_bytes(&self) -> u64 {
        let Ok(entries) = fs::read_dir(self.root.join(BLOBS_DIR)) else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// `sha256:<hex>` of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Write via a temporary sibling, fsync, then rename into place.
fn durable_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|error| Status::new(Code::Unavailable, format!("image-store: {error}")))
}

/// Escape a reference for use as a file name. Reversible: bytes outside
/// `[A-Za-z0-9._-]` are percent-encoded.
fn escape_ref(reference: &str) -> String {
    let mut escaped = String::with_capacity(reference.len());
    for byte in reference.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                escaped.push(byte as char)
            }
            other => escaped.push_str(&format!("%{other:02X}")),
        }
    }
    escaped
}

fn unescape_ref(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut reference = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = bytes.get(index + 1..index + 3)?;
            let byte = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
            reference.push(byte);
            index += 3;
        } else {
            reference.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(reference).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> ImageStore {
        ImageStore::open(dir.path().join("images")).unwrap()
    }

    #[test]
    fn blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let bytes = b"layer contents".to_vec();
        let digest = sha256_digest(&bytes);

        assert!(!store.has_blob(&digest));
        store.store_blob(&digest, &bytes).unwrap();
        assert!(store.has_blob(&digest));
        assert_eq!(store.read_blob(&digest).unwrap(), bytes);
    }

    #[test]
    fn store_blob_rejects_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let claimed = sha256_digest(b"other bytes");

        let error = store.store_blob(&claimed, b"layer contents").unwrap_err();
        assert_eq!(error.message(), "digest-mismatch");
        assert!(!store.has_blob(&claimed));
    }

    #[test]
    fn ref_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let digest = sha256_digest(b"manifest");

        store.put_ref("gcr.io/team/app:1.0", &digest).unwrap();
        assert_eq!(store.lookup("gcr.io/team/app:1.0").unwrap(), digest);
        assert_eq!(
            store.lookup("gcr.io/team/app:2.0").unwrap_err().message(),
            "image-not-found",
        );
    }

    #[test]
    fn ref_escaping_is_reversible() {
        let inputs = vec![
            "nginx:latest",
            "gcr.io/my-project/my-image:v1.0.0",
            "registry.local:5000/team/app@sha256:abcdef",
        ];
        for input in inputs {
            assert_eq!(unescape_ref(&escape_ref(input)).as_deref(), Some(input));
        }
    }

    #[test]
    fn list_groups_tags_by_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json",
                       "digest": sha256_digest(b"config"), "size": 6},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                        "digest": sha256_digest(b"layer"), "size": 123}],
        });
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let digest = sha256_digest(&bytes);
        store.put_manifest(&digest, &bytes).unwrap();
        store.put_ref("app:1.0", &digest).unwrap();
        store.put_ref("app:stable", &digest).unwrap();

        let images = store.list().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, digest);
        assert_eq!(images[0].size, 123);
        let mut tags = images[0].repo_tags.clone();
        tags.sort();
        assert_eq!(tags, vec!["app:1.0", "app:stable"]);
    }
}
