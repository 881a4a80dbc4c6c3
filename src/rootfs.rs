//! Per-container root filesystem assembly.
//!
//! Each container gets a writable overlay root composed from the image's
//! layer directories:
//!
//! - `lowerdir`: the layer directories, bottom→top in manifest order.
//! - `upperdir`, `workdir`: `<state_dir>/containers/<id>/{upper,work}`,
//!   always on the same filesystem.
//! - mounted at `<state_dir>/containers/<id>/rootfs` with `nosuid,nodev`.
//!
//! Before any overlay mount the container directory is made a private mount
//! so nothing propagates to the host namespace. Teardown reverses the order:
//! overlay, then the private self-bind, then the directory tree. A busy
//! overlay gets a bounded number of clean unmount attempts before falling
//! back to a lazy detach.
//!
//! All functions here block; lifecycle managers call them through
//! `spawn_blocking`.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::error::{Code, Result, Status};

/// Clean unmount attempts before escalating to a lazy detach.
const UNMOUNT_RETRIES: u32 = 5;

/// Pause between clean unmount attempts.
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Assembles and tears down container root filesystems under
/// `<state_dir>/containers`.
#[derive(Clone)]
pub struct RootfsAssembler {
    containers_dir: PathBuf,
}

impl RootfsAssembler {
    pub fn new(state_dir: &Path) -> Self {
        RootfsAssembler {
            containers_dir: state_dir.join("containers"),
        }
    }

    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.containers_dir.join(container_id)
    }

    /// Compose the overlay for a container and return the mounted root path.
    pub fn assemble(&self, container_id: &str, lower_dirs: &[PathBuf]) -> Result<PathBuf> {
        if lower_dirs.is_empty() {
            return Err(Status::new(Code::Internal, "rootfs-no-layers"));
        }

        let container_dir = self.container_dir(container_id);
        let upper = container_dir.join("upper");
        let work = container_dir.join("work");
        let rootfs = container_dir.join("rootfs");
        for dir in [&upper, &work, &rootfs] {
            fs::create_dir_all(dir)
                .map_err(|error| Status::new(Code::Unavailable, format!("rootfs-dirs: {error}")))?;
        }

        ensure_private(&container_dir)?;

        let options = overlay_options(lower_dirs, &upper, &work);
        mount(
            Some("overlay"),
            &rootfs,
            Some("overlay"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(options.as_str()),
        )
        .map_err(|errno| Status::new(Code::Internal, format!("rootfs-mount: {errno}")))?;

        Ok(rootfs)
    }

    /// Unmount and remove a container's filesystem tree.
    /// Safe to call when nothing is mounted.
    pub fn teardown(&self, container_id: &str) -> Result<()> {
        let container_dir = self.container_dir(container_id);
        if !container_dir.exists() {
            return Ok(());
        }

        unmount_with_escalation(&container_dir.join("rootfs"))?;
        unmount_with_escalation(&container_dir)?;

        fs::remove_dir_all(&container_dir)
            .map_err(|error| Status::new(Code::Internal, format!("rootfs-remove: {error}")))
    }
}

/// Make `dir` a mount point with private propagation, so overlay mounts
/// inside it never reach the host namespace.
fn ensure_private(dir: &Path) -> Result<()> {
    // MS_PRIVATE needs a mount point; self-bind if the directory is not one.
    if !is_mount_point(dir, &read_mountinfo()?) {
        mount(
            Some(dir),
            dir,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|errno| Status::new(Code::Internal, format!("rootfs-bind: {errno}")))?;
    }
    mount(
        None::<&str>,
        dir,
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|errno| Status::new(Code::Internal, format!("rootfs-private: {errno}")))
}

/// Clean unmount with bounded retries on EBUSY, then a lazy detach.
fn unmount_with_escalation(target: &Path) -> Result<()> {
    if !is_mount_point(target, &read_mountinfo()?) {
        return Ok(());
    }

    for attempt in 0..UNMOUNT_RETRIES {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => return Ok(()),
            Err(Errno::EBUSY) => {
                if attempt + 1 < UNMOUNT_RETRIES {
                    sleep(UNMOUNT_RETRY_DELAY);
                }
            }
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => return Ok(()),
            Err(errno) => {
                return Err(Status::new(
                    Code::Internal,
                    format!("rootfs-unmount: {errno}"),
                ))
            }
        }
    }

    umount2(target, MntFlags::MNT_DETACH)
        .map_err(|errno| Status::new(Code::Internal, format!("rootfs-detach: {errno}")))
}

/// Overlay mount data string: lower layers colon-joined bottom→top.
fn overlay_options(lower_dirs: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lower = lower_dirs
        .iter()
        .map(|dir| dir.to_string_lossy().into_owned())
        .collect::<Vec<String>>()
        .join(":");
    format!(
        "lowerdir={lower},upperdir={},workdir={}",
        upper.to_string_lossy(),
        work.to_string_lossy(),
    )
}

fn read_mountinfo() -> Result<String> {
    fs::read_to_string("/proc/self/mountinfo")
        .map_err(|error| Status::new(Code::Internal, format!("rootfs-mountinfo: {error}")))
}

/// True iff `path` appears as a mount point in the given
/// `/proc/self/mountinfo` content (field five of each line).
pub fn is_mount_point(path: &Path, mountinfo: &str) -> bool {
    let needle = path.to_string_lossy();
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|mount_point| mount_point == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
25 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw
96 25 0:42 / /var/lib/systemd-cri/containers/abc/rootfs rw,nosuid,nodev - overlay overlay rw,lowerdir=/l,upperdir=/u,workdir=/w
97 25 8:2 /var/lib/systemd-cri/containers/abc /var/lib/systemd-cri/containers/abc rw,relatime - ext4 /dev/sda2 rw
";

    #[test]
    fn overlay_options_join_lower_dirs_in_order() {
        let lower = vec![PathBuf::from("/images/base"), PathBuf::from("/images/app")];
        let options = overlay_options(
            &lower,
            Path::new("/state/containers/x/upper"),
            Path::new("/state/containers/x/work"),
        );

        let expected = concat!(
            "lowerdir=/images/base:/images/app,",
            "upperdir=/state/containers/x/upper,",
            "workdir=/state/containers/x/work",
        );
        assert_eq!(options, expected);
    }

    #[test]
    fn mountinfo_detects_mount_points() {
        let mounted = Path::new("/var/lib/systemd-cri/containers/abc/rootfs");
        let bound = Path::new("/var/lib/systemd-cri/containers/abc");
        let absent = Path::new("/var/lib/systemd-cri/containers/zzz/rootfs");

        assert!(is_mount_point(mounted, MOUNTINFO));
        assert!(is_mount_point(bound, MOUNTINFO));
        assert!(!is_mount_point(absent, MOUNTINFO));
    }

    #[test]
    fn assemble_rejects_empty_layer_list() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = RootfsAssembler::new(dir.path());

        let error = assembler.assemble("abc", &[]).unwrap_err();
        assert_eq!(error.message(), "rootfs-no-layers");
    }

    #[test]
    fn teardown_of_unknown_container_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = RootfsAssembler::new(dir.path());

        assert!(assembler.teardown("never-created").is_ok());
    }
}
