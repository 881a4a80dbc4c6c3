//! Runtime configuration.
//!
//! Configuration is assembled from command-line flags and the service-manager
//! directory conventions (`STATE_DIRECTORY`, `RUNTIME_DIRECTORY`).

use std::env;
use std::path::PathBuf;

/// Default state directory when `STATE_DIRECTORY` is not set by the service
/// manager.
const DEFAULT_STATE_DIRECTORY: &str = "/var/lib/systemd-cri";

/// Default runtime directory when `RUNTIME_DIRECTORY` is not set by the
/// service manager.
const DEFAULT_RUNTIME_DIRECTORY: &str = "/run/systemd-cri";

/// File name of the CRI socket inside the runtime directory.
const SOCKET_FILE_NAME: &str = "cri.sock";

/// Fully resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the Unix-domain socket serving the CRI gRPC services.
    pub socket_path: PathBuf,

    /// Directory holding the state store, image store, and container
    /// root filesystems.
    pub state_dir: PathBuf,

    /// TCP port of the exec/attach/portforward streaming endpoint.
    pub streaming_port: u16,

    /// Host advertised in streaming URLs returned to Kubelet.
    pub streaming_host: String,

    /// TCP port of the Prometheus metrics endpoint.
    pub metrics_port: u16,

    /// Directory containing CNI plugin binaries.
    pub cni_plugin_dir: PathBuf,

    /// CNI plugin used to wire pod network namespaces.
    pub cni_plugin: String,

    /// CIDR from which pod addresses are allocated.
    pub pod_cidr: String,

    /// External image fetcher program.
    /// Invoked as `<fetcher> <ref> <oci-dir> <rootfs-tar>`; it must
    /// materialize an OCI image layout at `<oci-dir>` and a flattened root
    /// filesystem tarball at `<rootfs-tar>`.
    pub fetcher: PathBuf,
}

impl Config {
    /// Resolve the directory conventions against the environment.
    pub fn resolve(
        socket: Option<PathBuf>,
        state_dir: Option<PathBuf>,
        streaming_port: u16,
        streaming_host: String,
        metrics_port: u16,
        cni_plugin_dir: PathBuf,
        cni_plugin: String,
        pod_cidr: String,
        fetcher: PathBuf,
    ) -> Self {
        let runtime_dir = env::var_os("RUNTIME_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_DIRECTORY));
        let state_dir = state_dir.unwrap_or_else(|| {
            env::var_os("STATE_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIRECTORY))
        });
        let socket_path = socket.unwrap_or_else(|| runtime_dir.join(SOCKET_FILE_NAME));

        Config {
            socket_path,
            state_dir,
            streaming_port,
            streaming_host,
            metrics_port,
            cni_plugin_dir,
            cni_plugin,
            pod_cidr,
            fetcher,
        }
    }

    /// Directory of the durable key-value store.
    pub fn store_dir(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    /// Root of the image store.
    pub fn images_dir(&self) -> PathBuf {
        self.state_dir.join("images")
    }
}
