//! Pod network namespaces and CNI plugin invocation.
//!
//! The runtime creates a named network namespace per pod (a bind-mount of a
//! freshly unshared net namespace), then delegates interface wiring to a CNI
//! plugin from the configured plugin directory. The plugin contract is the
//! standard one: command via `CNI_COMMAND`, namespace via `CNI_NETNS`, and
//! the network configuration piped to standard input.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use serde::Deserialize;
use serde_json::{from_slice, json, to_vec};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Code, Result, Status};
use crate::log_error_status;

/// CNI plugin API version. The latest version supported by the stock
/// plugins at time of writing.
const CNI_VERSION: &str = "1.0.0";

/// Interface name inside each pod namespace.
const POD_INTERFACE: &str = "eth0";

/// Where named network namespaces are bind-mounted, shared with iproute2.
const NETNS_DIR: &str = "/run/netns";

/// Client that creates pod network namespaces and wires them via a CNI
/// plugin.
#[derive(Clone)]
pub struct CniDriver(Arc<CniDriverInner>);

struct CniDriverInner {
    /// Directory containing CNI plugin binaries.
    plugin_dir: PathBuf,

    /// Plugin binary name, *i.e.* the network configuration's `type`.
    plugin: String,

    /// Serialized network configuration piped to the plugin:
    /// https://www.cni.dev/docs/spec/#section-1-network-configuration-format.
    config: Vec<u8>,
}

/// Result of wiring a pod namespace.
pub struct PodNetwork {
    /// Bind-mount path of the network namespace.
    pub netns_path: String,

    /// Address the plugin assigned to the pod interface, when it reported
    /// one.
    pub ip_address: Option<IpAddr>,
}

impl CniDriver {
    pub fn new(plugin_dir: PathBuf, plugin: String, pod_cidr: &str) -> Self {
        let config = to_vec(&json!({
            "cniVersion": CNI_VERSION,
            "name": "cri",
            "type": plugin,
            "ipam": {
                "type": "host-local",
                "dataDir": "/run/cni-ipam-state",
                "ranges": [
                    [{"subnet": pod_cidr}],
                ],
            },
        }))
        // Serializing a literal cannot fail.
        .unwrap();
        CniDriver(Arc::new(CniDriverInner {
            plugin_dir,
            plugin,
            config,
        }))
    }

    /// Create and wire the network namespace for a pod.
    /// On plugin failure the namespace is removed before the error surfaces.
    pub async fn create_pod_network(&self, pod_id: &str) -> Result<PodNetwork> {
        let netns_path = netns_path(pod_id);
        create_netns(&netns_path).await?;

        let output = match self.run_plugin("ADD", pod_id, &netns_path).await {
            Ok(output) => output,
            Err(error) => {
                // Do not leak the namespace the plugin never wired.
                let _ = remove_netns(Path::new(&netns_path)).await;
                return Err(error);
            }
        };

        let ip_address = parse_plugin_address(&output);
        Ok(PodNetwork {
            netns_path,
            ip_address,
        })
    }

    /// Release the pod's addresses and remove the namespace.
    /// Removal of an already-removed network succeeds.
    pub async fn destroy_pod_network(&self, pod_id: &str, netns_path: &str) -> Result<()> {
        // DEL is best effort: the plugin state may already be gone.
        let _ = self.run_plugin("DEL", pod_id, netns_path).await;
        remove_netns(Path::new(netns_path)).await
    }

    /// Run one CNI plugin command, piping the network configuration to its
    /// standard input. On success, return standard output.
    async fn run_plugin(
        &self,
        command: &str,
        pod_id: &str,
        netns_path: impl AsRef<Path>,
    ) -> Result<Vec<u8>> {
        let mut child = Command::new(self.0.plugin_dir.join(&self.0.plugin))
            // https://www.cni.dev/docs/spec/#parameters
            // Set parameters, starting with a clean environment (no inheritance).
            .env_clear()
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", pod_id)
            .env("CNI_NETNS", netns_path.as_ref())
            .env("CNI_IFNAME", POD_INTERFACE)
            .env("CNI_PATH", &self.0.plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(log_error_status!(pod: pod_id, Code::Unavailable, "cni-spawn-failed"))?;

        // Feed the config and close stdin so the plugin can finish.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&self.0.config)
                .await
                .map_err(log_error_status!(pod: pod_id, "cni-config-pipe"))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(log_error_status!(pod: pod_id, "cni-execution-error"))?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            // Plugins report errors as JSON on standard output.
            Err(log_error_status!(pod: pod_id, "cni-plugin-error")(
                String::from_utf8_lossy(&output.stdout),
            ))
        }
    }
}

/// Path of a pod's named network namespace.
fn netns_path(pod_id: &str) -> String {
    format!("{NETNS_DIR}/cri-{pod_id}")
}

/// Create a named network namespace: unshare the net namespace on a scratch
/// thread and bind-mount that thread's namespace file to `path`.
async fn create_netns(path: &str) -> Result<()> {
    let path = PathBuf::from(path);
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(NETNS_DIR)
            .map_err(|error| Status::new(Code::Unavailable, format!("netns-dir: {error}")))?;
        // The bind target must exist before mounting over it.
        std::fs::File::create(&path)
            .map_err(|error| Status::new(Code::Unavailable, format!("netns-create: {error}")))?;

        // A dedicated thread, because unshare permanently moves the calling
        // thread into the new namespace.
        let worker = std::thread::spawn(move || -> Result<()> {
            unshare(CloneFlags::CLONE_NEWNET)
                .map_err(|errno| Status::new(Code::Internal, format!("netns-unshare: {errno}")))?;
            mount(
                Some("/proc/thread-self/ns/net"),
                &path,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|errno| Status::new(Code::Internal, format!("netns-bind: {errno}")))
        });
        worker
            .join()
            .unwrap_or_else(|_| Err(Status::new(Code::Internal, "netns-thread-panicked")))
    })
    .await
    .unwrap_or_else(|_| Err(Status::new(Code::Internal, "netns-task-panicked")))
}

/// Unmount and unlink a named network namespace. Idempotent.
async fn remove_netns(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        match umount2(&path, MntFlags::MNT_DETACH) {
            Ok(()) => {}
            // Not mounted: fine, still unlink the file below.
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
            Err(errno) => {
                return Err(Status::new(
                    Code::Internal,
                    format!("netns-unmount: {errno}"),
                ))
            }
        }
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(Status::new(
                Code::Internal,
                format!("netns-unlink: {error}"),
            )),
        }
    })
    .await
    .unwrap_or_else(|_| Err(Status::new(Code::Internal, "netns-task-panicked")))
}

/// Used to parse the JSON result of the plugin for the `ADD` command.
#[derive(Deserialize)]
struct CniAddResult {
    #[serde(default)]
    ips: Vec<CniAddResultIp>,
}

/// See [`CniAddResult`].
#[derive(Deserialize)]
struct CniAddResultIp {
    address: String,
}

/// Best-effort extraction of the first assigned address. The plugin returns
/// addresses with a prefix length (`10.0.0.7/16`).
fn parse_plugin_address(output: &[u8]) -> Option<IpAddr> {
    let result: CniAddResult = from_slice(output).ok()?;
    let cidr = &result.ips.first()?.address;
    cidr.split('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_addresses_parse_with_prefix_length() {
        let output = br#"{"cniVersion":"1.0.0","ips":[{"address":"10.88.0.7/16"}]}"#;

        assert_eq!(
            parse_plugin_address(output),
            Some("10.88.0.7".parse().unwrap()),
        );
    }

    #[test]
    fn missing_addresses_are_tolerated() {
        assert_eq!(parse_plugin_address(br#"{"cniVersion":"1.0.0"}"#), None);
        assert_eq!(parse_plugin_address(b"not json"), None);
    }

    #[test]
    fn netns_paths_are_per_pod() {
        assert_eq!(netns_path("abc123"), "/run/netns/cri-abc123");
        assert_ne!(netns_path("a"), netns_path("b"));
    }
}
