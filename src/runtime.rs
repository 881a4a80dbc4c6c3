//! Top-level runtime state: the managers and stores wired together.

use std::sync::Arc;

use crate::cni::CniDriver;
use crate::config::Config;
use crate::containers::ContainerManager;
use crate::error::{Code, Result};
use crate::images::{ImagePuller, ImageStore};
use crate::machined::MachinedImporter;
use crate::metrics::RuntimeMetrics;
use crate::pods::PodManager;
use crate::rootfs::RootfsAssembler;
use crate::state::{ContainerState, PodSandboxState};
use crate::store::StateStore;
use crate::streaming::StreamingServer;
use crate::systemd::SystemdManager;
use crate::{log_warn, log_warn_globally};

/// Everything the CRI services need, constructed once at startup.
pub struct Runtime {
    pub store: StateStore,
    pub systemd: SystemdManager,
    pub machined: MachinedImporter,
    pub images: ImageStore,
    pub puller: ImagePuller,
    pub pods: PodManager,
    pub containers: ContainerManager,
    pub streaming: StreamingServer,
    pub metrics: RuntimeMetrics,
}

impl Runtime {
    /// Open stores and wire the managers around a connected bus client.
    pub fn new(config: &Config, bus: crate::bus::BusClient) -> Result<Arc<Self>> {
        let metrics = RuntimeMetrics::new();
        let store = StateStore::open(&config.store_dir())?;
        let images = ImageStore::open(config.images_dir())?;
        let systemd = SystemdManager::new(bus.clone());
        let machined = MachinedImporter::new(bus);
        let rootfs = RootfsAssembler::new(&config.state_dir);
        let cni = CniDriver::new(
            config.cni_plugin_dir.clone(),
            config.cni_plugin.clone(),
            &config.pod_cidr,
        );

        let puller = ImagePuller::new(
            images.clone(),
            machined.clone(),
            config.fetcher.clone(),
            &metrics,
        );
        let pods = PodManager::new(
            store.clone(),
            systemd.clone(),
            cni,
            rootfs.clone(),
            metrics.clone(),
        );
        let containers = ContainerManager::new(
            store.clone(),
            systemd.clone(),
            images.clone(),
            rootfs,
            metrics.clone(),
        );
        let streaming = StreamingServer::new(
            store.clone(),
            systemd.clone(),
            config.streaming_host.clone(),
            config.streaming_port,
            &metrics,
        );

        Ok(Arc::new(Runtime {
            store,
            systemd,
            machined,
            images,
            puller,
            pods,
            containers,
            streaming,
            metrics,
        }))
    }

    /// Reconcile stored records with the live service manager after a
    /// restart: a record whose unit no longer exists degrades to NOT_READY
    /// (pods) or UNKNOWN (containers). Live workloads are left untouched.
    pub async fn recover(&self) -> Result<()> {
        let mut running_pods = 0;
        for mut pod in self.store.list_pods()? {
            if pod.state != PodSandboxState::Ready {
                continue;
            }
            match self.systemd.unit_active_state(&pod.unit_name).await {
                Ok(state) if !state.is_terminal() => running_pods += 1,
                Ok(_) => {
                    log_warn!(pod: &pod.id, "Pod scope not running after restart");
                    pod.state = PodSandboxState::NotReady;
                    self.store.save_pod(&pod)?;
                }
                Err(status) if status.code() == Code::NotFound => {
                    log_warn!(pod: &pod.id, "Pod scope gone after restart");
                    pod.state = PodSandboxState::NotReady;
                    self.store.save_pod(&pod)?;
                }
                Err(status) => {
                    log_warn_globally!("Pod reconciliation failed: {status}");
                }
            }
        }

        let mut running_containers = 0;
        for mut container in self.store.list_containers()? {
            if container.state != ContainerState::Running {
                continue;
            }
            match self.systemd.unit_active_state(&container.unit_name).await {
                Ok(state) if !state.is_terminal() => running_containers += 1,
                Ok(_) | Err(_) => {
                    log_warn!(
                        container: &container.id,
                        "Container unit gone after restart",
                    );
                    container.state = ContainerState::Unknown;
                    container.pid = None;
                    self.store.save_container(&container)?;
                }
            }
        }

        self.metrics.pods_running.set(running_pods);
        self.metrics.containers_running.set(running_containers);
        Ok(())
    }
}
