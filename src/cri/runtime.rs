//! `RuntimeService` for the systemd-backed runtime.

use std::collections::HashMap;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{async_trait, Request, Response, Status};

use crate::api::v1;
use crate::api::v1::runtime_service_server::RuntimeService;
use crate::containers::{ContainerFilter, ContainerSettings, ResourceUpdate};
use crate::cri::{
    cri_container, cri_container_status, cri_pod_sandbox, cri_pod_sandbox_status,
    cri_state_to_container_state, require_id, TonicResult, CONDITION_NETWORK_READY,
    CONDITION_RUNTIME_READY, CONTAINER_RUNTIME_API_VERSION, CONTAINER_RUNTIME_NAME,
    CONTAINER_RUNTIME_VERSION, KUBELET_API_VERSION,
};
use crate::pods::{PodFilter, PodSandboxSettings};
use crate::runtime::Runtime;
use crate::state::{DeviceAccess, PodSandboxState, SecurityContext};

/// `ExecSync` with a zero timeout means "no timeout"; bound it anyway.
const EXEC_SYNC_DEFAULT_DEADLINE: Duration = Duration::from_secs(3600);

/// Wrapper around [`Runtime`] that implements [`RuntimeService`].
pub struct CriRuntimeService(pub Arc<Runtime>);

#[async_trait]
impl RuntimeService for CriRuntimeService {
    async fn version(
        &self,
        _request: Request<v1::VersionRequest>,
    ) -> TonicResult<v1::VersionResponse> {
        Ok(Response::new(v1::VersionResponse {
            version: String::from(KUBELET_API_VERSION),
            runtime_name: String::from(CONTAINER_RUNTIME_NAME),
            runtime_version: String::from(CONTAINER_RUNTIME_VERSION),
            runtime_api_version: String::from(CONTAINER_RUNTIME_API_VERSION),
        }))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<v1::RunPodSandboxRequest>,
    ) -> TonicResult<v1::RunPodSandboxResponse> {
        let config = request.into_inner().config.unwrap_or_default();
        let metadata = config.metadata.unwrap_or_default();
        if metadata.name.is_empty() {
            return Err(Status::invalid_argument("pod-name-empty"));
        }

        let pod_sandbox_id = self
            .0
            .pods
            .run_pod_sandbox(PodSandboxSettings {
                name: metadata.name,
                namespace: metadata.namespace,
                uid: metadata.uid,
                labels: config.labels,
                annotations: config.annotations,
            })
            .await?;

        Ok(Response::new(v1::RunPodSandboxResponse { pod_sandbox_id }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<v1::StopPodSandboxRequest>,
    ) -> TonicResult<v1::StopPodSandboxResponse> {
        let pod_sandbox_id = request.into_inner().pod_sandbox_id;
        require_id(&pod_sandbox_id, "pod-id-empty")?;

        self.0.pods.stop_pod_sandbox(&pod_sandbox_id).await?;

        Ok(Response::new(v1::StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<v1::RemovePodSandboxRequest>,
    ) -> TonicResult<v1::RemovePodSandboxResponse> {
        let pod_sandbox_id = request.into_inner().pod_sandbox_id;
        require_id(&pod_sandbox_id, "pod-id-empty")?;

        self.0.pods.remove_pod_sandbox(&pod_sandbox_id).await?;

        Ok(Response::new(v1::RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<v1::PodSandboxStatusRequest>,
    ) -> TonicResult<v1::PodSandboxStatusResponse> {
        let pod_sandbox_id = request.into_inner().pod_sandbox_id;
        require_id(&pod_sandbox_id, "pod-id-empty")?;

        let record = self.0.pods.pod_sandbox_status(&pod_sandbox_id).await?;

        Ok(Response::new(v1::PodSandboxStatusResponse {
            status: Some(cri_pod_sandbox_status(&record)),
            info: HashMap::default(),
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<v1::ListPodSandboxRequest>,
    ) -> TonicResult<v1::ListPodSandboxResponse> {
        let filter = request.into_inner().filter.unwrap_or_default();
        let filter = PodFilter {
            id: (!filter.id.is_empty()).then(|| filter.id.clone()),
            state: filter.state.map(|state| {
                if state.state == v1::PodSandboxState::SandboxReady as i32 {
                    PodSandboxState::Ready
                } else {
                    PodSandboxState::NotReady
                }
            }),
            labels: filter.label_selector,
        };

        let items = self
            .0
            .pods
            .list_pod_sandboxes(&filter)?
            .iter()
            .map(cri_pod_sandbox)
            .collect();

        Ok(Response::new(v1::ListPodSandboxResponse { items }))
    }

    async fn create_container(
        &self,
        request: Request<v1::CreateContainerRequest>,
    ) -> TonicResult<v1::CreateContainerResponse> {
        let request = request.into_inner();
        require_id(&request.pod_sandbox_id, "pod-id-empty")?;
        let config = request.config.unwrap_or_default();
        let metadata = config.metadata.unwrap_or_default();
        if metadata.name.is_empty() {
            return Err(Status::invalid_argument("container-name-empty"));
        }
        let image = config.image.unwrap_or_default();
        if image.image.is_empty() {
            return Err(Status::invalid_argument("container-image-empty"));
        }

        // Entrypoint and arguments collapse into one argv.
        let mut command = config.command;
        command.extend(config.args);

        let sandbox_config = request.sandbox_config.unwrap_or_default();
        let log_path = if config.log_path.is_empty() || sandbox_config.log_directory.is_empty() {
            String::new()
        } else {
            format!(
                "{}/{}",
                sandbox_config.log_directory.trim_end_matches('/'),
                config.log_path,
            )
        };

        let environment = config
            .envs
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();

        let context = config
            .linux
            .unwrap_or_default()
            .security_context
            .unwrap_or_default();
        let capabilities = context.capabilities.unwrap_or_default();
        let security = SecurityContext {
            run_as_user: context.run_as_user.map(|user| user.value),
            add_capabilities: capabilities.add_capabilities,
            drop_capabilities: capabilities.drop_capabilities,
            no_new_privs: context.no_new_privs,
            device_allow: config
                .devices
                .into_iter()
                .map(|device| DeviceAccess {
                    host_path: device.host_path,
                    permissions: device.permissions,
                })
                .collect(),
        };

        let container_id = self
            .0
            .containers
            .create(
                &request.pod_sandbox_id,
                ContainerSettings {
                    name: metadata.name,
                    image: image.image,
                    command,
                    working_dir: config.working_dir,
                    environment,
                    labels: config.labels,
                    annotations: config.annotations,
                    log_path,
                    security,
                },
            )
            .await?;

        Ok(Response::new(v1::CreateContainerResponse { container_id }))
    }

    async fn start_container(
        &self,
        request: Request<v1::StartContainerRequest>,
    ) -> TonicResult<v1::StartContainerResponse> {
        let container_id = request.into_inner().container_id;
        require_id(&container_id, "container-id-empty")?;

        self.0.containers.start(&container_id).await?;

        Ok(Response::new(v1::StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<v1::StopContainerRequest>,
    ) -> TonicResult<v1::StopContainerResponse> {
        let request = request.into_inner();
        require_id(&request.container_id, "container-id-empty")?;
        let grace = Duration::from_secs(request.timeout.try_into().unwrap_or(0));

        self.0.containers.stop(&request.container_id, grace).await?;

        Ok(Response::new(v1::StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<v1::RemoveContainerRequest>,
    ) -> TonicResult<v1::RemoveContainerResponse> {
        let container_id = request.into_inner().container_id;
        require_id(&container_id, "container-id-empty")?;

        self.0.containers.remove(&container_id).await?;

        Ok(Response::new(v1::RemoveContainerResponse {}))
    }

    async fn list_containers(
        &self,
        request: Request<v1::ListContainersRequest>,
    ) -> TonicResult<v1::ListContainersResponse> {
        let filter = request.into_inner().filter.unwrap_or_default();
        let filter = ContainerFilter {
            id: (!filter.id.is_empty()).then(|| filter.id.clone()),
            pod_sandbox_id: (!filter.pod_sandbox_id.is_empty())
                .then(|| filter.pod_sandbox_id.clone()),
            state: filter
                .state
                .and_then(|state| cri_state_to_container_state(state.state)),
            labels: filter.label_selector,
        };

        let containers = self
            .0
            .containers
            .list(&filter)?
            .iter()
            .map(cri_container)
            .collect();

        Ok(Response::new(v1::ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<v1::ContainerStatusRequest>,
    ) -> TonicResult<v1::ContainerStatusResponse> {
        let container_id = request.into_inner().container_id;
        require_id(&container_id, "container-id-empty")?;

        let record = self.0.containers.status(&container_id).await?;

        Ok(Response::new(v1::ContainerStatusResponse {
            status: Some(cri_container_status(&record)),
            info: HashMap::default(),
        }))
    }

    async fn update_container_resources(
        &self,
        request: Request<v1::UpdateContainerResourcesRequest>,
    ) -> TonicResult<v1::UpdateContainerResourcesResponse> {
        let request = request.into_inner();
        require_id(&request.container_id, "container-id-empty")?;
        let linux = request.linux.unwrap_or_default();
        let update = ResourceUpdate {
            cpu_period: (linux.cpu_period > 0).then_some(linux.cpu_period as u64),
            cpu_quota: (linux.cpu_quota > 0).then_some(linux.cpu_quota as u64),
            memory_limit_bytes: (linux.memory_limit_in_bytes > 0)
                .then_some(linux.memory_limit_in_bytes as u64),
            tasks_max: None,
        };

        self.0
            .containers
            .update_resources(&request.container_id, update)
            .await?;

        Ok(Response::new(v1::UpdateContainerResourcesResponse {}))
    }

    async fn reopen_container_log(
        &self,
        request: Request<v1::ReopenContainerLogRequest>,
    ) -> TonicResult<v1::ReopenContainerLogResponse> {
        let container_id = request.into_inner().container_id;
        require_id(&container_id, "container-id-empty")?;

        self.0.containers.reopen_log(&container_id).await?;

        Ok(Response::new(v1::ReopenContainerLogResponse {}))
    }

    async fn exec_sync(
        &self,
        request: Request<v1::ExecSyncRequest>,
    ) -> TonicResult<v1::ExecSyncResponse> {
        let request = request.into_inner();
        require_id(&request.container_id, "container-id-empty")?;
        let deadline = match request.timeout {
            timeout if timeout > 0 => Duration::from_secs(timeout as u64),
            _ => EXEC_SYNC_DEFAULT_DEADLINE,
        };

        let (stdout, stderr, exit_code) = self
            .0
            .streaming
            .exec_sync(&request.container_id, &request.cmd, deadline)
            .await?;

        Ok(Response::new(v1::ExecSyncResponse {
            stdout,
            stderr,
            exit_code,
        }))
    }

    async fn exec(&self, request: Request<v1::ExecRequest>) -> TonicResult<v1::ExecResponse> {
        let request = request.into_inner();
        require_id(&request.container_id, "container-id-empty")?;

        let url = self
            .0
            .streaming
            .prepare_exec(&request.container_id, request.cmd, request.stdin)?;

        Ok(Response::new(v1::ExecResponse { url }))
    }

    async fn attach(
        &self,
        request: Request<v1::AttachRequest>,
    ) -> TonicResult<v1::AttachResponse> {
        let request = request.into_inner();
        require_id(&request.container_id, "container-id-empty")?;

        let url = self.0.streaming.prepare_attach(&request.container_id)?;

        Ok(Response::new(v1::AttachResponse { url }))
    }

    async fn port_forward(
        &self,
        request: Request<v1::PortForwardRequest>,
    ) -> TonicResult<v1::PortForwardResponse> {
        let request = request.into_inner();
        require_id(&request.pod_sandbox_id, "pod-id-empty")?;
        let ports: Vec<u16> = request
            .port
            .iter()
            .filter_map(|port| u16::try_from(*port).ok())
            .collect();

        let url = self
            .0
            .streaming
            .prepare_port_forward(&request.pod_sandbox_id, ports)?;

        Ok(Response::new(v1::PortForwardResponse { url }))
    }

    async fn container_stats(
        &self,
        _request: Request<v1::ContainerStatsRequest>,
    ) -> TonicResult<v1::ContainerStatsResponse> {
        Err(Status::unimplemented("container-stats"))
    }

    async fn list_container_stats(
        &self,
        _request: Request<v1::ListContainerStatsRequest>,
    ) -> TonicResult<v1::ListContainerStatsResponse> {
        Err(Status::unimplemented("list-container-stats"))
    }

    async fn pod_sandbox_stats(
        &self,
        _request: Request<v1::PodSandboxStatsRequest>,
    ) -> TonicResult<v1::PodSandboxStatsResponse> {
        Err(Status::unimplemented("pod-sandbox-stats"))
    }

    async fn list_pod_sandbox_stats(
        &self,
        _request: Request<v1::ListPodSandboxStatsRequest>,
    ) -> TonicResult<v1::ListPodSandboxStatsResponse> {
        Err(Status::unimplemented("list-pod-sandbox-stats"))
    }

    async fn update_runtime_config(
        &self,
        request: Request<v1::UpdateRuntimeConfigRequest>,
    ) -> TonicResult<v1::UpdateRuntimeConfigResponse> {
        // The pod CIDR is fixed at startup; acknowledge without action.
        let _ = request.into_inner();
        Ok(Response::new(v1::UpdateRuntimeConfigResponse {}))
    }

    async fn status(&self, _request: Request<v1::StatusRequest>) -> TonicResult<v1::StatusResponse> {
        let ready = self.0.metrics.runtime_ready.get() == 1;
        let conditions = vec![
            v1::RuntimeCondition {
                r#type: String::from(CONDITION_RUNTIME_READY),
                status: ready,
                reason: String::new(),
                message: String::new(),
            },
            v1::RuntimeCondition {
                r#type: String::from(CONDITION_NETWORK_READY),
                status: ready,
                reason: String::new(),
                message: String::new(),
            },
        ];

        Ok(Response::new(v1::StatusResponse {
            status: Some(v1::RuntimeStatus { conditions }),
            info: HashMap::default(),
        }))
    }

    async fn checkpoint_container(
        &self,
        _request: Request<v1::CheckpointContainerRequest>,
    ) -> TonicResult<v1::CheckpointContainerResponse> {
        Err(Status::unimplemented("checkpoint-container"))
    }

    type GetContainerEventsStream = ReceiverStream<StdResult<v1::ContainerEventResponse, Status>>;

    async fn get_container_events(
        &self,
        _request: Request<v1::GetEventsRequest>,
    ) -> TonicResult<Self::GetContainerEventsStream> {
        Err(Status::unimplemented("get-container-events"))
    }

    async fn list_metric_descriptors(
        &self,
        _request: Request<v1::ListMetricDescriptorsRequest>,
    ) -> TonicResult<v1::ListMetricDescriptorsResponse> {
        Err(Status::unimplemented("list-metric-descriptors"))
    }

    async fn list_pod_sandbox_metrics(
        &self,
        _request: Request<v1::ListPodSandboxMetricsRequest>,
    ) -> TonicResult<v1::ListPodSandboxMetricsResponse> {
        Err(Status::unimplemented("list-pod-sandbox-metrics"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_sync_deadline_bounds_zero_timeouts() {
        // Mirrors the deadline selection in `exec_sync`.
        let pick = |timeout: i64| match timeout {
            timeout if timeout > 0 => Duration::from_secs(timeout as u64),
            _ => EXEC_SYNC_DEFAULT_DEADLINE,
        };

        assert_eq!(pick(5), Duration::from_secs(5));
        assert_eq!(pick(0), EXEC_SYNC_DEFAULT_DEADLINE);
        assert_eq!(pick(-3), EXEC_SYNC_DEFAULT_DEADLINE);
    }
}
