//! `RuntimeService` — pod sandbox and container lifecycle, plus streaming.

use std::collections::HashMap;
use std::time::Duration;

use api_proto::runtime::v1 as v1;
use api_proto::runtime::v1::runtime_service_server::RuntimeService;
use tonic::{async_trait, Request, Response, Status};

use super::{into_status, now_ns, parse_id, seconds_to_wire_nanos, CriService, TonicResult};
use crate::engine::{ContainerCreateRequest, ContainerFilter, MountSpec, PodFilter, PodSandboxRequest};
use crate::ids::{ContainerId, PodId};
use crate::store::{ContainerRecord, ContainerState as EngineContainerState, PodRecord, PodState as EnginePodState};

/// `RuntimeApiVersion` kubelet expects from a CRI v1 runtime.
const KUBELET_API_VERSION: &str = "0.1.0";
const CONTAINER_RUNTIME_NAME: &str = "systemd-cri";
const CONTAINER_RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");
const CONTAINER_RUNTIME_API_VERSION: &str = "v1";

fn pod_state_to_wire(state: EnginePodState) -> v1::PodSandboxState {
    match state {
        EnginePodState::Ready | EnginePodState::Created => v1::PodSandboxState::SandboxReady,
        EnginePodState::NotReady | EnginePodState::Unknown => v1::PodSandboxState::SandboxNotready,
    }
}

fn wire_pod_state_to_engine(state: v1::PodSandboxState) -> EnginePodState {
    match state {
        v1::PodSandboxState::SandboxReady => EnginePodState::Ready,
        v1::PodSandboxState::SandboxNotready => EnginePodState::NotReady,
    }
}

/// The CRI `ContainerState` enum numbers line up exactly with
/// [`EngineContainerState`]'s declaration order, but the conversion is
/// written out explicitly rather than transmuted.
fn container_state_to_wire(state: EngineContainerState) -> v1::ContainerState {
    match state {
        EngineContainerState::Created => v1::ContainerState::Created,
        EngineContainerState::Running => v1::ContainerState::Running,
        EngineContainerState::Exited => v1::ContainerState::Exited,
        EngineContainerState::Unknown => v1::ContainerState::Unknown,
    }
}

fn wire_container_state_to_engine(state: v1::ContainerState) -> EngineContainerState {
    match state {
        v1::ContainerState::Created => EngineContainerState::Created,
        v1::ContainerState::Running => EngineContainerState::Running,
        v1::ContainerState::Exited => EngineContainerState::Exited,
        v1::ContainerState::Unknown => EngineContainerState::Unknown,
    }
}

fn pod_sandbox_metadata(record: &PodRecord) -> v1::PodSandboxMetadata {
    v1::PodSandboxMetadata {
        name: record.name.clone(),
        uid: record.uid.clone(),
        namespace: record.namespace.clone(),
        attempt: 0,
    }
}

fn pod_sandbox_item(record: PodRecord) -> v1::PodSandbox {
    v1::PodSandbox {
        id: record.id.to_string(),
        state: pod_state_to_wire(record.state) as i32,
        created_at: seconds_to_wire_nanos(record.created_at),
        labels: record.labels,
        annotations: record.annotations,
        runtime_handler: String::new(),
        metadata: Some(pod_sandbox_metadata(&record)),
    }
}

fn mounts_from_record(record: &ContainerRecord) -> Vec<v1::Mount> {
    let Some(json) = &record.mounts_json else { return Vec::new() };
    serde_json::from_str::<Vec<MountSpec>>(json)
        .unwrap_or_default()
        .into_iter()
        .map(|mount| v1::Mount {
            container_path: mount.container_path,
            host_path: mount.host_path,
            readonly: mount.readonly,
            selinux_relabel: false,
        })
        .collect()
}

fn container_status(record: ContainerRecord) -> v1::ContainerStatus {
    v1::ContainerStatus {
        id: record.id.to_string(),
        metadata: Some(v1::ContainerMetadata { name: record.name.clone(), attempt: 0 }),
        state: container_state_to_wire(record.state) as i32,
        created_at: seconds_to_wire_nanos(record.created_at),
        started_at: seconds_to_wire_nanos(record.started_at),
        finished_at: seconds_to_wire_nanos(record.finished_at),
        exit_code: record.exit_code,
        image: Some(v1::ImageSpec { image: record.image.clone(), annotations: HashMap::new() }),
        image_ref: record.image_ref.clone().unwrap_or_default(),
        reason: String::new(),
        message: String::new(),
        mounts: mounts_from_record(&record),
        log_path: record.log_path.clone().unwrap_or_default(),
        labels: record.labels,
        annotations: record.annotations,
    }
}

fn container_item(record: ContainerRecord) -> v1::Container {
    v1::Container {
        id: record.id.to_string(),
        pod_sandbox_id: record.pod_sandbox_id.to_string(),
        metadata: Some(v1::ContainerMetadata { name: record.name.clone(), attempt: 0 }),
        image: Some(v1::ImageSpec { image: record.image.clone(), annotations: HashMap::new() }),
        image_ref: record.image_ref.clone().unwrap_or_default(),
        state: container_state_to_wire(record.state) as i32,
        created_at: seconds_to_wire_nanos(record.created_at),
        labels: record.labels,
        annotations: record.annotations,
    }
}

/// `security_context.namespace_options.network == NODE` means "use the
/// host's network namespace", per the `NamespaceMode` contract.
fn wants_host_network(config: &v1::PodSandboxConfig) -> bool {
    config
        .linux
        .as_ref()
        .and_then(|linux| linux.security_context.as_ref())
        .and_then(|security| security.namespace_options.as_ref())
        .map(|options| options.network() == v1::NamespaceMode::Node)
        .unwrap_or(false)
}

fn run_as_ids(config: &v1::ContainerConfig) -> (Option<i64>, Option<i64>, bool, bool) {
    let Some(security) = config.linux.as_ref().and_then(|l| l.security_context.as_ref()) else {
        return (None, None, false, false);
    };
    (
        security.run_as_user.as_ref().map(|v| v.value),
        security.run_as_group.as_ref().map(|v| v.value),
        security.privileged,
        security.readonly_rootfs,
    )
}

fn container_log_path(sandbox_config: &Option<v1::PodSandboxConfig>, config: &v1::ContainerConfig) -> Option<String> {
    if config.log_path.is_empty() {
        return None;
    }
    match sandbox_config.as_ref().map(|s| s.log_directory.as_str()) {
        Some(dir) if !dir.is_empty() => Some(format!("{dir}/{}", config.log_path)),
        _ => Some(config.log_path.clone()),
    }
}

#[async_trait]
impl RuntimeService for CriService {
    async fn version(&self, _request: Request<v1::VersionRequest>) -> TonicResult<v1::VersionResponse> {
        Ok(Response::new(v1::VersionResponse {
            version: KUBELET_API_VERSION.to_string(),
            runtime_name: CONTAINER_RUNTIME_NAME.to_string(),
            runtime_version: CONTAINER_RUNTIME_VERSION.to_string(),
            runtime_api_version: CONTAINER_RUNTIME_API_VERSION.to_string(),
        }))
    }

    async fn status(&self, _request: Request<v1::StatusRequest>) -> TonicResult<v1::StatusResponse> {
        let conditions = vec![
            v1::RuntimeCondition {
                r#type: "RuntimeReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
            v1::RuntimeCondition {
                r#type: "NetworkReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
        ];
        Ok(Response::new(v1::StatusResponse {
            status: Some(v1::RuntimeStatus { conditions }),
            info: HashMap::new(),
        }))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<v1::RunPodSandboxRequest>,
    ) -> TonicResult<v1::RunPodSandboxResponse> {
        let config = request.into_inner().config.unwrap_or_default();
        let metadata = config.metadata.clone().unwrap_or_default();
        let host_network = wants_host_network(&config);

        let pod_id = self
            .engine
            .run_pod_sandbox(PodSandboxRequest {
                name: metadata.name,
                uid: metadata.uid,
                namespace: metadata.namespace,
                labels: config.labels,
                annotations: config.annotations,
                host_network,
            })
            .await
            .map_err(into_status)?;

        Ok(Response::new(v1::RunPodSandboxResponse { pod_sandbox_id: pod_id.to_string() }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<v1::StopPodSandboxRequest>,
    ) -> TonicResult<v1::StopPodSandboxResponse> {
        let pod_id: PodId = parse_id(&request.into_inner().pod_sandbox_id, "pod sandbox")?;
        self.engine.stop_pod_sandbox(pod_id).await.map_err(into_status)?;
        Ok(Response::new(v1::StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<v1::RemovePodSandboxRequest>,
    ) -> TonicResult<v1::RemovePodSandboxResponse> {
        let pod_id: PodId = parse_id(&request.into_inner().pod_sandbox_id, "pod sandbox")?;
        self.engine.remove_pod_sandbox(pod_id).await.map_err(into_status)?;
        Ok(Response::new(v1::RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<v1::PodSandboxStatusRequest>,
    ) -> TonicResult<v1::PodSandboxStatusResponse> {
        let pod_id: PodId = parse_id(&request.into_inner().pod_sandbox_id, "pod sandbox")?;
        let record = self.engine.pod_sandbox_status(pod_id).await.map_err(into_status)?;

        let status = v1::PodSandboxStatus {
            id: record.id.to_string(),
            metadata: Some(pod_sandbox_metadata(&record)),
            state: pod_state_to_wire(record.state) as i32,
            created_at: seconds_to_wire_nanos(record.created_at),
            network: Some(v1::PodSandboxNetworkStatus {
                ip: record.pod_ip.clone().unwrap_or_default(),
                additional_ips: Vec::new(),
            }),
            labels: record.labels,
            annotations: record.annotations,
            runtime_handler: None,
        };

        Ok(Response::new(v1::PodSandboxStatusResponse { status: Some(status), info: HashMap::new() }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<v1::ListPodSandboxRequest>,
    ) -> TonicResult<v1::ListPodSandboxResponse> {
        let filter = request.into_inner().filter.unwrap_or_default();

        let id = if filter.id.is_empty() { None } else { filter.id.parse().ok() };
        let state = filter.state.map(|value| wire_pod_state_to_engine(value.state()));

        let pods = self
            .engine
            .list_pod_sandbox(&PodFilter { id, state, labels: filter.label_selector })
            .map_err(into_status)?;

        Ok(Response::new(v1::ListPodSandboxResponse {
            items: pods.into_iter().map(pod_sandbox_item).collect(),
        }))
    }

    async fn create_container(
        &self,
        request: Request<v1::CreateContainerRequest>,
    ) -> TonicResult<v1::CreateContainerResponse> {
        let request = request.into_inner();
        let pod_id: PodId = parse_id(&request.pod_sandbox_id, "pod sandbox")?;
        let config = request.config.unwrap_or_default();
        let metadata = config.metadata.clone().unwrap_or_default();
        let image = config.image.clone().unwrap_or_default();

        let (run_as_user, run_as_group, privileged, readonly_rootfs) = run_as_ids(&config);
        let log_path = container_log_path(&request.sandbox_config, &config);

        let mut command = config.command.clone();
        command.extend(config.args.clone());

        let mounts = config
            .mounts
            .iter()
            .map(|mount| MountSpec {
                container_path: mount.container_path.clone(),
                host_path: mount.host_path.clone(),
                readonly: mount.readonly,
            })
            .collect();

        let container_id = self
            .engine
            .create_container(
                pod_id,
                ContainerCreateRequest {
                    name: metadata.name,
                    image: image.image,
                    command,
                    working_dir: (!config.working_dir.is_empty()).then_some(config.working_dir),
                    envs: config.envs.into_iter().map(|kv| (kv.key, kv.value)).collect(),
                    mounts,
                    labels: config.labels,
                    annotations: config.annotations,
                    log_path,
                    run_as_user,
                    run_as_group,
                    privileged,
                    readonly_rootfs,
                },
            )
            .await
            .map_err(into_status)?;

        Ok(Response::new(v1::CreateContainerResponse { container_id: container_id.to_string() }))
    }

    async fn start_container(
        &self,
        request: Request<v1::StartContainerRequest>,
    ) -> TonicResult<v1::StartContainerResponse> {
        let container_id: ContainerId = parse_id(&request.into_inner().container_id, "container")?;
        self.engine.start_container(container_id).await.map_err(into_status)?;
        Ok(Response::new(v1::StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<v1::StopContainerRequest>,
    ) -> TonicResult<v1::StopContainerResponse> {
        let request = request.into_inner();
        let container_id: ContainerId = parse_id(&request.container_id, "container")?;
        self.engine
            .stop_container(container_id, request.timeout)
            .await
            .map_err(into_status)?;
        Ok(Response::new(v1::StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<v1::RemoveContainerRequest>,
    ) -> TonicResult<v1::RemoveContainerResponse> {
        let container_id: ContainerId = parse_id(&request.into_inner().container_id, "container")?;
        self.engine.remove_container(container_id).await.map_err(into_status)?;
        Ok(Response::new(v1::RemoveContainerResponse {}))
    }

    async fn list_containers(
        &self,
        request: Request<v1::ListContainersRequest>,
    ) -> TonicResult<v1::ListContainersResponse> {
        let filter = request.into_inner().filter.unwrap_or_default();

        let id = if filter.id.is_empty() { None } else { filter.id.parse().ok() };
        let pod_id = if filter.pod_sandbox_id.is_empty() {
            None
        } else {
            filter.pod_sandbox_id.parse().ok()
        };
        let state = filter.state.map(|value| wire_container_state_to_engine(value.state()));

        let containers = self
            .engine
            .list_containers(&ContainerFilter { id, pod_id, state, labels: filter.label_selector })
            .map_err(into_status)?;

        Ok(Response::new(v1::ListContainersResponse {
            containers: containers.into_iter().map(container_item).collect(),
        }))
    }

    async fn container_status(
        &self,
        request: Request<v1::ContainerStatusRequest>,
    ) -> TonicResult<v1::ContainerStatusResponse> {
        let container_id: ContainerId = parse_id(&request.into_inner().container_id, "container")?;
        let record = self.engine.container_status(container_id).await.map_err(into_status)?;
        Ok(Response::new(v1::ContainerStatusResponse {
            status: Some(container_status(record)),
            info: HashMap::new(),
        }))
    }

    /// Resource limits have no counterpart in [`crate::systemd::UnitPropertySpec`]
    /// — this runtime does not manage cgroup resource properties beyond what
    /// the transient unit was started with — so this is a documented no-op.
    async fn update_container_resources(
        &self,
        _request: Request<v1::UpdateContainerResourcesRequest>,
    ) -> TonicResult<v1::UpdateContainerResourcesResponse> {
        Ok(Response::new(v1::UpdateContainerResourcesResponse {}))
    }

    /// Log redirection is `StandardOutput=file:{log_path}` on the
    /// transient unit, fixed at start time; there is no separate log
    /// file handle to reopen, so this is a no-op success.
    async fn reopen_container_log(
        &self,
        _request: Request<v1::ReopenContainerLogRequest>,
    ) -> TonicResult<v1::ReopenContainerLogResponse> {
        Ok(Response::new(v1::ReopenContainerLogResponse {}))
    }

    async fn exec_sync(&self, request: Request<v1::ExecSyncRequest>) -> TonicResult<v1::ExecSyncResponse> {
        let request = request.into_inner();
        let container_id: ContainerId = parse_id(&request.container_id, "container")?;
        let timeout = if request.timeout > 0 {
            Duration::from_secs(request.timeout as u64)
        } else {
            Duration::from_secs(30)
        };

        let (exit_code, stdout, stderr) = self
            .streaming
            .exec_sync(container_id, request.cmd, timeout)
            .await
            .map_err(into_status)?;

        Ok(Response::new(v1::ExecSyncResponse { stdout, stderr, exit_code }))
    }

    async fn exec(&self, request: Request<v1::ExecRequest>) -> TonicResult<v1::ExecResponse> {
        let request = request.into_inner();
        let container_id: ContainerId = parse_id(&request.container_id, "container")?;
        let url = self
            .streaming
            .register_exec(container_id, request.cmd, request.tty, request.stdin);
        Ok(Response::new(v1::ExecResponse { url }))
    }

    async fn attach(&self, request: Request<v1::AttachRequest>) -> TonicResult<v1::AttachResponse> {
        let request = request.into_inner();
        let container_id: ContainerId = parse_id(&request.container_id, "container")?;
        let url = self.streaming.register_attach(container_id, request.tty, request.stdin);
        Ok(Response::new(v1::AttachResponse { url }))
    }

    async fn port_forward(&self, request: Request<v1::PortForwardRequest>) -> TonicResult<v1::PortForwardResponse> {
        let request = request.into_inner();
        let pod_id: PodId = parse_id(&request.pod_sandbox_id, "pod sandbox")?;
        let ports = request.port.into_iter().map(|port| port as u16).collect();
        let url = self.streaming.register_port_forward(pod_id, ports);
        Ok(Response::new(v1::PortForwardResponse { url }))
    }

    /// Stats collection is out of scope (§1 Non-goals); these are stubs.
    async fn container_stats(
        &self,
        _request: Request<v1::ContainerStatsRequest>,
    ) -> TonicResult<v1::ContainerStatsResponse> {
        Ok(Response::new(v1::ContainerStatsResponse {}))
    }

    async fn list_container_stats(
        &self,
        _request: Request<v1::ListContainerStatsRequest>,
    ) -> TonicResult<v1::ListContainerStatsResponse> {
        Ok(Response::new(v1::ListContainerStatsResponse {}))
    }

    async fn pod_sandbox_stats(
        &self,
        _request: Request<v1::PodSandboxStatsRequest>,
    ) -> TonicResult<v1::PodSandboxStatsResponse> {
        Ok(Response::new(v1::PodSandboxStatsResponse {}))
    }

    async fn list_pod_sandbox_stats(
        &self,
        _request: Request<v1::ListPodSandboxStatsRequest>,
    ) -> TonicResult<v1::ListPodSandboxStatsResponse> {
        Ok(Response::new(v1::ListPodSandboxStatsResponse {}))
    }

    async fn update_runtime_config(
        &self,
        _request: Request<v1::UpdateRuntimeConfigRequest>,
    ) -> TonicResult<v1::UpdateRuntimeConfigResponse> {
        Ok(Response::new(v1::UpdateRuntimeConfigResponse {}))
    }

    async fn runtime_config(
        &self,
        _request: Request<v1::RuntimeConfigRequest>,
    ) -> TonicResult<v1::RuntimeConfigResponse> {
        Ok(Response::new(v1::RuntimeConfigResponse {}))
    }

    /// Checkpointing needs CRIU integration this runtime's adapters don't
    /// provide (no such capability in [`crate::systemd::InitSystemClient`]).
    async fn checkpoint_container(
        &self,
        _request: Request<v1::CheckpointContainerRequest>,
    ) -> TonicResult<v1::CheckpointContainerResponse> {
        Err(Status::unimplemented("checkpoint_container is not supported by this runtime"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_state_wire_mapping_round_trips() {
        for state in [
            EngineContainerState::Created,
            EngineContainerState::Running,
            EngineContainerState::Exited,
            EngineContainerState::Unknown,
        ] {
            assert_eq!(wire_container_state_to_engine(container_state_to_wire(state)), state);
        }
    }

    #[test]
    fn pod_state_ready_and_created_both_report_wire_ready() {
        assert_eq!(pod_state_to_wire(EnginePodState::Ready), v1::PodSandboxState::SandboxReady);
        assert_eq!(pod_state_to_wire(EnginePodState::Created), v1::PodSandboxState::SandboxReady);
        assert_eq!(pod_state_to_wire(EnginePodState::NotReady), v1::PodSandboxState::SandboxNotready);
    }
}
