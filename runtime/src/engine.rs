//! The lifecycle engine: pod and container state machines over the three
//! adapters (init system, machine image pool, overlay manager) plus the
//! CNI driver. The sole writer to the [`Store`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use papaya::HashMap as PapayaMap;
use tokio::sync::Mutex;

use crate::cni::{self, CniDriver};
use crate::command::CommandRunner;
use crate::error::{Dependency, Result, RuntimeError};
use crate::ids::{ContainerId, PodId};
use crate::image_ref::ImageReference;
use crate::names;
use crate::overlay::{looks_like_rootfs, OverlayLayout, OverlayManager};
use crate::pool::{ImageRecord, MachineImagePool};
use crate::puller::ImagePuller;
use crate::store::{ContainerRecord, ContainerState, PodRecord, PodState, Store};
use crate::systemd::{ActiveState, ExecStart, InitSystemClient, Mode, UnitPropertySpec};
use crate::{log_info, log_warn};

/// Inputs to `RunPodSandbox`, already validated by the gRPC layer.
#[derive(Debug, Clone, Default)]
pub struct PodSandboxRequest {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub host_network: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MountSpec {
    pub container_path: String,
    pub host_path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Inputs to `CreateContainer`, already validated by the gRPC layer.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreateRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub envs: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub log_path: Option<String>,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub privileged: bool,
    pub readonly_rootfs: bool,
}

#[derive(Debug, Default, Clone)]
pub struct PodFilter {
    pub id: Option<PodId>,
    pub state: Option<PodState>,
    pub labels: HashMap<String, String>,
}

/// One filesystem usage entry, as returned by `ImageFsInfo`.
#[derive(Debug, Clone)]
pub struct FilesystemUsage {
    pub mountpoint: String,
    pub used_bytes: u64,
}

#[derive(Debug, Default, Clone)]
pub struct ContainerFilter {
    pub id: Option<ContainerId>,
    pub pod_id: Option<PodId>,
    pub state: Option<ContainerState>,
    pub labels: HashMap<String, String>,
}

pub struct Engine {
    store: Arc<Store>,
    systemd: Arc<dyn InitSystemClient>,
    pool: Arc<dyn MachineImagePool>,
    commands: Arc<dyn CommandRunner>,
    cni: Arc<CniDriver>,
    puller: ImagePuller,
    state_dir: PathBuf,
    pod_locks: PapayaMap<PodId, Arc<Mutex<()>>>,
}

const PAUSE_SLICE: &str = "cri-pods.slice";
const CONTAINER_SLICE: &str = "cri-containers.slice";
const IFNAME: &str = "eth0";

impl Engine {
    pub fn new(
        store: Arc<Store>,
        systemd: Arc<dyn InitSystemClient>,
        pool: Arc<dyn MachineImagePool>,
        commands: Arc<dyn CommandRunner>,
        cni: Arc<CniDriver>,
        puller: ImagePuller,
        state_dir: PathBuf,
    ) -> Self {
        Engine {
            store,
            systemd,
            pool,
            commands,
            cni,
            puller,
            state_dir,
            pod_locks: PapayaMap::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pool(&self) -> &dyn MachineImagePool {
        self.pool.as_ref()
    }

    pub fn puller(&self) -> &ImagePuller {
        &self.puller
    }

    pub fn commands(&self) -> &dyn CommandRunner {
        self.commands.as_ref()
    }

    async fn lock_pod(&self, pod_id: PodId) -> Arc<Mutex<()>> {
        let guard = self.pod_locks.pin();
        if let Some(lock) = guard.get(&pod_id) {
            return lock.clone();
        }
        let lock = Arc::new(Mutex::new(()));
        guard.get_or_insert(pod_id, lock).clone()
    }

    // ---- Pod state machine -------------------------------------------

    pub async fn run_pod_sandbox(&self, request: PodSandboxRequest) -> Result<PodId> {
        let pod_id = PodId::new();
        let lock = self.lock_pod(pod_id).await;
        let _guard = lock.lock().await;

        let unit_name = names::pod_unit_name(&pod_id);
        let mut network_namespace = None;
        let mut pod_ip = None;
        let mut pod_gateway = None;

        if !request.host_network {
            let netns_name = names::pod_netns_name(&pod_id);
            let netns_path = names::pod_netns_path(&pod_id);
            match self.setup_network(&pod_id, &request, &netns_name, &netns_path).await {
                Ok(result) => {
                    network_namespace = Some(netns_path);
                    pod_ip = result.ip;
                    pod_gateway = result.gateway;
                }
                Err(error) => {
                    log_warn!(pod: &pod_id, "CNI setup failed, starting without a network namespace: {error}");
                }
            }
        }

        let spec = UnitPropertySpec {
            description: format!("CRI pod sandbox {pod_id}"),
            slice: Some(PAUSE_SLICE.to_string()),
            exec_start: Some(ExecStart {
                path: "/bin/sleep".to_string(),
                argv: vec!["/bin/sleep".to_string(), "infinity".to_string()],
                ignore_failure: false,
            }),
            ..Default::default()
        };

        if let Err(error) = self.systemd.start_transient_unit(&unit_name, Mode::Fail, &spec).await {
            if let Some(netns_path) = &network_namespace {
                let _ = cni::delete_namespace(&names::pod_netns_name(&pod_id), self.commands.as_ref()).await;
                let _ = netns_path;
            }
            return Err(error);
        }

        let record = PodRecord {
            id: pod_id,
            name: request.name,
            uid: request.uid,
            namespace: request.namespace,
            state: PodState::Ready,
            created_at: now(),
            unit_name,
            network_namespace,
            pod_ip,
            pod_gateway,
            cni_network_config: None,
            labels: request.labels,
            annotations: request.annotations,
        };

        if let Err(error) = self.store.put_pod(&record) {
            let _ = self.systemd.stop_unit(&record.unit_name, Mode::Fail).await;
            return Err(error);
        }

        log_info!(pod: &pod_id, "pod sandbox ready");
        Ok(pod_id)
    }

    async fn setup_network(
        &self,
        pod_id: &PodId,
        request: &PodSandboxRequest,
        netns_name: &str,
        netns_path: &str,
    ) -> Result<cni::CniIpResult> {
        cni::create_namespace(netns_name, self.commands.as_ref()).await?;
        let result = self
            .cni
            .setup(pod_id, &request.name, &request.namespace, netns_path, IFNAME, self.commands.as_ref())
            .await;
        if result.is_err() {
            let _ = cni::delete_namespace(netns_name, self.commands.as_ref()).await;
        }
        result
    }

    pub async fn stop_pod_sandbox(&self, pod_id: PodId) -> Result<()> {
        let lock = self.lock_pod(pod_id).await;
        let _guard = lock.lock().await;

        let Some(mut record) = self.store.get_pod(&pod_id)? else {
            return Err(RuntimeError::not_found(format!("pod sandbox {pod_id} not found")));
        };

        self.systemd.stop_unit(&record.unit_name, Mode::Fail).await?;
        record.state = PodState::NotReady;
        self.store.put_pod(&record)
    }

    pub async fn remove_pod_sandbox(&self, pod_id: PodId) -> Result<()> {
        let lock = self.lock_pod(pod_id).await;
        let _guard = lock.lock().await;

        let Some(record) = self.store.get_pod(&pod_id)? else {
            return Err(RuntimeError::not_found(format!("pod sandbox {pod_id} not found")));
        };

        if !self.store.list_container_ids_for_pod(&pod_id)?.is_empty() {
            return Err(RuntimeError::invalid_state(
                "cannot remove a pod sandbox that still has containers",
            ));
        }

        if record.state == PodState::Ready {
            self.systemd.stop_unit(&record.unit_name, Mode::Fail).await?;
        }

        if let Some(netns_path) = &record.network_namespace {
            let netns_name = names::pod_netns_name(&pod_id);
            if let Err(error) = self
                .cni
                .teardown(&pod_id, &record.name, &record.namespace, netns_path, IFNAME, self.commands.as_ref())
                .await
            {
                log_warn!(pod: &pod_id, "CNI teardown failed (ignored): {error}");
            }
            if let Err(error) = cni::delete_namespace(&netns_name, self.commands.as_ref()).await {
                log_warn!(pod: &pod_id, "network namespace removal failed (ignored): {error}");
            }
        }

        self.systemd.reset_failed(&record.unit_name).await?;
        self.store.delete_pod(&pod_id)
    }

    pub async fn pod_sandbox_status(&self, pod_id: PodId) -> Result<PodRecord> {
        let Some(mut record) = self.store.get_pod(&pod_id)? else {
            return Err(RuntimeError::not_found(format!("pod sandbox {pod_id} not found")));
        };

        if let Some(path) = self.systemd.get_unit_path(&record.unit_name).await? {
            let active_state = self.systemd.get_unit_active_state(&path).await?;
            record.state = match active_state {
                ActiveState::Active | ActiveState::Reloading => PodState::Ready,
                ActiveState::Activating => PodState::Created,
                ActiveState::Inactive | ActiveState::Failed | ActiveState::Deactivating => PodState::NotReady,
                ActiveState::Unknown => record.state,
            };
        }
        Ok(record)
    }

    pub fn list_pod_sandbox(&self, filter: &PodFilter) -> Result<Vec<PodRecord>> {
        let mut pods = self.store.list_pods()?;
        if let Some(id) = filter.id {
            pods.retain(|p| p.id == id);
        }
        if let Some(state) = filter.state {
            pods.retain(|p| p.state == state);
        }
        if !filter.labels.is_empty() {
            pods.retain(|p| filter.labels.iter().all(|(k, v)| p.labels.get(k) == Some(v)));
        }
        Ok(pods)
    }

    // ---- Container state machine --------------------------------------

    pub async fn create_container(
        &self,
        pod_id: PodId,
        request: ContainerCreateRequest,
    ) -> Result<ContainerId> {
        let lock = self.lock_pod(pod_id).await;
        let _guard = lock.lock().await;

        if self.store.get_pod(&pod_id)?.is_none() {
            return Err(RuntimeError::not_found(format!("pod sandbox {pod_id} not found")));
        }

        let container_id = ContainerId::new();
        let unit_name = names::container_unit_name(&container_id);
        let base = self.container_base_dir(&container_id);
        std::fs::create_dir_all(&base)
            .map_err(|error| RuntimeError::dependency(Dependency::StoreError, error.to_string()))?;

        let image_rootfs = ImageReference::parse(&request.image)
            .ok()
            .map(|reference| PathBuf::from(self.pool.get_pool_path()).join(reference.pool_machine_name()))
            .filter(|path| path.exists());

        let mounts_json = serde_json::to_string(&request.mounts).ok();

        let record = ContainerRecord {
            id: container_id,
            pod_sandbox_id: pod_id,
            name: request.name,
            image: request.image,
            image_ref: image_rootfs.as_ref().map(|p| p.display().to_string()),
            state: ContainerState::Created,
            created_at: now(),
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            pid: None,
            unit_name,
            rootfs_path: Some(base.join("rootfs").display().to_string()),
            image_rootfs: image_rootfs.map(|p| p.display().to_string()),
            log_path: request.log_path,
            command: request.command,
            working_dir: request.working_dir,
            run_as_user: request.run_as_user,
            run_as_group: request.run_as_group,
            privileged: request.privileged,
            readonly_rootfs: request.readonly_rootfs,
            mounts_json,
            labels: request.labels,
            annotations: request.annotations,
        };

        self.store.put_container(&record)?;
        Ok(container_id)
    }

    pub async fn start_container(&self, container_id: ContainerId) -> Result<()> {
        let mut record = self.get_container(container_id)?;
        let lock = self.lock_pod(record.pod_sandbox_id).await;
        let _guard = lock.lock().await;

        // Crash recovery: a Start that finds an already-running unit
        // leaves state untouched and reports success.
        if record.state == ContainerState::Running {
            return Ok(());
        }
        if record.state != ContainerState::Created {
            return Err(RuntimeError::invalid_state(format!(
                "container {container_id} is not in the created state"
            )));
        }

        let mut root_directory = None;
        if let (Some(image_rootfs), Some(merged)) = (&record.image_rootfs, &record.rootfs_path) {
            let image_rootfs = PathBuf::from(image_rootfs);
            if looks_like_rootfs(&image_rootfs) {
                let base = self.container_base_dir(&container_id);
                let layout = OverlayLayout::for_container(&base, &image_rootfs);
                OverlayManager::prepare(&layout)?;
                match OverlayManager::mount(&layout) {
                    Ok(()) => root_directory = Some(merged.clone()),
                    Err(error) => {
                        log_warn!(container: &container_id, "overlay mount failed, starting without isolation: {error}");
                    }
                }
            } else {
                log_warn!(container: &container_id, "image rootfs does not look like a rootfs, starting without isolation");
            }
        }

        let spec = self.container_unit_spec(&record, root_directory.as_deref());
        if let Err(error) = self.systemd.start_transient_unit(&record.unit_name, Mode::Fail, &spec).await {
            return Err(error);
        }

        // Best-effort PID read: give the unit a moment to report MainPID.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let pid = match self.systemd.get_unit_path(&record.unit_name).await? {
            Some(path) => self.systemd.get_service_main_pid(&path).await?,
            None => None,
        };

        record.state = ContainerState::Running;
        record.started_at = now();
        record.pid = pid;
        self.store.put_container(&record)?;
        log_info!(container: &container_id, "container running");
        Ok(())
    }

    fn container_unit_spec(&self, record: &ContainerRecord, root_directory: Option<&str>) -> UnitPropertySpec {
        let mut spec = UnitPropertySpec {
            description: format!("CRI container {}", record.id),
            slice: Some(CONTAINER_SLICE.to_string()),
            working_directory: record.working_dir.clone(),
            no_new_privileges: !record.privileged,
            protect_system_strict: record.readonly_rootfs,
            ..Default::default()
        };

        if let Some(uid) = record.run_as_user {
            spec.user = Some(uid.to_string());
        }
        if let Some(gid) = record.run_as_group {
            spec.group = Some(gid.to_string());
        }

        if let Some(root) = root_directory {
            spec.root_directory = Some(root.to_string());
            spec.environment.push("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());
            spec.private_mounts = true;
            spec.mount_api_vfs = true;
            spec.private_tmp = true;
            if !record.privileged {
                spec.private_devices = true;
            }
        }

        if let Some(mounts_json) = &record.mounts_json {
            if let Ok(mounts) = serde_json::from_str::<Vec<MountSpec>>(mounts_json) {
                for mount in mounts {
                    let pair = (mount.host_path, mount.container_path);
                    if mount.readonly {
                        spec.bind_read_only_paths.push(pair);
                    } else {
                        spec.bind_paths.push(pair);
                    }
                }
            }
        }

        spec.exec_start = Some(if root_directory.is_some() {
            ExecStart {
                path: "/bin/sh".to_string(),
                argv: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("exec {}", shell_join(&record.command)),
                ],
                ignore_failure: false,
            }
        } else {
            let path = record.command.first().cloned().unwrap_or_else(|| "/bin/true".to_string());
            ExecStart { path, argv: record.command.clone(), ignore_failure: false }
        });

        if let Some(log_path) = &record.log_path {
            spec.standard_output = Some(format!("file:{log_path}"));
            spec.standard_error = Some(format!("file:{log_path}"));
        }

        spec
    }

    /// `StopContainer`: `timeout_secs <= 0` skips straight to `SIGKILL`, per
    /// the CRI contract that a zero grace period means "now". Otherwise
    /// sends `SIGTERM`, polls the unit's active state, and escalates to
    /// `SIGKILL` if it's still running once the grace period elapses.
    /// `StopUnit` runs last regardless, so a unit a signal never reached
    /// (already gone, or never started) still ends up fully torn down.
    pub async fn stop_container(&self, container_id: ContainerId, timeout_secs: i64) -> Result<()> {
        let mut record = self.get_container(container_id)?;
        let lock = self.lock_pod(record.pod_sandbox_id).await;
        let _guard = lock.lock().await;

        if record.state != ContainerState::Running {
            return Ok(());
        }

        self.terminate_unit(container_id, &record.unit_name, timeout_secs).await;
        self.systemd.stop_unit(&record.unit_name, Mode::Fail).await?;

        if let (Some(image_rootfs), Some(merged)) = (&record.image_rootfs, &record.rootfs_path) {
            let base = self.container_base_dir(&container_id);
            let layout = OverlayLayout::for_container(&base, &PathBuf::from(image_rootfs));
            debug_assert_eq!(layout.merged_dir.display().to_string(), *merged);
            if let Err(error) = OverlayManager::unmount(&layout) {
                log_warn!(container: &container_id, "overlay unmount failed (ignored): {error}");
            }
        }

        record.state = ContainerState::Exited;
        record.finished_at = now();
        self.store.put_container(&record)
    }

    const SIGTERM: i32 = 15;
    const SIGKILL: i32 = 9;
    const TERMINATE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

    /// Best-effort: a signal failing to land (unit already gone, dbus hiccup)
    /// is not fatal, since the caller always follows up with `StopUnit`.
    async fn terminate_unit(&self, container_id: ContainerId, unit_name: &str, timeout_secs: i64) {
        let deadline = timeout_secs.max(0) as u64;
        if deadline == 0 {
            if let Err(error) = self.systemd.kill_unit(unit_name, Self::SIGKILL).await {
                log_warn!(container: &container_id, "SIGKILL delivery failed (ignored): {error}");
            }
            return;
        }

        if let Err(error) = self.systemd.kill_unit(unit_name, Self::SIGTERM).await {
            log_warn!(container: &container_id, "SIGTERM delivery failed (ignored): {error}");
        }

        let elapsed = tokio::time::Instant::now();
        let budget = std::time::Duration::from_secs(deadline);
        loop {
            if elapsed.elapsed() >= budget {
                break;
            }
            match self.systemd.get_unit_path(unit_name).await {
                Ok(Some(path)) => match self.systemd.get_unit_active_state(&path).await {
                    Ok(ActiveState::Inactive) | Ok(ActiveState::Failed) | Err(_) => return,
                    Ok(_) => {}
                },
                Ok(None) => return,
                Err(_) => return,
            }
            tokio::time::sleep(Self::TERMINATE_POLL_INTERVAL).await;
        }

        if let Err(error) = self.systemd.kill_unit(unit_name, Self::SIGKILL).await {
            log_warn!(container: &container_id, "SIGKILL delivery failed (ignored): {error}");
        }
    }

    pub async fn remove_container(&self, container_id: ContainerId) -> Result<()> {
        let record = self.get_container(container_id)?;
        let lock = self.lock_pod(record.pod_sandbox_id).await;
        let _guard = lock.lock().await;

        if record.state == ContainerState::Running {
            self.systemd.stop_unit(&record.unit_name, Mode::Fail).await?;
        }
        self.systemd.reset_failed(&record.unit_name).await?;

        if let Some(image_rootfs) = &record.image_rootfs {
            let base = self.container_base_dir(&container_id);
            let layout = OverlayLayout::for_container(&base, &PathBuf::from(image_rootfs));
            if let Err(error) = OverlayManager::cleanup(&layout) {
                log_warn!(container: &container_id, "overlay cleanup failed (ignored): {error}");
            }
        }

        let base = self.container_base_dir(&container_id);
        let _ = std::fs::remove_dir_all(&base);

        self.store.delete_container(&container_id, &record.pod_sandbox_id)
    }

    pub async fn container_status(&self, container_id: ContainerId) -> Result<ContainerRecord> {
        let mut record = self.get_container(container_id)?;
        if record.state == ContainerState::Running {
            match self.systemd.get_unit_path(&record.unit_name).await? {
                Some(path) => {
                    let active_state = self.systemd.get_unit_active_state(&path).await?;
                    match active_state {
                        ActiveState::Active | ActiveState::Reloading => {
                            if record.pid.is_none() {
                                record.pid = self.systemd.get_service_main_pid(&path).await?;
                            }
                        }
                        _ => {
                            record.state = ContainerState::Exited;
                            record.finished_at = now();
                            self.store.put_container(&record)?;
                        }
                    }
                }
                None => {
                    record.state = ContainerState::Exited;
                    record.finished_at = now();
                    self.store.put_container(&record)?;
                }
            }
        }
        Ok(record)
    }

    pub fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>> {
        let mut containers = self.store.list_containers()?;
        if let Some(id) = filter.id {
            containers.retain(|c| c.id == id);
        }
        if let Some(pod_id) = filter.pod_id {
            containers.retain(|c| c.pod_sandbox_id == pod_id);
        }
        if let Some(state) = filter.state {
            containers.retain(|c| c.state == state);
        }
        if !filter.labels.is_empty() {
            containers.retain(|c| filter.labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)));
        }
        Ok(containers)
    }

    pub fn get_container(&self, container_id: ContainerId) -> Result<ContainerRecord> {
        self.store
            .get_container(&container_id)?
            .ok_or_else(|| RuntimeError::not_found(format!("container {container_id} not found")))
    }

    pub fn get_pod(&self, pod_id: PodId) -> Result<PodRecord> {
        self.store
            .get_pod(&pod_id)?
            .ok_or_else(|| RuntimeError::not_found(format!("pod sandbox {pod_id} not found")))
    }

    /// The pod sandbox unit's own main PID, as queried live from the init
    /// system (not persisted — mirrors how container PIDs are reconciled
    /// in [`Self::container_status`]). Used by the streaming manager to
    /// enter a pod's network namespace for port-forward.
    pub async fn pod_main_pid(&self, pod_id: PodId) -> Result<Option<u32>> {
        let record = self.get_pod(pod_id)?;
        match self.systemd.get_unit_path(&record.unit_name).await? {
            Some(path) => self.systemd.get_service_main_pid(&path).await,
            None => Ok(None),
        }
    }

    // ---- Image service --------------------------------------------------

    /// `PullImage`: parses `image`, delegates to the [`ImagePuller`], and
    /// returns the pool machine name (what `ImageStatus`/container creation
    /// key off of).
    pub async fn pull_image(&self, image: &str) -> Result<String> {
        let reference = ImageReference::parse(image)?;
        self.puller.pull(&reference, self.commands.as_ref(), self.pool.as_ref()).await
    }

    pub async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        self.pool.list().await
    }

    pub async fn image_status(&self, image: &str) -> Result<Option<ImageRecord>> {
        let reference = ImageReference::parse(image)?;
        self.pool.get(&reference.pool_machine_name()).await
    }

    pub async fn remove_image(&self, image: &str) -> Result<()> {
        let reference = ImageReference::parse(image)?;
        self.pool.remove(&reference.pool_machine_name()).await
    }

    /// `ImageFsInfo`: a single filesystem usage entry rooted at the pool
    /// path, since every pulled image lives on that one mount.
    pub async fn image_fs_info(&self) -> Result<FilesystemUsage> {
        let images = self.pool.list().await?;
        let used_bytes = images.iter().map(|image| image.disk_usage_bytes).sum();
        Ok(FilesystemUsage {
            mountpoint: self.pool.get_pool_path().to_string(),
            used_bytes,
        })
    }

    fn container_base_dir(&self, container_id: &ContainerId) -> PathBuf {
        self.state_dir.join("containers").join(container_id.to_string())
    }
}

fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|part| shell_escape(part))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_escape(part: &str) -> String {
    if part.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | ':')) {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', "'\\''"))
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_join_quotes_arguments_with_spaces() {
        let argv = vec!["/bin/echo".to_string(), "hello world".to_string()];
        assert_eq!(shell_join(&argv), "/bin/echo 'hello world'");
    }

    #[test]
    fn shell_join_leaves_plain_paths_unquoted() {
        let argv = vec!["/usr/bin/env".to_string()];
        assert_eq!(shell_join(&argv), "/usr/bin/env");
    }
}
