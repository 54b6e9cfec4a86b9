//! The init-system adapter: starts/stops/queries transient systemd units
//! over `org.freedesktop.systemd1` on the system bus.

use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::Connection;

use crate::error::{Dependency, ErrorKind, Result, RuntimeError};

/// Collision policy for `StartTransientUnit`/`StopUnit`. `"fail"` rejects a
/// start when the unit name is already busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fail,
    Replace,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Fail => "fail",
            Mode::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Active,
    Reloading,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    Unknown,
}

impl ActiveState {
    fn from_str(state: &str) -> Self {
        match state {
            "active" => ActiveState::Active,
            "reloading" => ActiveState::Reloading,
            "inactive" => ActiveState::Inactive,
            "failed" => ActiveState::Failed,
            "activating" => ActiveState::Activating,
            "deactivating" => ActiveState::Deactivating,
            _ => ActiveState::Unknown,
        }
    }
}

/// One `ExecStart=` entry: an absolute path, its argv (argv[0] included),
/// and whether a non-zero exit should be ignored.
pub struct ExecStart {
    pub path: String,
    pub argv: Vec<String>,
    pub ignore_failure: bool,
}

/// Explicit value type for a transient unit's property set, built by the
/// lifecycle engine and consumed by this adapter — never a closure over
/// ambient state, so property construction is independently testable.
#[derive(Default)]
pub struct UnitPropertySpec {
    pub description: String,
    pub slice: Option<String>,
    pub working_directory: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub no_new_privileges: bool,
    pub protect_system_strict: bool,
    pub root_directory: Option<String>,
    pub private_mounts: bool,
    pub mount_api_vfs: bool,
    pub private_tmp: bool,
    pub private_devices: bool,
    pub bind_paths: Vec<(String, String)>,
    pub bind_read_only_paths: Vec<(String, String)>,
    pub environment: Vec<String>,
    pub standard_output: Option<String>,
    pub standard_error: Option<String>,
    pub exec_start: Option<ExecStart>,
}

impl UnitPropertySpec {
    /// Render as the `(sv)` property array `StartTransientUnit` expects.
    fn to_dbus_properties(&self) -> Vec<(String, Value<'_>)> {
        let mut properties = vec![
            ("Description".to_string(), Value::from(self.description.clone())),
            ("Type".to_string(), Value::from("exec".to_string())),
        ];
        if let Some(slice) = &self.slice {
            properties.push(("Slice".to_string(), Value::from(slice.clone())));
        }
        if let Some(dir) = &self.working_directory {
            properties.push(("WorkingDirectory".to_string(), Value::from(dir.clone())));
        }
        if let Some(user) = &self.user {
            properties.push(("User".to_string(), Value::from(user.clone())));
        }
        if let Some(group) = &self.group {
            properties.push(("Group".to_string(), Value::from(group.clone())));
        }
        if self.no_new_privileges {
            properties.push(("NoNewPrivileges".to_string(), Value::from(true)));
        }
        if self.protect_system_strict {
            properties.push(("ProtectSystem".to_string(), Value::from("strict".to_string())));
        }
        if let Some(root) = &self.root_directory {
            properties.push(("RootDirectory".to_string(), Value::from(root.clone())));
        }
        if self.private_mounts {
            properties.push(("PrivateMounts".to_string(), Value::from(true)));
        }
        if self.mount_api_vfs {
            properties.push(("MountAPIVFS".to_string(), Value::from(true)));
        }
        if self.private_tmp {
            properties.push(("PrivateTmp".to_string(), Value::from(true)));
        }
        if self.private_devices {
            properties.push(("PrivateDevices".to_string(), Value::from(true)));
        }
        if !self.bind_paths.is_empty() {
            let paths: Vec<(String, String, bool, u64)> = self
                .bind_paths
                .iter()
                .map(|(src, dst)| (src.clone(), dst.clone(), false, 0u64))
                .collect();
            properties.push(("BindPaths".to_string(), Value::from(paths)));
        }
        if !self.bind_read_only_paths.is_empty() {
            let paths: Vec<(String, String, bool, u64)> = self
                .bind_read_only_paths
                .iter()
                .map(|(src, dst)| (src.clone(), dst.clone(), false, 0u64))
                .collect();
            properties.push(("BindReadOnlyPaths".to_string(), Value::from(paths)));
        }
        if !self.environment.is_empty() {
            properties.push(("Environment".to_string(), Value::from(self.environment.clone())));
        }
        if let Some(output) = &self.standard_output {
            properties.push(("StandardOutput".to_string(), Value::from(output.clone())));
        }
        if let Some(error) = &self.standard_error {
            properties.push(("StandardError".to_string(), Value::from(error.clone())));
        }
        if let Some(exec) = &self.exec_start {
            let entry = (
                exec.path.clone(),
                exec.argv.clone(),
                exec.ignore_failure,
            );
            properties.push(("ExecStart".to_string(), Value::from(vec![entry])));
        }
        properties
    }
}

/// The seven operations the lifecycle engine needs from the init system.
#[async_trait::async_trait]
pub trait InitSystemClient: Send + Sync {
    async fn start_transient_unit(&self, name: &str, mode: Mode, properties: &UnitPropertySpec) -> Result<()>;
    async fn stop_unit(&self, name: &str, mode: Mode) -> Result<()>;
    async fn kill_unit(&self, name: &str, signal: i32) -> Result<()>;
    async fn reset_failed(&self, name: &str) -> Result<()>;
    async fn get_unit_path(&self, name: &str) -> Result<Option<OwnedObjectPath>>;
    async fn get_unit_active_state(&self, object_path: &OwnedObjectPath) -> Result<ActiveState>;
    async fn get_service_main_pid(&self, object_path: &OwnedObjectPath) -> Result<Option<u32>>;
}

pub struct SystemdClient {
    connection: Connection,
}

impl SystemdClient {
    pub async fn connect() -> Result<Self> {
        let connection = Connection::system().await.map_err(dbus_error)?;
        Ok(SystemdClient { connection })
    }

    fn manager_proxy(&self) -> zbus::Proxy<'_> {
        zbus::Proxy::new_owned(
            self.connection.clone().into(),
            "org.freedesktop.systemd1",
            "/org/freedesktop/systemd1",
            "org.freedesktop.systemd1.Manager",
        )
        .expect("well-formed static proxy parameters")
    }
}

#[async_trait::async_trait]
impl InitSystemClient for SystemdClient {
    async fn start_transient_unit(&self, name: &str, mode: Mode, properties: &UnitPropertySpec) -> Result<()> {
        let aux: Vec<(String, Vec<(String, Value<'_>)>)> = Vec::new();
        self.manager_proxy()
            .call_method(
                "StartTransientUnit",
                &(name, mode.as_str(), properties.to_dbus_properties(), aux),
            )
            .await
            .map_err(dbus_error)?;
        Ok(())
    }

    async fn stop_unit(&self, name: &str, mode: Mode) -> Result<()> {
        match self
            .manager_proxy()
            .call_method("StopUnit", &(name, mode.as_str()))
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_unknown_unit(&error) => Ok(()),
            Err(error) => Err(dbus_error(error)),
        }
    }

    /// Sends a raw signal to the unit's main process, for `StopContainer`'s
    /// grace-period escalation. Targets `"main"` rather than `"all"`: a
    /// container's cgroup may contain reaper/helper processes it started
    /// itself, and those are its own business to clean up.
    async fn kill_unit(&self, name: &str, signal: i32) -> Result<()> {
        match self
            .manager_proxy()
            .call_method("KillUnit", &(name, "main", signal))
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_unknown_unit(&error) => Ok(()),
            Err(error) => Err(dbus_error(error)),
        }
    }

    async fn reset_failed(&self, name: &str) -> Result<()> {
        match self
            .manager_proxy()
            .call_method("ResetFailedUnit", &(name,))
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_unknown_unit(&error) => Ok(()),
            Err(error) => Err(dbus_error(error)),
        }
    }

    async fn get_unit_path(&self, name: &str) -> Result<Option<OwnedObjectPath>> {
        match self.manager_proxy().call_method("GetUnit", &(name,)).await {
            Ok(reply) => {
                let path: OwnedObjectPath = reply.body().deserialize().map_err(dbus_error)?;
                Ok(Some(path))
            }
            Err(error) if is_unknown_unit(&error) => Ok(None),
            Err(error) => Err(dbus_error(error)),
        }
    }

    async fn get_unit_active_state(&self, object_path: &OwnedObjectPath) -> Result<ActiveState> {
        let proxy = zbus::Proxy::new_owned(
            self.connection.clone().into(),
            "org.freedesktop.systemd1",
            object_path.clone(),
            "org.freedesktop.DBus.Properties",
        )
        .map_err(dbus_error)?;
        let value: Value = proxy
            .call_method("Get", &("org.freedesktop.systemd1.Unit", "ActiveState"))
            .await
            .map_err(dbus_error)?
            .body()
            .deserialize()
            .map_err(dbus_error)?;
        let state: String = value.try_into().map_err(|_| {
            RuntimeError::dependency(Dependency::SystemdError, "ActiveState property was not a string")
        })?;
        Ok(ActiveState::from_str(&state))
    }

    async fn get_service_main_pid(&self, object_path: &OwnedObjectPath) -> Result<Option<u32>> {
        let proxy = zbus::Proxy::new_owned(
            self.connection.clone().into(),
            "org.freedesktop.systemd1",
            object_path.clone(),
            "org.freedesktop.DBus.Properties",
        )
        .map_err(dbus_error)?;
        let value: Value = proxy
            .call_method("Get", &("org.freedesktop.systemd1.Service", "MainPID"))
            .await
            .map_err(dbus_error)?
            .body()
            .deserialize()
            .map_err(dbus_error)?;
        let pid: u32 = value.try_into().unwrap_or(0);
        Ok(if pid == 0 { None } else { Some(pid) })
    }
}

fn is_unknown_unit(error: &zbus::Error) -> bool {
    error.to_string().contains("NoSuchUnit")
}

/// Every `org.freedesktop.systemd1` bus failure is `SystemdError`, distinct
/// from the generic `DbusError` kind other D-Bus-speaking adapters (e.g. the
/// machine image pool) use.
fn dbus_error(error: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::new(ErrorKind::Dependency(Dependency::SystemdError), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_property_spec_always_sets_description_and_type_exec() {
        let spec = UnitPropertySpec {
            description: "test unit".into(),
            ..Default::default()
        };
        let properties = spec.to_dbus_properties();
        assert!(properties.iter().any(|(name, _)| name == "Description"));
        assert!(properties.iter().any(|(name, _)| name == "Type"));
    }

    #[test]
    fn unset_optional_fields_are_omitted() {
        let spec = UnitPropertySpec::default();
        let properties = spec.to_dbus_properties();
        assert!(!properties.iter().any(|(name, _)| name == "RootDirectory"));
        assert!(!properties.iter().any(|(name, _)| name == "User"));
    }

    #[test]
    fn log_redirection_sets_standard_output_and_error() {
        let spec = UnitPropertySpec {
            standard_output: Some("file:/var/log/cri/c1.log".into()),
            standard_error: Some("file:/var/log/cri/c1.log".into()),
            ..Default::default()
        };
        let properties = spec.to_dbus_properties();
        assert!(properties.iter().any(|(name, _)| name == "StandardOutput"));
        assert!(properties.iter().any(|(name, _)| name == "StandardError"));
    }
}
