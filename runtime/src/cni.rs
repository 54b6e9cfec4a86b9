//! The CNI driver: config discovery, plugin invocation, and network
//! namespace lifecycle for pod sandboxes.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{Dependency, ErrorKind, Result, RuntimeError};
use crate::ids::PodId;

const CNI_VERSION: &str = "1.0.0";

/// Parsed network configuration: the active plugin's type, its raw JSON
/// (re-serialized and sent to the plugin on stdin), and the IPAM range.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub plugin_type: String,
    pub raw: Value,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CniIpResult {
    pub ip: Option<String>,
    pub gateway: Option<String>,
}

/// Search path for CNI plugin binaries, checked in order for an
/// executable named after the plugin type.
const PLUGIN_DIRS: &[&str] = &["/opt/cni/bin", "/usr/libexec/cni", "/usr/lib/cni"];

pub struct CniDriver {
    conf_dir: PathBuf,
    bin_dirs: Vec<PathBuf>,
    config: OnceCell<NetworkConfig>,
}

impl CniDriver {
    pub fn new(conf_dir: PathBuf, bin_dirs: Vec<PathBuf>) -> Self {
        CniDriver {
            conf_dir,
            bin_dirs,
            config: OnceCell::new(),
        }
    }

    pub fn with_default_plugin_dirs(conf_dir: PathBuf) -> Self {
        Self::new(conf_dir, PLUGIN_DIRS.iter().map(PathBuf::from).collect())
    }

    /// Loads (and caches) the first valid config file in `conf_dir`,
    /// writing a default bridge config if none exists.
    async fn config(&self) -> Result<&NetworkConfig> {
        self.config
            .get_or_try_init(|| async { load_or_bootstrap_config(&self.conf_dir) })
            .await
    }

    fn find_plugin_binary(&self, plugin_type: &str) -> Result<PathBuf> {
        for dir in &self.bin_dirs {
            let candidate = dir.join(plugin_type);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(RuntimeError::dependency(
            Dependency::ExecFailed,
            format!("no CNI plugin binary named {plugin_type:?} found in search path"),
        ))
    }

    /// ADD: creates the namespace at `netns_path` is the caller's
    /// responsibility (see [`crate::names::pod_netns_path`]); this invokes
    /// the plugin with `CNI_COMMAND=ADD`.
    pub async fn setup(
        &self,
        pod_id: &PodId,
        pod_name: &str,
        pod_namespace: &str,
        netns_path: &str,
        ifname: &str,
        commands: &dyn CommandRunner,
    ) -> Result<CniIpResult> {
        let config = self.config().await?;
        let binary = self.find_plugin_binary(&config.plugin_type)?;

        let spec = CommandSpec::new(binary.display().to_string())
            .env("CNI_COMMAND", "ADD")
            .env("CNI_CONTAINERID", pod_id.to_string())
            .env("CNI_NETNS", netns_path)
            .env("CNI_IFNAME", ifname)
            .env(
                "CNI_ARGS",
                format!(
                    "IgnoreUnknown=1;K8S_POD_NAMESPACE={pod_namespace};K8S_POD_NAME={pod_name};\
                     K8S_POD_INFRA_CONTAINER_ID={pod_id}"
                ),
            )
            .env(
                "CNI_PATH",
                self.bin_dirs
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            )
            .inherit_ambient_env()
            .stdin(serde_json::to_vec(&config.raw).unwrap_or_default());

        let output = commands.run(spec).await?;
        if !output.success() {
            return Err(RuntimeError::dependency(
                Dependency::ExecFailed,
                format!(
                    "CNI ADD for plugin {:?} exited {}: {}",
                    config.plugin_type,
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        parse_result(&output.stdout)
    }

    /// DEL: invocation errors are logged by the caller and never
    /// propagated, per §4.6.
    pub async fn teardown(
        &self,
        pod_id: &PodId,
        pod_name: &str,
        pod_namespace: &str,
        netns_path: &str,
        ifname: &str,
        commands: &dyn CommandRunner,
    ) -> Result<()> {
        let config = self.config().await?;
        let binary = self.find_plugin_binary(&config.plugin_type)?;

        let spec = CommandSpec::new(binary.display().to_string())
            .env("CNI_COMMAND", "DEL")
            .env("CNI_CONTAINERID", pod_id.to_string())
            .env("CNI_NETNS", netns_path)
            .env("CNI_IFNAME", ifname)
            .env(
                "CNI_ARGS",
                format!(
                    "IgnoreUnknown=1;K8S_POD_NAMESPACE={pod_namespace};K8S_POD_NAME={pod_name};\
                     K8S_POD_INFRA_CONTAINER_ID={pod_id}"
                ),
            )
            .env(
                "CNI_PATH",
                self.bin_dirs
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            )
            .inherit_ambient_env()
            .stdin(serde_json::to_vec(&config.raw).unwrap_or_default());

        commands.run(spec).await.map(|_| ())
    }
}

/// Creates the network namespace at the canonical path via `ip netns add`.
pub async fn create_namespace(name: &str, commands: &dyn CommandRunner) -> Result<()> {
    let output = commands
        .run(CommandSpec::new("ip").args(["netns", "add", name]).inherit_ambient_env())
        .await?;
    crate::command::ensure_success("ip netns add", &output)
}

/// Deletes the network namespace; errors are the caller's to decide on
/// (Remove treats "already gone" as success, matching the idempotence
/// invariant for Stop/Remove).
pub async fn delete_namespace(name: &str, commands: &dyn CommandRunner) -> Result<()> {
    let output = commands
        .run(CommandSpec::new("ip").args(["netns", "delete", name]).inherit_ambient_env())
        .await?;
    if output.success() || String::from_utf8_lossy(&output.stderr).contains("No such file") {
        Ok(())
    } else {
        crate::command::ensure_success("ip netns delete", &output)
    }
}

fn load_or_bootstrap_config(conf_dir: &Path) -> Result<NetworkConfig> {
    std::fs::create_dir_all(conf_dir).map_err(config_error)?;

    let mut entries: Vec<PathBuf> = std::fs::read_dir(conf_dir)
        .map_err(config_error)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("conf") | Some("conflist") | Some("json")
            )
        })
        .collect();
    entries.sort();

    if entries.is_empty() {
        let default_path = conf_dir.join("10-bridge.conflist");
        std::fs::write(&default_path, default_bridge_config().to_string()).map_err(config_error)?;
        entries.push(default_path);
    }

    let raw = std::fs::read_to_string(&entries[0]).map_err(config_error)?;
    let value: Value = serde_json::from_str(&raw).map_err(config_error)?;
    parse_config(value)
}

fn parse_config(value: Value) -> Result<NetworkConfig> {
    // A conflist has a `plugins` array; a single-plugin file is the root
    // object itself. The active plugin is the first `plugins[]` entry.
    let plugin_obj = if let Some(plugins) = value.get("plugins").and_then(Value::as_array) {
        plugins.first().cloned().ok_or_else(|| {
            RuntimeError::new(ErrorKind::InvalidArgument, "conflist has an empty plugins[] array")
        })?
    } else {
        value.clone()
    };

    let plugin_type = plugin_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RuntimeError::new(ErrorKind::InvalidArgument, "CNI plugin config missing \"type\""))?
        .to_string();

    let (subnet, gateway) = extract_ipam_range(&plugin_obj);

    Ok(NetworkConfig {
        plugin_type,
        raw: value,
        subnet,
        gateway,
    })
}

/// IPAM supports both direct `subnet`/`gateway` and conflist-style
/// `ranges: [[{subnet, gateway}]]`.
fn extract_ipam_range(plugin_obj: &Value) -> (Option<String>, Option<String>) {
    let Some(ipam) = plugin_obj.get("ipam") else {
        return (None, None);
    };
    if let Some(ranges) = ipam.get("ranges").and_then(Value::as_array) {
        if let Some(first_group) = ranges.first().and_then(Value::as_array) {
            if let Some(first_range) = first_group.first() {
                return (
                    first_range.get("subnet").and_then(Value::as_str).map(str::to_string),
                    first_range.get("gateway").and_then(Value::as_str).map(str::to_string),
                );
            }
        }
    }
    (
        ipam.get("subnet").and_then(Value::as_str).map(str::to_string),
        ipam.get("gateway").and_then(Value::as_str).map(str::to_string),
    )
}

/// Fixed default bridge config, written when no config file exists yet.
fn default_bridge_config() -> Value {
    serde_json::json!({
        "cniVersion": CNI_VERSION,
        "name": "cri-bridge",
        "type": "bridge",
        "bridge": "cri0",
        "isGateway": true,
        "ipMasq": true,
        "hairpinMode": true,
        "ipam": {
            "type": "host-local",
            "ranges": [[{"subnet": "10.88.0.0/16"}]],
            "routes": [{"dst": "0.0.0.0/0"}]
        }
    })
}

#[derive(Deserialize)]
struct RawIp {
    address: String,
    #[serde(default)]
    gateway: Option<String>,
}

#[derive(Deserialize)]
struct RawResult {
    #[serde(default)]
    ips: Vec<RawIp>,
}

/// The first IP in `ips[]`, CIDR stripped, plus its gateway.
fn parse_result(stdout: &[u8]) -> Result<CniIpResult> {
    let result: RawResult = serde_json::from_slice(stdout).map_err(|error| {
        RuntimeError::dependency(Dependency::ExecFailed, format!("malformed CNI result JSON: {error}"))
    })?;
    let Some(first) = result.ips.into_iter().next() else {
        return Ok(CniIpResult { ip: None, gateway: None });
    };
    let ip = first.address.split('/').next().map(str::to_string);
    Ok(CniIpResult { ip, gateway: first.gateway })
}

fn config_error(error: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::new(ErrorKind::Dependency(Dependency::ExecFailed), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflist_uses_first_plugin_entry() {
        let value = serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "mynet",
            "plugins": [
                {"type": "bridge", "ipam": {"subnet": "10.1.0.0/16", "gateway": "10.1.0.1"}},
                {"type": "portmap"}
            ]
        });
        let config = parse_config(value).unwrap();
        assert_eq!(config.plugin_type, "bridge");
        assert_eq!(config.subnet.as_deref(), Some("10.1.0.0/16"));
        assert_eq!(config.gateway.as_deref(), Some("10.1.0.1"));
    }

    #[test]
    fn single_plugin_file_uses_root_object() {
        let value = serde_json::json!({
            "cniVersion": "1.0.0",
            "type": "bridge",
            "ipam": {"ranges": [[{"subnet": "10.88.0.0/16", "gateway": "10.88.0.1"}]]}
        });
        let config = parse_config(value).unwrap();
        assert_eq!(config.plugin_type, "bridge");
        assert_eq!(config.subnet.as_deref(), Some("10.88.0.0/16"));
    }

    #[test]
    fn extracts_first_ip_with_cidr_stripped() {
        let result = parse_result(
            br#"{"cniVersion":"1.0.0","ips":[{"address":"10.88.0.3/16","gateway":"10.88.0.1"}]}"#,
        )
        .unwrap();
        assert_eq!(result.ip.as_deref(), Some("10.88.0.3"));
        assert_eq!(result.gateway.as_deref(), Some("10.88.0.1"));
    }

    #[test]
    fn missing_type_is_an_invalid_argument() {
        let value = serde_json::json!({"cniVersion": "1.0.0"});
        assert!(parse_config(value).is_err());
    }
}
