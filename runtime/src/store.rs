//! Durable state: pods, containers, and the pod→container secondary index.
//!
//! Records are serialized as JSON, with `#[serde(default)]` on every
//! optional field, so a reader from an older version of this runtime can
//! skip fields it doesn't know about yet instead of failing to deserialize.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Dependency, ErrorKind, Result, RuntimeError};
use crate::ids::{ContainerId, PodId};

/// One write in a [`KvStore::apply`] batch.
pub enum KvOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// The key-value operations the lifecycle engine needs. A trait so tests
/// can swap in an in-memory fake instead of touching disk.
pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Applies every operation as a single durable write. The default,
    /// sequential fallback is not atomic; [`SledStore`] overrides it with a
    /// `sled::Batch` so a record and its secondary index entry never
    /// observably diverge.
    fn apply(&self, ops: &[KvOp]) -> Result<()> {
        for op in ops {
            match op {
                KvOp::Put(key, value) => self.put(key, value)?,
                KvOp::Delete(key) => self.delete(key)?,
            }
        }
        Ok(())
    }
}

/// `sled`-backed embedded store. Writes call `flush` before returning so
/// they are durable by the time the caller observes success.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path).map_err(|error| {
            RuntimeError::dependency(
                Dependency::StoreError,
                format!("failed to open state store at {}: {error}", path.display()),
            )
        })?;
        Ok(SledStore { db })
    }
}

impl KvStore for SledStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.insert(key, value).map_err(store_error)?;
        self.db.flush().map_err(store_error)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(key)
            .map_err(store_error)?
            .map(|value| value.to_vec()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key).map_err(store_error)?;
        self.db.flush().map_err(store_error)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (key, _) = entry.map_err(store_error)?;
            let key = String::from_utf8(key.to_vec()).map_err(|error| {
                RuntimeError::dependency(
                    Dependency::StoreError,
                    format!("non-UTF-8 key in state store: {error}"),
                )
            })?;
            keys.push(key);
        }
        Ok(keys)
    }

    fn apply(&self, ops: &[KvOp]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                KvOp::Put(key, value) => batch.insert(key.as_bytes(), value.as_slice()),
                KvOp::Delete(key) => batch.remove(key.as_bytes()),
            }
        }
        self.db.apply_batch(batch).map_err(store_error)?;
        self.db.flush().map_err(store_error)?;
        Ok(())
    }
}

fn store_error(error: sled::Error) -> RuntimeError {
    RuntimeError::dependency(Dependency::StoreError, error.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodState {
    Created,
    Ready,
    NotReady,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodRecord {
    pub id: PodId,
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub state: PodState,
    pub created_at: i64,
    pub unit_name: String,
    #[serde(default)]
    pub network_namespace: Option<String>,
    #[serde(default)]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub pod_gateway: Option<String>,
    #[serde(default)]
    pub cni_network_config: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub pod_sandbox_id: PodId,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub image_ref: Option<String>,
    pub state: ContainerState,
    pub created_at: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: i64,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub pid: Option<u32>,
    pub unit_name: String,
    #[serde(default)]
    pub rootfs_path: Option<String>,
    #[serde(default)]
    pub image_rootfs: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub run_as_group: Option<i64>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub readonly_rootfs: bool,
    #[serde(default)]
    pub mounts_json: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Typed wrapper around a [`KvStore`], encoding the logical key space from
/// the spec (`pods/{id}`, `containers/{id}`, `pod_containers/{pod}/{id}`).
pub struct Store {
    kv: Box<dyn KvStore>,
}

impl Store {
    pub fn new(kv: Box<dyn KvStore>) -> Self {
        Store { kv }
    }

    pub fn put_pod(&self, pod: &PodRecord) -> Result<()> {
        let value = serde_json::to_vec(pod).map_err(serialize_error)?;
        self.kv.put(&pod_key(&pod.id), &value)
    }

    pub fn get_pod(&self, id: &PodId) -> Result<Option<PodRecord>> {
        match self.kv.get(&pod_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(serialize_error)?)),
            None => Ok(None),
        }
    }

    pub fn delete_pod(&self, id: &PodId) -> Result<()> {
        self.kv.delete(&pod_key(id))
    }

    pub fn list_pods(&self) -> Result<Vec<PodRecord>> {
        let mut pods = Vec::new();
        for key in self.kv.scan_prefix("pods/")? {
            if let Some(bytes) = self.kv.get(&key)? {
                pods.push(serde_json::from_slice(&bytes).map_err(serialize_error)?);
            }
        }
        Ok(pods)
    }

    pub fn put_container(&self, container: &ContainerRecord) -> Result<()> {
        let value = serde_json::to_vec(container).map_err(serialize_error)?;
        self.kv.apply(&[
            KvOp::Put(container_key(&container.id), value),
            KvOp::Put(index_key(&container.pod_sandbox_id, &container.id), Vec::new()),
        ])
    }

    pub fn get_container(&self, id: &ContainerId) -> Result<Option<ContainerRecord>> {
        match self.kv.get(&container_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(serialize_error)?)),
            None => Ok(None),
        }
    }

    pub fn delete_container(&self, id: &ContainerId, pod_id: &PodId) -> Result<()> {
        self.kv.apply(&[
            KvOp::Delete(container_key(id)),
            KvOp::Delete(index_key(pod_id, id)),
        ])
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let mut containers = Vec::new();
        for key in self.kv.scan_prefix("containers/")? {
            if let Some(bytes) = self.kv.get(&key)? {
                containers.push(serde_json::from_slice(&bytes).map_err(serialize_error)?);
            }
        }
        Ok(containers)
    }

    /// Container IDs owned by `pod_id`, via the secondary index (no scan of
    /// the full container table).
    pub fn list_container_ids_for_pod(&self, pod_id: &PodId) -> Result<Vec<ContainerId>> {
        let prefix = format!("pod_containers/{pod_id}/");
        self.kv
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|id| id.parse().ok())
                    .ok_or_else(|| {
                        RuntimeError::dependency(
                            Dependency::StoreError,
                            format!("malformed secondary index key {key:?}"),
                        )
                    })
            })
            .collect()
    }
}

fn pod_key(id: &PodId) -> String {
    format!("pods/{id}")
}

fn container_key(id: &ContainerId) -> String {
    format!("containers/{id}")
}

fn index_key(pod_id: &PodId, container_id: &ContainerId) -> String {
    format!("pod_containers/{pod_id}/{container_id}")
}

fn serialize_error(error: serde_json::Error) -> RuntimeError {
    RuntimeError::new(ErrorKind::Dependency(Dependency::StoreError), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Minimal in-memory `KvStore` for exercising `Store`'s key-space logic
    /// without touching disk.
    #[derive(Default)]
    struct MemoryKv {
        map: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl KvStore for MemoryKv {
        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            self.map.lock().unwrap().insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.map.lock().unwrap().get(key).cloned())
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.map.lock().unwrap().remove(key);
            Ok(())
        }

        fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .map
                .lock()
                .unwrap()
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    fn store() -> Store {
        Store::new(Box::new(MemoryKv::default()))
    }

    fn pod_record(id: PodId) -> PodRecord {
        PodRecord {
            id,
            name: "p1".into(),
            uid: "u1".into(),
            namespace: "default".into(),
            state: PodState::Ready,
            created_at: 1,
            unit_name: crate::names::pod_unit_name(&id),
            network_namespace: None,
            pod_ip: None,
            pod_gateway: None,
            cni_network_config: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    fn container_record(id: ContainerId, pod_id: PodId) -> ContainerRecord {
        ContainerRecord {
            id,
            pod_sandbox_id: pod_id,
            name: "c1".into(),
            image: "nginx:latest".into(),
            image_ref: None,
            state: ContainerState::Created,
            created_at: 1,
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            pid: None,
            unit_name: crate::names::container_unit_name(&id),
            rootfs_path: None,
            image_rootfs: None,
            log_path: None,
            command: vec![],
            working_dir: None,
            run_as_user: None,
            run_as_group: None,
            privileged: false,
            readonly_rootfs: false,
            mounts_json: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn put_then_get_pod_round_trips() {
        let store = store();
        let pod = pod_record(PodId::new());
        store.put_pod(&pod).unwrap();
        let loaded = store.get_pod(&pod.id).unwrap().unwrap();
        assert_eq!(loaded.name, pod.name);
        assert_eq!(loaded.state, PodState::Ready);
    }

    #[test]
    fn get_missing_pod_returns_none() {
        let store = store();
        assert!(store.get_pod(&PodId::new()).unwrap().is_none());
    }

    #[test]
    fn container_save_maintains_secondary_index() {
        let store = store();
        let pod_id = PodId::new();
        let container = container_record(ContainerId::new(), pod_id);
        store.put_container(&container).unwrap();

        let ids = store.list_container_ids_for_pod(&pod_id).unwrap();
        assert_eq!(ids, vec![container.id]);
    }

    #[test]
    fn deleting_container_removes_index_entry() {
        let store = store();
        let pod_id = PodId::new();
        let container = container_record(ContainerId::new(), pod_id);
        store.put_container(&container).unwrap();
        store.delete_container(&container.id, &pod_id).unwrap();

        assert!(store.get_container(&container.id).unwrap().is_none());
        assert!(store.list_container_ids_for_pod(&pod_id).unwrap().is_empty());
    }
}
