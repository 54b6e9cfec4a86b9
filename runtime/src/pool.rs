//! The machine image pool adapter: `org.freedesktop.machine1` over the
//! system bus, as used by `machinectl`/`systemd-importd`.

use std::os::fd::RawFd;
use std::time::Duration;

use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::Connection;

use crate::error::{Dependency, ErrorKind, Result, RuntimeError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const POLL_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Directory,
    Subvolume,
    Raw,
    Block,
    Unknown,
}

impl ImageType {
    fn from_str(value: &str) -> Self {
        match value {
            "directory" => ImageType::Directory,
            "subvolume" => ImageType::Subvolume,
            "raw" => ImageType::Raw,
            "block" => ImageType::Block,
            _ => ImageType::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub name: String,
    pub image_type: ImageType,
    pub read_only: bool,
    pub creation_time_usec: u64,
    pub modification_time_usec: u64,
    pub disk_usage_bytes: u64,
    pub object_path: OwnedObjectPath,
}

#[async_trait::async_trait]
pub trait MachineImagePool: Send + Sync {
    async fn list(&self) -> Result<Vec<ImageRecord>>;
    async fn get(&self, name: &str) -> Result<Option<ImageRecord>>;
    async fn remove(&self, name: &str) -> Result<()>;
    async fn clone_image(&self, src: &str, dst: &str, read_only: bool) -> Result<()>;
    /// Imports `directory_fd` as a new pool image named `name`, polling
    /// completion per §4.3: ~100ms cadence, 30s cap.
    async fn import_fs(&self, directory_fd: RawFd, name: &str, force: bool, read_only: bool) -> Result<()>;
    fn get_pool_path(&self) -> &str;
    async fn mark_read_only(&self, name: &str, flag: bool) -> Result<()>;
}

pub struct MachinedClient {
    connection: Connection,
    pool_path: String,
}

impl MachinedClient {
    pub async fn connect() -> Result<Self> {
        let connection = Connection::system().await.map_err(dbus_error)?;
        Ok(MachinedClient {
            connection,
            pool_path: "/var/lib/machines".to_string(),
        })
    }

    fn manager_proxy(&self) -> zbus::Proxy<'_> {
        zbus::Proxy::new_owned(
            self.connection.clone().into(),
            "org.freedesktop.machine1",
            "/org/freedesktop/machine1",
            "org.freedesktop.machine1.Manager",
        )
        .expect("well-formed static proxy parameters")
    }

    async fn image_property<T: TryFrom<Value<'static>>>(
        &self,
        object_path: &OwnedObjectPath,
        property: &str,
    ) -> Result<Option<T>> {
        let proxy = zbus::Proxy::new_owned(
            self.connection.clone().into(),
            "org.freedesktop.machine1",
            object_path.clone(),
            "org.freedesktop.DBus.Properties",
        )
        .map_err(dbus_error)?;
        let reply = proxy
            .call_method("Get", &("org.freedesktop.machine1.Image", property))
            .await;
        match reply {
            Ok(reply) => {
                let value: Value = reply.body().deserialize().map_err(dbus_error)?;
                Ok(value.try_into().ok())
            }
            // Some image types (e.g. `raw`) don't expose timestamps; treat
            // a missing property as absent, not as an error.
            Err(_) => Ok(None),
        }
    }

    /// Whether the transfer object at `path` still exposes a `Progress`
    /// property. `systemd-importd` removes the object once the transfer
    /// finishes, whether it succeeded or failed, so a property-get failure
    /// here means the transfer ended per §4.3.
    async fn transfer_in_progress(&self, path: &OwnedObjectPath) -> bool {
        let Ok(proxy) = zbus::Proxy::new_owned(
            self.connection.clone().into(),
            "org.freedesktop.machine1",
            path.clone(),
            "org.freedesktop.DBus.Properties",
        ) else {
            return false;
        };
        proxy
            .call_method("Get", &("org.freedesktop.import1.Transfer", "Progress"))
            .await
            .is_ok()
    }

    async fn load_image(&self, name: &str, object_path: OwnedObjectPath) -> Result<ImageRecord> {
        let image_type: Option<String> = self.image_property(&object_path, "Type").await?;
        let read_only: Option<bool> = self.image_property(&object_path, "ReadOnly").await?;
        let creation_time_usec: Option<u64> = self.image_property(&object_path, "CreationTimestamp").await?;
        let modification_time_usec: Option<u64> =
            self.image_property(&object_path, "ModificationTimestamp").await?;
        let disk_usage_bytes: Option<u64> = self.image_property(&object_path, "Usage").await?;

        Ok(ImageRecord {
            name: name.to_string(),
            image_type: ImageType::from_str(image_type.as_deref().unwrap_or("unknown")),
            read_only: read_only.unwrap_or(false),
            creation_time_usec: creation_time_usec.unwrap_or(0),
            modification_time_usec: modification_time_usec.unwrap_or(0),
            disk_usage_bytes: disk_usage_bytes.unwrap_or(0),
            object_path,
        })
    }
}

#[async_trait::async_trait]
impl MachineImagePool for MachinedClient {
    async fn list(&self) -> Result<Vec<ImageRecord>> {
        let reply = self
            .manager_proxy()
            .call_method("ListImages", &())
            .await
            .map_err(dbus_error)?;
        let entries: Vec<(String, String, bool, u64, u64, u64, OwnedObjectPath)> =
            reply.body().deserialize().map_err(dbus_error)?;
        let mut images = Vec::with_capacity(entries.len());
        for (name, image_type, read_only, creation, modification, usage, path) in entries {
            images.push(ImageRecord {
                name,
                image_type: ImageType::from_str(&image_type),
                read_only,
                creation_time_usec: creation,
                modification_time_usec: modification,
                disk_usage_bytes: usage,
                object_path: path,
            });
        }
        Ok(images)
    }

    async fn get(&self, name: &str) -> Result<Option<ImageRecord>> {
        match self.manager_proxy().call_method("GetImage", &(name,)).await {
            Ok(reply) => {
                let path: OwnedObjectPath = reply.body().deserialize().map_err(dbus_error)?;
                Ok(Some(self.load_image(name, path).await?))
            }
            Err(error) if is_no_such_image(&error) => Ok(None),
            Err(error) => Err(dbus_error(error)),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self.manager_proxy().call_method("RemoveImage", &(name,)).await {
            Ok(_) => Ok(()),
            Err(error) if is_no_such_image(&error) => Ok(()),
            Err(error) => Err(dbus_error(error)),
        }
    }

    async fn clone_image(&self, src: &str, dst: &str, read_only: bool) -> Result<()> {
        self.manager_proxy()
            .call_method("CloneImage", &(src, dst, read_only))
            .await
            .map_err(dbus_error)?;
        Ok(())
    }

    async fn import_fs(&self, directory_fd: RawFd, name: &str, force: bool, read_only: bool) -> Result<()> {
        let fd = zbus::zvariant::Fd::from(directory_fd);
        let reply = self
            .manager_proxy()
            .call_method("ImportFileSystem", &(fd, name, force, read_only))
            .await
            .map_err(dbus_error)?;
        let transfer_path: OwnedObjectPath = reply.body().deserialize().map_err(dbus_error)?;

        let deadline = tokio::time::Instant::now() + POLL_CAP;
        loop {
            if self.get(name).await?.is_some() {
                return Ok(());
            }
            if !self.transfer_in_progress(&transfer_path).await {
                return Err(RuntimeError::dependency(
                    Dependency::ImportFailed,
                    format!("import transfer for {name:?} ended without producing the image"),
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::timeout(format!(
                    "import of image {name:?} did not complete within {POLL_CAP:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn get_pool_path(&self) -> &str {
        &self.pool_path
    }

    async fn mark_read_only(&self, name: &str, flag: bool) -> Result<()> {
        self.manager_proxy()
            .call_method("MarkImageReadOnly", &(name, flag))
            .await
            .map_err(dbus_error)?;
        Ok(())
    }
}

fn is_no_such_image(error: &zbus::Error) -> bool {
    error.to_string().contains("NoSuchImage")
}

fn dbus_error(error: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::new(ErrorKind::Dependency(Dependency::DbusError), error.to_string())
}

/// Opens `path` to obtain a directory file descriptor suitable for
/// [`MachineImagePool::import_fs`].
pub fn open_directory_fd(path: &std::path::Path) -> Result<std::fs::File> {
    std::fs::File::open(path).map_err(|error| {
        RuntimeError::dependency(
            Dependency::ImportFailed,
            format!("failed to open {} for import: {error}", path.display()),
        )
    })
}
