//! The image puller: given a reference, produces a host machine-image-pool
//! name by shelling out to an OCI copy tool and an OCI unpack tool, then
//! importing the resulting rootfs via the [`MachineImagePool`] adapter.

use std::path::{Path, PathBuf};

use crate::command::{ensure_success, CommandRunner, CommandSpec};
use crate::error::{Dependency, Result, RuntimeError};
use crate::image_ref::ImageReference;
use crate::pool::{open_directory_fd, MachineImagePool};

/// Binary names for the external copy/unpack tools. Configurable so tests
/// can substitute a fake [`CommandRunner`] without assuming real tools are
/// installed.
pub struct ImagePuller {
    pub copy_tool: String,
    pub unpack_tool: String,
    pub scratch_dir: PathBuf,
}

impl Default for ImagePuller {
    fn default() -> Self {
        ImagePuller {
            copy_tool: "skopeo".to_string(),
            unpack_tool: "umoci".to_string(),
            scratch_dir: PathBuf::from("tmp"),
        }
    }
}

impl ImagePuller {
    pub async fn pull(
        &self,
        reference: &ImageReference,
        commands: &dyn CommandRunner,
        pool: &dyn MachineImagePool,
    ) -> Result<String> {
        let name = reference.pool_machine_name();

        // Short-circuit: the pool already has this image (S3 in the spec).
        if pool.get(&name).await?.is_some() {
            return Ok(name);
        }

        let source = format!(
            "docker://{}/{}{}",
            reference.effective_registry(),
            reference.repository,
            reference.source_suffix()
        );

        let oci_dir = self.scratch_dir.join("oci").join(&name);
        let bundle_dir = self.scratch_dir.join("bundle").join(&name);
        std::fs::create_dir_all(&oci_dir)
            .map_err(|error| RuntimeError::dependency(Dependency::PullFailed, error.to_string()))?;

        let copy_output = commands
            .run(
                CommandSpec::new(&self.copy_tool)
                    .args(["copy", &source, &format!("oci:{}", oci_dir.display())])
                    .inherit_ambient_env(),
            )
            .await?;
        if let Err(error) = ensure_success(&self.copy_tool, &copy_output) {
            let _ = std::fs::remove_dir_all(&oci_dir);
            return Err(RuntimeError::dependency(Dependency::PullFailed, error.to_string()));
        }

        let unpack_output = commands
            .run(
                CommandSpec::new(&self.unpack_tool)
                    .args([
                        "unpack",
                        "--image",
                        &oci_dir.display().to_string(),
                        &bundle_dir.display().to_string(),
                    ])
                    .inherit_ambient_env(),
            )
            .await?;
        if let Err(error) = ensure_success(&self.unpack_tool, &unpack_output) {
            let _ = std::fs::remove_dir_all(&oci_dir);
            let _ = std::fs::remove_dir_all(&bundle_dir);
            return Err(RuntimeError::dependency(Dependency::ExtractFailed, error.to_string()));
        }

        let rootfs = bundle_dir.join("rootfs");
        let import_result = self.import(&rootfs, &name, pool).await;

        let _ = std::fs::remove_dir_all(&oci_dir);
        let _ = std::fs::remove_dir_all(&bundle_dir);

        import_result?;

        if pool.get(&name).await?.is_none() {
            return Err(RuntimeError::dependency(
                Dependency::ImportFailed,
                format!("image {name:?} missing from pool after import"),
            ));
        }
        Ok(name)
    }

    async fn import(&self, rootfs: &Path, name: &str, pool: &dyn MachineImagePool) -> Result<()> {
        let file = open_directory_fd(rootfs)?;
        use std::os::fd::AsRawFd;
        pool.import_fs(file.as_raw_fd(), name, false, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::fake::FakeCommandRunner;
    use crate::pool::{ImageRecord, ImageType};
    use async_trait::async_trait;
    use std::os::fd::RawFd;
    use std::sync::Mutex;
    use zbus::zvariant::OwnedObjectPath;

    #[derive(Default)]
    struct FakePool {
        present: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MachineImagePool for FakePool {
        async fn list(&self) -> Result<Vec<ImageRecord>> {
            Ok(Vec::new())
        }

        async fn get(&self, name: &str) -> Result<Option<ImageRecord>> {
            Ok(self.present.lock().unwrap().iter().any(|n| n == name).then(|| ImageRecord {
                name: name.to_string(),
                image_type: ImageType::Directory,
                read_only: true,
                creation_time_usec: 0,
                modification_time_usec: 0,
                disk_usage_bytes: 0,
                object_path: OwnedObjectPath::try_from("/x").unwrap(),
            }))
        }

        async fn remove(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn clone_image(&self, _src: &str, _dst: &str, _read_only: bool) -> Result<()> {
            Ok(())
        }

        async fn import_fs(&self, _fd: RawFd, name: &str, _force: bool, _read_only: bool) -> Result<()> {
            self.present.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn get_pool_path(&self) -> &str {
            "/var/lib/machines"
        }

        async fn mark_read_only(&self, _name: &str, _flag: bool) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn already_present_image_short_circuits_without_invoking_tools() {
        let pool = FakePool::default();
        pool.present.lock().unwrap().push("nginx-1-19".to_string());
        let commands = FakeCommandRunner::default();
        let puller = ImagePuller {
            scratch_dir: std::env::temp_dir().join("puller-test-short-circuit"),
            ..Default::default()
        };

        let reference = ImageReference::parse("nginx:1.19").unwrap();
        let name = puller.pull(&reference, &commands, &pool).await.unwrap();

        assert_eq!(name, "nginx-1-19");
        assert!(commands.calls.lock().unwrap().is_empty());
    }
}
