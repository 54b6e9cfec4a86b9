//! The overlay manager: composes a per-container overlay filesystem from
//! an image rootfs (lower) and a writable scratch tree (upper/work/merged).

use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};

use crate::error::{Dependency, ErrorKind, Result, RuntimeError};

/// The four directories that make up one container's overlay.
#[derive(Debug, Clone)]
pub struct OverlayLayout {
    pub lower_dirs: Vec<PathBuf>,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
}

impl OverlayLayout {
    /// `base` is the container's scratch directory,
    /// `{base}/{upper,work,rootfs}` per the persisted-state layout.
    pub fn for_container(base: &Path, image_rootfs: &Path) -> Self {
        OverlayLayout {
            lower_dirs: vec![image_rootfs.to_path_buf()],
            upper_dir: base.join("upper"),
            work_dir: base.join("work"),
            merged_dir: base.join("rootfs"),
        }
    }

    /// `lowerdir=L1:L2:...,upperdir=U,workdir=W`, lower directories
    /// bottom-first, colon-joined.
    pub fn mount_options(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={lower},upperdir={},workdir={}",
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// An image rootfs "looks like a rootfs" if it has a `bin/` or `usr/`
/// entry; otherwise the container starts without `RootDirectory`
/// isolation and a warning is logged by the caller.
pub fn looks_like_rootfs(path: &Path) -> bool {
    path.join("bin").is_dir() || path.join("usr").is_dir()
}

/// Idempotent: `prepare`/`mount`/`unmount`/`cleanup` are all safe to call
/// more than once or out of the happy path.
pub struct OverlayManager;

impl OverlayManager {
    /// Creates `upper_dir`/`work_dir`/`merged_dir` if they don't already
    /// exist.
    pub fn prepare(layout: &OverlayLayout) -> Result<()> {
        for dir in [&layout.upper_dir, &layout.work_dir, &layout.merged_dir] {
            std::fs::create_dir_all(dir).map_err(|error| {
                RuntimeError::dependency(
                    Dependency::ExecFailed,
                    format!("failed to create overlay directory {}: {error}", dir.display()),
                )
            })?;
        }
        Ok(())
    }

    /// No-op if `merged_dir` is already a mountpoint.
    pub fn mount(layout: &OverlayLayout) -> Result<()> {
        if is_mounted(&layout.merged_dir) {
            return Ok(());
        }
        let options = layout.mount_options();
        nix::mount::mount(
            Some("overlay"),
            &layout.merged_dir,
            Some("overlay"),
            nix::mount::MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|error| {
            RuntimeError::dependency(
                Dependency::ExecFailed,
                format!("overlay mount of {} failed: {error}", layout.merged_dir.display()),
            )
        })
    }

    /// Normal unmount first, falling back to a lazy (detach) unmount if
    /// the merged directory is still busy. No-op if not mounted.
    pub fn unmount(layout: &OverlayLayout) -> Result<()> {
        if !is_mounted(&layout.merged_dir) {
            return Ok(());
        }
        if umount2(&layout.merged_dir, MntFlags::empty()).is_ok() {
            return Ok(());
        }
        umount2(&layout.merged_dir, MntFlags::MNT_DETACH).map_err(|error| {
            RuntimeError::dependency(
                Dependency::ExecFailed,
                format!("overlay unmount of {} failed: {error}", layout.merged_dir.display()),
            )
        })
    }

    /// Unmounts (if mounted) then removes all three writable directories.
    pub fn cleanup(layout: &OverlayLayout) -> Result<()> {
        Self::unmount(layout)?;
        for dir in [&layout.upper_dir, &layout.work_dir, &layout.merged_dir] {
            if dir.exists() {
                std::fs::remove_dir_all(dir).map_err(|error| {
                    RuntimeError::new(
                        ErrorKind::Dependency(Dependency::ExecFailed),
                        format!("failed removing overlay directory {}: {error}", dir.display()),
                    )
                })?;
            }
        }
        Ok(())
    }
}

fn is_mounted(path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    let target = path.display().to_string();
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(4) == Some(target.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mount_options_join_lower_dirs_bottom_first() {
        let layout = OverlayLayout {
            lower_dirs: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            upper_dir: PathBuf::from("/u"),
            work_dir: PathBuf::from("/w"),
            merged_dir: PathBuf::from("/m"),
        };
        assert_eq!(layout.mount_options(), "lowerdir=/a:/b,upperdir=/u,workdir=/w");
    }

    #[test]
    fn prepare_creates_writable_directories_idempotently() {
        let base = tempdir().unwrap();
        let image = tempdir().unwrap();
        let layout = OverlayLayout::for_container(base.path(), image.path());

        OverlayManager::prepare(&layout).unwrap();
        OverlayManager::prepare(&layout).unwrap();

        assert!(layout.upper_dir.is_dir());
        assert!(layout.work_dir.is_dir());
        assert!(layout.merged_dir.is_dir());
    }

    #[test]
    fn looks_like_rootfs_requires_bin_or_usr() {
        let dir = tempdir().unwrap();
        assert!(!looks_like_rootfs(dir.path()));
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        assert!(looks_like_rootfs(dir.path()));
    }

    #[test]
    fn unmount_of_unmounted_merged_dir_is_a_no_op() {
        let base = tempdir().unwrap();
        let image = tempdir().unwrap();
        let layout = OverlayLayout::for_container(base.path(), image.path());
        OverlayManager::prepare(&layout).unwrap();
        OverlayManager::unmount(&layout).unwrap();
    }
}
