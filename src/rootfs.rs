//! Overlay root filesystem assembly and teardown.
//!
//! The union mount itself and the `pivot_root` sequence reuse the same
//! `mount(2)`/`MsFlags` plumbing as the original overlay/base-mount helpers:
//! a shared-propagation prep step before clone, an in-container bind step
//! after, and a true `pivot_root` (not `chroot`) so the old root is fully
//! detached rather than merely hidden behind a new working directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::fchdir;

use crate::ids::OverlayId;
use crate::syscall::ignore_kind;
use crate::Error;

pub struct RootfsAssembler {
    layers_root: PathBuf,
}

impl RootfsAssembler {
    pub fn new(layers_root: impl Into<PathBuf>) -> Self {
        Self {
            layers_root: layers_root.into(),
        }
    }

    pub fn layers_root(&self) -> &Path {
        &self.layers_root
    }

    fn triple(&self, id: OverlayId) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
        let base = self.layers_root.join(id.to_string());
        (
            base.clone(),
            base.join("upper"),
            base.join("work"),
            base.join("merged"),
        )
    }

    /// Creates a fresh upper/work/merged triple and mounts an overlay over
    /// `image_path` as the lower layer. The id is assigned here rather than
    /// by the caller so assembly and naming can never drift apart.
    ///
    /// UUID collisions are already vanishingly unlikely, but `create_dir`
    /// is inherently exclusive (`EEXIST` on collision), so a bounded number
    /// of id rerolls is a cheap backstop against the case where a layers
    /// root is shared and somehow already has an entry under the id drawn.
    pub fn assemble(&self, image_path: &Path) -> Result<(OverlayId, PathBuf), Error> {
        if !image_path.is_dir() {
            return Err(format!("image path does not exist: {}", image_path.display()).into());
        }
        fs::create_dir_all(&self.layers_root).map_err(|e| {
            format!(
                "cannot create layers root {}: {e}",
                self.layers_root.display()
            )
        })?;
        const MAX_ATTEMPTS: u32 = 8;
        let mut last_err = None;
        for _ in 0..MAX_ATTEMPTS {
            let id = OverlayId::new();
            match self.try_create_triple(id) {
                Ok((upper, work, merged)) => {
                    self.mount_overlay(image_path, &upper, &work, &merged)?;
                    return Ok((id, merged));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => last_err = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(format!(
            "cannot allocate a fresh overlay id after {MAX_ATTEMPTS} attempts: {}",
            last_err.expect("loop only exits via return or a recorded AlreadyExists error")
        )
        .into())
    }

    /// Creates the upper/work/merged triple for `id`. Returns `EEXIST` (via
    /// the base directory or any of the three) unmodified so [`Self::assemble`]
    /// can distinguish a genuine collision from any other I/O failure.
    fn try_create_triple(&self, id: OverlayId) -> std::io::Result<(PathBuf, PathBuf, PathBuf)> {
        let (base, upper, work, merged) = self.triple(id);
        fs::create_dir(&base)?;
        fs::create_dir(&upper)?;
        fs::create_dir(&work)?;
        fs::create_dir(&merged)?;
        Ok((upper, work, merged))
    }

    /// Re-mounts the overlay for an existing triple, over the same image
    /// and upper layer as before. Used by `start`: the upper directory
    /// (and thus whatever the container wrote) survives the stop/start
    /// cycle untouched.
    pub fn remount(&self, id: OverlayId, image_path: &Path) -> Result<PathBuf, Error> {
        let (_, upper, work, merged) = self.triple(id);
        fs::create_dir_all(&merged)?;
        self.mount_overlay(image_path, &upper, &work, &merged)?;
        Ok(merged)
    }

    fn mount_overlay(
        &self,
        lowerdir: &Path,
        upperdir: &Path,
        workdir: &Path,
        merged: &Path,
    ) -> Result<(), Error> {
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdir.display(),
            upperdir.display(),
            workdir.display(),
        );
        mount(
            Some("overlay"),
            merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|e| format!("cannot mount overlay at {}: {e}", merged.display()))?;
        Ok(())
    }

    /// Marks `host_dir` shared-propagation so mounts made from inside the
    /// container at the same subpath become visible on the host. Must run
    /// before clone, since it touches the host's own mount namespace.
    pub fn prepare_bind(&self, host_dir: &Path) -> Result<(), Error> {
        mount(
            None::<&str>,
            host_dir,
            None::<&str>,
            MsFlags::MS_SHARED | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("cannot mark {} shared: {e}", host_dir.display()))?;
        Ok(())
    }

    /// Creates the target path inside `merged` and bind-mounts `host_dir`
    /// onto it. Runs inside the container, before pivot, so the target path
    /// is created relative to the about-to-become-root `merged` tree.
    pub fn apply_bind_inside(merged: &Path, host_dir: &Path) -> Result<(), Error> {
        let target = join_under(merged, host_dir);
        fs::create_dir_all(&target)
            .map_err(|e| format!("cannot create bind target {}: {e}", target.display()))?;
        mount(
            Some(host_dir),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("cannot bind {} onto {}: {e}", host_dir.display(), target.display()))?;
        Ok(())
    }

    /// Lazy-unmounts `/proc`, the propagated bind (if any), then `merged`
    /// itself. Order matters: inner mounts must go before the overlay they
    /// sit on. Used by both `stop` (directories survive, for `start` to
    /// reuse) and [`Self::teardown`] (directories are then removed too).
    pub fn unmount(&self, id: OverlayId, propagated: Option<&Path>) -> Result<(), Error> {
        let (_, _, _, merged) = self.triple(id);
        lazy_unmount(&merged.join("proc"))?;
        if let Some(host_dir) = propagated {
            lazy_unmount(&join_under(&merged, host_dir))?;
        }
        lazy_unmount(&merged)?;
        Ok(())
    }

    /// Unmounts everything [`Self::unmount`] does, then recursively removes
    /// the overlay triple. Used by `rm`.
    pub fn teardown(&self, id: OverlayId, propagated: Option<&Path>) -> Result<(), Error> {
        self.unmount(id, propagated)?;
        let (base, _, _, _) = self.triple(id);
        ignore_kind(fs::remove_dir_all(&base), ErrorKind::NotFound)
            .map_err(|e| format!("cannot remove overlay {}: {e}", base.display()))?;
        Ok(())
    }
}

fn join_under(root: &Path, absolute: &Path) -> PathBuf {
    root.join(absolute.strip_prefix("/").unwrap_or(absolute))
}

fn lazy_unmount(path: &Path) -> Result<(), Error> {
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::EINVAL) => Ok(()),
        Err(e) => Err(format!("cannot unmount {}: {e}", path.display()).into()),
    }
}

/// Runs inside the child after the identity-map handshake completes:
/// privatizes the mount namespace, performs any optional bind propagation,
/// then replaces the process root with `merged` via a real `pivot_root`.
pub fn pivot_into(merged: &Path) -> Result<(), Error> {
    remount_private(merged)?;
    mount_base(merged)?;
    pivot_root(merged)
}

fn remount_private(merged: &Path) -> Result<(), Error> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    mount(
        Some(merged),
        merged,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    Ok(())
}

/// The small set of virtual filesystems every container needs regardless
/// of the image: sysfs, dev, pts, shm, mqueue, and the cgroup2 tree. `/proc`
/// is mounted separately, after pivot, once the PID namespace is current.
fn mount_base(merged: &Path) -> Result<(), Error> {
    setup_mount(
        merged,
        "sysfs",
        "sys",
        "sysfs",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
        None,
    )?;
    setup_mount(
        merged,
        "tmpfs",
        "dev",
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755,size=65536k"),
    )?;
    setup_mount(
        merged,
        "devpts",
        "dev/pts",
        "devpts",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )?;
    setup_mount(
        merged,
        "tmpfs",
        "dev/shm",
        "tmpfs",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777,size=65536k"),
    )?;
    setup_mount(
        merged,
        "mqueue",
        "dev/mqueue",
        "mqueue",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )?;
    Ok(())
}

fn setup_mount(
    rootfs: &Path,
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), Error> {
    let target = rootfs.join(target);
    ignore_kind(fs::create_dir_all(&target), ErrorKind::AlreadyExists)?;
    mount(Some(source), &target, Some(fstype), flags, data)
        .map_err(|e| format!("cannot mount {fstype} at {}: {e}", target.display()))?;
    Ok(())
}

fn pivot_root(path: &Path) -> Result<(), Error> {
    let new_root = open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())?;
    nix::unistd::pivot_root(path, path)?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    umount2("/", MntFlags::MNT_DETACH)?;
    fchdir(&new_root)?;
    Ok(())
}

/// Mounts a fresh `/proc`. Valid once the calling process is running as
/// pid 1 of a new PID namespace, which is only true after pivot.
pub fn mount_proc() -> Result<(), Error> {
    ignore_kind(fs::create_dir_all("/proc"), ErrorKind::AlreadyExists)?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| format!("cannot mount /proc: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::OverlayId;

    /// Directory creation, unlike the overlay mount itself, needs no
    /// privilege, so the collision path `assemble`'s retry loop guards
    /// against is exercisable directly: a pre-existing base directory for
    /// a given id surfaces as `AlreadyExists`, the signal `assemble` rerolls
    /// on.
    #[test]
    fn try_create_triple_reports_collision_as_already_exists() {
        let tmp = std::env::temp_dir().join(format!(
            "conbox-rootfs-test-{}-{}",
            std::process::id(),
            OverlayId::new()
        ));
        let assembler = RootfsAssembler::new(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let id = OverlayId::new();
        fs::create_dir(tmp.join(id.to_string())).unwrap();

        let err = assembler.try_create_triple(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn try_create_triple_succeeds_for_a_fresh_id() {
        let tmp = std::env::temp_dir().join(format!(
            "conbox-rootfs-test-{}-{}",
            std::process::id(),
            OverlayId::new()
        ));
        fs::create_dir_all(&tmp).unwrap();
        let assembler = RootfsAssembler::new(&tmp);

        let id = OverlayId::new();
        let (upper, work, merged) = assembler.try_create_triple(id).unwrap();
        assert!(upper.is_dir());
        assert!(work.is_dir());
        assert!(merged.is_dir());

        let _ = fs::remove_dir_all(&tmp);
    }
}
