use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Once;

use rand::distributions::{Alphanumeric, DistString as _};
use tar::Archive;

use conbox::Error;

pub struct TempDir(PathBuf);

impl TempDir {
    #[allow(unused)]
    pub fn new() -> Result<Self, Error> {
        let tmpdir = Path::new(env!("CARGO_TARGET_TMPDIR"));
        let path = loop {
            let path = tmpdir.join(format!("test-{}", rand_string(32)));
            match std::fs::metadata(&path) {
                Ok(_) => continue,
                Err(v) if v.kind() == ErrorKind::NotFound => break path,
                Err(v) => return Err(v.into()),
            }
        };
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    #[allow(unused)]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.0.join(path)
    }

    #[allow(unused)]
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[allow(unused)]
pub fn rand_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// A throwaway cgroup v2 leaf nested under the current process's own
/// cgroup (or `TEST_CGROUP_PATH` if set), removed on drop. Plain `mkdir`/
/// `rmdir` against cgroupfs, the same way a container leaf is created --
/// no dedicated "Cgroup" type, just a path [`conbox::cgroup::CgroupController`]
/// can be pointed at.
pub struct TempCgroup(PathBuf);

impl TempCgroup {
    #[allow(unused)]
    pub fn new() -> Result<Self, Error> {
        let base = current_cgroup_path()?;
        let path = base.join(format!("conbox-test-{}", rand_string(16)));
        std::fs::create_dir(&path)
            .map_err(|e| format!("cannot create test cgroup {}: {e}", path.display()))?;
        Ok(Self(path))
    }

    #[allow(unused)]
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempCgroup {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.0);
    }
}

fn current_cgroup_path() -> Result<PathBuf, Error> {
    if let Ok(v) = std::env::var("TEST_CGROUP_PATH") {
        return Ok(PathBuf::from(v));
    }
    let contents = std::fs::read_to_string("/proc/self/cgroup")?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("0::") {
            return Ok(PathBuf::from("/sys/fs/cgroup").join(rest.trim_start_matches('/')));
        }
    }
    Err("no cgroup v2 entry in /proc/self/cgroup".into())
}

/// Fetches and unpacks a small static busybox rootfs into `dest`, once per
/// test binary invocation. Network-dependent, mirroring the teacher's own
/// `get_rootfs` fixture.
#[allow(unused)]
pub fn unpack_busybox_rootfs(dest: &Path) -> Result<(), Error> {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        assert!(std::process::Command::new("curl")
            .args([
                "-fsSL",
                "--retry",
                "5",
                "https://github.com/docker-library/busybox/raw/31d342ad033e27c18723a516a2274ab39547be27/stable/glibc/busybox.tar.xz",
                "-o",
                "rootfs.tar.xz",
            ])
            .current_dir("./tests")
            .status()
            .unwrap()
            .success());
        assert!(std::process::Command::new("xz")
            .args(["-dkf", "rootfs.tar.xz"])
            .current_dir("./tests")
            .status()
            .unwrap()
            .success());
    });
    std::fs::create_dir_all(dest)?;
    let mut archive = Archive::new(File::open("./tests/rootfs.tar")?);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_unpack_xattrs(true);
    archive.unpack(dest)?;
    Ok(())
}

/// Privileged tests (namespace/cgroup integration) skip rather than fail
/// when not running as root, matching the teacher's own integration tests.
#[allow(unused)]
pub fn requires_root() -> bool {
    if !nix::unistd::getuid().is_root() {
        eprintln!("skipping: this test must run as root");
        return false;
    }
    true
}
