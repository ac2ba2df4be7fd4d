//! Typed cgroup v2 attribute accessors for a single runtime's worth of
//! container leaves.
//!
//! Each attribute gets its own accessor rather than a bare path/string
//! wrapper, so a failed write carries the attribute's identity instead of a
//! bare errno. The `rbps=`/`wbps=` formatting for `io.max` and the
//! `"<quota> 100000"` shape of `cpu.max` are the textual formats the kernel
//! expects for those files.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::error::CgroupAttrError;
use crate::syscall::ignore_kind;
use crate::Error;

const DEVICE: &str = "8:0";

#[derive(Clone, Debug, Default)]
pub struct Limits {
    pub mem_limit: Option<String>,
    pub cpu_quota: Option<u64>,
    pub io_read_bps: Option<String>,
    pub io_write_bps: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Metrics {
    pub memory_current: u64,
    pub cpu_usage_usec: u64,
    pub pids_current: u64,
    pub io_rbytes: Option<u64>,
    pub io_wbytes: Option<u64>,
}

pub struct CgroupController {
    root: PathBuf,
}

impl CgroupController {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn leaf_path(&self, pid: i32) -> PathBuf {
        self.root.join(format!("container_{pid}"))
    }

    /// Creates the runtime cgroup parent if absent and delegates
    /// `+cpu +memory +pids +io` to its subtree. A controller that's
    /// already enabled reports failures on some kernels; those are
    /// benign here.
    pub fn ensure_root(&self) -> Result<(), Error> {
        ignore_kind(fs::create_dir_all(&self.root), ErrorKind::AlreadyExists)
            .map_err(|e| format!("cannot create cgroup root {}: {e}", self.root.display()))?;
        let path = self.root.join("cgroup.subtree_control");
        if let Err(err) = write_attr(&path, "cgroup.subtree_control", "+cpu +memory +pids +io") {
            debug!("ensure_root: subtree_control write not fatal: {err}");
        }
        Ok(())
    }

    pub fn create_leaf(&self, pid: i32) -> Result<(), Error> {
        let path = self.leaf_path(pid);
        fs::create_dir(&path)
            .map_err(|e| format!("cannot create cgroup leaf {}: {e}", path.display()))?;
        Ok(())
    }

    /// Writes limits before placement: the first allocation the process
    /// makes after `place` is already accounted against these limits.
    pub fn apply_limits(&self, pid: i32, limits: &Limits) -> Result<(), Error> {
        let dir = self.leaf_path(pid);
        if let Some(mem) = &limits.mem_limit {
            write_attr(&dir.join("memory.max"), "memory.max", mem)?;
            write_attr(&dir.join("memory.swap.max"), "memory.swap.max", "0")?;
        }
        if let Some(quota) = limits.cpu_quota {
            let value = format!("{quota} 100000");
            write_attr(&dir.join("cpu.max"), "cpu.max", &value)?;
        }
        if limits.io_read_bps.is_some() || limits.io_write_bps.is_some() {
            let rbps = limits.io_read_bps.as_deref().unwrap_or("max");
            let wbps = limits.io_write_bps.as_deref().unwrap_or("max");
            let value = format!("{DEVICE} rbps={rbps} wbps={wbps}");
            write_attr(&dir.join("io.max"), "io.max", &value)?;
        }
        Ok(())
    }

    pub fn place(&self, pid: i32) -> Result<(), Error> {
        let path = self.leaf_path(pid).join("cgroup.procs");
        write_attr(&path, "cgroup.procs", &pid.to_string())
    }

    pub fn freeze(&self, pid: i32) -> Result<(), Error> {
        write_attr(
            &self.leaf_path(pid).join("cgroup.freeze"),
            "cgroup.freeze",
            "1",
        )
    }

    pub fn thaw(&self, pid: i32) -> Result<(), Error> {
        write_attr(
            &self.leaf_path(pid).join("cgroup.freeze"),
            "cgroup.freeze",
            "0",
        )
    }

    pub fn read_metrics(&self, pid: i32) -> Result<Metrics, Error> {
        let dir = self.leaf_path(pid);
        let memory_current = read_attr(&dir.join("memory.current"), "memory.current")?
            .trim()
            .parse()
            .unwrap_or(0);
        let pids_current = read_attr(&dir.join("pids.current"), "pids.current")?
            .trim()
            .parse()
            .unwrap_or(0);
        let cpu_stat = read_attr(&dir.join("cpu.stat"), "cpu.stat")?;
        let cpu_usage_usec = parse_stat_value(&cpu_stat, "usage_usec").unwrap_or(0);
        let (io_rbytes, io_wbytes) = match read_attr(&dir.join("io.stat"), "io.stat") {
            Ok(contents) => (
                sum_stat_field(&contents, "rbytes"),
                sum_stat_field(&contents, "wbytes"),
            ),
            Err(_) => (None, None),
        };
        Ok(Metrics {
            memory_current,
            cpu_usage_usec,
            pids_current,
            io_rbytes,
            io_wbytes,
        })
    }

    /// Only valid when the leaf has no live processes; `rmdir` fails with
    /// `EBUSY` otherwise, which is surfaced rather than tolerated.
    pub fn remove_leaf(&self, pid: i32) -> Result<(), Error> {
        let path = self.leaf_path(pid);
        ignore_kind(fs::remove_dir(&path), ErrorKind::NotFound)
            .map_err(|e| format!("cannot remove cgroup leaf {}: {e}", path.display()))?;
        Ok(())
    }

}

fn write_attr(path: &Path, attr: &'static str, value: &str) -> Result<(), Error> {
    trace!("cgroup: write {attr} = {value:?} ({path:?})");
    let result = OpenOptions::new()
        .write(true)
        .truncate(false)
        .open(path)
        .and_then(|mut f| f.write_all(value.as_bytes()));
    result.map_err(|e| Box::new(CgroupAttrError::new(attr, e)) as Error)
}

fn read_attr(path: &Path, attr: &'static str) -> Result<String, Error> {
    let mut buf = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut buf))
        .map_err(|e| Box::new(CgroupAttrError::new(attr, e)) as Error)?;
    Ok(buf)
}

/// Parses a `key value\n` line format, as used by `cpu.stat`.
fn parse_stat_value(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == key {
            parts.next()?.parse().ok()
        } else {
            None
        }
    })
}

/// `io.stat` has one line per device (`8:0 rbytes=... wbytes=...`);
/// aggregates a named field across every device line.
fn sum_stat_field(contents: &str, key: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut found = false;
    for line in contents.lines() {
        for field in line.split_whitespace() {
            if let Some(value) = field.strip_prefix(&format!("{key}=")) {
                if let Ok(v) = value.parse::<u64>() {
                    total += v;
                    found = true;
                }
            }
        }
    }
    found.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_stat_usage() {
        let stat = "usage_usec 1234\nuser_usec 1000\nsystem_usec 234\n";
        assert_eq!(parse_stat_value(stat, "usage_usec"), Some(1234));
    }

    #[test]
    fn sums_io_stat_across_devices() {
        let stat = "8:0 rbytes=100 wbytes=50\n8:16 rbytes=400 wbytes=25\n";
        assert_eq!(sum_stat_field(stat, "rbytes"), Some(500));
        assert_eq!(sum_stat_field(stat, "wbytes"), Some(75));
    }

    #[test]
    fn missing_io_stat_field_is_none() {
        assert_eq!(sum_stat_field("8:0 rbytes=1\n", "wbytes"), None);
    }
}
