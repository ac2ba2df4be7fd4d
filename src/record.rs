//! The on-disk container record.
//!
//! One record directory per container, keyed by [`ContainerId`] (see
//! [`crate::ids`] for why that's a stable id rather than the live PID).
//! Each attribute is its own small file: a directory is the simplest
//! crash-tolerant key/value store and stays inspectable with ordinary
//! shell tools.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::ids::OverlayId;
use crate::syscall::ignore_kind;
use crate::Error;

const FIELD_IMAGE_NAME: &str = "image_name";
const FIELD_OVERLAY_ID: &str = "overlay_id";
const FIELD_COMMAND: &str = "command";
const FIELD_MEM_LIMIT: &str = "mem_limit";
const FIELD_CPU_QUOTA: &str = "cpu_quota";
const FIELD_IO_READ_BPS: &str = "io_read_bps";
const FIELD_IO_WRITE_BPS: &str = "io_write_bps";
const FIELD_PIN_CPU: &str = "pin_cpu";
const FIELD_SHARE_IPC: &str = "share_ipc";
const FIELD_DETACH: &str = "detach";
const FIELD_PROPAGATE_MOUNT_DIR: &str = "propagate_mount_dir";
const FIELD_PID: &str = "pid";

/// Everything persisted about one container. `pid` is the only field that
/// `start` mutates in place; every other field is fixed at `run` time.
#[derive(Clone, Debug)]
pub struct ContainerRecord {
    pub image_name: PathBuf,
    pub overlay_id: OverlayId,
    pub command: Vec<String>,
    pub mem_limit: Option<String>,
    pub cpu_quota: Option<u64>,
    pub io_read_bps: Option<String>,
    pub io_write_bps: Option<String>,
    pub pin_cpu: bool,
    pub share_ipc: bool,
    pub detach: bool,
    pub propagate_mount_dir: Option<PathBuf>,
    /// Current live host pid of the init process, if the container has
    /// ever been started. Absent only in the brief window inside `run`
    /// before the init process's pid is known.
    pub pid: Option<i32>,
}

impl ContainerRecord {
    /// Writes every field as its own file under `dir`, which must already
    /// exist. Command argv is persisted one element per line; elements
    /// containing a literal newline are rejected by [`validate_argv`]
    /// before a record is ever constructed, so no escaping is needed here.
    pub fn write_to(&self, dir: &Path) -> Result<(), Error> {
        write_field(dir, FIELD_IMAGE_NAME, path_to_string(&self.image_name)?)?;
        write_field(dir, FIELD_OVERLAY_ID, self.overlay_id.to_string())?;
        write_field(dir, FIELD_COMMAND, self.command.join("\n"))?;
        write_optional(dir, FIELD_MEM_LIMIT, self.mem_limit.as_deref())?;
        write_optional(
            dir,
            FIELD_CPU_QUOTA,
            self.cpu_quota.map(|v| v.to_string()).as_deref(),
        )?;
        write_optional(dir, FIELD_IO_READ_BPS, self.io_read_bps.as_deref())?;
        write_optional(dir, FIELD_IO_WRITE_BPS, self.io_write_bps.as_deref())?;
        write_flag(dir, FIELD_PIN_CPU, self.pin_cpu)?;
        write_flag(dir, FIELD_SHARE_IPC, self.share_ipc)?;
        write_flag(dir, FIELD_DETACH, self.detach)?;
        match &self.propagate_mount_dir {
            Some(p) => write_field(dir, FIELD_PROPAGATE_MOUNT_DIR, path_to_string(p)?)?,
            None => remove_field(dir, FIELD_PROPAGATE_MOUNT_DIR)?,
        }
        self.write_pid(dir)?;
        Ok(())
    }

    /// Overwrites only the `pid` field; used by `start` in place of a
    /// directory rename (see [`crate::ids`]).
    pub fn write_pid(&self, dir: &Path) -> Result<(), Error> {
        match self.pid {
            Some(pid) => write_field(dir, FIELD_PID, pid.to_string())?,
            None => remove_field(dir, FIELD_PID)?,
        }
        Ok(())
    }

    /// Reads back every field. Missing required fields surface as
    /// "configuration is corrupt or missing".
    pub fn read_from(dir: &Path) -> Result<Self, Error> {
        let image_name = PathBuf::from(
            read_field(dir, FIELD_IMAGE_NAME)?
                .ok_or("configuration is corrupt or missing: image_name")?,
        );
        let overlay_id = read_field(dir, FIELD_OVERLAY_ID)?
            .ok_or("configuration is corrupt or missing: overlay_id")?
            .parse()
            .map_err(|e| format!("configuration is corrupt or missing: overlay_id: {e}"))?;
        let command: Vec<String> = read_field(dir, FIELD_COMMAND)?
            .ok_or("configuration is corrupt or missing: command")?
            .split('\n')
            .map(str::to_owned)
            .collect();
        if command.is_empty() || command[0].is_empty() {
            return Err("configuration is corrupt or missing: command".into());
        }
        let mem_limit = read_field(dir, FIELD_MEM_LIMIT)?;
        let cpu_quota = read_field(dir, FIELD_CPU_QUOTA)?
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| format!("configuration is corrupt or missing: cpu_quota: {e}"))?;
        let io_read_bps = read_field(dir, FIELD_IO_READ_BPS)?;
        let io_write_bps = read_field(dir, FIELD_IO_WRITE_BPS)?;
        let pin_cpu = read_field(dir, FIELD_PIN_CPU)?.is_some();
        let share_ipc = read_field(dir, FIELD_SHARE_IPC)?.is_some();
        let detach = read_field(dir, FIELD_DETACH)?.is_some();
        let propagate_mount_dir = read_field(dir, FIELD_PROPAGATE_MOUNT_DIR)?.map(PathBuf::from);
        let pid = read_field(dir, FIELD_PID)?
            .map(|v| v.parse::<i32>())
            .transpose()
            .map_err(|e| format!("configuration is corrupt or missing: pid: {e}"))?;
        Ok(Self {
            image_name,
            overlay_id,
            command,
            mem_limit,
            cpu_quota,
            io_read_bps,
            io_write_bps,
            pin_cpu,
            share_ipc,
            detach,
            propagate_mount_dir,
            pid,
        })
    }
}

/// Rejects argv elements that would break the newline-delimited encoding.
pub fn validate_argv(command: &[String]) -> Result<(), Error> {
    if command.is_empty() {
        return Err("command must not be empty".into());
    }
    if command.iter().any(|arg| arg.contains('\n')) {
        return Err("command arguments must not contain newlines".into());
    }
    Ok(())
}

fn path_to_string(p: &Path) -> Result<String, Error> {
    p.to_str()
        .map(str::to_owned)
        .ok_or_else(|| format!("non-UTF8 path: {p:?}").into())
}

fn write_field(dir: &Path, name: &str, value: impl AsRef<[u8]>) -> Result<(), Error> {
    Ok(fs::write(dir.join(name), value)?)
}

fn write_optional(dir: &Path, name: &str, value: Option<&str>) -> Result<(), Error> {
    match value {
        Some(v) => write_field(dir, name, v),
        None => remove_field(dir, name),
    }
}

fn write_flag(dir: &Path, name: &str, present: bool) -> Result<(), Error> {
    if present {
        write_field(dir, name, "1")
    } else {
        remove_field(dir, name)
    }
}

fn remove_field(dir: &Path, name: &str) -> Result<(), Error> {
    Ok(ignore_kind(fs::remove_file(dir.join(name)), ErrorKind::NotFound)?)
}

fn read_field(dir: &Path, name: &str) -> Result<Option<String>, Error> {
    match fs::read_to_string(dir.join(name)) {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
