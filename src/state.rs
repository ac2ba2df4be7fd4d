//! A directory-backed registry mapping container id -> [`ContainerRecord`].
//!
//! Kernel and filesystem state is modeled as plain directories rather than
//! a database. All values are short ASCII; no binary framing, so the state
//! root stays inspectable with `ls`/`cat`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;

use crate::ids::ContainerId;
use crate::record::ContainerRecord;
use crate::syscall::ignore_kind;
use crate::Error;

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| format!("cannot create state directory {}: {e}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, id: ContainerId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Creates the record directory and writes every field. On partial
    /// failure the caller is expected to roll back via a
    /// [`crate::lifecycle::RollbackGuard`]; the store itself is best-effort
    /// about partial writes.
    pub fn create(&self, id: ContainerId, record: &ContainerRecord) -> Result<(), Error> {
        let dir = self.dir(id);
        fs::create_dir(&dir)
            .map_err(|e| format!("cannot create container state {}: {e}", dir.display()))?;
        record.write_to(&dir)?;
        debug!("state store: created record for {id}");
        Ok(())
    }

    pub fn read(&self, id: ContainerId) -> Result<ContainerRecord, Error> {
        ContainerRecord::read_from(&self.dir(id))
    }

    /// Overwrites the `pid` field of an existing record in place. Used by
    /// `start` instead of a pid-keyed rename — the key here is the stable
    /// [`ContainerId`], not the pid.
    pub fn update_pid(&self, id: ContainerId, pid: Option<i32>) -> Result<(), Error> {
        let record = self.read(id)?;
        let record = ContainerRecord { pid, ..record };
        record.write_pid(&self.dir(id))
    }

    /// Renames one record directory to another id. The lifecycle manager
    /// never calls this since ids are stable across start/stop, but a
    /// store that can only create and delete isn't a complete key/value
    /// abstraction.
    pub fn rename(&self, from: ContainerId, to: ContainerId) -> Result<(), Error> {
        Ok(fs::rename(self.dir(from), self.dir(to))?)
    }

    /// Recursively removes the record directory. Caller must have already
    /// ensured the process is not alive.
    pub fn delete(&self, id: ContainerId) -> Result<(), Error> {
        ignore_kind(fs::remove_dir_all(self.dir(id)), ErrorKind::NotFound)?;
        debug!("state store: deleted record for {id}");
        Ok(())
    }

    pub fn exists(&self, id: ContainerId) -> bool {
        self.dir(id).is_dir()
    }

    /// Directory scan, filtering out anything that isn't a valid container
    /// id (UUID-named directory).
    pub fn enumerate(&self) -> Result<Vec<ContainerId>, Error> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<ContainerId>() {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::OverlayId;

    fn sample_record() -> ContainerRecord {
        ContainerRecord {
            image_name: "/tmp/image".into(),
            overlay_id: OverlayId::new(),
            command: vec!["/bin/echo".into(), "hi".into()],
            mem_limit: Some("1000000".into()),
            cpu_quota: Some(50000),
            io_read_bps: None,
            io_write_bps: None,
            pin_cpu: true,
            share_ipc: false,
            detach: true,
            propagate_mount_dir: Some("/mnt/shared".into()),
            pid: Some(1234),
        }
    }

    #[test]
    fn round_trips_every_field() {
        let tmp = std::env::temp_dir().join(format!("conbox-state-test-{}", std::process::id()));
        let store = StateStore::new(&tmp).unwrap();
        let id = ContainerId::new();
        let record = sample_record();
        store.create(id, &record).unwrap();
        let read_back = store.read(id).unwrap();
        assert_eq!(read_back.image_name, record.image_name);
        assert_eq!(read_back.command, record.command);
        assert_eq!(read_back.mem_limit, record.mem_limit);
        assert_eq!(read_back.cpu_quota, record.cpu_quota);
        assert_eq!(read_back.pin_cpu, record.pin_cpu);
        assert_eq!(read_back.share_ipc, record.share_ipc);
        assert_eq!(read_back.detach, record.detach);
        assert_eq!(read_back.propagate_mount_dir, record.propagate_mount_dir);
        assert_eq!(read_back.pid, record.pid);
        assert!(store.enumerate().unwrap().contains(&id));
        store.delete(id).unwrap();
        assert!(!store.exists(id));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn update_pid_overwrites_in_place() {
        let tmp = std::env::temp_dir().join(format!("conbox-state-test2-{}", std::process::id()));
        let store = StateStore::new(&tmp).unwrap();
        let id = ContainerId::new();
        store.create(id, &sample_record()).unwrap();
        store.update_pid(id, Some(9999)).unwrap();
        assert_eq!(store.read(id).unwrap().pid, Some(9999));
        let _ = fs::remove_dir_all(&tmp);
    }
}
