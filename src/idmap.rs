//! Writes the uid/gid identity map for a freshly cloned child's user
//! namespace.
//!
//! The map is always the 1-wide `{container 0 -> host invoker}` shape the
//! spec calls for (§4.4, GLOSSARY "Identity map"): no subuid ranges, no
//! `new{u,g}idmap` helper binaries — a direct write through `/proc/<pid>`,
//! which only a process with the right privileges over that pid can do.
//! The child cannot proceed past its pipe read until this write lands,
//! which is the synchronization barrier the spec's handshake depends on.

use std::fs;

use nix::unistd::{Gid, Pid, Uid};

use crate::Error;

/// Writes `/proc/<pid>/{setgroups,uid_map,gid_map}` for `pid`, mapping
/// container uid/gid 0 to `host_uid`/`host_gid`. `setgroups` must be
/// written `deny` before `gid_map` or the kernel refuses the gid_map
/// write for an unprivileged caller.
pub fn write_identity_map(pid: Pid, host_uid: Uid, host_gid: Gid) -> Result<(), Error> {
    let root = format!("/proc/{pid}");
    fs::write(format!("{root}/setgroups"), "deny")
        .map_err(|e| format!("cannot write {root}/setgroups: {e}"))?;
    fs::write(format!("{root}/uid_map"), format!("0 {host_uid} 1"))
        .map_err(|e| format!("cannot write {root}/uid_map: {e}"))?;
    fs::write(format!("{root}/gid_map"), format!("0 {host_gid} 1"))
        .map_err(|e| format!("cannot write {root}/gid_map: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_pid() {
        let err = write_identity_map(Pid::from_raw(i32::MAX), Uid::from_raw(0), Gid::from_raw(0));
        assert!(err.is_err());
    }
}
