//! The lifecycle manager (spec §4.5): the top-level state machine that
//! orchestrates the state store, cgroup controller, rootfs assembler and
//! namespace launcher for each subcommand, and owns cleanup symmetry.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getgid, getuid, setsid, ForkResult, Gid, Pid, Uid};

use crate::cgroup::{CgroupController, Limits, Metrics};
use crate::config::RuntimeRoots;
use crate::cpupin::{host_cpu_count, pin_and_prioritize, CpuPinner};
use crate::error::precondition;
use crate::ids::ContainerId;
use crate::launcher::{self, LaunchOptions};
use crate::record::{validate_argv, ContainerRecord};
use crate::rollback::RollbackGuard;
use crate::rootfs::RootfsAssembler;
use crate::state::StateStore;
use crate::syscall::new_pipe;
use crate::Error;

/// Time `stop` waits after `SIGTERM` before escalating to `SIGKILL`
/// (SPEC_FULL §0.7's two-phase shutdown; the literal spec sends an
/// unconditional `SIGKILL`).
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub image: PathBuf,
    pub command: Vec<String>,
    pub mem_limit: Option<String>,
    pub cpu_quota: Option<u64>,
    pub io_read_bps: Option<String>,
    pub io_write_bps: Option<String>,
    pub pin_cpu: bool,
    pub detach: bool,
    pub share_ipc: bool,
    pub propagate_mount_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// The container exited while we were waiting on it in the foreground.
    Exited(i32),
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub id: ContainerId,
    pub pid: i32,
    pub state: RunState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub command: Vec<String>,
    pub propagate_mount_dir: Option<PathBuf>,
    pub metrics: Metrics,
}

pub struct LifecycleManager {
    state: StateStore,
    cgroup: CgroupController,
    rootfs: RootfsAssembler,
    cpu_pinner: CpuPinner,
}

impl LifecycleManager {
    pub fn new(roots: RuntimeRoots) -> Result<Self, Error> {
        let state = StateStore::new(roots.state_root.clone())?;
        let cgroup = CgroupController::new(roots.cgroup_root.clone());
        cgroup.ensure_root()?;
        let rootfs = RootfsAssembler::new(roots.layers_root.clone());
        let cpu_pinner = CpuPinner::new(roots.next_cpu_file());
        Ok(Self {
            state,
            cgroup,
            rootfs,
            cpu_pinner,
        })
    }

    pub fn run(&self, opts: RunOptions) -> Result<RunOutcome, Error> {
        if opts.detach {
            self.run_detached(opts)
        } else {
            let (id, pid) = self.run_inner(&opts, getuid(), getgid())?;
            let status = wait_for_exit(pid)?;
            Ok(RunOutcome {
                id,
                pid: pid.as_raw(),
                state: RunState::Exited(status),
            })
        }
    }

    /// Builds every piece of a container under a [`RollbackGuard`]:
    /// overlay, namespaced init process, state record, cgroup placement,
    /// optional CPU pin. Any failure unwinds everything built so far.
    fn run_inner(
        &self,
        opts: &RunOptions,
        host_uid: Uid,
        host_gid: Gid,
    ) -> Result<(ContainerId, Pid), Error> {
        validate_argv(&opts.command)?;
        if !opts.image.is_dir() {
            return precondition(format!(
                "image path does not exist: {}",
                opts.image.display()
            ));
        }
        let id = ContainerId::new();
        let mut guard = RollbackGuard::new();

        if let Some(host_dir) = &opts.propagate_mount_dir {
            self.rootfs.prepare_bind(host_dir).map_err(|e| {
                format!(
                    "--propagate-mount target {} must already be a mount point: {e}",
                    host_dir.display()
                )
            })?;
        }

        let (overlay_id, merged) = self.rootfs.assemble(&opts.image)?;
        push_rootfs_teardown(
            &mut guard,
            self.rootfs.layers_root(),
            overlay_id,
            opts.propagate_mount_dir.clone(),
        );

        let launched = launcher::launch(LaunchOptions {
            command: opts.command.clone(),
            merged,
            propagate_bind: opts.propagate_mount_dir.clone(),
            share_ipc: opts.share_ipc,
            host_uid,
            host_gid,
        })?;
        let pid = launched.pid();
        guard.push(move || {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
        });

        let record = ContainerRecord {
            image_name: opts.image.clone(),
            overlay_id,
            command: opts.command.clone(),
            mem_limit: opts.mem_limit.clone(),
            cpu_quota: opts.cpu_quota,
            io_read_bps: opts.io_read_bps.clone(),
            io_write_bps: opts.io_write_bps.clone(),
            pin_cpu: opts.pin_cpu,
            share_ipc: opts.share_ipc,
            detach: opts.detach,
            propagate_mount_dir: opts.propagate_mount_dir.clone(),
            pid: Some(pid.as_raw()),
        };
        self.state.create(id, &record)?;
        push_state_delete(&mut guard, self.state.root(), id);

        self.place_in_cgroup(&mut guard, pid.as_raw(), &record)?;

        if opts.pin_cpu {
            let ncpus = host_cpu_count()?;
            let target = self.cpu_pinner.next_cpu(ncpus)?;
            pin_and_prioritize(pid, target)?;
        }

        guard.disarm();
        Ok((id, pid))
    }

    /// Places `pid` into a fresh cgroup leaf, applying limits strictly
    /// before placement (§4.2's ordering rule) so the very first
    /// allocation the init process makes is already accounted.
    fn place_in_cgroup(
        &self,
        guard: &mut RollbackGuard,
        pid: i32,
        record: &ContainerRecord,
    ) -> Result<(), Error> {
        self.cgroup.create_leaf(pid)?;
        let cgroup_root = self.cgroup.root().to_path_buf();
        guard.push(move || {
            let cgroup = CgroupController::new(cgroup_root);
            let _ = cgroup.remove_leaf(pid);
        });
        self.cgroup.apply_limits(pid, &limits_of(record))?;
        self.cgroup.place(pid)?;
        Ok(())
    }

    /// Forks an intermediate process that detaches the session (so the
    /// CLI invocation can return immediately) and builds the container
    /// inside it; the namespaced init process is reparented to init once
    /// the intermediate exits, left running in the background.
    fn run_detached(&self, opts: RunOptions) -> Result<RunOutcome, Error> {
        let pipe = new_pipe()?;
        match unsafe { fork() }.map_err(|e| format!("cannot fork detach session: {e}"))? {
            ForkResult::Child => {
                let _ = setsid();
                let tx = pipe.tx();
                let report = self.run_inner(&opts, getuid(), getgid());
                send_detach_report(tx, &report);
                std::process::exit(if report.is_ok() { 0 } else { 1 })
            }
            ForkResult::Parent { child } => {
                let rx = pipe.rx();
                let outcome = recv_detach_report(rx);
                let _ = waitpid(child, Some(WaitPidFlag::__WALL));
                let (id, pid) = outcome?;
                Ok(RunOutcome {
                    id,
                    pid: pid.as_raw(),
                    state: RunState::Running,
                })
            }
        }
    }

    /// Resolves the CLI's pid-keyed surface (spec §6) onto the stable
    /// internal [`ContainerId`] (SPEC_FULL §0.1) by scanning records for
    /// one whose current `pid` field matches. The pid need not be live --
    /// a stopped container keeps its last pid until `start` overwrites it.
    pub fn find_by_pid(&self, pid: i32) -> Result<ContainerId, Error> {
        for id in self.state.enumerate()? {
            if let Ok(record) = self.state.read(id) {
                if record.pid == Some(pid) {
                    return Ok(id);
                }
            }
        }
        precondition(format!("no such container: {pid}"))
    }

    pub fn list(&self) -> Result<Vec<(ContainerId, ContainerRecord, ContainerState)>, Error> {
        let mut out = Vec::new();
        for id in self.state.enumerate()? {
            let record = self.state.read(id)?;
            let state = container_state(&record);
            out.push((id, record, state));
        }
        Ok(out)
    }

    pub fn status(&self, id: ContainerId) -> Result<StatusReport, Error> {
        let record = self.state.read(id)?;
        let pid = record
            .pid
            .filter(|&pid| is_live(pid))
            .ok_or("no such running container")?;
        let metrics = self.cgroup.read_metrics(pid)?;
        Ok(StatusReport {
            command: record.command,
            propagate_mount_dir: record.propagate_mount_dir,
            metrics,
        })
    }

    pub fn freeze(&self, id: ContainerId) -> Result<(), Error> {
        let record = self.state.read(id)?;
        let pid = record.pid.ok_or("no such running container")?;
        self.cgroup.freeze(pid)
    }

    pub fn thaw(&self, id: ContainerId) -> Result<(), Error> {
        let record = self.state.read(id)?;
        let pid = record.pid.ok_or("no such running container")?;
        self.cgroup.thaw(pid)
    }

    /// Two-phase shutdown (SPEC_FULL §0.7): `SIGTERM`, wait up to `grace`,
    /// escalate to `SIGKILL`, reap, then lazily unmount `/proc`, the
    /// propagated bind and the overlay -- but not remove them, so `start`
    /// can reuse the upper layer.
    pub fn stop(&self, id: ContainerId, grace: Duration) -> Result<(), Error> {
        let record = self.state.read(id)?;
        let pid = record
            .pid
            .filter(|&pid| is_live(pid))
            .ok_or("container is not running")?;
        let nix_pid = Pid::from_raw(pid);

        kill(nix_pid, Signal::SIGTERM).map_err(|e| format!("cannot signal {pid}: {e}"))?;
        let deadline = Instant::now() + grace;
        while is_live(pid) && Instant::now() < deadline {
            match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                Ok(WaitStatus::StillAlive) | Err(_) => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(_) => break,
            }
        }
        if is_live(pid) {
            kill(nix_pid, Signal::SIGKILL).map_err(|e| format!("cannot kill {pid}: {e}"))?;
        }
        let _ = waitpid(nix_pid, Some(WaitPidFlag::__WALL));

        self.rootfs
            .unmount(record.overlay_id, record.propagate_mount_dir.as_deref())
    }

    /// Re-launches a stopped container. The overlay's upper layer is
    /// reused (SPEC_FULL §0.1: the [`ContainerId`] is stable, so this
    /// overwrites the `pid` field in place instead of renaming anything).
    ///
    /// Built under a [`RollbackGuard`] spanning the whole sequence
    /// (SPEC_FULL §0.4), the same way `run_inner` is: the re-mounted
    /// overlay, the launched child, the `pid` field update and the cgroup
    /// placement are each undone in reverse order if any later step fails,
    /// rather than leaving a re-mounted overlay or an untracked child
    /// behind.
    pub fn start(&self, id: ContainerId) -> Result<RunOutcome, Error> {
        let record = self.state.read(id)?;
        if record.pid.is_some_and(is_live) {
            return precondition("container is already running");
        }

        let (host_uid, host_gid) = sudo_identity();
        let mut guard = RollbackGuard::new();

        if let Some(host_dir) = &record.propagate_mount_dir {
            self.rootfs.prepare_bind(host_dir).ok();
        }
        let merged = self.rootfs.remount(record.overlay_id, &record.image_name)?;
        push_rootfs_unmount(
            &mut guard,
            self.rootfs.layers_root(),
            record.overlay_id,
            record.propagate_mount_dir.clone(),
        );

        let launched = launcher::launch(LaunchOptions {
            command: record.command.clone(),
            merged,
            propagate_bind: record.propagate_mount_dir.clone(),
            share_ipc: record.share_ipc,
            host_uid,
            host_gid,
        })?;
        let pid = launched.pid();
        guard.push(move || {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
        });

        self.state.update_pid(id, Some(pid.as_raw()))?;
        let old_pid = record.pid;
        push_state_restore_pid(&mut guard, self.state.root(), id, old_pid);

        self.place_in_cgroup(&mut guard, pid.as_raw(), &record)?;

        if record.pin_cpu {
            let ncpus = host_cpu_count()?;
            let target = self.cpu_pinner.next_cpu(ncpus)?;
            pin_and_prioritize(pid, target)?;
        }

        guard.disarm();
        if record.detach {
            Ok(RunOutcome {
                id,
                pid: pid.as_raw(),
                state: RunState::Running,
            })
        } else {
            let status = wait_for_exit(pid)?;
            Ok(RunOutcome {
                id,
                pid: pid.as_raw(),
                state: RunState::Exited(status),
            })
        }
    }

    /// Forbidden while the container is live; tolerates a container whose
    /// cgroup leaf or overlay have already partially disappeared.
    pub fn rm(&self, id: ContainerId) -> Result<(), Error> {
        let record = self.state.read(id)?;
        if record.pid.is_some_and(is_live) {
            return precondition("cannot remove a running container; stop it first");
        }
        self.rootfs
            .teardown(record.overlay_id, record.propagate_mount_dir.as_deref())?;
        if let Some(pid) = record.pid {
            self.cgroup.remove_leaf(pid)?;
        }
        self.state.delete(id)
    }
}

fn limits_of(record: &ContainerRecord) -> Limits {
    Limits {
        mem_limit: record.mem_limit.clone(),
        cpu_quota: record.cpu_quota,
        io_read_bps: record.io_read_bps.clone(),
        io_write_bps: record.io_write_bps.clone(),
    }
}

fn container_state(record: &ContainerRecord) -> ContainerState {
    match record.pid {
        Some(pid) if is_live(pid) => ContainerState::Running,
        _ => ContainerState::Stopped,
    }
}

fn is_live(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

fn push_rootfs_teardown(
    guard: &mut RollbackGuard,
    layers_root: &Path,
    overlay_id: crate::ids::OverlayId,
    propagated: Option<PathBuf>,
) {
    let layers_root = layers_root.to_path_buf();
    guard.push(move || {
        let rootfs = RootfsAssembler::new(layers_root);
        let _ = rootfs.teardown(overlay_id, propagated.as_deref());
    });
}

fn push_state_delete(guard: &mut RollbackGuard, state_root: &Path, id: ContainerId) {
    let state_root = state_root.to_path_buf();
    guard.push(move || {
        if let Ok(state) = StateStore::new(state_root) {
            let _ = state.delete(id);
        }
    });
}

/// `start`'s rollback counterpart to [`push_rootfs_teardown`]: unmounts the
/// re-mounted overlay (and the propagated bind, if any) without removing
/// the upper/work/merged triple, since `start` only remounts an overlay
/// that `run` already created and owns.
fn push_rootfs_unmount(
    guard: &mut RollbackGuard,
    layers_root: &Path,
    overlay_id: crate::ids::OverlayId,
    propagated: Option<PathBuf>,
) {
    let layers_root = layers_root.to_path_buf();
    guard.push(move || {
        let rootfs = RootfsAssembler::new(layers_root);
        let _ = rootfs.unmount(overlay_id, propagated.as_deref());
    });
}

/// `start`'s rollback counterpart to [`push_state_delete`]: restores the
/// `pid` field to its pre-`start` value instead of deleting the record,
/// since the record itself predates this `start` call.
fn push_state_restore_pid(
    guard: &mut RollbackGuard,
    state_root: &Path,
    id: ContainerId,
    old_pid: Option<i32>,
) {
    let state_root = state_root.to_path_buf();
    guard.push(move || {
        if let Ok(state) = StateStore::new(state_root) {
            let _ = state.update_pid(id, old_pid);
        }
    });
}

fn wait_for_exit(pid: Pid) -> Result<i32, Error> {
    match waitpid(pid, Some(WaitPidFlag::__WALL))? {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
        other => Err(format!("unexpected wait status: {other:?}").into()),
    }
}

/// `start` honors `SUDO_UID`/`SUDO_GID` so a container re-launched under
/// `sudo` keeps the original invoker's identity rather than mapping to
/// root's.
fn sudo_identity() -> (Uid, Gid) {
    let uid = std::env::var("SUDO_UID")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Uid::from_raw)
        .unwrap_or_else(getuid);
    let gid = std::env::var("SUDO_GID")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Gid::from_raw)
        .unwrap_or_else(getgid);
    (uid, gid)
}

fn send_detach_report(mut tx: impl Write, report: &Result<(ContainerId, Pid), Error>) {
    let _ = (|| -> Result<(), Error> {
        match report {
            Ok((id, pid)) => {
                tx.write_all(&[0])?;
                tx.write_all(&pid.as_raw().to_le_bytes())?;
                let id = id.to_string();
                tx.write_all(&(id.len() as u32).to_le_bytes())?;
                tx.write_all(id.as_bytes())?;
            }
            Err(e) => {
                tx.write_all(&[1])?;
                let msg = e.to_string();
                tx.write_all(&(msg.len() as u32).to_le_bytes())?;
                tx.write_all(msg.as_bytes())?;
            }
        }
        Ok(())
    })();
}

fn recv_detach_report(mut rx: impl Read) -> Result<(ContainerId, Pid), Error> {
    let mut tag = [0u8; 1];
    rx.read_exact(&mut tag)?;
    if tag[0] == 0 {
        let mut pid_buf = [0u8; 4];
        rx.read_exact(&mut pid_buf)?;
        let pid = Pid::from_raw(i32::from_le_bytes(pid_buf));
        let mut len_buf = [0u8; 4];
        rx.read_exact(&mut len_buf)?;
        let mut id_buf = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        rx.read_exact(&mut id_buf)?;
        let id: ContainerId = String::from_utf8(id_buf)?
            .parse()
            .map_err(|e| format!("malformed detach report id: {e}"))?;
        Ok((id, pid))
    } else {
        let mut len_buf = [0u8; 4];
        rx.read_exact(&mut len_buf)?;
        let mut msg_buf = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        rx.read_exact(&mut msg_buf)?;
        Err(String::from_utf8(msg_buf)?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_state_reflects_proc_presence() {
        let running = ContainerRecord {
            pid: Some(1),
            ..sample()
        };
        assert_eq!(container_state(&running), ContainerState::Running);
        let stopped = ContainerRecord {
            pid: Some(999_999),
            ..sample()
        };
        assert_eq!(container_state(&stopped), ContainerState::Stopped);
        let never_started = ContainerRecord {
            pid: None,
            ..sample()
        };
        assert_eq!(container_state(&never_started), ContainerState::Stopped);
    }

    fn sample() -> ContainerRecord {
        ContainerRecord {
            image_name: "/tmp/image".into(),
            overlay_id: crate::ids::OverlayId::new(),
            command: vec!["/bin/true".into()],
            mem_limit: None,
            cpu_quota: None,
            io_read_bps: None,
            io_write_bps: None,
            pin_cpu: false,
            share_ipc: false,
            detach: false,
            propagate_mount_dir: None,
            pid: None,
        }
    }
}
