//! Low-level clone3/pidfd/pipe plumbing shared by the namespace launcher.
//!
//! `nix` doesn't wrap `clone3` or `pidfd_open`, so these drop to a raw
//! `libc::syscall`. A small length-prefixed result protocol runs over a
//! pipe for reporting child-side errors back to the parent.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

use crate::Error;

pub type Pid = nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default)]
pub(crate) struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

impl CloneArgs {
    pub fn flag_newuser(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUSER as u64;
    }

    pub fn flag_newns(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNS as u64;
    }

    pub fn flag_newpid(&mut self) {
        self.flags |= nix::libc::CLONE_NEWPID as u64;
    }

    pub fn flag_newnet(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNET as u64;
    }

    pub fn flag_newipc(&mut self) {
        self.flags |= nix::libc::CLONE_NEWIPC as u64;
    }

    pub fn flag_newuts(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUTS as u64;
    }
}

pub(crate) enum CloneResult {
    Child,
    Parent { child: Pid },
}

/// # Safety
/// Forks the calling thread the same way `libc::fork` does; the child must
/// avoid touching Rust state that assumes other threads are still around
/// (locks held elsewhere, buffered stdio, etc) until it execs or exits.
pub(crate) unsafe fn clone3(cl_args: &CloneArgs) -> Result<CloneResult, Errno> {
    let res = nix::libc::syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as nix::libc::pid_t),
        },
    })
}

pub(crate) fn pidfd_open(pid: Pid) -> Result<File, Errno> {
    let res = unsafe {
        nix::libc::syscall(
            nix::libc::SYS_pidfd_open,
            pid.as_raw(),
            0 as nix::libc::c_uint,
        )
    };
    Errno::result(res).map(|v| unsafe {
        use std::os::fd::FromRawFd;
        File::from_raw_fd(v as RawFd)
    })
}

pub(crate) struct Pipe {
    rx: File,
    tx: File,
}

impl Pipe {
    pub fn rx(self) -> impl Read {
        drop(self.tx);
        self.rx
    }

    pub fn tx(self) -> impl Write {
        drop(self.rx);
        self.tx
    }
}

pub(crate) fn new_pipe() -> Result<Pipe, Error> {
    let (rx, tx) = nix::unistd::pipe()?;
    Ok(Pipe {
        rx: rx.into(),
        tx: tx.into(),
    })
}

/// Reads a single "ok" byte written by [`write_ok`].
pub(crate) fn read_ok(mut rx: impl Read) -> Result<(), Error> {
    rx.read_exact(&mut [0; 1])?;
    Ok(())
}

pub(crate) fn write_ok(mut tx: impl Write) -> Result<(), Error> {
    Ok(tx.write_all(&[0])?)
}

/// Passes a pid back over a plain pipe: used by detached `run` to report
/// the namespaced child's pid from the session-detaching intermediate
/// process back to the original CLI invocation.
pub(crate) fn read_pid(mut rx: impl Read) -> Result<Pid, Error> {
    let mut buf = [0; 4];
    rx.read_exact(&mut buf)?;
    Ok(Pid::from_raw(nix::libc::pid_t::from_le_bytes(buf)))
}

pub(crate) fn write_pid(mut tx: impl Write, pid: Pid) -> Result<(), Error> {
    Ok(tx.write_all(&pid.as_raw().to_le_bytes())?)
}

/// Reads a `Result<(), Error>` encoded by [`write_result`]: a status byte
/// followed by a length-prefixed UTF-8 message on failure.
pub(crate) fn read_result(mut rx: impl Read) -> Result<Result<(), Error>, Error> {
    let mut buf = [0; std::mem::size_of::<u8>()];
    rx.read_exact(&mut buf)?;
    match u8::from_le_bytes(buf) {
        0 => Ok(Ok(())),
        1 => {
            let mut buf = [0; std::mem::size_of::<usize>()];
            rx.read_exact(&mut buf)?;
            let len = usize::from_le_bytes(buf);
            let mut buf = vec![0; len];
            rx.read_exact(&mut buf)?;
            Ok(Err(String::from_utf8(buf)?.into()))
        }
        _ => unreachable!("unknown result tag"),
    }
}

pub(crate) fn write_result(tx: impl Write, result: Result<(), Error>) -> Result<(), Error> {
    let mut tx = tx;
    match result {
        Ok(()) => Ok(tx.write_all(&u8::to_le_bytes(0))?),
        Err(err) => {
            tx.write_all(&u8::to_le_bytes(1))?;
            let msg = err.to_string();
            tx.write_all(&usize::to_le_bytes(msg.as_bytes().len()))?;
            Ok(tx.write_all(msg.as_bytes())?)
        }
    }
}

pub(crate) fn exit_child(result: Result<(), Error>) -> ! {
    match result {
        Ok(()) => unsafe { nix::libc::_exit(0) },
        Err(_) => unsafe { nix::libc::_exit(1) },
    }
}

/// Owns a child pid; reaps it on drop if nobody waited explicitly, keeping
/// every forked helper from leaving zombies behind on an error path.
pub(crate) struct OwnedPid(Option<Pid>);

impl OwnedPid {
    pub unsafe fn from_raw(pid: Pid) -> Self {
        Self(Some(pid))
    }

    pub fn as_raw(&self) -> Pid {
        self.0.unwrap()
    }

    pub fn into_raw(mut self) -> Pid {
        self.0.take().unwrap()
    }

    pub fn wait_success(self) -> Result<(), Error> {
        let mut this = self;
        let status = waitpid(this.0.take().unwrap(), Some(WaitPidFlag::__WALL))?;
        match status {
            WaitStatus::Exited(_, 0) => Ok(()),
            WaitStatus::Exited(_, v) => Err(format!("child exited with status {v}").into()),
            WaitStatus::Signaled(_, v, _) => Err(format!("child killed by signal {v}").into()),
            other => Err(format!("unexpected wait status: {other:?}").into()),
        }
    }
}

impl Drop for OwnedPid {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
        }
    }
}

pub(crate) fn ignore_kind(
    result: std::io::Result<()>,
    kind: std::io::ErrorKind,
) -> std::io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == kind => Ok(()),
        Err(err) => Err(err),
    }
}
