//! The namespace launcher (spec §4.4): clones the container's init process
//! into a fresh namespace set, runs the parent/child synchronization
//! handshake, and completes the child's rootfs pivot before handing off to
//! the user command.
//!
//! Namespace set is always PID + mount + UTS + user + net, plus IPC unless
//! the caller asks to share it with the host. A detached vs. foreground
//! posture is orthogonal to this module and is handled by the lifecycle
//! manager (spec §4.5) once [`launch`] returns a live pid.

use std::convert::Infallible;
use std::ffi::CString;
use std::io::{Read, Write};
use std::path::PathBuf;

use nix::unistd::{execvp, sethostname, Gid, Uid};

use crate::idmap::write_identity_map;
use crate::network::bring_up_loopback;
use crate::rootfs::{mount_proc, pivot_into, RootfsAssembler};
use crate::syscall::{
    clone3, exit_child, new_pipe, read_ok, read_result, write_ok, write_result, CloneArgs,
    CloneResult, OwnedPid, Pid,
};
use crate::Error;

pub struct LaunchOptions {
    pub command: Vec<String>,
    pub merged: PathBuf,
    pub propagate_bind: Option<PathBuf>,
    pub share_ipc: bool,
    pub host_uid: Uid,
    pub host_gid: Gid,
}

pub struct LaunchedChild {
    pid: Pid,
}

impl LaunchedChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// Clones the init process and blocks until its setup (identity map,
/// loopback, optional bind, pivot, `/proc` remount) has completed. Returns
/// as soon as the child is about to exec, *not* once it has exited --
/// foreground waiting is the caller's job.
pub fn launch(opts: LaunchOptions) -> Result<LaunchedChild, Error> {
    let sync_pipe = new_pipe()?;
    let result_pipe = new_pipe()?;

    let mut cl_args = CloneArgs::default();
    cl_args.flag_newuser();
    cl_args.flag_newns();
    cl_args.flag_newpid();
    cl_args.flag_newnet();
    cl_args.flag_newuts();
    if !opts.share_ipc {
        cl_args.flag_newipc();
    }

    match unsafe { clone3(&cl_args) }.map_err(|e| format!("cannot clone init process: {e}"))? {
        CloneResult::Child => {
            let rx = sync_pipe.rx();
            let tx = result_pipe.tx();
            exit_child(run_child(rx, tx, &opts).map(|inf: Infallible| match inf {}))
        }
        CloneResult::Parent { child } => {
            let child = unsafe { OwnedPid::from_raw(child) };
            write_identity_map(child.as_raw(), opts.host_uid, opts.host_gid)
                .map_err(|e| format!("cannot write identity map: {e}"))?;
            write_ok(sync_pipe.tx())?;
            read_result(result_pipe.rx())??;
            Ok(LaunchedChild {
                pid: child.into_raw(),
            })
        }
    }
}

fn run_child(rx: impl Read, tx: impl Write, opts: &LaunchOptions) -> Result<Infallible, Error> {
    // Blocks until the parent has installed the uid/gid map; any mount or
    // identity syscall attempted before this unblocks fails with EPERM
    // because the user namespace isn't functional yet.
    read_ok(rx)?;

    let setup = child_setup(opts);
    let report: Result<(), Error> = match &setup {
        Ok(()) => Ok(()),
        Err(e) => Err(e.to_string().into()),
    };
    write_result(tx, report)?;
    setup?;

    exec_command(&opts.command)
}

fn child_setup(opts: &LaunchOptions) -> Result<(), Error> {
    bring_up_loopback()?;
    if let Some(host_dir) = &opts.propagate_bind {
        RootfsAssembler::apply_bind_inside(&opts.merged, host_dir)?;
    }
    sethostname("container").map_err(|e| format!("cannot set hostname: {e}"))?;
    pivot_into(&opts.merged)?;
    mount_proc()?;
    Ok(())
}

fn exec_command(command: &[String]) -> Result<Infallible, Error> {
    let filename = CString::new(command[0].as_bytes())?;
    let argv: Vec<CString> = command
        .iter()
        .map(|v| CString::new(v.as_bytes()))
        .collect::<Result<_, _>>()?;
    Ok(execvp(&filename, &argv)?)
}

