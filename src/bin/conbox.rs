//! `conbox` CLI: parses the eight subcommands (spec.md §6), wires them to
//! [`conbox::manager::LifecycleManager`], and maps results onto exit codes.
//!
//! Mirrors the teacher's lack of a binary entirely, so the overall shape is
//! grounded on the retrieval pack's container CLIs instead: one `clap`
//! derive `Cli`, `env_logger::init()` once in `main`, a linear
//! dispatch-and-exit per subcommand.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use conbox::config::RuntimeRoots;
use conbox::manager::{ContainerState, LifecycleManager, RunOptions, RunState, DEFAULT_STOP_GRACE};

#[derive(Parser)]
#[command(name = "conbox", about = "Minimal Linux container runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble an overlay over IMAGE, launch CMD in a fresh namespace set.
    Run {
        #[arg(long)]
        mem: Option<String>,
        #[arg(long)]
        cpu: Option<u64>,
        #[arg(long = "io-read-bps")]
        io_read_bps: Option<String>,
        #[arg(long = "io-write-bps")]
        io_write_bps: Option<String>,
        #[arg(long = "pin-cpu")]
        pin_cpu: bool,
        #[arg(long)]
        detach: bool,
        #[arg(long = "share-ipc")]
        share_ipc: bool,
        #[arg(long = "propagate-mount", value_name = "DIR")]
        propagate_mount: Option<PathBuf>,
        image: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 1.., required = true)]
        cmd: Vec<String>,
    },
    /// List every known container with its current state.
    List,
    /// Show memory/cpu/pid metrics for a running container.
    Status { pid: i32 },
    /// Freeze a running container's cgroup.
    Freeze { pid: i32 },
    /// Thaw a frozen container's cgroup.
    Thaw { pid: i32 },
    /// SIGTERM, wait, SIGKILL if still alive, then unmount (state survives).
    Stop { pid: i32 },
    /// Re-launch a stopped container, reusing its overlay upper layer.
    Start { pid: i32 },
    /// Remove a stopped container's state and overlay entirely.
    Rm { pid: i32 },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let manager = match LifecycleManager::new(RuntimeRoots::from_env()) {
        Ok(m) => m,
        Err(e) => return fail(e),
    };
    match run(&manager, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(e),
    }
}

fn fail(err: conbox::Error) -> ExitCode {
    error!("{err}");
    eprintln!("conbox: {err}");
    ExitCode::FAILURE
}

fn run(manager: &LifecycleManager, command: Command) -> Result<(), conbox::Error> {
    match command {
        Command::Run {
            mem,
            cpu,
            io_read_bps,
            io_write_bps,
            pin_cpu,
            detach,
            share_ipc,
            propagate_mount,
            image,
            cmd,
        } => {
            let outcome = manager.run(RunOptions {
                image,
                command: cmd,
                mem_limit: mem,
                cpu_quota: cpu,
                io_read_bps,
                io_write_bps,
                pin_cpu,
                detach,
                share_ipc,
                propagate_mount_dir: propagate_mount,
            })?;
            match outcome.state {
                RunState::Running => println!("Container started with PID {}", outcome.pid),
                RunState::Exited(code) => {
                    if code != 0 {
                        println!("Container exited with status {code}");
                    }
                }
            }
            Ok(())
        }
        Command::List => {
            println!("{:<15}\t{}", "CONTAINER PID", "COMMAND\tSTATE");
            for (_, record, state) in manager.list()? {
                let pid = record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                let state = match state {
                    ContainerState::Running => "Running",
                    ContainerState::Stopped => "Stopped",
                };
                println!("{:<15}\t{}\t{state}", pid, record.command.join(" "));
            }
            Ok(())
        }
        Command::Status { pid } => {
            let id = manager.find_by_pid(pid)?;
            let report = manager.status(id)?;
            println!("Command: {}", report.command.join(" "));
            if let Some(dir) = &report.propagate_mount_dir {
                println!("Propagated mount: {}", dir.display());
            }
            println!("Memory Usage: {} bytes", report.metrics.memory_current);
            println!("CPU Usage: {} usec", report.metrics.cpu_usage_usec);
            println!("Active Processes: {}", report.metrics.pids_current);
            if let Some(r) = report.metrics.io_rbytes {
                println!("IO Read: {r} bytes");
            }
            if let Some(w) = report.metrics.io_wbytes {
                println!("IO Write: {w} bytes");
            }
            Ok(())
        }
        Command::Freeze { pid } => manager.freeze(manager.find_by_pid(pid)?),
        Command::Thaw { pid } => manager.thaw(manager.find_by_pid(pid)?),
        Command::Stop { pid } => manager.stop(manager.find_by_pid(pid)?, DEFAULT_STOP_GRACE),
        Command::Start { pid } => {
            let id = manager.find_by_pid(pid)?;
            let outcome = manager.start(id)?;
            match outcome.state {
                RunState::Running => println!("Container started with PID {}", outcome.pid),
                RunState::Exited(code) => {
                    if code != 0 {
                        println!("Container exited with status {code}");
                    }
                }
            }
            Ok(())
        }
        Command::Rm { pid } => manager.rm(manager.find_by_pid(pid)?),
    }
}
