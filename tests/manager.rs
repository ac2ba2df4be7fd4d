mod common;

use common::TempDir;
use conbox::config::RuntimeRoots;
use conbox::ids::ContainerId;
use conbox::manager::{LifecycleManager, RunOptions};

/// These don't touch real namespaces or cgroupfs -- `ensure_root`'s
/// `cgroup.subtree_control` write fails silently against a plain
/// directory, so `LifecycleManager::new` succeeds without root and these
/// precondition paths are exercised directly.
fn manager_in(tmp: &TempDir) -> LifecycleManager {
    LifecycleManager::new(RuntimeRoots {
        state_root: tmp.join("state"),
        cgroup_root: tmp.join("cgroup"),
        layers_root: tmp.join("layers"),
    })
    .unwrap()
}

#[test]
fn run_rejects_missing_image_path() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_in(&tmp);
    let err = manager
        .run(RunOptions {
            image: tmp.join("does-not-exist"),
            command: vec!["/bin/true".into()],
            ..Default::default()
        })
        .unwrap_err();
    assert!(err.to_string().contains("image path does not exist"));
}

#[test]
fn run_rejects_empty_command() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir(tmp.join("image")).unwrap();
    let manager = manager_in(&tmp);
    let err = manager
        .run(RunOptions {
            image: tmp.join("image"),
            command: vec![],
            ..Default::default()
        })
        .unwrap_err();
    assert!(err.to_string().contains("command"));
}

#[test]
fn find_by_pid_reports_no_such_container() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_in(&tmp);
    assert!(manager.find_by_pid(999_999).is_err());
}

#[test]
fn list_on_fresh_state_root_is_empty() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_in(&tmp);
    assert!(manager.list().unwrap().is_empty());
}

#[test]
fn rm_on_unknown_container_id_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_in(&tmp);
    assert!(manager.rm(ContainerId::new()).is_err());
}
