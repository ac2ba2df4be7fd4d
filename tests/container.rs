mod common;

use std::time::Duration;

use common::{requires_root, unpack_busybox_rootfs, TempCgroup, TempDir};
use conbox::config::RuntimeRoots;
use conbox::manager::{ContainerState, LifecycleManager, RunOptions, RunState};

#[test]
fn run_foreground_executes_command_and_reports_exit_status() {
    if !requires_root() {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let image = tmp.join("image");
    unpack_busybox_rootfs(&image).unwrap();
    let cgroup_root = TempCgroup::new().unwrap();

    let manager = LifecycleManager::new(RuntimeRoots {
        state_root: tmp.join("state"),
        cgroup_root: cgroup_root.path().to_path_buf(),
        layers_root: tmp.join("layers"),
    })
    .unwrap();

    let outcome = manager
        .run(RunOptions {
            image,
            command: vec!["/bin/true".into()],
            ..Default::default()
        })
        .unwrap();

    assert_eq!(outcome.state, RunState::Exited(0));
    manager.rm(outcome.id).unwrap();
}

#[test]
fn detached_lifecycle_survives_stop_start_and_reuses_upper_layer() {
    if !requires_root() {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let image = tmp.join("image");
    unpack_busybox_rootfs(&image).unwrap();
    let cgroup_root = TempCgroup::new().unwrap();

    let manager = LifecycleManager::new(RuntimeRoots {
        state_root: tmp.join("state"),
        cgroup_root: cgroup_root.path().to_path_buf(),
        layers_root: tmp.join("layers"),
    })
    .unwrap();

    let outcome = manager
        .run(RunOptions {
            image,
            command: vec![
                "/bin/sh".into(),
                "-c".into(),
                "touch /marker; sleep 30".into(),
            ],
            detach: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(outcome.state, RunState::Running);

    // give the init process a moment to run the touch before checking state
    std::thread::sleep(Duration::from_millis(200));

    let status = manager.status(outcome.id).unwrap();
    assert!(status.metrics.pids_current >= 1);

    let record = manager
        .list()
        .unwrap()
        .into_iter()
        .find(|(id, _, _)| *id == outcome.id)
        .unwrap()
        .1;
    let marker = tmp
        .join("layers")
        .join(record.overlay_id.to_string())
        .join("upper")
        .join("marker");
    assert!(marker.exists());

    manager.stop(outcome.id, Duration::from_secs(2)).unwrap();
    let (_, _, state) = manager
        .list()
        .unwrap()
        .into_iter()
        .find(|(id, _, _)| *id == outcome.id)
        .unwrap();
    assert_eq!(state, ContainerState::Stopped);

    let restarted = manager.start(outcome.id).unwrap();
    assert_eq!(restarted.state, RunState::Running);
    assert!(marker.exists(), "upper layer should survive stop/start");

    manager.stop(outcome.id, Duration::from_secs(2)).unwrap();
    manager.rm(outcome.id).unwrap();
}
