mod common;

use std::time::Duration;

use common::{requires_root, TempCgroup};
use conbox::cgroup::{CgroupController, Limits};

#[test]
fn ensure_root_enables_every_controller() {
    if !requires_root() {
        return;
    }
    let cgroup = TempCgroup::new().unwrap();
    let controller = CgroupController::new(cgroup.path());
    controller.ensure_root().unwrap();
    let contents = std::fs::read_to_string(cgroup.path().join("cgroup.subtree_control")).unwrap();
    for want in ["cpu", "memory", "pids", "io"] {
        assert!(contents.contains(want), "{contents:?} missing {want}");
    }
}

#[test]
fn leaf_lifecycle_applies_limits_and_reports_metrics() {
    if !requires_root() {
        return;
    }
    let cgroup = TempCgroup::new().unwrap();
    let controller = CgroupController::new(cgroup.path());
    controller.ensure_root().unwrap();

    let mut child = std::process::Command::new("/bin/sleep")
        .arg("5")
        .spawn()
        .unwrap();
    let pid = child.id() as i32;

    controller.create_leaf(pid).unwrap();
    controller
        .apply_limits(
            pid,
            &Limits {
                mem_limit: Some("100000000".into()),
                ..Default::default()
            },
        )
        .unwrap();
    controller.place(pid).unwrap();

    let mem_max =
        std::fs::read_to_string(cgroup.path().join(format!("container_{pid}/memory.max")))
            .unwrap();
    assert_eq!(mem_max.trim(), "100000000");

    let metrics = controller.read_metrics(pid).unwrap();
    assert!(metrics.pids_current >= 1);

    controller.freeze(pid).unwrap();
    let frozen =
        std::fs::read_to_string(cgroup.path().join(format!("container_{pid}/cgroup.freeze")))
            .unwrap();
    assert_eq!(frozen.trim(), "1");
    controller.thaw(pid).unwrap();

    let _ = child.kill();
    let _ = child.wait();
    std::thread::sleep(Duration::from_millis(50));
    controller.remove_leaf(pid).unwrap();
}
