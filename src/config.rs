//! Runtime root paths (spec §6 "Persisted state layout", SPEC_FULL §1.3).
//!
//! There is no config file: every knob is either a CLI flag or one of
//! these three filesystem roots, which default under `/run/conbox` and
//! `/sys/fs/cgroup/conbox` and can be overridden by environment variable,
//! mirroring the teacher's `Manager::new` pattern of taking roots as
//! constructor parameters instead of hardcoding them.

use std::path::PathBuf;

const STATE_DIR_VAR: &str = "CONBOX_STATE_DIR";
const CGROUP_DIR_VAR: &str = "CONBOX_CGROUP_DIR";
const LAYERS_DIR_VAR: &str = "CONBOX_LAYERS_DIR";

#[derive(Clone, Debug)]
pub struct RuntimeRoots {
    pub state_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub layers_root: PathBuf,
}

impl RuntimeRoots {
    pub fn from_env() -> Self {
        Self {
            state_root: env_or(STATE_DIR_VAR, "/run/conbox/state"),
            cgroup_root: env_or(CGROUP_DIR_VAR, "/sys/fs/cgroup/conbox"),
            layers_root: env_or(LAYERS_DIR_VAR, "/run/conbox/layers"),
        }
    }

    pub fn next_cpu_file(&self) -> PathBuf {
        self.state_root.join("next_cpu")
    }
}

fn env_or(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var).map(PathBuf::from).unwrap_or_else(|| default.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_unset() {
        std::env::remove_var(STATE_DIR_VAR);
        let roots = RuntimeRoots::from_env();
        assert_eq!(roots.state_root, PathBuf::from("/run/conbox/state"));
        assert_eq!(roots.next_cpu_file(), PathBuf::from("/run/conbox/state/next_cpu"));
    }
}
