// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::config::CgroupKnobs;
use crate::util::write_one_line;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const SYSTEMD_SLICE_PROBE: &str = "/sys/fs/cgroup/system.slice";
const SUBTREE_CONTROLLERS: &str = "+cpu +memory +io";

/// Per-client cgroup-v2 manager. Everything here is best-effort - the
/// benchmark must still produce results on hosts without privilege or
/// full controller support, so failures degrade to warnings instead of
/// aborting the run.
pub struct CgroupMgr {
    enabled: bool,
    base_path: PathBuf,
    cgroups: BTreeMap<String, CgroupKnobs>,
}

fn detect_base_path() -> PathBuf {
    // One probe fixes the base path for the rest of the run. On
    // systemd-managed hierarchies our groups live under system.slice so
    // that the manager doesn't fight us over the top-level tree.
    if Path::new(SYSTEMD_SLICE_PROBE).is_dir() {
        debug!("cgroup: systemd-managed hierarchy, using {:?}", SYSTEMD_SLICE_PROBE);
        PathBuf::from(SYSTEMD_SLICE_PROBE)
    } else {
        debug!("cgroup: flat hierarchy, using {:?}", CGROUP_ROOT);
        PathBuf::from(CGROUP_ROOT)
    }
}

fn enable_controllers(cgrp_dir: &Path) {
    let path = cgrp_dir.join("cgroup.subtree_control");
    if let Err(e) = write_one_line(&path, SUBTREE_CONTROLLERS) {
        warn!(
            "cgroup: Failed to write {:?} to {:?} ({})",
            SUBTREE_CONTROLLERS, &path, &e
        );
    }
}

/// Directories whose subtree_control must be written before `cgrp_dir`
/// can use the controllers, ordered root to leaf. Delegation only takes
/// effect in that order.
fn delegation_dirs(base_path: &Path, cgrp_dir: &Path) -> Vec<PathBuf> {
    let mut intermediates = Vec::new();
    let mut parent = cgrp_dir.parent();
    while let Some(dir) = parent {
        if dir == base_path {
            break;
        }
        intermediates.push(dir.to_path_buf());
        parent = dir.parent();
    }

    let mut dirs = vec![base_path.to_path_buf()];
    dirs.extend(intermediates.into_iter().rev());
    dirs
}

impl CgroupMgr {
    pub fn new(cgroups: BTreeMap<String, CgroupKnobs>, enabled: bool) -> Self {
        let enabled = enabled && !cgroups.is_empty();
        Self {
            enabled,
            base_path: detect_base_path(),
            cgroups,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn group_dir(&self, client_name: &str) -> Option<PathBuf> {
        let knobs = self.cgroups.get(client_name)?;
        if knobs.cgroup_name.is_empty() {
            return None;
        }
        Some(self.base_path.join(&knobs.cgroup_name))
    }

    /// Path of the client's cgroup.procs, for child-side self-assignment.
    pub fn procs_path(&self, client_name: &str) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        Some(self.group_dir(client_name)?.join("cgroup.procs"))
    }

    /// Create and configure the client's cgroup. Partial failures are
    /// counted and reported, never escalated.
    pub fn setup(&self, client_name: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let knobs = match self.cgroups.get(client_name) {
            Some(v) => v,
            None => {
                warn!(
                    "cgroup: No config for {:?}, running without cgroup",
                    client_name
                );
                return Ok(());
            }
        };

        let cgrp_dir = self.base_path.join(&knobs.cgroup_name);
        if let Err(e) = fs::create_dir_all(&cgrp_dir) {
            warn!(
                "cgroup: Failed to create {:?} ({}), running without cgroup",
                &cgrp_dir, &e
            );
            return Ok(());
        }

        // Controllers must be activated top-down before the leaf can use
        // them. Names with a path separator get intermediate dirs which
        // need their own subtree_control writes, root first.
        for dir in delegation_dirs(&self.base_path, &cgrp_dir) {
            enable_controllers(&dir);
        }

        let mut nr_applied = 0;
        let mut nr_failed = 0;
        for (key, value) in knobs.settings.iter() {
            let knob_path = cgrp_dir.join(key);
            if !knob_path.exists() {
                // controller not available on this host
                debug!("cgroup: {:?} missing, skipping", &knob_path);
                nr_failed += 1;
                continue;
            }
            match write_one_line(&knob_path, value) {
                Ok(()) => nr_applied += 1,
                Err(e) => {
                    debug!("cgroup: Failed to set {}={:?} ({})", key, value, &e);
                    nr_failed += 1;
                }
            }
        }

        if nr_applied > 0 {
            info!(
                "cgroup: Set up {:?} ({} settings applied, {} failed)",
                &knobs.cgroup_name, nr_applied, nr_failed
            );
        } else {
            warn!(
                "cgroup: No settings applied for {:?} (controllers may not be available)",
                &knobs.cgroup_name
            );
        }
        Ok(())
    }

    /// Best-effort pid assignment. The workload still runs without the
    /// isolation guarantee when this fails.
    pub fn assign(&self, client_name: &str, pid: u32) {
        let procs_path = match self.procs_path(client_name) {
            Some(v) => v,
            None => return,
        };
        if let Err(e) = write_one_line(&procs_path, &pid.to_string()) {
            warn!(
                "cgroup: Failed to add pid {} to {:?} ({})",
                pid, &procs_path, &e
            );
        }
    }

    fn kill_residual_procs(cgrp_dir: &Path) {
        let procs_path = cgrp_dir.join("cgroup.procs");
        let content = match fs::OpenOptions::new().read(true).open(&procs_path) {
            Ok(mut f) => {
                let mut buf = String::new();
                match f.read_to_string(&mut buf) {
                    Ok(_) => buf,
                    Err(_) => return,
                }
            }
            Err(_) => return,
        };
        for line in content.lines() {
            if let Ok(pid) = line.trim().parse::<i32>() {
                debug!("cgroup: killing residual pid {} in {:?}", pid, cgrp_dir);
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }

    /// Advisory cleanup after a run. Never a correctness gate - every
    /// failure is swallowed.
    pub fn teardown_all(&self) {
        if !self.enabled {
            return;
        }

        let mut parents = Vec::new();
        for (client_name, knobs) in self.cgroups.iter() {
            let cgrp_dir = match self.group_dir(client_name) {
                Some(v) => v,
                None => continue,
            };
            Self::kill_residual_procs(&cgrp_dir);
            match fs::remove_dir(&cgrp_dir) {
                Ok(()) => debug!("cgroup: removed {:?}", &cgrp_dir),
                Err(e) => debug!("cgroup: Failed to remove {:?} ({})", &cgrp_dir, &e),
            }
            if let Some((parent, _)) = knobs.cgroup_name.rsplit_once('/') {
                let parent = self.base_path.join(parent);
                if !parents.contains(&parent) {
                    parents.push(parent);
                }
            }
        }
        for parent in parents {
            if let Err(e) = fs::remove_dir(&parent) {
                debug!("cgroup: Failed to remove {:?} ({})", &parent, &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_knobs() -> BTreeMap<String, CgroupKnobs> {
        let mut settings = BTreeMap::new();
        settings.insert("io.weight".to_string(), "100".to_string());
        let mut map = BTreeMap::new();
        map.insert(
            "client1_steady".to_string(),
            CgroupKnobs {
                cgroup_name: "fairness/client1".to_string(),
                settings,
            },
        );
        map
    }

    #[test]
    fn test_disabled_mgr_is_inert() {
        let mgr = CgroupMgr::new(sample_knobs(), false);
        assert!(!mgr.enabled());
        assert!(mgr.procs_path("client1_steady").is_none());
        // setup/assign/teardown must all be no-op successes
        mgr.setup("client1_steady").unwrap();
        mgr.assign("client1_steady", 12345);
        mgr.teardown_all();
    }

    #[test]
    fn test_empty_config_disables() {
        let mgr = CgroupMgr::new(BTreeMap::new(), true);
        assert!(!mgr.enabled());
        mgr.setup("anyone").unwrap();
    }

    #[test]
    fn test_unconfigured_client_is_tolerated() {
        let mgr = CgroupMgr::new(sample_knobs(), true);
        assert!(mgr.enabled());
        mgr.setup("no_such_client").unwrap();
        assert!(mgr.procs_path("no_such_client").is_none());
    }

    #[test]
    fn test_delegation_order_is_top_down() {
        let base = Path::new("/sys/fs/cgroup");
        assert_eq!(
            delegation_dirs(base, &base.join("fairness/client1")),
            vec![base.to_path_buf(), base.join("fairness")]
        );
        // deeper nesting keeps strict root-to-leaf order
        assert_eq!(
            delegation_dirs(base, &base.join("a/b/c")),
            vec![base.to_path_buf(), base.join("a"), base.join("a/b")]
        );
        // a top-level group only needs the base
        assert_eq!(
            delegation_dirs(base, &base.join("solo")),
            vec![base.to_path_buf()]
        );
    }

    #[test]
    fn test_procs_path_layout() {
        let mgr = CgroupMgr::new(sample_knobs(), true);
        let path = mgr.procs_path("client1_steady").unwrap();
        assert!(path.ends_with("fairness/client1/cgroup.procs"));
    }
}
