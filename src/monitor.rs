// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Background `iostat` sampler for one test invocation. Output goes to
/// `<dir>/<test_name>.iostat`, one sample per second.
pub struct IostatMonitor {
    test_name: String,
    log_path: PathBuf,
    child: Child,
}

impl IostatMonitor {
    pub fn start<P: AsRef<Path>>(iostat_dir: P, test_name: &str) -> Result<Self> {
        let log_path = iostat_dir.as_ref().join(format!("{}.iostat", test_name));
        let log_file = fs::File::create(&log_path)
            .with_context(|| format!("failed to create {:?}", &log_path))?;

        let child = Command::new("iostat")
            .args(&["-d", "1"])
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn iostat")?;

        debug!(
            "monitor: iostat pid {} logging to {:?}",
            child.id(),
            &log_path
        );
        Ok(Self {
            test_name: test_name.to_string(),
            log_path,
            child,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Terminate the sampler and reap it. Must complete before the next
    /// test starts so that monitors never overlap.
    pub fn stop(mut self) {
        if let Err(e) = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
            warn!(
                "monitor: Failed to signal iostat for {:?} ({})",
                &self.test_name, &e
            );
        }
        match self.child.wait() {
            Ok(status) => debug!(
                "monitor: iostat for {:?} exited ({})",
                &self.test_name, &status
            ),
            Err(e) => warn!(
                "monitor: Failed to reap iostat for {:?} ({})",
                &self.test_name, &e
            ),
        }
    }
}

/// Start monitoring and keep going without it if iostat isn't usable.
pub fn try_start<P: AsRef<Path>>(iostat_dir: P, test_name: &str) -> Option<IostatMonitor> {
    match IostatMonitor::start(iostat_dir, test_name) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("monitor: {:?} will run unmonitored ({})", test_name, &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_log_naming() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("steady_reader_d1_cached.iostat");
        // iostat may be missing on the test host, in which case start()
        // degrades to an error the caller turns into a warning
        if let Ok(mon) = IostatMonitor::start(dir.path(), "steady_reader_d1_cached") {
            assert_eq!(mon.log_path(), expected.as_path());
            assert!(expected.exists());
            mon.stop();
        }
    }
}
