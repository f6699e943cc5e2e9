// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

use crate::bench::{drop_caches, CacheMode, FioJob};
use crate::cgroup::CgroupMgr;
use crate::config::{Phase, Workload};
use crate::monitor;
use crate::testfile::{setup_testfile, testfile_path};
use crate::Config;

pub const CLIENT1_NAME: &str = "client1_steady";
pub const CLIENT2_NAME: &str = "client2_bursty";

const CONCURRENT_SETTLE_SECS: u64 = 2;

struct ClientRun {
    client: String,
    short_name: String,
    wl: Workload,
    testfile_dir: PathBuf,
    output_path: PathBuf,
    cgroups: Arc<CgroupMgr>,
    mode: CacheMode,
    verbose: bool,
}

impl ClientRun {
    /// Resolve one phase into a runnable fio job. A phase-level
    /// file_size override gets its own backing file provisioned here,
    /// same as the sequential path.
    fn phase_job(&self, idx: usize, phase: &Phase) -> Result<FioJob> {
        let phase_name = format!("{}_{}_phase{}", &self.short_name, self.mode.name(), idx + 1);
        let phase_output = self.output_path.join(format!("{}.json", phase_name));
        let log_prefix = self.output_path.join(&phase_name);

        let size = self.wl.phase_file_size(phase).to_string();
        let testfile = testfile_path(&self.testfile_dir, &size);
        setup_testfile(&size, &testfile)?;

        let mut job =
            FioJob::from_phase(&self.wl, phase, phase_name, testfile, phase_output, self.mode);
        job.log_prefix = Some(log_prefix);
        Ok(job)
    }

    /// Execute every phase of this client's workload sequentially. Each
    /// fio child enters the client's cgroup twice: from inside the child
    /// before exec and from this side right after spawn, so losing
    /// either race still leaves the pid in the group.
    fn run(&self) -> Result<()> {
        for (idx, phase) in self.wl.run_phases().iter().enumerate() {
            let job = self.phase_job(idx, phase)?;

            let mut cmd = job.command();
            if !self.verbose {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            if let Some(procs_path) = self.cgroups.procs_path(&self.client) {
                unsafe {
                    cmd.pre_exec(move || {
                        let pid = libc::getpid();
                        let _ = fs::write(&procs_path, pid.to_string());
                        Ok(())
                    });
                }
            }

            let mut child = match cmd.spawn() {
                Ok(v) => v,
                Err(e) => bail!("failed to spawn fio for {:?} ({})", &job.name, &e),
            };
            self.cgroups.assign(&self.client, child.id());

            match child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("dual: fio {:?} failed ({})", &job.name, &status),
                Err(e) => bail!("failed to reap fio for {:?} ({})", &job.name, &e),
            }
        }
        Ok(())
    }
}

fn spawn_client(run: ClientRun) -> JoinHandle<Result<()>> {
    spawn(move || run.run())
}

fn join_client(client: &str, jh: JoinHandle<Result<()>>) {
    match jh.join() {
        Ok(Ok(())) => info!("dual:   Client {:?} completed", client),
        Ok(Err(e)) => warn!("dual:   Client {:?} failed ({})", client, &e),
        Err(_) => warn!("dual:   Client {:?} runner panicked", client),
    }
}

/// Concurrent dual-client fairness run: both clients observe the same
/// cold-cache starting state per cache mode, execute their phases under
/// independent cgroups and are jointly awaited.
pub fn run_dual(
    cfg: &Config,
    workloads: &BTreeMap<String, Workload>,
    cgroups: Arc<CgroupMgr>,
) -> Result<()> {
    let (client1, client2) = match (workloads.get(CLIENT1_NAME), workloads.get(CLIENT2_NAME)) {
        (Some(c1), Some(c2)) => (c1, c2),
        _ => bail!(
            "dual-client mode requires {:?} and {:?} in config",
            CLIENT1_NAME,
            CLIENT2_NAME
        ),
    };

    info!("dual: Starting concurrent dual-client fairness test");
    info!("dual:   Client1 (steady): {}", &client1.description);
    info!("dual:   Client2 (bursty): {}", &client2.description);

    cgroups.setup(CLIENT1_NAME)?;
    cgroups.setup(CLIENT2_NAME)?;

    // provision the workload-level files up front so that only phase
    // overrides need work once the clients are racing
    setup_testfile(&client1.file_size, &cfg.testfile_path(&client1.file_size))?;
    setup_testfile(&client2.file_size, &cfg.testfile_path(&client2.file_size))?;

    for mode in cfg.cache_modes.iter() {
        info!("dual: Running mode {:?}", mode.name());

        let mon = monitor::try_start(&cfg.iostat_path, &format!("concurrent_{}", mode.name()));

        // shared barrier - both clients start from the same cache state
        drop_caches();

        let runs = [
            (CLIENT1_NAME, "client1", client1),
            (CLIENT2_NAME, "client2", client2),
        ]
        .map(|(client, short_name, wl)| ClientRun {
            client: client.into(),
            short_name: short_name.into(),
            wl: wl.clone(),
            testfile_dir: cfg.testfile_dir.clone(),
            output_path: cfg.output_path.clone(),
            cgroups: cgroups.clone(),
            mode: *mode,
            verbose: cfg.verbose,
        });

        let [jh1, jh2] = runs.map(spawn_client);
        join_client(CLIENT1_NAME, jh1);
        join_client(CLIENT2_NAME, jh2);

        if let Some(mon) = mon {
            mon.stop();
        }
        info!("dual: Completed mode {:?}", mode.name());
        sleep(Duration::from_secs(CONCURRENT_SETTLE_SECS));
    }

    cgroups.teardown_all();
    Ok(())
}
