// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use crate::config::{Phase, Workload};
use crate::monitor;
use crate::testfile::setup_testfile;
use crate::util::write_one_line;
use crate::Config;

// fio reports intermediate status so a wedged run is visible in the logs.
const FIO_STATUS_INTERVAL: u32 = 5;
// let transient device state settle between cache modes
const MODE_SETTLE_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Direct,
}

impl CacheMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Direct => "direct",
        }
    }

    /// Expand the command line cache-mode filter into the sweep.
    pub fn sweep(filter: &str) -> Result<Vec<Self>> {
        match filter {
            "both" => Ok(vec![Self::Cached, Self::Direct]),
            "cached" => Ok(vec![Self::Cached]),
            "direct" => Ok(vec![Self::Direct]),
            v => bail!("invalid cache mode {:?}, expected both|cached|direct", v),
        }
    }
}

/// One fio invocation, fully resolved. Built either from a phase (with
/// workload-level fallbacks applied) or from a legacy single-phase
/// workload.
#[derive(Debug, Clone)]
pub struct FioJob {
    pub name: String,
    pub filename: PathBuf,
    pub size: String,
    pub runtime: u32,
    pub pattern: String,
    pub block_size: String,
    pub numjobs: u32,
    pub iodepth: u32,
    pub ioengine: Option<String>,
    pub rate_iops: u32,
    pub output: PathBuf,
    /// prefix for per-second bw/iops/lat logs, dual-client runs only
    pub log_prefix: Option<PathBuf>,
    pub direct: bool,
}

impl FioJob {
    pub fn from_phase(
        wl: &Workload,
        phase: &Phase,
        name: String,
        filename: PathBuf,
        output: PathBuf,
        mode: CacheMode,
    ) -> Self {
        Self {
            name,
            filename,
            size: wl.phase_file_size(phase).to_string(),
            runtime: phase.runtime,
            pattern: phase.pattern.clone(),
            block_size: phase.block_size.clone(),
            numjobs: wl.phase_numjobs(phase),
            iodepth: phase.iodepth,
            ioengine: phase.ioengine.clone(),
            rate_iops: wl.phase_rate_iops(phase),
            output,
            log_prefix: None,
            direct: mode == CacheMode::Direct,
        }
    }

    pub fn from_legacy(
        wl: &Workload,
        name: String,
        filename: PathBuf,
        output: PathBuf,
        mode: CacheMode,
    ) -> Self {
        Self {
            name,
            filename,
            size: wl.file_size.clone(),
            runtime: wl.runtime,
            pattern: wl.pattern.clone(),
            block_size: wl.block_size.clone(),
            numjobs: wl.numjobs,
            iodepth: wl.iodepth,
            ioengine: wl.ioengine.clone(),
            rate_iops: wl.rate_iops,
            output,
            log_prefix: None,
            direct: mode == CacheMode::Direct,
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new("fio");
        cmd.arg(format!("--name={}", &self.name))
            .arg(format!("--filename={}", self.filename.display()))
            .arg(format!("--size={}", &self.size))
            .arg(format!("--runtime={}", self.runtime))
            .arg("--time_based=1")
            .arg(format!("--rw={}", &self.pattern))
            .arg(format!("--bs={}", &self.block_size))
            .arg(format!("--numjobs={}", self.numjobs))
            .arg(format!("--iodepth={}", self.iodepth));

        if let Some(engine) = self.ioengine.as_ref() {
            cmd.arg(format!("--ioengine={}", engine));
        }
        if self.rate_iops > 0 {
            cmd.arg(format!("--rate_iops={}", self.rate_iops));
        }
        if let Some(prefix) = self.log_prefix.as_ref() {
            cmd.arg("--log_avg_msec=1000")
                .arg(format!("--write_lat_log={}", prefix.display()))
                .arg(format!("--write_bw_log={}", prefix.display()))
                .arg(format!("--write_iops_log={}", prefix.display()));
        }

        cmd.arg("--group_reporting=1")
            .arg("--output-format=json")
            .arg(format!("--output={}", self.output.display()))
            .arg(format!("--status-interval={}", FIO_STATUS_INTERVAL));

        if self.direct {
            cmd.arg("--direct=1");
        }
        cmd
    }

    /// Run the job to completion. fio failures are per-test conditions,
    /// logged but never escalated.
    pub fn run(&self, verbose: bool) {
        let mut cmd = self.command();
        if verbose {
            info!("bench: Executing {:?}", &cmd);
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        match cmd.status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("bench: fio {:?} failed ({})", &self.name, &status),
            Err(e) => warn!("bench: Failed to run fio {:?} ({})", &self.name, &e),
        }
    }
}

/// Flush dirty pages and ask the OS to purge the page cache. Purging
/// needs privilege and may not be supported, both are tolerated.
pub fn drop_caches() {
    unsafe { libc::sync() };
    if let Err(e) = write_one_line("/proc/sys/vm/drop_caches", "3") {
        debug!("bench: Failed to write drop_caches ({}), trying purge", &e);
        match Command::new("purge")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            v => debug!("bench: purge not usable ({:?})", &v),
        }
    }
    sleep(Duration::from_secs(1));
}

/// Fold per-phase outputs into one per-test result file. This surfaces
/// the last phase that produced output rather than aggregating metrics
/// across phases.
pub fn merge_phase_results(output_path: &Path, test_name: &str, nr_phases: usize) -> bool {
    let combined = output_path.join(format!("{}.json", test_name));
    for idx in (1..=nr_phases).rev() {
        let phase_file = output_path.join(format!("{}_phase{}.json", test_name, idx));
        match phase_file.metadata() {
            Ok(md) if md.len() > 0 => match fs::copy(&phase_file, &combined) {
                Ok(_) => {
                    debug!(
                        "bench: merged phase{} into {:?}",
                        idx,
                        combined.file_name().unwrap_or_default()
                    );
                    return true;
                }
                Err(e) => {
                    warn!("bench: Failed to copy {:?} ({})", &phase_file, &e);
                    continue;
                }
            },
            _ => continue,
        }
    }
    warn!("bench: No valid phase results to merge for {:?}", test_name);
    false
}

/// Run one named workload across the configured cache-mode sweep.
pub fn run_workload(
    cfg: &Config,
    workloads: &BTreeMap<String, Workload>,
    name: &str,
) -> Result<()> {
    let wl = workloads
        .get(name)
        .ok_or_else(|| anyhow!("workload {:?} not found in config", name))?;

    info!("bench: Running workload {:?}", name);
    if wl.is_multi_phase() {
        info!("bench:   {} phase(s)", wl.phases.len());
    } else if cfg.verbose {
        info!(
            "bench:   {}, {}, jobs={}, depth={}, pattern={}",
            &wl.file_size, &wl.block_size, wl.numjobs, wl.iodepth, &wl.pattern
        );
    }

    let testfile = cfg.testfile_path(&wl.file_size);
    setup_testfile(&wl.file_size, &testfile)?;

    for mode in cfg.cache_modes.iter() {
        let test_name = format!("{}_{}", name, mode.name());
        let output = cfg.output_path.join(format!("{}.json", test_name));
        info!("bench:   Running {:?}", &test_name);

        let mon = monitor::try_start(&cfg.iostat_path, &test_name);
        drop_caches();

        if wl.is_multi_phase() {
            for (idx, phase) in wl.phases.iter().enumerate() {
                let phase_name = format!("{}_phase{}", test_name, idx + 1);
                let phase_output = cfg.output_path.join(format!("{}.json", phase_name));

                let size = wl.phase_file_size(phase).to_string();
                let phase_file = cfg.testfile_path(&size);
                setup_testfile(&size, &phase_file)?;

                let mut info_line = format!(
                    "bench:     Phase {}/{}: {} for {}s",
                    idx + 1,
                    wl.phases.len(),
                    &phase.pattern,
                    phase.runtime
                );
                let rate = wl.phase_rate_iops(phase);
                if rate > 0 {
                    info_line += &format!(" (rate_iops={})", rate);
                }
                info!("{}", info_line);

                FioJob::from_phase(wl, phase, phase_name, phase_file, phase_output, *mode)
                    .run(cfg.verbose);
                // caches are deliberately left warm between phases
            }
            merge_phase_results(&cfg.output_path, &test_name, wl.phases.len());
        } else {
            FioJob::from_legacy(wl, test_name.clone(), testfile.clone(), output.clone(), *mode)
                .run(cfg.verbose);
        }

        if output.exists() {
            info!("bench:   Completed {:?}", &test_name);
        } else {
            warn!("bench:   Failed {:?}", &test_name);
        }

        if let Some(mon) = mon {
            mon.stop();
        }
        sleep(Duration::from_secs(MODE_SETTLE_SECS));
    }

    Ok(())
}

/// `all` mode - every configured workload, sequentially.
pub fn run_all(cfg: &Config, workloads: &BTreeMap<String, Workload>) -> Result<()> {
    info!("bench: Running all {} workload(s)", workloads.len());
    let mut nr_done = 0;
    for name in workloads.keys() {
        run_workload(cfg, workloads, name)?;
        nr_done += 1;
        info!("bench: Progress {}/{} workloads", nr_done, workloads.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cache_mode_sweep() {
        assert_eq!(
            CacheMode::sweep("both").unwrap(),
            vec![CacheMode::Cached, CacheMode::Direct]
        );
        assert_eq!(CacheMode::sweep("cached").unwrap(), vec![CacheMode::Cached]);
        assert_eq!(CacheMode::sweep("direct").unwrap(), vec![CacheMode::Direct]);
        assert!(CacheMode::sweep("warm").is_err());
    }

    #[test]
    fn test_merge_picks_last_nonempty_phase() {
        let dir = tempfile::tempdir().unwrap();
        fs::File::create(dir.path().join("wl_cached_phase1.json"))
            .unwrap()
            .write_all(b"{\"phase\": 1}")
            .unwrap();
        // phase2 produced nothing
        fs::File::create(dir.path().join("wl_cached_phase2.json")).unwrap();

        assert!(merge_phase_results(dir.path(), "wl_cached", 2));
        let combined = fs::read_to_string(dir.path().join("wl_cached.json")).unwrap();
        assert_eq!(combined, "{\"phase\": 1}");
    }

    #[test]
    fn test_merge_with_no_valid_phase() {
        let dir = tempfile::tempdir().unwrap();
        fs::File::create(dir.path().join("wl_direct_phase1.json")).unwrap();
        assert!(!merge_phase_results(dir.path(), "wl_direct", 1));
        assert!(!dir.path().join("wl_direct.json").exists());
    }

    #[test]
    fn test_fio_command_from_phase_fallbacks() {
        let mut wl = Workload::default();
        wl.numjobs = 2;
        wl.rate_iops = 500;
        wl.file_size = "1G".into();
        let phase = Phase {
            runtime: 10,
            block_size: "64k".into(),
            iodepth: 8,
            pattern: "randwrite".into(),
            ioengine: None,
            numjobs: None,
            file_size: None,
            rate_iops: Some(0),
        };

        let job = FioJob::from_phase(
            &wl,
            &phase,
            "wl_direct_phase1".into(),
            "/tmp/test_file_1G".into(),
            "/tmp/out.json".into(),
            CacheMode::Direct,
        );
        assert_eq!(job.numjobs, 2);
        assert_eq!(job.size, "1G");
        // Some(0) means explicitly unlimited, not "inherit"
        assert_eq!(job.rate_iops, 0);

        let cmd = job.command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--rw=randwrite".to_string()));
        assert!(args.contains(&"--direct=1".to_string()));
        assert!(args.contains(&"--numjobs=2".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--rate_iops")));
        assert!(!args.iter().any(|a| a.starts_with("--ioengine")));
    }

    #[test]
    fn test_fio_command_legacy_rate() {
        let mut wl = Workload::default();
        wl.rate_iops = 200;
        wl.ioengine = Some("psync".into());
        let job = FioJob::from_legacy(
            &wl,
            "wl_cached".into(),
            "/tmp/test_file_1G".into(),
            "/tmp/out.json".into(),
            CacheMode::Cached,
        );
        let args: Vec<String> = job
            .command()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--rate_iops=200".to_string()));
        assert!(args.contains(&"--ioengine=psync".to_string()));
        assert!(!args.contains(&"--direct=1".to_string()));
    }
}
