// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use chrono::Local;
use glob::glob;
use log::{error, info, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

mod args;
mod bench;
mod cgroup;
mod config;
mod dual;
mod monitor;
mod testfile;
mod util;

use args::Args;
use bench::CacheMode;
use cgroup::CgroupMgr;

fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Immutable run configuration handed to every component. Holds the
/// resolved paths and the cache-mode sweep for this invocation.
pub struct Config {
    pub config_path: String,
    pub output_path: PathBuf,
    pub iostat_path: PathBuf,
    pub testfile_dir: PathBuf,
    pub cache_modes: Vec<CacheMode>,
    pub verbose: bool,
}

impl Config {
    fn new(args: &Args) -> Result<Self> {
        let cache_modes = CacheMode::sweep(&args.cache_mode)?;

        // the output dir is recreated from scratch on every invocation
        let output_path = PathBuf::from(&args.output);
        if output_path.exists() {
            fs::remove_dir_all(&output_path)
                .with_context(|| format!("failed to clear output dir {:?}", &output_path))?;
        }
        let iostat_path = output_path.join("iostat");
        fs::create_dir_all(&iostat_path)
            .with_context(|| format!("failed to create output dir {:?}", &iostat_path))?;

        Ok(Self {
            config_path: args.config.clone(),
            output_path,
            iostat_path,
            testfile_dir: std::env::current_dir()?,
            cache_modes,
            verbose: args.verbosity > 0,
        })
    }

    pub fn testfile_path(&self, size_str: &str) -> PathBuf {
        testfile::testfile_path(&self.testfile_dir, size_str)
    }

    fn write_metadata(&self, mode: &str) -> Result<()> {
        let mut f = fs::File::create(self.output_path.join("metadata.txt"))?;
        writeln!(f, "timestamp={}", timestamp())?;
        writeln!(f, "config_file={}", &self.config_path)?;
        writeln!(f, "test_type=fairness_benchmark")?;
        writeln!(f, "run_mode={}", mode)?;
        Ok(())
    }
}

fn check_dependencies(args: &Args) -> Result<()> {
    if util::find_bin("fio", Option::<&str>::None).is_none() {
        anyhow::bail!("fio is required but not installed");
    }
    if !Path::new(&args.config).exists() {
        anyhow::bail!("config file not found: {:?}", &args.config);
    }
    Ok(())
}

fn count_glob(pattern: &str) -> usize {
    match glob(pattern) {
        Ok(iter) => iter.filter_map(Result::ok).count(),
        Err(_) => 0,
    }
}

fn generate_summary(cfg: &Config) -> Result<()> {
    let nr_json = count_glob(&format!("{}/*.json", cfg.output_path.display()));
    let nr_iostat = count_glob(&format!("{}/*.iostat", cfg.iostat_path.display()));

    info!(
        "Generated {} fio results and {} iostat logs",
        nr_json, nr_iostat
    );

    let mut f = fs::File::create(cfg.output_path.join("summary.txt"))?;
    writeln!(f, "Fairness Benchmark Results Summary")?;
    writeln!(f, "=================================")?;
    writeln!(f, "Timestamp: {}", timestamp())?;
    writeln!(f, "Config File: {}", &cfg.config_path)?;
    writeln!(f)?;
    writeln!(f, "Results:")?;
    writeln!(f, "- FIO JSON results: {} files", nr_json)?;
    writeln!(f, "- iostat monitoring: {} files", nr_iostat)?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    util::init_logging(args.verbosity);

    if let Err(e) = check_dependencies(&args) {
        error!("{}", &e);
        exit(1);
    }

    let workloads = match config::load_workloads(&args.config) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to parse config file ({})", &e);
            exit(1);
        }
    };

    let cgroup_cfgs = match config::load_cgroup_configs(&args.cgroup_config) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to parse cgroup config, skipping cgroups ({})", &e);
            Default::default()
        }
    };

    info!("Starting fairness benchmark");
    info!("Mode: {}, Config: {}", &args.mode, &args.config);

    let cfg = match Config::new(&args) {
        Ok(v) => v,
        Err(e) => {
            error!("{}", &e);
            exit(1);
        }
    };
    if let Err(e) = cfg.write_metadata(&args.mode) {
        warn!("Failed to write metadata ({})", &e);
    }

    let cgroups = Arc::new(CgroupMgr::new(cgroup_cfgs, !args.no_cgroups));
    info!(
        "Cgroup isolation {}",
        if cgroups.enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let result = match args.mode.as_str() {
        "dual" => dual::run_dual(&cfg, &workloads, cgroups),
        "all" => bench::run_all(&cfg, &workloads),
        name => bench::run_workload(&cfg, &workloads, name),
    };
    if let Err(e) = result {
        error!("{}", &e);
        exit(1);
    }

    if let Err(e) = generate_summary(&cfg) {
        warn!("Failed to write summary ({})", &e);
    }
    info!(
        "Fairness benchmark completed, results in {:?}",
        &cfg.output_path
    );
}
