// Copyright (c) Facebook, Inc. and its affiliates.
use clap::{App, AppSettings, Arg, ArgMatches};

lazy_static::lazy_static! {
    static ref ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-c, --config=[FILE]        'Workload config file (default: {dfl_config})'
             -o, --output=[DIR]         'Output directory (default: {dfl_output})'
             -C, --cache-mode=[MODE]    'Cache mode sweep: both|cached|direct (default: {dfl_cache})'
             -g, --cgroup-config=[FILE] 'Cgroup config file (default: {dfl_cgroup})'
                 --no-cgroups           'Disable cgroup-based client isolation'
             -v...                      'Sets the level of verbosity'",
            dfl_config = dfl.config,
            dfl_output = dfl.output,
            dfl_cache = dfl.cache_mode,
            dfl_cgroup = dfl.cgroup_config,
        )
    };
}

const AFTER_HELP: &str = "\
MODES:
    dual               Run concurrent dual-client fairness test (default)
    all                Run all sequential workloads
    <workload-name>    Run one specific workload

Dual-client mode runs client1_steady and client2_bursty concurrently
under per-client cgroups, logs per-second IOPS/bandwidth/latency and
samples iostat at 1-second intervals.";

#[derive(Debug, Clone)]
pub struct Args {
    pub mode: String,
    pub config: String,
    pub output: String,
    pub cgroup_config: String,
    pub cache_mode: String,
    pub no_cgroups: bool,
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            mode: "dual".into(),
            config: "fairness_configs.ini".into(),
            output: "fairness_results".into(),
            cgroup_config: "cgroup_config.ini".into(),
            cache_mode: "both".into(),
            no_cgroups: false,
            verbosity: 0,
        }
    }
}

impl Args {
    fn match_cmdline() -> ArgMatches<'static> {
        App::new("fairness-bench")
            .version(clap::crate_version!())
            .author(env!("CARGO_PKG_AUTHORS"))
            .about("Storage I/O fairness benchmark orchestrator")
            .setting(AppSettings::UnifiedHelpMessage)
            .setting(AppSettings::DeriveDisplayOrder)
            .args_from_usage(&ARGS_STR)
            .arg(
                Arg::with_name("MODE")
                    .help("dual | all | <workload-name>")
                    .index(1),
            )
            .after_help(AFTER_HELP)
            .get_matches()
    }

    pub fn parse() -> Self {
        let matches = Self::match_cmdline();
        let mut args = Self::default();

        if let Some(v) = matches.value_of("MODE") {
            args.mode = v.into();
        }
        if let Some(v) = matches.value_of("config") {
            args.config = v.into();
        }
        if let Some(v) = matches.value_of("output") {
            args.output = v.into();
        }
        if let Some(v) = matches.value_of("cache-mode") {
            args.cache_mode = v.into();
        }
        if let Some(v) = matches.value_of("cgroup-config") {
            args.cgroup_config = v.into();
        }
        args.no_cgroups = matches.is_present("no-cgroups");
        args.verbosity = matches.occurrences_of("v") as u32;
        args
    }
}
