// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One timed sub-step of a multi-phase workload. Unset parameters fall
/// back to the owning workload's defaults at execution time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Phase {
    pub runtime: u32,
    pub block_size: String,
    pub iodepth: u32,
    pub pattern: String,
    pub ioengine: Option<String>,
    pub numjobs: Option<u32>,
    pub file_size: Option<String>,
    pub rate_iops: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub description: String,
    pub file_size: String,
    pub numjobs: u32,
    pub rate_iops: u32,
    // Legacy single-phase fields, superseded when phases is non-empty.
    pub block_size: String,
    pub runtime: u32,
    pub iodepth: u32,
    pub pattern: String,
    pub ioengine: Option<String>,
    pub phases: Vec<Phase>,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            description: String::new(),
            file_size: "1G".into(),
            numjobs: 1,
            rate_iops: 0,
            block_size: "4k".into(),
            runtime: 30,
            iodepth: 1,
            pattern: "read".into(),
            ioengine: None,
            phases: vec![],
        }
    }
}

impl Workload {
    pub fn is_multi_phase(&self) -> bool {
        !self.phases.is_empty()
    }

    pub fn phase_file_size<'a>(&'a self, phase: &'a Phase) -> &'a str {
        phase.file_size.as_deref().unwrap_or(&self.file_size)
    }

    pub fn phase_numjobs(&self, phase: &Phase) -> u32 {
        phase.numjobs.unwrap_or(self.numjobs)
    }

    pub fn phase_rate_iops(&self, phase: &Phase) -> u32 {
        phase.rate_iops.unwrap_or(self.rate_iops)
    }

    /// Phases to execute. A legacy workload without explicit phases acts
    /// as a single phase built from its workload-level fields.
    pub fn run_phases(&self) -> Vec<Phase> {
        if self.is_multi_phase() {
            self.phases.clone()
        } else {
            vec![Phase {
                runtime: self.runtime,
                block_size: self.block_size.clone(),
                iodepth: self.iodepth,
                pattern: self.pattern.clone(),
                ioengine: self.ioengine.clone(),
                numjobs: None,
                file_size: None,
                rate_iops: None,
            }]
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CgroupKnobs {
    pub cgroup_name: String,
    pub settings: BTreeMap<String, String>,
}

fn split_kv(line: &str) -> Option<(&str, &str)> {
    let eq = line.find('=')?;
    let key = line[..eq].trim();
    // strip inline comments off the value
    let mut value = &line[eq + 1..];
    if let Some(hash) = value.find('#') {
        value = &value[..hash];
    }
    Some((key, value.trim()))
}

fn parse_u32(section: &str, key: &str, value: &str) -> Option<u32> {
    match value.parse::<u32>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(
                "config: [{}] ignoring non-numeric {}={:?}",
                section, key, value
            );
            None
        }
    }
}

fn set_phase_param(phase: &mut Phase, section: &str, key: &str, param: &str, value: &str) {
    match param {
        "runtime" => {
            if let Some(v) = parse_u32(section, key, value) {
                phase.runtime = v;
            }
        }
        "block_size" => phase.block_size = value.into(),
        "iodepth" => {
            if let Some(v) = parse_u32(section, key, value) {
                phase.iodepth = v;
            }
        }
        "pattern" => phase.pattern = value.into(),
        "ioengine" => phase.ioengine = Some(value.into()),
        "numjobs" => phase.numjobs = parse_u32(section, key, value),
        "file_size" => phase.file_size = Some(value.into()),
        "rate_iops" => phase.rate_iops = parse_u32(section, key, value),
        _ => debug!("config: [{}] ignoring unknown phase key {:?}", section, key),
    }
}

fn set_workload_param(wl: &mut Workload, section: &str, key: &str, value: &str) {
    match key {
        "description" => wl.description = value.into(),
        "file_size" => wl.file_size = value.into(),
        "numjobs" => {
            if let Some(v) = parse_u32(section, key, value) {
                wl.numjobs = v;
            }
        }
        "rate_iops" => {
            if let Some(v) = parse_u32(section, key, value) {
                wl.rate_iops = v;
            }
        }
        "block_size" => wl.block_size = value.into(),
        "runtime" => {
            if let Some(v) = parse_u32(section, key, value) {
                wl.runtime = v;
            }
        }
        "iodepth" => {
            if let Some(v) = parse_u32(section, key, value) {
                wl.iodepth = v;
            }
        }
        "pattern" => wl.pattern = value.into(),
        "ioengine" => wl.ioengine = Some(value.into()),
        _ => debug!("config: [{}] ignoring unknown key {:?}", section, key),
    }
}

fn commit_workload(
    workloads: &mut BTreeMap<String, Workload>,
    name: &str,
    mut wl: Workload,
    phase_map: BTreeMap<u32, Phase>,
) {
    // phase records materialize in ascending numeric order regardless of
    // their order in the file
    wl.phases = phase_map.into_iter().map(|(_, phase)| phase).collect();
    workloads.insert(name.to_string(), wl);
}

/// Load the workload definitions from a section-keyed config file.
pub fn load_workloads<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, Workload>> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) => bail!("can't open workload config {:?} ({})", path, &e),
    };

    let mut workloads = BTreeMap::new();
    let mut section = String::new();
    let mut wl = Workload::default();
    let mut phase_map: BTreeMap<u32, Phase> = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            if !section.is_empty() {
                commit_workload(&mut workloads, &section, wl, phase_map);
            }
            section = line[1..line.len() - 1].trim().to_string();
            wl = Workload::default();
            phase_map = BTreeMap::new();
            continue;
        }

        let (key, value) = match split_kv(line) {
            Some(v) => v,
            None => continue,
        };

        if let Some(rest) = key.strip_prefix("phase_") {
            if let Some((num, param)) = rest.split_once('_') {
                if let Ok(idx) = num.parse::<u32>() {
                    let phase = phase_map.entry(idx).or_default();
                    set_phase_param(phase, &section, key, param, value);
                    continue;
                }
            }
        }
        set_workload_param(&mut wl, &section, key, value);
    }

    // the final section is only terminated by end-of-input
    if !section.is_empty() {
        commit_workload(&mut workloads, &section, wl, phase_map);
    }

    if workloads.is_empty() {
        bail!("workload config {:?} contains no workloads", path);
    }

    for (name, wl) in workloads.iter() {
        debug!(
            "config: workload {:?}: {} phase(s), file_size={:?}",
            name,
            wl.phases.len(),
            &wl.file_size
        );
    }
    Ok(workloads)
}

/// Load the per-client resource-control config. A missing file disables
/// isolation and is not an error.
pub fn load_cgroup_configs<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, CgroupKnobs>> {
    let path = path.as_ref();
    if !path.exists() {
        info!(
            "config: cgroup config {:?} not found, running without cgroups",
            path
        );
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path)?;

    let mut cgroups = BTreeMap::new();
    let mut section = String::new();
    let mut knobs = CgroupKnobs::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            if !section.is_empty() {
                cgroups.insert(section.clone(), knobs);
            }
            section = line[1..line.len() - 1].trim().to_string();
            knobs = CgroupKnobs::default();
            continue;
        }

        if let Some((key, value)) = split_kv(line) {
            if key == "cgroup_name" {
                knobs.cgroup_name = value.to_string();
            } else {
                knobs.settings.insert(key.to_string(), value.to_string());
            }
        }
    }
    if !section.is_empty() {
        cgroups.insert(section, knobs);
    }

    info!("config: loaded cgroup config for {} client(s)", cgroups.len());
    Ok(cgroups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_workloads_legacy() {
        let f = write_tmp(
            "# comment\n\
             [steady_reader_d1]\n\
             description = Steady 4k random reads\n\
             file_size = 1G\n\
             runtime = 30\n\
             pattern = randread\n\
             block_size = 4k\n\
             numjobs = 1\n\
             iodepth = 1\n\
             bogus_key = whatever\n",
        );
        let wls = load_workloads(f.path()).unwrap();
        assert_eq!(wls.len(), 1);
        let wl = &wls["steady_reader_d1"];
        assert!(!wl.is_multi_phase());
        assert_eq!(wl.file_size, "1G");
        assert_eq!(wl.runtime, 30);
        assert_eq!(wl.pattern, "randread");
        assert_eq!(wl.iodepth, 1);
    }

    #[test]
    fn test_load_workloads_phases_sparse_and_unordered() {
        let f = write_tmp(
            "[client2_bursty]\n\
             file_size = 1G\n\
             numjobs = 2\n\
             rate_iops = 500\n\
             phase_3_runtime = 20\n\
             phase_3_pattern = randwrite\n\
             phase_3_block_size = 64k\n\
             phase_3_iodepth = 8\n\
             phase_1_runtime = 10  # warmup\n\
             phase_1_pattern = randread\n\
             phase_1_block_size = 4k\n\
             phase_1_iodepth = 1\n\
             phase_1_rate_iops = 100\n\
             phase_1_numjobs = 4\n",
        );
        let wls = load_workloads(f.path()).unwrap();
        let wl = &wls["client2_bursty"];
        assert_eq!(wl.phases.len(), 2);
        // ascending phase order regardless of file order
        assert_eq!(wl.phases[0].pattern, "randread");
        assert_eq!(wl.phases[0].runtime, 10);
        assert_eq!(wl.phases[1].pattern, "randwrite");
        assert_eq!(wl.phases[1].iodepth, 8);
        // fallback law
        assert_eq!(wl.phase_numjobs(&wl.phases[0]), 4);
        assert_eq!(wl.phase_numjobs(&wl.phases[1]), 2);
        assert_eq!(wl.phase_rate_iops(&wl.phases[0]), 100);
        assert_eq!(wl.phase_rate_iops(&wl.phases[1]), 500);
        assert_eq!(wl.phase_file_size(&wl.phases[1]), "1G");
    }

    #[test]
    fn test_final_section_flush() {
        let f = write_tmp(
            "[first]\nruntime = 5\n\
             [last]\nruntime = 7\n",
        );
        let wls = load_workloads(f.path()).unwrap();
        assert_eq!(wls.len(), 2);
        assert_eq!(wls["last"].runtime, 7);
    }

    #[test]
    fn test_empty_config_fails() {
        let f = write_tmp("# nothing here\n");
        assert!(load_workloads(f.path()).is_err());
        assert!(load_workloads("/no/such/file.ini").is_err());
    }

    #[test]
    fn test_load_cgroup_configs() {
        let f = write_tmp(
            "[client1_steady]\n\
             cgroup_name = fairness/client1\n\
             io.weight = 100\n\
             memory.max = 512M\n\
             [client2_bursty]\n\
             cgroup_name = fairness/client2\n\
             io.weight = 100\n",
        );
        let cgs = load_cgroup_configs(f.path()).unwrap();
        assert_eq!(cgs.len(), 2);
        assert_eq!(cgs["client1_steady"].cgroup_name, "fairness/client1");
        assert_eq!(cgs["client1_steady"].settings["io.weight"], "100");
        assert_eq!(cgs["client1_steady"].settings.len(), 2);

        let missing = load_cgroup_configs("/no/such/cgroup.ini").unwrap();
        assert!(missing.is_empty());
    }
}
