//! Reads CPU and memory limits out of the discovered cgroups

use std::fmt;

use clap::ValueEnum;
use log::debug;
use nix::unistd::{self, SysconfVar};

use crate::cgroup::{CGroup, CGroups, CgroupError};

const CPU_CFS_QUOTA_US: &str = "cpu.cfs_quota_us";
const CPU_CFS_PERIOD_US: &str = "cpu.cfs_period_us";
const CPU_MAX: &str = "cpu.max";
const MEMORY_LIMIT_IN_BYTES: &str = "memory.limit_in_bytes";
const MEMORY_MAX: &str = "memory.max";

/// Written to `cpu.max` and `memory.max` when there is no limit
const UNLIMITED: &str = "max";

/// Period the kernel assumes when `cpu.max` only holds a quota
const DEFAULT_CPU_PERIOD_US: i64 = 100_000;

/// Assumed when `sysconf(3)` does not know the page size
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// How a CPU quota was turned into a CPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuQuotaStatus {
    /// No quota is set; the host's CPU count applies.
    Undefined,
    /// The quota determined the CPU count.
    Used,
    /// The quota was below the minimum, which applies instead.
    MinUsed,
}

/// How the total memory was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    /// No limit is set; the host's memory applies.
    Undefined,
    /// The cgroup limit applies.
    Used,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Rounding {
    #[default]
    Floor,
    Ceil,
}

impl fmt::Display for CpuQuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undefined => "undefined",
            Self::Used => "used",
            Self::MinUsed => "min used",
        })
    }
}

impl fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undefined => "undefined",
            Self::Used => "used",
        })
    }
}

impl CGroups {
    /// Returns the CPU quota as a (fractional) number of CPUs.
    ///
    /// `None` means that no quota is set or that the cpu controller is not
    /// available to us.
    pub fn cpu_quota(&self) -> Result<Option<f64>, CgroupError> {
        let Some(group) = self.controller("cpu") else {
            debug!("no cpu controller");
            return Ok(None);
        };

        let quota = match self {
            Self::V1(_) => cpu_quota_v1(group)?,
            Self::V2(_) => cpu_quota_v2(group)?,
        };
        debug!("cpu quota of {:?} is {quota:?}", group.path());

        Ok(quota)
    }

    /// Returns the memory limit in bytes, `None` if there is none.
    pub fn memory_limit(&self) -> Result<Option<u64>, CgroupError> {
        let Some(group) = self.controller("memory") else {
            debug!("no memory controller");
            return Ok(None);
        };

        let limit = match self {
            Self::V1(_) => memory_limit_v1(group)?,
            Self::V2(_) => memory_limit_v2(group)?,
        };
        debug!("memory limit of {:?} is {limit:?}", group.path());

        Ok(limit)
    }
}

fn cpu_quota_v1(group: &CGroup) -> Result<Option<f64>, CgroupError> {
    let quota = group.read_int(CPU_CFS_QUOTA_US)?;
    if quota <= 0 {
        return Ok(None);
    }

    let period = group.read_int(CPU_CFS_PERIOD_US)?;
    if period <= 0 {
        return Err(CgroupError::InvalidValue {
            path: group.param_path(CPU_CFS_PERIOD_US),
            value: period.to_string(),
        });
    }

    Ok(Some(quota as f64 / period as f64))
}

/// `cpu.max` holds `$MAX $PERIOD`, where `$MAX` may be `max`.
fn cpu_quota_v2(group: &CGroup) -> Result<Option<f64>, CgroupError> {
    let line = group.read_first_line(CPU_MAX)?;
    let invalid = || CgroupError::InvalidValue {
        path: group.param_path(CPU_MAX),
        value: line.clone(),
    };

    let fields: Vec<&str> = line.split_whitespace().collect();
    let (quota, period) = match *fields.as_slice() {
        [quota] => (quota, None),
        [quota, period] => (quota, Some(period)),
        _ => return Err(invalid()),
    };
    if quota == UNLIMITED {
        return Ok(None);
    }

    let quota: i64 = quota.parse().map_err(|_| invalid())?;
    let period: i64 = match period {
        Some(period) => period.parse().map_err(|_| invalid())?,
        None => DEFAULT_CPU_PERIOD_US,
    };
    if quota <= 0 || period <= 0 {
        return Err(invalid());
    }

    Ok(Some(quota as f64 / period as f64))
}

fn memory_limit_v1(group: &CGroup) -> Result<Option<u64>, CgroupError> {
    let limit = group.read_int(MEMORY_LIMIT_IN_BYTES)?;
    let limit = u64::try_from(limit).map_err(|_| CgroupError::InvalidValue {
        path: group.param_path(MEMORY_LIMIT_IN_BYTES),
        value: limit.to_string(),
    })?;

    Ok((limit < v1_memory_unlimited(page_size()?)).then_some(limit))
}

/// `memory.limit_in_bytes` of an unlimited v1 group is `PAGE_COUNTER_MAX`
/// pages, which is `i64::MAX` rounded down to the page size.
fn v1_memory_unlimited(page_size: u64) -> u64 {
    let max = i64::MAX as u64;
    max - max % page_size
}

fn page_size() -> Result<u64, CgroupError> {
    match unistd::sysconf(SysconfVar::PAGE_SIZE)? {
        Some(size) if size > 0 => Ok(size as u64),
        _ => {
            debug!("page size unknown, assuming {DEFAULT_PAGE_SIZE}");
            Ok(DEFAULT_PAGE_SIZE)
        }
    }
}

fn memory_limit_v2(group: &CGroup) -> Result<Option<u64>, CgroupError> {
    let line = group.read_first_line(MEMORY_MAX)?;
    if line == UNLIMITED {
        return Ok(None);
    }

    line.parse()
        .map(Some)
        .map_err(|_| CgroupError::InvalidValue {
            path: group.param_path(MEMORY_MAX),
            value: line,
        })
}

/// Turns a CPU quota into a whole number of CPUs.
///
/// Without a quota, `host_procs` is returned. A quota that rounds to less
/// than `min_procs` is raised to it.
pub fn procs_from_quota(
    quota: Option<f64>,
    host_procs: usize,
    min_procs: usize,
    rounding: Rounding,
) -> (usize, CpuQuotaStatus) {
    let Some(quota) = quota else {
        return (host_procs, CpuQuotaStatus::Undefined);
    };

    let procs = match rounding {
        Rounding::Floor => quota.floor(),
        Rounding::Ceil => quota.ceil(),
    };
    let procs = procs as usize;

    if procs < min_procs {
        (min_procs, CpuQuotaStatus::MinUsed)
    } else {
        (procs, CpuQuotaStatus::Used)
    }
}

/// Picks the effective total memory, falling back to `host_total` without
/// a limit.
pub fn memory_from_limit(limit: Option<u64>, host_total: u64) -> (u64, MemoryStatus) {
    match limit {
        Some(limit) => (limit, MemoryStatus::Used),
        None => (host_total, MemoryStatus::Undefined),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs, path::Path};

    use tempfile::TempDir;

    use super::*;

    fn group_with(files: &[(&str, &str)]) -> (TempDir, CGroup) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let group = CGroup::new(dir.path());
        (dir, group)
    }

    fn v1(controller: &str, group: CGroup) -> CGroups {
        CGroups::V1(HashMap::from([(controller.to_string(), group)]))
    }

    #[test]
    fn cpu_quota_v1_limited() {
        let (_dir, group) = group_with(&[
            (CPU_CFS_QUOTA_US, "250000\n"),
            (CPU_CFS_PERIOD_US, "100000\n"),
        ]);
        assert_eq!(v1("cpu", group).cpu_quota().unwrap(), Some(2.5));
    }

    #[test]
    fn cpu_quota_v1_unlimited() {
        let (_dir, group) = group_with(&[(CPU_CFS_QUOTA_US, "-1\n")]);
        assert_eq!(v1("cpu", group).cpu_quota().unwrap(), None);
    }

    #[test]
    fn cpu_quota_v1_bad_period() {
        let (_dir, group) = group_with(&[
            (CPU_CFS_QUOTA_US, "50000\n"),
            (CPU_CFS_PERIOD_US, "0\n"),
        ]);
        assert!(matches!(
            v1("cpu", group).cpu_quota(),
            Err(CgroupError::InvalidValue { .. })
        ));
    }

    #[test]
    fn cpu_quota_without_controller() {
        let (_dir, group) = group_with(&[]);
        assert_eq!(v1("memory", group).cpu_quota().unwrap(), None);
    }

    #[test]
    fn v2_cpu_quota() {
        let cases = [
            ("max 100000\n", Some(None)),
            ("max\n", Some(None)),
            ("50000 100000\n", Some(Some(0.5))),
            ("300000\n", Some(Some(3.0))),
            ("1 2 3\n", None),
            ("abc 100000\n", None),
            ("50000 0\n", None),
        ];

        for (content, expected) in cases {
            let (_dir, group) = group_with(&[(CPU_MAX, content)]);
            let quota = CGroups::V2(group).cpu_quota().ok();
            assert_eq!(quota, expected, "{content:?}");
        }
    }

    #[test]
    fn v1_memory_limit() {
        let (_dir, group) = group_with(&[(MEMORY_LIMIT_IN_BYTES, "536870912\n")]);
        assert_eq!(v1("memory", group).memory_limit().unwrap(), Some(536870912));

        let (_dir, group) = group_with(&[(MEMORY_LIMIT_IN_BYTES, "9223372036854771712\n")]);
        assert_eq!(v1("memory", group).memory_limit().unwrap(), None);
    }

    #[test]
    fn v1_memory_unlimited_per_page_size() {
        assert_eq!(v1_memory_unlimited(4096), 9223372036854771712);
        assert_eq!(v1_memory_unlimited(65536), 9223372036854710272);

        // A 64 KiB page kernel reports this for an unlimited group.
        let unlimited = 9223372036854710272;
        assert!(unlimited >= v1_memory_unlimited(65536));
        assert!(unlimited < v1_memory_unlimited(4096));
        assert!(page_size().unwrap().is_power_of_two());
    }

    #[test]
    fn v2_memory_limit() {
        let (_dir, group) = group_with(&[(MEMORY_MAX, "max\n")]);
        assert_eq!(CGroups::V2(group).memory_limit().unwrap(), None);

        let (_dir, group) = group_with(&[(MEMORY_MAX, "1073741824\n")]);
        assert_eq!(CGroups::V2(group).memory_limit().unwrap(), Some(1 << 30));

        let (_dir, group) = group_with(&[(MEMORY_MAX, "lots\n")]);
        assert!(CGroups::V2(group).memory_limit().is_err());
    }

    #[test]
    fn quota_to_procs() {
        assert_eq!(
            procs_from_quota(None, 8, 1, Rounding::Floor),
            (8, CpuQuotaStatus::Undefined)
        );
        assert_eq!(
            procs_from_quota(Some(2.5), 8, 1, Rounding::Floor),
            (2, CpuQuotaStatus::Used)
        );
        assert_eq!(
            procs_from_quota(Some(2.5), 8, 1, Rounding::Ceil),
            (3, CpuQuotaStatus::Used)
        );
        assert_eq!(
            procs_from_quota(Some(0.5), 8, 1, Rounding::Floor),
            (1, CpuQuotaStatus::MinUsed)
        );
        assert_eq!(
            procs_from_quota(Some(0.5), 8, 1, Rounding::Ceil),
            (1, CpuQuotaStatus::Used)
        );
    }

    #[test]
    fn limit_to_memory() {
        assert_eq!(memory_from_limit(None, 1 << 34), (1 << 34, MemoryStatus::Undefined));
        assert_eq!(memory_from_limit(Some(1 << 29), 1 << 34), (1 << 29, MemoryStatus::Used));
    }

    #[test]
    fn v2_group_serves_all_controllers() {
        let (dir, group) = group_with(&[(CPU_MAX, "max 100000\n"), (MEMORY_MAX, "max\n")]);
        let cgroups = CGroups::V2(group);
        assert_eq!(cgroups.controller("cpu").unwrap().path(), Path::new(dir.path()));
        assert_eq!(cgroups.memory_limit().unwrap(), None);
    }
}
