use std::path::PathBuf;

use anyhow::{Context, Result};
use cgquota::{
    cgroup::PROC_CGROUP_PATH,
    mount::PROC_MOUNTINFO_PATH,
    quota::{self, Rounding},
    CGroups,
};
use clap::Parser;
use log::debug;
use nix::{
    sys::sysinfo,
    unistd::{self, SysconfVar},
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The mount table to read
    #[arg(long, default_value = PROC_MOUNTINFO_PATH)]
    mountinfo: PathBuf,

    /// The cgroup membership file to read
    #[arg(long, default_value = PROC_CGROUP_PATH)]
    cgroup: PathBuf,

    /// The lowest CPU count to report when a quota is set
    #[arg(long, default_value_t = 1)]
    min_procs: usize,

    /// How to turn a fractional CPU quota into a CPU count
    #[arg(long, value_enum, default_value_t = Rounding::Floor)]
    rounding: Rounding,
}

/// The number of online CPUs of the host, ignoring any quota
fn host_procs() -> Result<usize> {
    let procs = unistd::sysconf(SysconfVar::_NPROCESSORS_ONLN)?
        .context("the number of online CPUs is unknown")?;
    Ok(usize::try_from(procs)?)
}

/// The total RAM of the host
fn host_memory() -> Result<u64> {
    Ok(sysinfo::sysinfo()?.ram_total())
}

fn main() -> Result<()> {
    // Initialize the application.
    env_logger::init();
    let args = Args::parse();

    let cgroups = CGroups::from_paths(&args.mountinfo, &args.cgroup).with_context(|| {
        format!(
            "failed to discover cgroups from {:?} and {:?}",
            args.mountinfo, args.cgroup
        )
    })?;
    debug!("discovered {cgroups:?}");

    match &cgroups {
        CGroups::V1(groups) => {
            println!("cgroup: v1");
            let mut controllers: Vec<_> = groups.iter().collect();
            controllers.sort_unstable_by_key(|(name, _)| *name);
            for (name, group) in controllers {
                println!("  {name}: {}", group.path().display());
            }
        }
        CGroups::V2(group) => {
            println!("cgroup: v2");
            println!("  unified: {}", group.path().display());
        }
    }

    let cpu_quota = cgroups.cpu_quota().context("failed to read the CPU quota")?;
    let (procs, status) =
        quota::procs_from_quota(cpu_quota, host_procs()?, args.min_procs, args.rounding);
    println!("cpus: {procs} ({status})");

    let memory_limit = cgroups
        .memory_limit()
        .context("failed to read the memory limit")?;
    let (memory, status) = quota::memory_from_limit(memory_limit, host_memory()?);
    println!("memory: {memory} bytes ({status})");

    Ok(())
}
