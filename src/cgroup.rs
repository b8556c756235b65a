//! Locates the cgroup directories of a process
//!
//! `/proc/self/cgroup` names the group of every hierarchy relative to the
//! root of that hierarchy, while `/proc/self/mountinfo` tells us where (and
//! which part of) each hierarchy is mounted. Combining the two yields the
//! directories we can actually open from inside a container.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use log::debug;
use thiserror::Error;

use crate::mount::{self, MountPoint, ReadError, TranslateError, PROC_MOUNTINFO_PATH};

pub const PROC_CGROUP_PATH: &str = "/proc/self/cgroup";

/// Filesystem type of a cgroup v1 hierarchy
const CGROUP_FS_TYPE: &str = "cgroup";

/// Filesystem type of the unified cgroup v2 hierarchy
const CGROUP2_FS_TYPE: &str = "cgroup2";

#[derive(Error, Debug)]
pub enum CgroupError {
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Mountinfo(#[from] ReadError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error("invalid cgroup line: {line:?}")]
    InvalidSubsystem { line: String },
    #[error("invalid value {value:?} in {path:?}")]
    InvalidValue { path: PathBuf, value: String },
    #[error("no cgroup hierarchy is mounted for this process")]
    NotFound,
    #[error("system call failed: {0}")]
    Internal(#[from] nix::errno::Errno),
}

/// One line of `/proc/self/cgroup`, i.e. `hierarchy-ID:controller-list:cgroup-path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subsystem {
    pub id: u32,
    /// Empty for the cgroup v2 entry.
    pub controllers: Vec<String>,
    /// The cgroup path relative to the root of the hierarchy.
    pub name: String,
}

impl Subsystem {
    pub fn from_line(line: &str) -> Result<Self, CgroupError> {
        let invalid = || CgroupError::InvalidSubsystem {
            line: line.to_string(),
        };

        // The path itself may contain colons.
        let fields: Vec<&str> = line.splitn(3, ':').collect();
        let [id, controllers, name] = fields.as_slice() else {
            return Err(invalid());
        };

        let controllers = if controllers.is_empty() {
            Vec::new()
        } else {
            controllers.split(',').map(ToOwned::to_owned).collect()
        };

        Ok(Self {
            id: id.parse().map_err(|_| invalid())?,
            controllers,
            name: name.to_string(),
        })
    }

    /// Whether this is the entry of the unified hierarchy.
    pub fn is_unified(&self) -> bool {
        self.id == 0 && self.controllers.is_empty()
    }
}

/// Parses a whole `/proc/<pid>/cgroup` file.
pub fn parse_subsystems<R: BufRead>(reader: R) -> Result<Vec<Subsystem>, CgroupError> {
    let mut subsystems = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        subsystems.push(Subsystem::from_line(&line)?);
    }

    Ok(subsystems)
}

/// A cgroup directory that is reachable from our mount namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CGroup {
    path: PathBuf,
}

impl CGroup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path of the control file `param` within this group.
    pub fn param_path(&self, param: &str) -> PathBuf {
        self.path.join(param)
    }

    /// Returns the first line of `param`, without surrounding whitespace.
    pub fn read_first_line(&self, param: &str) -> Result<String, CgroupError> {
        let path = self.param_path(param);
        let content = fs::read_to_string(&path)?;

        let line = content.lines().next().unwrap_or_default().trim().to_string();
        if line.is_empty() {
            return Err(CgroupError::InvalidValue {
                path,
                value: content,
            });
        }

        Ok(line)
    }

    /// Reads `param` as a single integer.
    pub fn read_int(&self, param: &str) -> Result<i64, CgroupError> {
        let line = self.read_first_line(param)?;
        line.parse().map_err(|_| CgroupError::InvalidValue {
            path: self.param_path(param),
            value: line,
        })
    }
}

/// The cgroup directories of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CGroups {
    /// One directory per v1 controller, keyed by controller name.
    V1(HashMap<String, CGroup>),
    /// The single directory in the unified hierarchy.
    V2(CGroup),
}

impl CGroups {
    /// Discovers the cgroups of the calling process.
    pub fn for_current_process() -> Result<Self, CgroupError> {
        Self::from_paths(
            Path::new(PROC_MOUNTINFO_PATH),
            Path::new(PROC_CGROUP_PATH),
        )
    }

    pub fn from_paths(mountinfo: &Path, proc_cgroup: &Path) -> Result<Self, CgroupError> {
        debug!("reading {mountinfo:?} and {proc_cgroup:?}");
        Self::from_readers(
            BufReader::new(File::open(mountinfo)?),
            BufReader::new(File::open(proc_cgroup)?),
        )
    }

    pub fn from_readers<M: BufRead, C: BufRead>(
        mountinfo: M,
        proc_cgroup: C,
    ) -> Result<Self, CgroupError> {
        let mounts = mount::parse_mountinfo(mountinfo)?;
        let subsystems = parse_subsystems(proc_cgroup)?;
        Self::from_tables(&mounts, &subsystems)
    }

    /// Matches the membership entries against the mount table.
    ///
    /// If the process is only a member of the unified hierarchy, the result is
    /// [`CGroups::V2`]. Otherwise every v1 controller whose group is exposed by
    /// one of the `cgroup` mounts is returned.
    pub fn from_tables(
        mounts: &[MountPoint],
        subsystems: &[Subsystem],
    ) -> Result<Self, CgroupError> {
        if subsystems.iter().all(Subsystem::is_unified) {
            return Self::unified(mounts, subsystems);
        }

        let by_controller: HashMap<&str, &Subsystem> = subsystems
            .iter()
            .flat_map(|subsys| subsys.controllers.iter().map(move |c| (c.as_str(), subsys)))
            .collect();

        let mut groups = HashMap::new();
        for mount in mounts.iter().filter(|m| m.fs_type == CGROUP_FS_TYPE) {
            for opt in &mount.super_options {
                let Some(subsys) = by_controller.get(opt.as_str()) else {
                    continue;
                };

                match mount.translate(&subsys.name) {
                    Ok(path) => {
                        debug!("found controller {opt} at {path:?}");
                        groups.insert(opt.clone(), CGroup::new(path));
                    }
                    // Another mount of the same hierarchy may still expose it.
                    Err(e) => debug!("skipping {opt} on {:?}: {e}", mount.mount_point),
                }
            }
        }

        if groups.is_empty() {
            return Err(CgroupError::NotFound);
        }

        Ok(Self::V1(groups))
    }

    fn unified(mounts: &[MountPoint], subsystems: &[Subsystem]) -> Result<Self, CgroupError> {
        let subsys = subsystems.first().ok_or(CgroupError::NotFound)?;
        let mount = mounts
            .iter()
            .find(|m| m.fs_type == CGROUP2_FS_TYPE)
            .ok_or(CgroupError::NotFound)?;

        let path = mount.translate(&subsys.name)?;
        debug!("found unified hierarchy at {path:?}");

        Ok(Self::V2(CGroup::new(path)))
    }

    /// Returns the group that holds the control files of `controller`.
    pub fn controller(&self, controller: &str) -> Option<&CGroup> {
        match self {
            Self::V1(groups) => groups.get(controller),
            Self::V2(group) => Some(group),
        }
    }
}
