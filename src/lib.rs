//! Finds the cgroup limits that actually apply to the calling process.
//!
//! Inside a container, `/sys/fs/cgroup` usually only exposes the container's
//! own subtree of each hierarchy, while `/proc/self/cgroup` still names the
//! group relative to the hierarchy's real root. [`mount::MountPoint::translate`]
//! bridges the two using the mount's root from `/proc/self/mountinfo`.

pub mod cgroup;
pub mod mount;
pub mod quota;

pub use cgroup::{CGroup, CGroups, CgroupError, Subsystem};
pub use mount::{MountPoint, ParseError, TranslateError};
pub use quota::{CpuQuotaStatus, MemoryStatus, Rounding};
