//! Parses `/proc/self/mountinfo` and maps paths through a mount
//!
//! See `proc_pid_mountinfo(5)` for the line format:
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```

use std::{io::BufRead, num::ParseIntError, path::PathBuf, str::FromStr};

use log::debug;
use thiserror::Error;

pub const PROC_MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Separates the optional fields from the filesystem specific part
const SEPARATOR: &str = "-";

/// Mount ID, parent ID, device ID, root, mount point and options
const PRE_FIELDS: usize = 6;

/// Filesystem type, mount source and super options
const POST_FIELDS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid {field} {value:?}: {source}")]
    InvalidId {
        field: &'static str,
        value: String,
        source: ParseIntError,
    },
    #[error("invalid mountinfo line: {line:?}")]
    InvalidFormat { line: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TranslateError {
    #[error("path {path:?} is not absolute")]
    NotAbsolute { path: String },
    #[error("path {path:?} is not exposed by mount {mount_point:?} of {root:?}")]
    NotExposed {
        mount_point: String,
        root: String,
        path: String,
    },
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("failed to read mount table: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse mount table: {0}")]
    Parse(#[from] ParseError),
}

/// A single entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub mount_id: i32,
    pub parent_id: i32,
    pub device_id: String,
    /// The directory of the filesystem that forms the root of this mount.
    pub root: String,
    /// Where `root` is attached, relative to our own root directory.
    pub mount_point: String,
    pub options: Vec<String>,
    /// Zero or more `tag[:value]` fields, e.g. `shared:1`.
    pub optional_fields: Vec<String>,
    pub fs_type: String,
    pub mount_source: String,
    pub super_options: Vec<String>,
}

impl MountPoint {
    /// Parses one line of the mount table.
    ///
    /// The super options are taken as the whole remainder of the line, as
    /// some filesystems (e.g. `9p` on WSL) put unescaped spaces in there.
    pub fn from_line(line: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidFormat {
            line: line.to_string(),
        };

        let sep = line
            .split(' ')
            .skip(PRE_FIELDS)
            .position(|field| field == SEPARATOR)
            .map(|i| i + PRE_FIELDS)
            .ok_or_else(invalid)?;

        // Split again, this time keeping everything after the mount source
        // together.
        let fields: Vec<&str> = line.splitn(sep + 1 + POST_FIELDS, ' ').collect();
        if fields.len() != sep + 1 + POST_FIELDS {
            return Err(invalid());
        }

        let (pre, post) = (&fields[..sep], &fields[sep + 1..]);
        let (fs_type, mount_source, super_options) = (post[0], post[1], post[2]);
        // Fields are separated by exactly one space.
        if pre.iter().any(|field| field.is_empty())
            || [fs_type, mount_source]
                .iter()
                .any(|field| field.is_empty() || *field == SEPARATOR)
            || super_options.is_empty()
        {
            return Err(invalid());
        }

        let root = unescape(pre[3]);
        let mount_point = unescape(pre[4]);
        if !root.starts_with('/') || !mount_point.starts_with('/') {
            return Err(invalid());
        }

        Ok(Self {
            mount_id: parse_id("mount ID", pre[0])?,
            parent_id: parse_id("parent ID", pre[1])?,
            device_id: pre[2].to_string(),
            root,
            mount_point,
            options: split_options(pre[5]),
            optional_fields: pre[PRE_FIELDS..].iter().map(|f| f.to_string()).collect(),
            fs_type: fs_type.to_string(),
            mount_source: unescape(mount_source),
            super_options: split_options(super_options),
        })
    }

    /// Maps `path`, given relative to the root of this mount's filesystem, to
    /// the path under which it is visible to us.
    ///
    /// `path` must name `root` itself or something below it.
    /// The check works on path components, so `/docker/abc-x` is not
    /// considered to be below `/docker/abc`.
    pub fn translate(&self, path: &str) -> Result<PathBuf, TranslateError> {
        if !path.starts_with('/') {
            return Err(TranslateError::NotAbsolute {
                path: path.to_string(),
            });
        }

        let root = clean(&self.root);
        let rel = clean(path)
            .strip_prefix(root.as_slice())
            .map(|rel| rel.to_vec())
            .ok_or_else(|| TranslateError::NotExposed {
                mount_point: self.mount_point.clone(),
                root: self.root.clone(),
                path: path.to_string(),
            })?;

        let mut translated = PathBuf::from("/");
        translated.extend(clean(&self.mount_point));
        translated.extend(rel);
        debug!("translated {path:?} to {translated:?} via {:?}", self.mount_point);

        Ok(translated)
    }
}

impl FromStr for MountPoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_line(s)
    }
}

/// Parses a whole mount table, failing on the first malformed line.
///
/// Mount paths are arbitrary bytes, so lines are decoded lossily instead of
/// rejecting the whole table over one path that is not UTF-8.
pub fn parse_mountinfo<R: BufRead>(mut reader: R) -> Result<Vec<MountPoint>, ReadError> {
    let mut mounts = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }
        mounts.push(MountPoint::from_line(line)?);
    }
    debug!("parsed {} mount table entries", mounts.len());

    Ok(mounts)
}

fn parse_id(field: &'static str, value: &str) -> Result<i32, ParseError> {
    value.parse().map_err(|source| ParseError::InvalidId {
        field,
        value: value.to_string(),
        source,
    })
}

fn split_options(field: &str) -> Vec<String> {
    field.split(',').map(ToOwned::to_owned).collect()
}

/// Lexically resolves `path` into its components.
///
/// Empty and `.` components vanish and `..` removes its predecessor; a `..`
/// at the top stays at the top, as in `/..` == `/`.
fn clean(path: &str) -> Vec<&str> {
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
    components
}

/// Decodes the octal escapes the kernel uses for space, tab, newline and
/// backslash.
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes
            .get(i + 1..i + 4)
            .filter(|digits| bytes[i] == b'\\' && digits.iter().all(|d| (b'0'..=b'7').contains(d)))
            .and_then(|digits| {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                u8::try_from(value).ok()
            });
        match escaped {
            Some(b) => {
                out.push(b);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
