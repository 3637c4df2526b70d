//! Filesystem and string helpers shared across the engine.

use std::fs;
use std::path::{Component, Path, PathBuf};

use nix::sched::CpuSet;
use nix::unistd::{chown, Gid, Pid, Uid};
use rand::Rng;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("failed to create directory {path:?}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create file {path:?}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to copy {from:?} to {to:?}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to change ownership of {path:?}")]
    Chown { path: PathBuf, source: nix::Error },
    #[error("failed to read metadata of {path:?}")]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rename {from:?} to {to:?}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, FsError>;

/// Creates the directory and all missing parents, then hands ownership of the
/// leaf to the given user. Existing directories are left untouched.
pub fn create_dir_all_owned(path: impl AsRef<Path>, uid: Uid, gid: Gid) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path).map_err(|err| FsError::CreateDir {
            path: path.to_path_buf(),
            source: err,
        })?;
        chown(path, Some(uid), Some(gid)).map_err(|err| FsError::Chown {
            path: path.to_path_buf(),
            source: err,
        })?;
    }
    Ok(())
}

/// Creates an empty file (and its parent directories) if it does not exist.
/// Used as a bind-mount target for regular files.
pub fn create_file_if_missing(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| FsError::CreateDir {
            path: parent.to_path_buf(),
            source: err,
        })?;
    }
    fs::File::create(path).map_err(|err| FsError::CreateFile {
        path: path.to_path_buf(),
        source: err,
    })?;
    Ok(())
}

/// Copies a file into the container rootfs, creating parents and assigning
/// ownership to the invoking user.
pub fn copy_file_owned(
    from: impl AsRef<Path>,
    to: impl AsRef<Path>,
    uid: Uid,
    gid: Gid,
) -> Result<()> {
    let (from, to) = (from.as_ref(), to.as_ref());
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| FsError::CreateDir {
            path: parent.to_path_buf(),
            source: err,
        })?;
    }
    fs::copy(from, to).map_err(|err| FsError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source: err,
    })?;
    chown(to, Some(uid), Some(gid)).map_err(|err| FsError::Chown {
        path: to.to_path_buf(),
        source: err,
    })?;
    Ok(())
}

/// Moves a file, falling back to copy-and-unlink when source and destination
/// live on different filesystems.
pub fn move_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let (from, to) = (from.as_ref(), to.as_ref());
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(from, to).map_err(|err| FsError::Copy {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source: err,
            })?;
            fs::remove_file(from).map_err(|err| FsError::Rename {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source: err,
            })?;
            Ok(())
        }
        Err(err) => Err(FsError::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: err,
        }),
    }
}

pub fn file_size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let metadata = path.metadata().map_err(|err| FsError::Metadata {
        path: path.to_path_buf(),
        source: err,
    })?;
    Ok(metadata.len())
}

/// Random lowercase-hex string, e.g. for container ids and scratch dirs.
pub fn random_hex_string(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Renders a byte count the way `images` displays it, e.g. "245.81MB".
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[unit])
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}

/// Splits "KEY=VALUE" at the first '='. Returns None when '=' is absent.
pub fn split_env_var(var: &str) -> Option<(String, String)> {
    var.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
}

/// Lexically removes `.` and `..` components. The result of joining a
/// normalized absolute path onto a rootfs can never escape the rootfs.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::Prefix(..) => unreachable!(),
        }
    }
    out
}

/// The CPU affinity of the calling process as an OCI cpuset string ("0-3,7").
pub fn cpu_affinity_string() -> Option<String> {
    let set = nix::sched::sched_getaffinity(Pid::from_raw(0)).ok()?;
    let cpus: Vec<usize> = (0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .collect();
    if cpus.is_empty() {
        return None;
    }
    Some(format_cpu_list(&cpus))
}

fn format_cpu_list(cpus: &[usize]) -> String {
    let mut ranges: Vec<String> = Vec::new();
    let mut start = cpus[0];
    let mut end = cpus[0];
    for &cpu in &cpus[1..] {
        if cpu == end + 1 {
            end = cpu;
        } else {
            ranges.push(render_range(start, end));
            start = cpu;
            end = cpu;
        }
    }
    ranges.push(render_range(start, end));
    ranges.join(",")
}

fn render_range(start: usize, end: usize) -> String {
    if start == end {
        format!("{start}")
    } else {
        format!("{start}-{end}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(1023), "1023B");
        assert_eq!(format_size(1024), "1.00KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00MB");
        assert_eq!(format_size(1536), "1.50KB");
    }

    #[test]
    fn test_split_env_var() {
        assert_eq!(
            split_env_var("KEY=value"),
            Some(("KEY".to_string(), "value".to_string()))
        );
        assert_eq!(
            split_env_var("KEY=a=b"),
            Some(("KEY".to_string(), "a=b".to_string()))
        );
        assert_eq!(split_env_var("novalue"), None);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(
            normalize_path(Path::new("/../../etc")),
            PathBuf::from("/etc")
        );
    }

    #[test]
    fn test_format_cpu_list() {
        assert_eq!(format_cpu_list(&[0]), "0");
        assert_eq!(format_cpu_list(&[0, 1, 2, 3]), "0-3");
        assert_eq!(format_cpu_list(&[0, 1, 2, 7]), "0-2,7");
        assert_eq!(format_cpu_list(&[1, 3, 5]), "1,3,5");
    }

    #[test]
    fn test_random_hex_string() {
        let s = random_hex_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_move_file_same_filesystem() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let from = tmp.path().join("a");
        let to = tmp.path().join("b");
        fs::write(&from, b"payload")?;
        move_file(&from, &to)?;
        assert!(!from.exists());
        assert_eq!(fs::read(&to)?, b"payload");
        Ok(())
    }
}
