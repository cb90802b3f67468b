use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    os::unix::fs::PermissionsExt,
    time::SystemTime,
};

use nix::unistd::{access, AccessFlags};
use pbx_metrics::scoped_metric;
use tracing::debug;

/// Paths are opaque strings. Queries answer with `bool`, operations report failure through
/// `io::Result` and never panic.
pub trait Filesystem: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    fn is_directory(&self, path: &str) -> bool;
    fn is_symbolic_link(&self, path: &str) -> bool;
    fn is_readable(&self, path: &str) -> bool;
    fn is_writable(&self, path: &str) -> bool;
    fn is_executable(&self, path: &str) -> bool;

    /// Creates an empty file unless one is already there.
    fn create_file(&self, path: &str) -> io::Result<()>;

    /// Creates `path` and all its ancestors. Succeeds if the directory already exists.
    fn create_directory(&self, path: &str) -> io::Result<()>;

    /// Reads `length` bytes starting at `offset`, or everything after `offset` if no length is
    /// given. Asking for more bytes than the file holds is an error.
    fn read(&self, path: &str, offset: u64, length: Option<u64>) -> io::Result<Vec<u8>>;

    fn read_all(&self, path: &str) -> io::Result<Vec<u8>> {
        self.read(path, 0, None)
    }

    fn write(&self, contents: &[u8], path: &str) -> io::Result<()>;
    fn set_executable(&self, path: &str, executable: bool) -> io::Result<()>;

    fn read_symbolic_link(&self, path: &str) -> io::Result<String>;
    fn write_symbolic_link(&self, target: &str, path: &str) -> io::Result<()>;

    fn remove_file(&self, path: &str) -> io::Result<()>;
    fn resolve_path(&self, path: &str) -> io::Result<String>;

    /// Calls `visit` with the name of every entry in the directory, excluding `.` and `..`.
    fn enumerate_directory(&self, path: &str, visit: &mut dyn FnMut(&str)) -> io::Result<()>;

    fn modified(&self, path: &str) -> io::Result<SystemTime>;
}

/// How often a failed removal is attempted before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `op` until it succeeds, fails with `NotFound`, or attempts run out.
    pub fn run<T, F>(&self, mut op: F) -> io::Result<T>
    where
        F: FnMut() -> io::Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == io::ErrorKind::NotFound || attempt >= self.max_attempts => {
                    return Err(e)
                }
                Err(e) => {
                    debug!(attempt, error = %e, "retrying");
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(2)
    }
}

pub(crate) fn invalid_path(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{} is not valid UTF-8", path),
    )
}

#[derive(Debug, Default, Clone)]
pub struct DefaultFilesystem {
    removal: RetryPolicy,
}

impl DefaultFilesystem {
    pub fn new() -> Self {
        DefaultFilesystem::default()
    }

    pub fn with_removal_policy(removal: RetryPolicy) -> Self {
        DefaultFilesystem { removal }
    }
}

impl Filesystem for DefaultFilesystem {
    fn exists(&self, path: &str) -> bool {
        access(path, AccessFlags::F_OK).is_ok()
    }

    fn is_directory(&self, path: &str) -> bool {
        fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
    }

    fn is_symbolic_link(&self, path: &str) -> bool {
        fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn is_readable(&self, path: &str) -> bool {
        access(path, AccessFlags::R_OK).is_ok()
    }

    fn is_writable(&self, path: &str) -> bool {
        access(path, AccessFlags::W_OK).is_ok()
    }

    fn is_executable(&self, path: &str) -> bool {
        access(path, AccessFlags::X_OK).is_ok()
    }

    fn create_file(&self, path: &str) -> io::Result<()> {
        if self.is_writable(path) {
            return Ok(());
        }
        File::create(path).map(|_| ())
    }

    fn create_directory(&self, path: &str) -> io::Result<()> {
        for ancestor in pbx_paths::ancestors(path) {
            match fs::create_dir(&ancestor) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && self.is_directory(&ancestor) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read(&self, path: &str, offset: u64, length: Option<u64>) -> io::Result<Vec<u8>> {
        scoped_metric!("read");
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let length = match length {
            Some(length) if offset.saturating_add(length) > size => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} is {} bytes, wanted {} at {}", path, size, length, offset),
                ))
            }
            Some(length) => length,
            None => size.saturating_sub(offset),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut contents = vec![0; length as usize];
        file.read_exact(&mut contents)?;
        Ok(contents)
    }

    fn write(&self, contents: &[u8], path: &str) -> io::Result<()> {
        scoped_metric!("write");
        fs::write(path, contents)
    }

    fn set_executable(&self, path: &str, executable: bool) -> io::Result<()> {
        let mut permissions = fs::metadata(path)?.permissions();
        let mode = permissions.mode();
        permissions.set_mode(if executable {
            mode | 0o111
        } else {
            mode & !0o111
        });
        fs::set_permissions(path, permissions)
    }

    fn read_symbolic_link(&self, path: &str) -> io::Result<String> {
        fs::read_link(path)?
            .into_os_string()
            .into_string()
            .map_err(|_| invalid_path(path))
    }

    fn write_symbolic_link(&self, target: &str, path: &str) -> io::Result<()> {
        std::os::unix::fs::symlink(target, path)
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        self.removal.run(|| fs::remove_file(path))
    }

    fn resolve_path(&self, path: &str) -> io::Result<String> {
        fs::canonicalize(path)?
            .into_os_string()
            .into_string()
            .map_err(|_| invalid_path(path))
    }

    fn enumerate_directory(&self, path: &str, visit: &mut dyn FnMut(&str)) -> io::Result<()> {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            visit(&entry.file_name().to_string_lossy());
        }
        Ok(())
    }

    fn modified(&self, path: &str) -> io::Result<SystemTime> {
        scoped_metric!("stat");
        fs::metadata(path)?.modified()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    fn path_in(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().expect("utf-8").to_owned()
    }

    #[test]
    fn test_create_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultFilesystem::new();
        let nested = path_in(&dir, "a/b/c");
        fs.create_directory(&nested).expect("created");
        fs.create_directory(&nested).expect("already there is fine");
        assert!(fs.is_directory(&nested));
    }

    #[test]
    fn test_create_directory_over_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultFilesystem::new();
        let file = path_in(&dir, "f");
        fs.write(b"x", &file).unwrap();
        assert!(fs.create_directory(&format!("{}/sub", file)).is_err());
    }

    #[test]
    fn test_read_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultFilesystem::new();
        let file = path_in(&dir, "data");
        fs.write(b"0123456789", &file).unwrap();
        assert_eq!(fs.read_all(&file).unwrap(), b"0123456789");
        assert_eq!(fs.read(&file, 3, Some(4)).unwrap(), b"3456");
        assert_eq!(fs.read(&file, 8, None).unwrap(), b"89");
        assert!(fs.read(&file, 8, Some(5)).is_err());
        assert!(fs.read(&path_in(&dir, "missing"), 0, None).is_err());
    }

    #[test]
    fn test_executable_bit() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultFilesystem::new();
        let script = path_in(&dir, "script.sh");
        fs.write(b"#!/bin/sh\n", &script).unwrap();
        fs.set_executable(&script, true).unwrap();
        assert!(fs.is_executable(&script));
        fs.set_executable(&script, false).unwrap();
        assert!(!fs.is_executable(&script));
    }

    #[test]
    fn test_symbolic_links_and_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultFilesystem::new();
        let target = path_in(&dir, "target");
        let link = path_in(&dir, "link");
        fs.create_file(&target).unwrap();
        fs.write_symbolic_link(&target, &link).unwrap();
        assert!(fs.is_symbolic_link(&link));
        assert_eq!(fs.read_symbolic_link(&link).unwrap(), target);

        let mut names = Vec::new();
        fs.enumerate_directory(dir.path().to_str().unwrap(), &mut |name| {
            names.push(name.to_owned())
        })
        .unwrap();
        names.sort();
        assert_eq!(names, vec!["link", "target"]);
    }

    #[test]
    fn test_remove_missing_file_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultFilesystem::new();
        let err = fs.remove_file(&path_in(&dir, "nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_retry_policy_is_bounded() {
        let attempts = Cell::new(0);
        let result: io::Result<()> = RetryPolicy::new(3).run(|| {
            attempts.set(attempts.get() + 1);
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "busy"))
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);

        attempts.set(0);
        let result = RetryPolicy::new(0).run(|| {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 2 {
                Err(io::Error::new(io::ErrorKind::Other, "flaky"))
            } else {
                Ok(attempts.get())
            }
        });
        // Zero is clamped to a single attempt.
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }
}
