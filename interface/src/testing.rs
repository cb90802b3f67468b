//! Deterministic stand-ins for the capabilities. Timestamps come from a logical clock that ticks
//! once per mutation, so "newer" is always strictly ordered.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{CancellationToken, Context, Filesystem, LaunchError, LaunchOutput, LaunchRequest, Launcher};

#[derive(Debug, Clone)]
enum Entry {
    File {
        contents: Vec<u8>,
        executable: bool,
        modified: SystemTime,
    },
    Directory {
        modified: SystemTime,
    },
    Symlink {
        target: String,
    },
}

#[derive(Debug, Default)]
pub struct MemoryFilesystem {
    entries: Mutex<BTreeMap<String, Entry>>,
    clock: AtomicU64,
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{}: not found", path))
}

fn is_root(path: &str) -> bool {
    path == "/" || path.is_empty()
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        MemoryFilesystem::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        // Tests that panic while holding the lock fail anyway.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn tick(&self) -> SystemTime {
        let now = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        UNIX_EPOCH + Duration::from_secs(now)
    }

    /// The time the next mutation will be stamped with, minus one: "now".
    pub fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.clock.load(Ordering::SeqCst))
    }

    /// Creates a file and any missing parent directories.
    pub fn add_file<D: Into<Vec<u8>>>(&self, path: &str, contents: D) {
        if let Some(parent) = pbx_paths::parent(path) {
            let _ = self.create_directory(parent);
        }
        let modified = self.tick();
        self.entries().insert(
            path.to_owned(),
            Entry::File {
                contents: contents.into(),
                executable: false,
                modified,
            },
        );
    }

    /// Bumps the modification time of an existing entry.
    pub fn touch(&self, path: &str) -> io::Result<()> {
        let now = self.tick();
        match self.entries().get_mut(path) {
            Some(Entry::File { modified, .. }) | Some(Entry::Directory { modified }) => {
                *modified = now;
                Ok(())
            }
            _ => Err(not_found(path)),
        }
    }

    /// Pins the modification time of an existing entry.
    pub fn set_modified(&self, path: &str, time: SystemTime) -> io::Result<()> {
        match self.entries().get_mut(path) {
            Some(Entry::File { modified, .. }) | Some(Entry::Directory { modified }) => {
                *modified = time;
                Ok(())
            }
            _ => Err(not_found(path)),
        }
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.entries().get(path) {
            Some(Entry::File { contents, .. }) => Some(contents.clone()),
            _ => None,
        }
    }

    /// Follows symlinks up to a fixed depth.
    fn lookup(&self, path: &str) -> Option<Entry> {
        let entries = self.entries();
        let mut current = path.to_owned();
        for _ in 0..8 {
            match entries.get(&current) {
                Some(Entry::Symlink { target }) => current = target.clone(),
                Some(entry) => return Some(entry.clone()),
                None if is_root(&current) => {
                    return Some(Entry::Directory {
                        modified: UNIX_EPOCH,
                    })
                }
                None => return None,
            }
        }
        None
    }

    fn parent_is_directory(&self, path: &str) -> bool {
        match pbx_paths::parent(path) {
            Some(parent) => self.is_directory(parent),
            None => true,
        }
    }
}

impl Filesystem for MemoryFilesystem {
    fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    fn is_directory(&self, path: &str) -> bool {
        matches!(self.lookup(path), Some(Entry::Directory { .. }))
    }

    fn is_symbolic_link(&self, path: &str) -> bool {
        matches!(self.entries().get(path), Some(Entry::Symlink { .. }))
    }

    fn is_readable(&self, path: &str) -> bool {
        self.exists(path)
    }

    fn is_writable(&self, path: &str) -> bool {
        self.exists(path)
    }

    fn is_executable(&self, path: &str) -> bool {
        match self.lookup(path) {
            Some(Entry::File { executable, .. }) => executable,
            Some(Entry::Directory { .. }) => true,
            _ => false,
        }
    }

    fn create_file(&self, path: &str) -> io::Result<()> {
        if self.exists(path) {
            return Ok(());
        }
        self.write(&[], path)
    }

    fn create_directory(&self, path: &str) -> io::Result<()> {
        for ancestor in pbx_paths::ancestors(path) {
            match self.lookup(&ancestor) {
                Some(Entry::Directory { .. }) => {}
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a directory", ancestor),
                    ))
                }
                None => {
                    let modified = self.tick();
                    self.entries()
                        .insert(ancestor, Entry::Directory { modified });
                }
            }
        }
        Ok(())
    }

    fn read(&self, path: &str, offset: u64, length: Option<u64>) -> io::Result<Vec<u8>> {
        let contents = match self.lookup(path) {
            Some(Entry::File { contents, .. }) => contents,
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a file", path),
                ))
            }
            None => return Err(not_found(path)),
        };
        let size = contents.len() as u64;
        let end = match length {
            Some(length) if offset + length > size => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, path.to_owned()))
            }
            Some(length) => offset + length,
            None => size,
        };
        let start = offset.min(size);
        Ok(contents[start as usize..end.max(start) as usize].to_vec())
    }

    fn write(&self, contents: &[u8], path: &str) -> io::Result<()> {
        if !self.parent_is_directory(path) {
            return Err(not_found(path));
        }
        if self.is_directory(path) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path),
            ));
        }
        let modified = self.tick();
        let mut entries = self.entries();
        let executable = match entries.get(path) {
            Some(Entry::File { executable, .. }) => *executable,
            _ => false,
        };
        entries.insert(
            path.to_owned(),
            Entry::File {
                contents: contents.to_vec(),
                executable,
                modified,
            },
        );
        Ok(())
    }

    fn set_executable(&self, path: &str, is_executable: bool) -> io::Result<()> {
        match self.entries().get_mut(path) {
            Some(Entry::File { executable, .. }) => {
                *executable = is_executable;
                Ok(())
            }
            _ => Err(not_found(path)),
        }
    }

    fn read_symbolic_link(&self, path: &str) -> io::Result<String> {
        match self.entries().get(path) {
            Some(Entry::Symlink { target }) => Ok(target.clone()),
            _ => Err(not_found(path)),
        }
    }

    fn write_symbolic_link(&self, target: &str, path: &str) -> io::Result<()> {
        if self.entries().contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, path.to_owned()));
        }
        self.entries().insert(
            path.to_owned(),
            Entry::Symlink {
                target: target.to_owned(),
            },
        );
        Ok(())
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        let mut entries = self.entries();
        match entries.get(path) {
            Some(Entry::File { .. }) | Some(Entry::Symlink { .. }) => {
                entries.remove(path);
                Ok(())
            }
            _ => Err(not_found(path)),
        }
    }

    fn resolve_path(&self, path: &str) -> io::Result<String> {
        if self.exists(path) {
            Ok(path.to_owned())
        } else {
            Err(not_found(path))
        }
    }

    fn enumerate_directory(&self, path: &str, visit: &mut dyn FnMut(&str)) -> io::Result<()> {
        if !self.is_directory(path) {
            return Err(not_found(path));
        }
        let directory = path.trim_end_matches('/');
        let names: Vec<String> = self
            .entries()
            .keys()
            .filter(|k| pbx_paths::parent(k).map(|p| p.trim_end_matches('/')) == Some(directory))
            .map(|k| pbx_paths::base_name(k).to_owned())
            .collect();
        for name in names {
            visit(&name);
        }
        Ok(())
    }

    fn modified(&self, path: &str) -> io::Result<SystemTime> {
        match self.lookup(path) {
            Some(Entry::File { modified, .. }) | Some(Entry::Directory { modified }) => {
                Ok(modified)
            }
            _ => Err(not_found(path)),
        }
    }
}

/// A context with fixed, caller supplied values.
#[derive(Debug, Clone)]
pub struct FixedContext {
    pub current_directory: String,
    pub executable_path: String,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    pub user_id: u32,
    pub group_id: u32,
    pub user_name: String,
    pub group_name: String,
    pub home: Option<String>,
}

impl FixedContext {
    pub fn new<S: Into<String>>(current_directory: S) -> Self {
        FixedContext {
            current_directory: current_directory.into(),
            executable_path: "/usr/local/bin/pbx".to_owned(),
            arguments: vec![],
            environment: HashMap::new(),
            user_id: 501,
            group_id: 20,
            user_name: "builder".to_owned(),
            group_name: "staff".to_owned(),
            home: None,
        }
    }

    pub fn with_variable<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

impl Context for FixedContext {
    fn current_directory(&self) -> io::Result<&str> {
        Ok(&self.current_directory)
    }

    fn executable_path(&self) -> io::Result<&str> {
        Ok(&self.executable_path)
    }

    fn command_line_arguments(&self) -> &[String] {
        &self.arguments
    }

    fn environment_variable(&self, name: &str) -> Option<String> {
        self.environment.get(name).cloned()
    }

    fn environment_variables(&self) -> &HashMap<String, String> {
        &self.environment
    }

    fn user_id(&self) -> u32 {
        self.user_id
    }

    fn group_id(&self) -> u32 {
        self.group_id
    }

    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn group_name(&self) -> &str {
        &self.group_name
    }

    fn user_home_directory(&self) -> Option<String> {
        self.home.clone()
    }
}

/// Adapts a closure into a launcher.
pub struct FnLauncher<F>(pub F);

impl<F> Launcher for FnLauncher<F>
where
    F: Fn(&LaunchRequest<'_>) -> Result<LaunchOutput, LaunchError> + Send + Sync,
{
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<LaunchOutput, LaunchError> {
        (self.0)(request)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_clock_orders_mutations() {
        let fs = MemoryFilesystem::new();
        fs.add_file("/src/a.c", "int a;");
        fs.add_file("/src/b.c", "int b;");
        assert!(fs.modified("/src/b.c").unwrap() > fs.modified("/src/a.c").unwrap());
        fs.touch("/src/a.c").unwrap();
        assert!(fs.modified("/src/a.c").unwrap() > fs.modified("/src/b.c").unwrap());
    }

    #[test]
    fn test_write_needs_parent() {
        let fs = MemoryFilesystem::new();
        assert!(fs.write(b"x", "/missing/dir/file").is_err());
        fs.create_directory("/missing/dir").unwrap();
        fs.write(b"x", "/missing/dir/file").unwrap();
        assert_eq!(fs.contents("/missing/dir/file"), Some(b"x".to_vec()));
    }

    #[test]
    fn test_enumerate_lists_direct_children() {
        let fs = MemoryFilesystem::new();
        fs.add_file("/d/a", "");
        fs.add_file("/d/sub/b", "");
        let mut names = vec![];
        fs.enumerate_directory("/d", &mut |n| names.push(n.to_owned()))
            .unwrap();
        assert_eq!(names, vec!["a", "sub"]);
    }

    #[test]
    fn test_symlinks_resolve() {
        let fs = MemoryFilesystem::new();
        fs.add_file("/real", "data");
        fs.write_symbolic_link("/real", "/alias").unwrap();
        assert_eq!(fs.read_all("/alias").unwrap(), b"data");
        assert!(fs.is_symbolic_link("/alias"));
        assert_eq!(fs.read_symbolic_link("/alias").unwrap(), "/real");
    }
}
