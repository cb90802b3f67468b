//! Tools that run inside the build process, addressed as `builtin-<name>`.

use std::{collections::HashMap, io};

use thiserror::Error;
use tracing::debug;

use pbx_interface::Filesystem;
use pbx_paths::{base_name, join};

#[derive(Error, Debug)]
pub enum BuiltinError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("{path}: {source}")]
    Io { path: String, source: io::Error },
}

fn io_error(path: &str) -> impl FnOnce(io::Error) -> BuiltinError + '_ {
    move |source| BuiltinError::Io {
        path: path.to_owned(),
        source,
    }
}

pub struct BuiltinContext<'a> {
    pub fs: &'a dyn Filesystem,
    pub working_directory: &'a str,
}

impl<'a> BuiltinContext<'a> {
    fn resolve(&self, path: &str) -> String {
        join(self.working_directory, path)
    }
}

pub trait Builtin: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, arguments: &[String], context: &BuiltinContext<'_>) -> Result<(), BuiltinError>;
}

pub struct Builtins {
    tools: HashMap<&'static str, Box<dyn Builtin>>,
}

impl Builtins {
    pub fn empty() -> Builtins {
        Builtins {
            tools: HashMap::new(),
        }
    }

    /// Replaces any builtin already registered under the same name.
    pub fn register(&mut self, builtin: Box<dyn Builtin>) {
        self.tools.insert(builtin.name(), builtin);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Builtin> {
        self.tools.get(name).map(|b| b.as_ref())
    }
}

impl Default for Builtins {
    fn default() -> Self {
        let mut builtins = Builtins::empty();
        builtins.register(Box::new(CopyFiles));
        builtins.register(Box::new(CreateBuildDirectory));
        builtins.register(Box::new(Touch));
        builtins
    }
}

impl std::fmt::Debug for Builtins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_set().entries(names).finish()
    }
}

/// `copy [-exclude NAME]... [-resolve-src-symlinks] SOURCE... DESTINATION`
///
/// Copies each source, file or directory tree, into the destination directory.
#[derive(Debug, Clone, Copy)]
pub struct CopyFiles;

struct CopyOptions<'a> {
    excludes: Vec<&'a str>,
    resolve_symlinks: bool,
}

impl CopyFiles {
    const USAGE: &'static str =
        "copy [-exclude NAME]... [-resolve-src-symlinks] SOURCE... DESTINATION";

    fn copy_item(
        &self,
        fs: &dyn Filesystem,
        options: &CopyOptions<'_>,
        source: &str,
        destination: &str,
    ) -> Result<(), BuiltinError> {
        if fs.is_symbolic_link(source) && !options.resolve_symlinks {
            let target = fs.read_symbolic_link(source).map_err(io_error(source))?;
            if fs.is_symbolic_link(destination) || fs.exists(destination) {
                fs.remove_file(destination).map_err(io_error(destination))?;
            }
            return fs
                .write_symbolic_link(&target, destination)
                .map_err(io_error(destination));
        }
        // A link left by an earlier copy is replaced, never written through.
        if fs.is_symbolic_link(destination) {
            fs.remove_file(destination).map_err(io_error(destination))?;
        }
        if fs.is_directory(source) {
            fs.create_directory(destination)
                .map_err(io_error(destination))?;
            let mut names = Vec::new();
            fs.enumerate_directory(source, &mut |name| names.push(name.to_owned()))
                .map_err(io_error(source))?;
            names.sort();
            for name in names.iter().filter(|n| !options.excludes.contains(&n.as_str())) {
                self.copy_item(fs, options, &join(source, name), &join(destination, name))?;
            }
            return Ok(());
        }
        let contents = fs.read_all(source).map_err(io_error(source))?;
        fs.write(&contents, destination)
            .map_err(io_error(destination))?;
        if fs.is_executable(source) {
            fs.set_executable(destination, true)
                .map_err(io_error(destination))?;
        }
        Ok(())
    }
}

impl Builtin for CopyFiles {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn run(&self, arguments: &[String], context: &BuiltinContext<'_>) -> Result<(), BuiltinError> {
        let mut options = CopyOptions {
            excludes: vec![],
            resolve_symlinks: false,
        };
        let mut paths = Vec::new();
        let mut args = arguments.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-exclude" => match args.next() {
                    Some(name) => options.excludes.push(name.as_str()),
                    None => return Err(BuiltinError::Usage(CopyFiles::USAGE)),
                },
                "-resolve-src-symlinks" => options.resolve_symlinks = true,
                option if option.starts_with('-') && option.len() > 1 => {
                    return Err(BuiltinError::UnknownOption(option.to_owned()))
                }
                path => paths.push(context.resolve(path)),
            }
        }
        let destination = match paths.pop() {
            Some(destination) if !paths.is_empty() => destination,
            _ => return Err(BuiltinError::Usage(CopyFiles::USAGE)),
        };
        context
            .fs
            .create_directory(&destination)
            .map_err(io_error(&destination))?;
        for source in &paths {
            let name = base_name(source);
            if options.excludes.contains(&name) {
                continue;
            }
            debug!(%source, %destination, "copy");
            self.copy_item(context.fs, &options, source, &join(&destination, name))?;
        }
        Ok(())
    }
}

/// `create-build-directory DIRECTORY...`
#[derive(Debug, Clone, Copy)]
pub struct CreateBuildDirectory;

impl Builtin for CreateBuildDirectory {
    fn name(&self) -> &'static str {
        "create-build-directory"
    }

    fn run(&self, arguments: &[String], context: &BuiltinContext<'_>) -> Result<(), BuiltinError> {
        if arguments.is_empty() {
            return Err(BuiltinError::Usage("create-build-directory DIRECTORY..."));
        }
        for argument in arguments {
            let path = context.resolve(argument);
            context
                .fs
                .create_directory(&path)
                .map_err(io_error(&path))?;
        }
        Ok(())
    }
}

/// `touch FILE...`: creates missing files and bumps the modification time of existing ones.
#[derive(Debug, Clone, Copy)]
pub struct Touch;

impl Builtin for Touch {
    fn name(&self) -> &'static str {
        "touch"
    }

    fn run(&self, arguments: &[String], context: &BuiltinContext<'_>) -> Result<(), BuiltinError> {
        if arguments.is_empty() {
            return Err(BuiltinError::Usage("touch FILE..."));
        }
        let fs = context.fs;
        for argument in arguments {
            let path = context.resolve(argument);
            if fs.is_directory(&path) {
                continue;
            }
            // Rewriting is the only way to move the timestamp through the capability.
            let contents = if fs.exists(&path) {
                fs.read_all(&path).map_err(io_error(&path))?
            } else {
                vec![]
            };
            fs.write(&contents, &path).map_err(io_error(&path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pbx_interface::testing::MemoryFilesystem;

    fn run(fs: &MemoryFilesystem, name: &str, arguments: &[&str]) -> Result<(), BuiltinError> {
        let arguments: Vec<String> = arguments.iter().map(|a| a.to_string()).collect();
        let context = BuiltinContext {
            fs,
            working_directory: "/work",
        };
        Builtins::default()
            .get(name)
            .expect("registered")
            .run(&arguments, &context)
    }

    #[test]
    fn test_registry() {
        let builtins = Builtins::default();
        assert!(builtins.get("copy").is_some());
        assert!(builtins.get("touch").is_some());
        assert!(builtins.get("lipo").is_none());
        assert!(Builtins::empty().get("copy").is_none());
        assert_eq!(
            format!("{:?}", builtins),
            r#"{"copy", "create-build-directory", "touch"}"#
        );
    }

    #[test]
    fn test_copy_tree() {
        let fs = MemoryFilesystem::new();
        fs.add_file("/work/Resources/a.txt", "a");
        fs.add_file("/work/Resources/nested/b.txt", "b");
        fs.add_file("/work/Resources/.DS_Store", "junk");
        fs.add_file("/work/tool", "#!/bin/sh");
        fs.set_executable("/work/tool", true).unwrap();
        run(
            &fs,
            "copy",
            &["-exclude", ".DS_Store", "Resources", "tool", "out/App.app"],
        )
        .unwrap();
        assert_eq!(fs.contents("/work/out/App.app/Resources/a.txt").unwrap(), b"a");
        assert_eq!(
            fs.contents("/work/out/App.app/Resources/nested/b.txt").unwrap(),
            b"b"
        );
        assert!(!fs.exists("/work/out/App.app/Resources/.DS_Store"));
        assert!(fs.is_executable("/work/out/App.app/tool"));
    }

    #[test]
    fn test_copy_symlinks() {
        let fs = MemoryFilesystem::new();
        fs.add_file("/work/real.txt", "real");
        fs.write_symbolic_link("/work/real.txt", "/work/link").unwrap();

        run(&fs, "copy", &["link", "kept"]).unwrap();
        assert!(fs.is_symbolic_link("/work/kept/link"));

        run(&fs, "copy", &["-resolve-src-symlinks", "link", "resolved"]).unwrap();
        assert!(!fs.is_symbolic_link("/work/resolved/link"));
        assert_eq!(fs.contents("/work/resolved/link").unwrap(), b"real");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_replaces_destination_links() {
        use pbx_interface::DefaultFilesystem;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let fs = DefaultFilesystem::new();
        let work = join(root, "work");
        let outside = join(root, "outside.txt");
        fs.create_directory(&join(&work, "out")).unwrap();
        fs.write(b"new", &join(&work, "real.txt")).unwrap();
        fs.write(b"secret", &outside).unwrap();
        let stale = join(&work, "out/real.txt");
        fs.write_symbolic_link(&outside, &stale).unwrap();

        let arguments = vec!["real.txt".to_owned(), "out".to_owned()];
        let context = BuiltinContext {
            fs: &fs,
            working_directory: &work,
        };
        CopyFiles.run(&arguments, &context).unwrap();

        assert!(!fs.is_symbolic_link(&stale));
        assert_eq!(fs.read_all(&stale).unwrap(), b"new");
        assert_eq!(fs.read_all(&outside).unwrap(), b"secret");
    }

    #[test]
    fn test_copy_usage() {
        let fs = MemoryFilesystem::new();
        insta::assert_snapshot!(
            run(&fs, "copy", &["only-one"]).unwrap_err().to_string(),
            @"usage: copy [-exclude NAME]... [-resolve-src-symlinks] SOURCE... DESTINATION"
        );
        insta::assert_snapshot!(
            run(&fs, "copy", &["-strip", "a", "b"]).unwrap_err().to_string(),
            @"unknown option '-strip'"
        );
    }

    #[test]
    fn test_copy_missing_source() {
        let fs = MemoryFilesystem::new();
        let err = run(&fs, "copy", &["missing.txt", "out"]).unwrap_err();
        assert!(matches!(err, BuiltinError::Io { ref path, .. } if path == "/work/missing.txt"));
    }

    #[test]
    fn test_create_build_directory() {
        let fs = MemoryFilesystem::new();
        run(&fs, "create-build-directory", &["out/obj", "/abs/dir"]).unwrap();
        assert!(fs.is_directory("/work/out/obj"));
        assert!(fs.is_directory("/abs/dir"));
        // Existing directories are fine.
        run(&fs, "create-build-directory", &["out/obj"]).unwrap();
    }

    #[test]
    fn test_touch() {
        let fs = MemoryFilesystem::new();
        fs.add_file("/work/stamp", "keep");
        let before = fs.modified("/work/stamp").unwrap();
        run(&fs, "touch", &["stamp", "new-stamp"]).unwrap();
        assert!(fs.modified("/work/stamp").unwrap() > before);
        assert_eq!(fs.contents("/work/stamp").unwrap(), b"keep");
        assert_eq!(fs.contents("/work/new-stamp").unwrap(), b"");
    }
}
