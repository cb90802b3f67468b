use std::{collections::HashMap, env, io};

use nix::unistd::{Gid, Group, Uid, User};
use once_cell::sync::{Lazy, OnceCell};

use crate::fs::invalid_path;

/// Facts about the running process. Implementations compute each value at most once.
pub trait Context: Send + Sync {
    fn current_directory(&self) -> io::Result<&str>;
    fn executable_path(&self) -> io::Result<&str>;
    fn command_line_arguments(&self) -> &[String];

    fn environment_variable(&self, name: &str) -> Option<String>;
    fn environment_variables(&self) -> &HashMap<String, String>;

    fn user_id(&self) -> u32;
    fn group_id(&self) -> u32;
    fn user_name(&self) -> &str;
    fn group_name(&self) -> &str;
    fn user_home_directory(&self) -> Option<String>;
}

// Process-wide, so every DefaultContext shares one computation. Concurrent first callers block on
// the initializer instead of racing it.
static CURRENT_DIRECTORY: OnceCell<String> = OnceCell::new();
static EXECUTABLE_PATH: OnceCell<String> = OnceCell::new();
static ARGUMENTS: Lazy<Vec<String>> = Lazy::new(|| {
    env::args_os()
        .skip(1)
        .map(|a| a.to_string_lossy().into_owned())
        .collect()
});
static ENVIRONMENT: Lazy<HashMap<String, String>> = Lazy::new(|| {
    env::vars_os()
        .map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                v.to_string_lossy().into_owned(),
            )
        })
        .collect()
});
static USER_NAME: Lazy<String> = Lazy::new(|| {
    let uid = Uid::current();
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
});
static GROUP_NAME: Lazy<String> = Lazy::new(|| {
    let gid = Gid::current();
    match Group::from_gid(gid) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
});

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultContext;

impl DefaultContext {
    pub fn new() -> Self {
        DefaultContext
    }
}

impl Context for DefaultContext {
    fn current_directory(&self) -> io::Result<&str> {
        CURRENT_DIRECTORY
            .get_or_try_init(|| {
                env::current_dir()?
                    .into_os_string()
                    .into_string()
                    .map_err(|_| invalid_path("current directory"))
            })
            .map(String::as_str)
    }

    fn executable_path(&self) -> io::Result<&str> {
        EXECUTABLE_PATH
            .get_or_try_init(|| {
                let exe = env::current_exe()?;
                // Normalize through symlinks where possible, keep the raw path otherwise.
                let exe = std::fs::canonicalize(&exe).unwrap_or(exe);
                exe.into_os_string()
                    .into_string()
                    .map_err(|_| invalid_path("executable path"))
            })
            .map(String::as_str)
    }

    fn command_line_arguments(&self) -> &[String] {
        &ARGUMENTS
    }

    fn environment_variable(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }

    fn environment_variables(&self) -> &HashMap<String, String> {
        &ENVIRONMENT
    }

    fn user_id(&self) -> u32 {
        Uid::current().as_raw()
    }

    fn group_id(&self) -> u32 {
        Gid::current().as_raw()
    }

    fn user_name(&self) -> &str {
        &USER_NAME
    }

    fn group_name(&self) -> &str {
        &GROUP_NAME
    }

    fn user_home_directory(&self) -> Option<String> {
        if let Some(home) = self.environment_variable("HOME") {
            return Some(home);
        }
        User::from_uid(Uid::current())
            .ok()
            .flatten()
            .and_then(|user| user.dir.into_os_string().into_string().ok())
    }
}
