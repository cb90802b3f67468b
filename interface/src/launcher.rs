use std::{
    collections::HashMap,
    io::{self, Read},
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use nix::unistd::{access, AccessFlags};
use pbx_metrics::scoped_metric;
use thiserror::Error;
use tracing::debug;

use crate::CancellationToken;

/// Everything needed to start a program. `environment` is the complete environment of the child,
/// not a set of overrides.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub executable: &'a str,
    pub arguments: &'a [String],
    pub environment: &'a HashMap<String, String>,
    pub working_directory: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOutput {
    /// None when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl LaunchOutput {
    pub fn exited(code: i32) -> LaunchOutput {
        LaunchOutput {
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable not found: {0}")]
    NotFound(String),
    #[error("{0} is not executable")]
    NotExecutable(String),
    #[error("running {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("cancelled")]
    Cancelled,
}

pub trait Launcher: Send + Sync {
    /// Runs the program to completion. Implementations that can stop a child early do so once
    /// `cancel` is raised and report `LaunchError::Cancelled`.
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<LaunchOutput, LaunchError>;
}

/// Runs programs with `std::process`, capturing their output.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    poll_interval: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        ProcessLauncher {
            poll_interval: Duration::from_millis(5),
        }
    }
}

fn is_executable_file(path: &str) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
        && access(path, AccessFlags::X_OK).is_ok()
}

impl ProcessLauncher {
    pub fn new() -> Self {
        ProcessLauncher::default()
    }

    /// Paths with a slash are taken relative to the working directory, bare names are looked up
    /// in the child's `PATH`.
    pub fn resolve(&self, request: &LaunchRequest<'_>) -> Result<String, LaunchError> {
        let executable = request.executable;
        if executable.contains('/') {
            let path = pbx_paths::join(request.working_directory, executable);
            if !std::path::Path::new(&path).exists() {
                return Err(LaunchError::NotFound(path));
            }
            if !is_executable_file(&path) {
                return Err(LaunchError::NotExecutable(path));
            }
            return Ok(path);
        }

        let search = request
            .environment
            .get("PATH")
            .map(String::as_str)
            .unwrap_or("/usr/bin:/bin");
        search
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| pbx_paths::join(&pbx_paths::join(request.working_directory, dir), executable))
            .find(|candidate| is_executable_file(candidate))
            .ok_or_else(|| LaunchError::NotFound(executable.to_owned()))
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buffer);
        }
        buffer
    })
}

// Errors are ignored: the child may already be gone.
fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<LaunchOutput, LaunchError> {
        scoped_metric!("launch");
        let path = self.resolve(request)?;
        let io_error = |source| LaunchError::Io {
            path: path.clone(),
            source,
        };

        let mut command = Command::new(&path);
        command
            .args(request.arguments)
            .env_clear()
            .envs(request.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !request.working_directory.is_empty() {
            command.current_dir(request.working_directory);
        }
        debug!(executable = %path, "spawning");
        let mut child = command.spawn().map_err(io_error)?;

        // Pipes are drained on their own threads so a chatty child never blocks on a full pipe
        // while we poll for exit.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    kill_and_reap(&mut child);
                    return Err(io_error(e));
                }
            }
            if cancel.is_cancelled() {
                debug!(executable = %path, "killing cancelled child");
                kill_and_reap(&mut child);
                break None;
            }
            thread::sleep(self.poll_interval);
        };

        match status {
            Some(status) => Ok(LaunchOutput {
                code: status.code(),
                stdout: stdout.join().unwrap_or_default(),
                stderr: stderr.join().unwrap_or_default(),
            }),
            // Grandchildren may still hold the pipes open, so the drain threads are left behind.
            None => Err(LaunchError::Cancelled),
        }
    }
}
