/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use pbx_interface::{
    CancellationToken, Filesystem, LaunchError, LaunchOutput, LaunchRequest, Launcher,
};
use pbx_invocation::{Executable, Invocation};

use crate::{
    builtins::{BuiltinContext, BuiltinError, Builtins},
    command_pool::CommandPoolTask,
    dependency_info,
    graph::InvocationId,
    materialize::{materialize, AuxiliaryFileError},
};

fn exit_message(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {}", code),
        None => "terminated by a signal".to_owned(),
    }
}

#[derive(Error, Debug)]
pub enum InvocationExecutionError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("{}", exit_message(.code))]
    ExitStatus { code: Option<i32>, stderr: Vec<u8> },
    #[error("unknown builtin '{0}'")]
    UnknownBuiltin(String),
    #[error("builtin-{name}: {source}")]
    Builtin { name: String, source: BuiltinError },
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    AuxiliaryFile(#[from] AuxiliaryFileError),
    #[error(transparent)]
    Execution(#[from] InvocationExecutionError),
}

impl NodeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            NodeError::Execution(InvocationExecutionError::Launch(LaunchError::Cancelled))
        )
    }
}

#[derive(Debug, Default)]
pub struct TaskOutput {
    /// Captured output of external tools.
    pub output: Option<LaunchOutput>,
    /// Inputs reported by the invocation's dependency info, absolute.
    pub discovered: Vec<String>,
}

pub type TaskResult = (InvocationId, Result<TaskOutput, NodeError>);

/// The ambient environment with the invocation's entries layered on top.
pub fn merge_environment(
    ambient: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = ambient.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Everything one invocation needs to run on a pool worker.
pub struct InvocationTask<'a> {
    pub id: InvocationId,
    pub invocation: &'a Invocation,
    pub environment: HashMap<String, String>,
    pub working_directory: String,
    pub fs: &'a dyn Filesystem,
    pub launcher: &'a dyn Launcher,
    pub builtins: &'a Builtins,
    pub cancel: &'a CancellationToken,
}

impl<'a> InvocationTask<'a> {
    fn execute(&self) -> Result<TaskOutput, NodeError> {
        // Queued work that never started is interrupted like running work.
        if self.cancel.is_cancelled() {
            return Err(InvocationExecutionError::Launch(LaunchError::Cancelled).into());
        }
        for file in self.invocation.auxiliary_files() {
            materialize(self.fs, file, &self.working_directory)?;
        }
        let output = match self.invocation.executable() {
            None => None,
            Some(Executable::Builtin(name)) => {
                self.run_builtin(name)?;
                None
            }
            Some(Executable::External(path)) => Some(self.launch(path)?),
        };
        Ok(TaskOutput {
            output,
            discovered: self.read_dependency_info(),
        })
    }

    fn run_builtin(&self, name: &str) -> Result<(), InvocationExecutionError> {
        let builtin = self
            .builtins
            .get(name)
            .ok_or_else(|| InvocationExecutionError::UnknownBuiltin(name.to_owned()))?;
        let context = BuiltinContext {
            fs: self.fs,
            working_directory: &self.working_directory,
        };
        builtin
            .run(self.invocation.arguments(), &context)
            .map_err(|source| InvocationExecutionError::Builtin {
                name: name.to_owned(),
                source,
            })
    }

    fn launch(&self, executable: &str) -> Result<LaunchOutput, InvocationExecutionError> {
        let request = LaunchRequest {
            executable,
            arguments: self.invocation.arguments(),
            environment: &self.environment,
            working_directory: &self.working_directory,
        };
        let output = self.launcher.launch(&request, self.cancel)?;
        if !output.success() {
            return Err(InvocationExecutionError::ExitStatus {
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    fn read_dependency_info(&self) -> Vec<String> {
        let mut discovered: Vec<String> = Vec::new();
        for info in self.invocation.dependency_info() {
            match dependency_info::read(self.fs, info, &self.working_directory) {
                Ok(parsed) => {
                    for input in parsed.inputs {
                        if !discovered.contains(&input) {
                            discovered.push(input);
                        }
                    }
                }
                Err(e) => warn!(
                    invocation = %self.invocation.description(),
                    error = %e,
                    "ignoring dependency info"
                ),
            }
        }
        discovered
    }
}

impl<'a> CommandPoolTask for InvocationTask<'a> {
    type Result = TaskResult;

    fn run(&self) -> TaskResult {
        debug!(invocation = %self.invocation.description(), "running");
        (self.id, self.execute())
    }
}
