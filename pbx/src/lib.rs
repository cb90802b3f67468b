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

use std::{ffi::OsString, fmt};

use anyhow::{bail, Context as _};
use thiserror::Error;
use tracing::info;

use pbx_build::{
    build, BuildState, BuildStatus, ExecutorConfig, FailurePolicy, InvocationGraph,
    ParallelTopoScheduler,
};
use pbx_interface::{DefaultContext, DefaultFilesystem, ProcessLauncher};
use pbx_metrics::scoped_metric;

pub mod manifest;
mod printer;

pub use printer::ConsolePrinter;

pub const USAGE: &str = "usage: pbx [options]

options:
  -C DIR        change to DIR before doing anything else
  -f FILE       invocation manifest, JSON or .plist [default=invocations.json]
  -j N          run N invocations in parallel [default derived from CPUs]
  -k            keep going past failures
  -d MODE       enable debugging (use '-d list' to list modes)
  --state FILE  build state file [default=.pbx_state.json]
  -v            show all command lines while building
  -h, --help    print this message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    Explain,
    List,
    Stats,
}

#[derive(Error, Debug)]
#[error("unknown debug setting '{0}'")]
pub struct DebugModeError(String);

impl std::str::FromStr for DebugMode {
    type Err = DebugModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explain" => Ok(DebugMode::Explain),
            "list" => Ok(DebugMode::List),
            "stats" => Ok(DebugMode::Stats),
            e => Err(DebugModeError(e.to_owned())),
        }
    }
}

impl fmt::Display for DebugMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DebugMode::Explain => "explain",
            DebugMode::List => "list",
            DebugMode::Stats => "stats",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub execution_dir: Option<String>,
    pub manifest: String,
    pub parallelism: usize,
    pub keep_going: bool,
    pub debug_modes: Vec<DebugMode>,
    pub state_file: String,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            execution_dir: None,
            manifest: "invocations.json".to_owned(),
            parallelism: num_cpus::get(),
            keep_going: false,
            debug_modes: vec![],
            state_file: ".pbx_state.json".to_owned(),
            verbose: false,
        }
    }
}

impl Config {
    /// None when help was requested.
    pub fn from_args(args: Vec<OsString>) -> anyhow::Result<Option<Config>> {
        let mut args = pico_args::Arguments::from_vec(args);
        if args.contains(["-h", "--help"]) {
            return Ok(None);
        }
        let defaults = Config::default();
        let mut debug_modes = vec![];
        while let Some(mode) = args.opt_value_from_str::<_, DebugMode>("-d")? {
            debug_modes.push(mode);
        }
        let config = Config {
            execution_dir: args.opt_value_from_str("-C")?,
            manifest: args.opt_value_from_str("-f")?.unwrap_or(defaults.manifest),
            parallelism: args
                .opt_value_from_str("-j")?
                .unwrap_or(defaults.parallelism),
            keep_going: args.contains("-k"),
            debug_modes,
            state_file: args
                .opt_value_from_str("--state")?
                .unwrap_or(defaults.state_file),
            verbose: args.contains("-v"),
        };
        let free = args.free()?;
        if !free.is_empty() {
            bail!("unexpected arguments: {}", free.join(" "));
        }
        Ok(Some(config))
    }

    fn debug(&self, mode: DebugMode) -> bool {
        self.debug_modes.contains(&mode)
    }

    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            parallelism: self.parallelism,
            failure_policy: if self.keep_going {
                FailurePolicy::KeepGoing
            } else {
                FailurePolicy::StopOnFirstFailure
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum BuildFailure {
    #[error("build failed")]
    Failed,
    #[error("build interrupted")]
    Cancelled,
}

fn list_debug_modes() {
    println!("debugging modes:");
    println!("  stats    print operation counts/timing info");
    println!("  explain  explain what caused an invocation to run");
}

pub fn run(config: Config) -> anyhow::Result<()> {
    if config.debug(DebugMode::List) {
        list_debug_modes();
        return Ok(());
    }
    if let Some(dir) = &config.execution_dir {
        std::env::set_current_dir(&dir).with_context(|| format!("changing to {} for -C", &dir))?;
    }

    let metrics_enabled = config.debug(DebugMode::Stats);
    if metrics_enabled {
        pbx_metrics::enable();
    }

    let fs = DefaultFilesystem::new();
    let context = DefaultContext::new();
    let launcher = ProcessLauncher::new();

    let invocations = {
        scoped_metric!("manifest");
        manifest::load(&fs, &config.manifest)
            .with_context(|| format!("loading {}", config.manifest))?
    };
    let graph = InvocationGraph::new(invocations)?;
    let mut state = BuildState::load(&fs, &config.state_file);

    let printer = ConsolePrinter::new(graph.len(), config.debug(DebugMode::Explain), config.verbose);
    let scheduler = ParallelTopoScheduler::new(&fs, &context, &launcher)
        .with_config(config.executor_config())
        .with_observer(&printer);
    let report = {
        scoped_metric!("build");
        build(&scheduler, &graph, &mut state)?
    };
    state
        .save(&fs, &config.state_file)
        .with_context(|| format!("saving {}", config.state_file))?;
    printer.summarize(&graph, &report);
    info!(status = ?report.status, "done");

    if metrics_enabled {
        pbx_metrics::dump();
    }
    match report.status {
        BuildStatus::Succeeded => Ok(()),
        BuildStatus::Failed { .. } => Err(BuildFailure::Failed.into()),
        BuildStatus::Cancelled => Err(BuildFailure::Cancelled.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Option<Config>> {
        Config::from_args(args.iter().map(OsString::from).collect())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(parse(&[]).unwrap(), Some(Config::default()));
        assert_eq!(parse(&["-h"]).unwrap(), None);
    }

    #[test]
    fn test_flags() {
        let config = parse(&[
            "-C", "out", "-f", "build.json", "-j", "3", "-k", "-d", "stats", "-d", "explain",
            "--state", "state.json", "-v",
        ])
        .unwrap()
        .unwrap();
        assert_eq!(
            config,
            Config {
                execution_dir: Some("out".to_owned()),
                manifest: "build.json".to_owned(),
                parallelism: 3,
                keep_going: true,
                debug_modes: vec![DebugMode::Stats, DebugMode::Explain],
                state_file: "state.json".to_owned(),
                verbose: true,
            }
        );
        assert_eq!(
            config.executor_config().failure_policy,
            FailurePolicy::KeepGoing
        );
    }

    #[test]
    fn test_bad_arguments() {
        assert!(parse(&["-d", "everything"]).is_err());
        assert!(parse(&["-j", "many"]).is_err());
        assert!(parse(&["target"]).is_err());
    }

    #[test]
    fn test_debug_mode_names() {
        for mode in &[DebugMode::Explain, DebugMode::List, DebugMode::Stats] {
            assert_eq!(mode.to_string().parse::<DebugMode>().unwrap(), *mode);
        }
    }
}
