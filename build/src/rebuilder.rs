use std::{fmt, time::SystemTime};

use tracing::debug;

use pbx_interface::Filesystem;
use pbx_invocation::Invocation;
use pbx_metrics::scoped_metric;
use pbx_paths::join;

use crate::{interface::Rebuilder, state::BuildState};

/// Why an invocation has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    NoOutputs,
    MissingOutput(String),
    MissingAuxiliaryFile(String),
    /// The producer of this content input ran in this build.
    DependencyRebuilt(String),
    MissingInput(String),
    InputNewer(String),
    MissingDiscoveredInput(String),
    DiscoveredInputNewer(String),
    NotRecorded,
    CommandChanged,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::NoOutputs => write!(f, "it declares no outputs and has no record"),
            Reason::MissingOutput(p) => write!(f, "output {} is missing", p),
            Reason::MissingAuxiliaryFile(p) => write!(f, "auxiliary file {} is missing", p),
            Reason::DependencyRebuilt(p) => write!(f, "{} was rebuilt", p),
            Reason::MissingInput(p) => write!(f, "input {} is missing", p),
            Reason::InputNewer(p) => write!(f, "input {} is newer than its outputs", p),
            Reason::MissingDiscoveredInput(p) => write!(f, "discovered input {} is missing", p),
            Reason::DiscoveredInputNewer(p) => {
                write!(f, "discovered input {} is newer than its outputs", p)
            }
            Reason::NotRecorded => write!(f, "it has not run before"),
            Reason::CommandChanged => write!(f, "its command line changed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Build(Reason),
    Skip,
}

/// Decides by comparing modification times of inputs against the oldest output, backed by the
/// previous run's records.
pub struct MTimeRebuilder<'a> {
    fs: &'a dyn Filesystem,
    state: &'a BuildState,
    working_directory: &'a str,
}

impl<'a> MTimeRebuilder<'a> {
    /// `working_directory` resolves paths of invocations that do not set their own.
    pub fn new(
        fs: &'a dyn Filesystem,
        state: &'a BuildState,
        working_directory: &'a str,
    ) -> MTimeRebuilder<'a> {
        MTimeRebuilder {
            fs,
            state,
            working_directory,
        }
    }

    fn resolve(&self, invocation: &Invocation, path: &str) -> String {
        join(
            &join(self.working_directory, invocation.working_directory()),
            path,
        )
    }

    // None when some output is missing.
    fn oldest_output(&self, invocation: &Invocation) -> Result<Option<SystemTime>, Reason> {
        let mut oldest: Option<SystemTime> = None;
        for output in invocation.outputs() {
            let path = self.resolve(invocation, output);
            if invocation.creates_product_structure() {
                if !self.fs.exists(&path) {
                    return Err(Reason::MissingOutput(output.clone()));
                }
                continue;
            }
            if !self.fs.is_readable(&path) {
                return Err(Reason::MissingOutput(output.clone()));
            }
            let modified = self
                .fs
                .modified(&path)
                .map_err(|_| Reason::MissingOutput(output.clone()))?;
            oldest = Some(match oldest {
                Some(t) if t <= modified => t,
                _ => modified,
            });
        }
        Ok(oldest)
    }

    fn check(&self, invocation: &Invocation, rebuilt_dependency: Option<&str>) -> Result<(), Reason> {
        if let Some(path) = rebuilt_dependency {
            return Err(Reason::DependencyRebuilt(path.to_owned()));
        }
        let oldest = self.oldest_output(invocation)?;
        for file in invocation.auxiliary_files() {
            if !self.fs.exists(&self.resolve(invocation, file.path())) {
                return Err(Reason::MissingAuxiliaryFile(file.path().to_owned()));
            }
        }

        let record = self.state.record_for(invocation);
        if self.state.is_tracked() {
            match record {
                None => return Err(Reason::NotRecorded),
                Some(record) if record.command != invocation.command_line() => {
                    return Err(Reason::CommandChanged)
                }
                Some(_) => {}
            }
        } else if invocation.outputs().is_empty() {
            return Err(Reason::NoOutputs);
        }

        // Without outputs there is nothing to compare against, only presence counts.
        if invocation.outputs().is_empty() {
            for input in invocation.content_inputs() {
                if self.fs.modified(&self.resolve(invocation, input)).is_err() {
                    return Err(Reason::MissingInput(input.to_owned()));
                }
            }
            return Ok(());
        }

        // Product structure outputs are directories whose timestamps say nothing.
        let oldest = match oldest {
            Some(oldest) => oldest,
            None => return Ok(()),
        };
        for input in invocation.content_inputs() {
            match self.fs.modified(&self.resolve(invocation, input)) {
                Err(_) => return Err(Reason::MissingInput(input.to_owned())),
                Ok(modified) if modified > oldest => {
                    return Err(Reason::InputNewer(input.to_owned()))
                }
                Ok(_) => {}
            }
        }
        for discovered in record.iter().flat_map(|r| r.discovered.iter()) {
            match self.fs.modified(&self.resolve(invocation, discovered)) {
                Err(_) => return Err(Reason::MissingDiscoveredInput(discovered.clone())),
                Ok(modified) if modified > oldest => {
                    return Err(Reason::DiscoveredInputNewer(discovered.clone()))
                }
                Ok(_) => {}
            }
        }
        Ok(())
    }
}

impl<'a> Rebuilder for MTimeRebuilder<'a> {
    fn decide(&self, invocation: &Invocation, rebuilt_dependency: Option<&str>) -> Decision {
        scoped_metric!("decide");
        match self.check(invocation, rebuilt_dependency) {
            Ok(()) => Decision::Skip,
            Err(reason) => {
                debug!(invocation = %invocation.description(), %reason, "out of date");
                Decision::Build(reason)
            }
        }
    }
}
