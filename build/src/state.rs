//! What the previous run knew about each invocation: the command it ran and the inputs its
//! dependency info reported. Keyed by primary output, or by description for invocations without
//! outputs.

use std::{collections::BTreeMap, io};

use thiserror::Error;
use tracing::{debug, warn};

use pbx_interface::Filesystem;
use pbx_invocation::Invocation;
use pbx_plist::{Dictionary, Format, FormatError, Json, Value};

use crate::{
    graph::InvocationGraph,
    scheduler::{BuildReport, NodeState},
};

const VERSION: i64 = 1;

#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("unexpected build state layout: {0}")]
    Layout(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationRecord {
    pub command: String,
    pub discovered: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildState {
    // False until state was loaded or updated by a run. Without it, missing records prove
    // nothing.
    tracked: bool,
    records: BTreeMap<String, InvocationRecord>,
}

impl BuildState {
    /// An untracked, empty state. Decisions fall back to timestamps alone.
    pub fn new() -> BuildState {
        BuildState::default()
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    pub fn record(&self, primary_output: &str) -> Option<&InvocationRecord> {
        self.records.get(primary_output)
    }

    /// The record of `invocation`, wherever it is keyed.
    pub fn record_for(&self, invocation: &Invocation) -> Option<&InvocationRecord> {
        self.records.get(&key(invocation))
    }

    pub fn insert<S: Into<String>>(&mut self, primary_output: S, record: InvocationRecord) {
        self.tracked = true;
        self.records.insert(primary_output.into(), record);
    }

    pub fn remove(&mut self, primary_output: &str) -> Option<InvocationRecord> {
        self.records.remove(primary_output)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Folds the outcome of a run into the state.
    pub fn update(&mut self, graph: &InvocationGraph, report: &BuildReport) {
        for id in graph.ids() {
            let invocation = &graph[id];
            let key = key(invocation);
            let outcome = report.outcome(id);
            match &outcome.state {
                NodeState::Succeeded => {
                    self.records.insert(
                        key,
                        InvocationRecord {
                            command: invocation.command_line(),
                            discovered: outcome.discovered.clone(),
                        },
                    );
                }
                // A skip never ran the tool, so without an earlier record nothing is known about
                // its discovered inputs. Leaving it unrecorded forces a run next time.
                NodeState::Skipped => {
                    if let Some(record) = self.records.get_mut(&key) {
                        record.command = invocation.command_line();
                    } else {
                        debug!(%key, "skipped without a record");
                    }
                }
                NodeState::Failed(_) | NodeState::Interrupted => {
                    self.records.remove(&key);
                }
                NodeState::Pending | NodeState::Running => {}
            }
        }
        self.tracked = true;
    }

    pub fn to_value(&self) -> Value {
        let invocations: Dictionary = self
            .records
            .iter()
            .map(|(output, record)| {
                let mut entry = Dictionary::new();
                entry.insert("command", record.command.as_str());
                entry.insert(
                    "discovered",
                    record
                        .discovered
                        .iter()
                        .map(|d| Value::from(d.as_str()))
                        .collect::<Vec<_>>(),
                );
                (output.as_str(), entry)
            })
            .collect();
        let mut root = Dictionary::new();
        root.insert("version", VERSION);
        root.insert("invocations", invocations);
        root.into()
    }

    pub fn from_value(value: &Value) -> Result<BuildState, StateError> {
        let root = value
            .as_dictionary()
            .ok_or_else(|| StateError::Layout(format!("expected dictionary, got {}", value.kind())))?;
        match root.get("version").and_then(Value::as_integer) {
            Some(VERSION) => {}
            Some(other) => return Err(StateError::Layout(format!("unknown version {}", other))),
            None => return Err(StateError::Layout("missing version".to_owned())),
        }
        let invocations = root
            .get("invocations")
            .and_then(Value::as_dictionary)
            .ok_or_else(|| StateError::Layout("missing invocations".to_owned()))?;
        let mut state = BuildState {
            tracked: true,
            records: BTreeMap::new(),
        };
        for (output, entry) in invocations.iter() {
            let entry = entry
                .as_dictionary()
                .ok_or_else(|| StateError::Layout(format!("record for {}", output)))?;
            let command = entry
                .get("command")
                .and_then(Value::as_str)
                .ok_or_else(|| StateError::Layout(format!("command for {}", output)))?;
            let discovered = match entry.get("discovered") {
                None => vec![],
                Some(list) => list
                    .as_array()
                    .ok_or_else(|| StateError::Layout(format!("discovered for {}", output)))?
                    .iter()
                    .map(|d| {
                        d.as_str()
                            .map(str::to_owned)
                            .ok_or_else(|| StateError::Layout(format!("discovered for {}", output)))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            };
            state.records.insert(
                output.to_owned(),
                InvocationRecord {
                    command: command.to_owned(),
                    discovered,
                },
            );
        }
        Ok(state)
    }

    /// Reads the state file. A missing file gives an untracked state; an unreadable one is an
    /// error the caller may choose to ignore.
    pub fn read(fs: &dyn Filesystem, path: &str) -> Result<BuildState, StateError> {
        if !fs.exists(path) {
            return Ok(BuildState::new());
        }
        let contents = fs.read_all(path)?;
        let value = Json::new().deserialize(&contents)?;
        BuildState::from_value(&value)
    }

    /// Like `read`, but anything unusable is discarded so every invocation is reconsidered.
    pub fn load(fs: &dyn Filesystem, path: &str) -> BuildState {
        match BuildState::read(fs, path) {
            Ok(state) => {
                debug!(path, records = state.len(), "loaded build state");
                state
            }
            Err(e) => {
                warn!(path, error = %e, "discarding build state");
                BuildState::new()
            }
        }
    }

    pub fn save(&self, fs: &dyn Filesystem, path: &str) -> Result<(), StateError> {
        let contents = Json::pretty_printed().serialize(&self.to_value())?;
        fs.write(&contents, path)?;
        Ok(())
    }
}

pub(crate) fn key(invocation: &Invocation) -> String {
    match invocation.primary_output() {
        Some(output) => output.to_owned(),
        None => format!("<{}>", invocation.description()),
    }
}
