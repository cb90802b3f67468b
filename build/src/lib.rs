//! Turns a set of invocations into a dependency graph, decides which of them are out of date and
//! runs those on a worker pool.
//!
//! ```no_run
//! # use pbx_build::*;
//! # use pbx_interface::*;
//! # fn run(invocations: Vec<pbx_invocation::Invocation>) -> Result<(), Box<dyn std::error::Error>> {
//! let fs = DefaultFilesystem::new();
//! let context = DefaultContext::new();
//! let launcher = ProcessLauncher::new();
//! let graph = InvocationGraph::new(invocations)?;
//! let mut state = BuildState::load(&fs, ".pbx_state.json");
//! let scheduler = ParallelTopoScheduler::new(&fs, &context, &launcher);
//! let report = build(&scheduler, &graph, &mut state)?;
//! state.save(&fs, ".pbx_state.json")?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod builtins;
mod command_pool;
pub mod dependency_info;
mod graph;
mod interface;
pub mod materialize;
mod rebuilder;
mod scheduler;
mod state;
mod task;

#[cfg(test)]
mod property_tests;

pub use builtins::{Builtin, BuiltinContext, BuiltinError, Builtins};
pub use dependency_info::{DependencyInfoError, DiscoveredDependencies};
pub use graph::{Edge, EdgeKind, GraphError, InvocationGraph, InvocationId};
pub use interface::{BuildObserver, NullObserver, Rebuilder};
pub use materialize::{AuxiliaryFileError, AuxiliaryFileErrorKind};
pub use rebuilder::{Decision, MTimeRebuilder, Reason};
pub use scheduler::{
    BuildReport, BuildStatus, ExecutorConfig, FailurePolicy, NodeOutcome, NodeState,
    ParallelTopoScheduler, ScheduleError,
};
pub use state::{BuildState, InvocationRecord, StateError};
pub use task::{InvocationExecutionError, NodeError};

/// Runs `graph` against the timestamps on the scheduler's filesystem and `state`, then folds the
/// outcome back into `state`. Saving it is left to the caller.
pub fn build(
    scheduler: &ParallelTopoScheduler<'_>,
    graph: &InvocationGraph,
    state: &mut BuildState,
) -> Result<BuildReport, ScheduleError> {
    let working_directory = scheduler.working_directory()?;
    let report = {
        let rebuilder = MTimeRebuilder::new(scheduler.filesystem(), state, working_directory);
        scheduler.schedule(&rebuilder, graph)?
    };
    state.update(graph, &report);
    Ok(report)
}
