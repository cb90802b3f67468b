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

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    io,
    sync::mpsc::RecvTimeoutError,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use pbx_interface::{CancellationToken, Context, Filesystem, Launcher};
use pbx_metrics::scoped_metric;

use crate::{
    builtins::Builtins,
    command_pool::CommandPool,
    graph::{EdgeKind, InvocationGraph, InvocationId},
    interface::{BuildObserver, NullObserver, Rebuilder},
    rebuilder::{Decision, Reason},
    task::{merge_environment, InvocationTask, NodeError, TaskOutput},
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("determining the working directory: {0}")]
    WorkingDirectory(#[source] io::Error),
    #[error("a worker thread panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop dispatching once anything fails. Running invocations finish.
    StopOnFirstFailure,
    /// Keep running everything that does not depend on a failure.
    KeepGoing,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::StopOnFirstFailure
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub parallelism: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            parallelism: num_cpus::get(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug)]
pub enum NodeState {
    /// Never dispatched: blocked by a failure, a stop or a cancellation.
    Pending,
    Skipped,
    Running,
    Succeeded,
    Failed(NodeError),
    /// Stopped by cancellation.
    Interrupted,
}

impl NodeState {
    pub fn is_pending(&self) -> bool {
        matches!(self, NodeState::Pending)
    }
}

#[derive(Debug)]
pub struct NodeOutcome {
    pub state: NodeState,
    /// Why the invocation ran, when it did.
    pub reason: Option<Reason>,
    pub discovered: Vec<String>,
}

impl NodeOutcome {
    fn pending() -> NodeOutcome {
        NodeOutcome {
            state: NodeState::Pending,
            reason: None,
            discovered: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Succeeded,
    Failed { first: InvocationId },
    Cancelled,
}

#[derive(Debug)]
pub struct BuildReport {
    pub status: BuildStatus,
    outcomes: Vec<NodeOutcome>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }

    pub fn outcome(&self, id: InvocationId) -> &NodeOutcome {
        &self.outcomes[id.index()]
    }

    pub fn state(&self, id: InvocationId) -> &NodeState {
        &self.outcome(id).state
    }

    fn ids_where<F: Fn(&NodeState) -> bool>(&self, f: F) -> Vec<InvocationId> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| f(&o.state))
            .map(|(i, _)| InvocationId::new(i))
            .collect()
    }

    pub fn pending(&self) -> Vec<InvocationId> {
        self.ids_where(NodeState::is_pending)
    }

    pub fn interrupted(&self) -> Vec<InvocationId> {
        self.ids_where(|s| matches!(s, NodeState::Interrupted))
    }

    pub fn failures(&self) -> impl Iterator<Item = (InvocationId, &NodeError)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| match &o.state {
                NodeState::Failed(e) => Some((InvocationId::new(i), e)),
                _ => None,
            })
    }

    pub fn first_failure(&self) -> Option<(InvocationId, &NodeError)> {
        match self.status {
            BuildStatus::Failed { first } => match &self.outcome(first).state {
                NodeState::Failed(e) => Some((first, e)),
                _ => None,
            },
            _ => self.failures().next(),
        }
    }

    /// (ran, skipped)
    pub fn counts(&self) -> (usize, usize) {
        let ran = self
            .outcomes
            .iter()
            .filter(|o| matches!(o.state, NodeState::Succeeded))
            .count();
        let skipped = self
            .outcomes
            .iter()
            .filter(|o| matches!(o.state, NodeState::Skipped))
            .count();
        (ran, skipped)
    }
}

// Bookkeeping of the main thread.
struct Progress {
    outcomes: Vec<NodeOutcome>,
    // Producers still to finish, per node.
    waiting: Vec<usize>,
    // A content input whose producer ran, per node.
    rebuilt: Vec<Option<String>>,
    ready: BinaryHeap<Reverse<usize>>,
    in_flight: usize,
    stopping: bool,
    cancelled: bool,
    first_failure: Option<InvocationId>,
}

impl Progress {
    fn new(graph: &InvocationGraph) -> Progress {
        let waiting: Vec<usize> = graph
            .ids()
            .map(|id| graph.dependencies(id).count())
            .collect();
        let ready = waiting
            .iter()
            .enumerate()
            .filter(|(_, w)| **w == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        Progress {
            outcomes: graph.ids().map(|_| NodeOutcome::pending()).collect(),
            rebuilt: vec![None; graph.len()],
            waiting,
            ready,
            in_flight: 0,
            stopping: false,
            cancelled: false,
            first_failure: None,
        }
    }

    // Lets dependents go once `id` is done.
    fn release(&mut self, graph: &InvocationGraph, id: InvocationId, ran: bool) {
        for (dependent, edge) in graph.dependents(id) {
            let i = dependent.index();
            if ran && edge.kind == EdgeKind::Content && self.rebuilt[i].is_none() {
                self.rebuilt[i] = Some(edge.path.clone());
            }
            self.waiting[i] -= 1;
            if self.waiting[i] == 0 {
                self.ready.push(Reverse(i));
            }
        }
    }

    fn status(&self) -> BuildStatus {
        if self.cancelled {
            BuildStatus::Cancelled
        } else if let Some(first) = self.first_failure {
            BuildStatus::Failed { first }
        } else {
            BuildStatus::Succeeded
        }
    }
}

/// Runs invocations on a worker pool in dependency order, dispatching each only once all of its
/// producers succeeded or were skipped.
pub struct ParallelTopoScheduler<'a> {
    fs: &'a dyn Filesystem,
    context: &'a dyn Context,
    launcher: &'a dyn Launcher,
    builtins: Builtins,
    config: ExecutorConfig,
    cancel: CancellationToken,
    observer: &'a dyn BuildObserver,
}

impl<'a> ParallelTopoScheduler<'a> {
    pub fn new(
        fs: &'a dyn Filesystem,
        context: &'a dyn Context,
        launcher: &'a dyn Launcher,
    ) -> ParallelTopoScheduler<'a> {
        ParallelTopoScheduler {
            fs,
            context,
            launcher,
            builtins: Builtins::default(),
            config: ExecutorConfig::default(),
            cancel: CancellationToken::new(),
            observer: &NullObserver,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_builtins(mut self, builtins: Builtins) -> Self {
        self.builtins = builtins;
        self
    }

    /// Raising `cancel` stops the build.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn BuildObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn filesystem(&self) -> &'a dyn Filesystem {
        self.fs
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The directory invocations without their own working directory run in.
    pub fn working_directory(&self) -> Result<&str, ScheduleError> {
        self.context
            .current_directory()
            .map_err(ScheduleError::WorkingDirectory)
    }

    fn task<'s>(
        &'s self,
        graph: &'s InvocationGraph,
        id: InvocationId,
        working_directory: &str,
    ) -> InvocationTask<'s> {
        let invocation = &graph[id];
        let environment =
            merge_environment(self.context.environment_variables(), invocation.environment());
        let working_directory = if invocation.working_directory().is_empty() {
            working_directory.to_owned()
        } else {
            pbx_paths::join(working_directory, invocation.working_directory())
        };
        InvocationTask {
            id,
            invocation,
            environment,
            working_directory,
            fs: self.fs,
            launcher: self.launcher,
            builtins: &self.builtins,
            cancel: &self.cancel,
        }
    }

    pub fn schedule(
        &self,
        rebuilder: &dyn Rebuilder,
        graph: &InvocationGraph,
    ) -> Result<BuildReport, ScheduleError> {
        scoped_metric!("schedule");
        let working_directory = self.working_directory()?;
        let mut progress = Progress::new(graph);
        let pool = CommandPool::with_capacity(self.config.parallelism);
        info!(
            invocations = graph.len(),
            parallelism = pool.capacity(),
            "starting build"
        );

        let panicked = pool
            .run(|scope| loop {
                if self.cancel.is_cancelled() && !progress.cancelled {
                    info!("build cancelled");
                    progress.cancelled = true;
                    progress.stopping = true;
                }

                while !progress.stopping && progress.in_flight < pool.capacity() {
                    let id = match progress.ready.pop() {
                        Some(Reverse(i)) => InvocationId::new(i),
                        None => break,
                    };
                    let invocation = &graph[id];
                    let rebuilt = progress.rebuilt[id.index()].as_deref();
                    match rebuilder.decide(invocation, rebuilt) {
                        Decision::Skip => {
                            debug!(invocation = %invocation.description(), "up to date");
                            progress.outcomes[id.index()].state = NodeState::Skipped;
                            self.observer.skipped(id, invocation);
                            progress.release(graph, id, false);
                        }
                        Decision::Build(reason) => {
                            self.observer.started(id, invocation, &reason);
                            let outcome = &mut progress.outcomes[id.index()];
                            outcome.state = NodeState::Running;
                            outcome.reason = Some(reason);
                            scope.enqueue(self.task(graph, id, working_directory));
                            progress.in_flight += 1;
                        }
                    }
                }

                if progress.in_flight == 0 {
                    break false;
                }

                let (id, result) = match scope.rx.recv_timeout(POLL_INTERVAL) {
                    Ok(finished) => finished,
                    Err(RecvTimeoutError::Timeout) if scope.is_poisoned() => break true,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break true,
                };
                progress.in_flight -= 1;
                let invocation = &graph[id];
                self.observer.finished(
                    id,
                    invocation,
                    result.as_ref().map(|o: &TaskOutput| o.output.as_ref()),
                );
                let outcome = &mut progress.outcomes[id.index()];
                match result {
                    Ok(output) => {
                        outcome.state = NodeState::Succeeded;
                        outcome.discovered = output.discovered;
                        progress.release(graph, id, true);
                    }
                    Err(e) if e.is_cancelled() => {
                        outcome.state = NodeState::Interrupted;
                        progress.cancelled = true;
                        progress.stopping = true;
                    }
                    Err(e) => {
                        warn!(invocation = %invocation.description(), error = %e, "failed");
                        outcome.state = NodeState::Failed(e);
                        progress.first_failure.get_or_insert(id);
                        if self.config.failure_policy == FailurePolicy::StopOnFirstFailure {
                            progress.stopping = true;
                        }
                    }
                }
            })
            .unwrap_or(true);
        if panicked {
            return Err(ScheduleError::WorkerPanicked);
        }

        let status = progress.status();
        let report = BuildReport {
            status,
            outcomes: progress.outcomes,
        };
        let (ran, skipped) = report.counts();
        info!(?status, ran, skipped, "build finished");
        Ok(report)
    }
}
