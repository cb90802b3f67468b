use pbx_interface::LaunchOutput;
use pbx_invocation::Invocation;

use crate::{
    graph::InvocationId,
    rebuilder::{Decision, Reason},
    task::NodeError,
};

pub trait Rebuilder: Sync {
    /// `rebuilt_dependency` names a content input whose producer ran in this build, if any.
    fn decide(&self, invocation: &Invocation, rebuilt_dependency: Option<&str>) -> Decision;
}

/// Progress callbacks, invoked on the scheduling thread.
pub trait BuildObserver: Sync {
    fn started(&self, _id: InvocationId, _invocation: &Invocation, _reason: &Reason) {}

    fn skipped(&self, _id: InvocationId, _invocation: &Invocation) {}

    /// `output` is None for builtins and invocations without an executable.
    fn finished(
        &self,
        _id: InvocationId,
        _invocation: &Invocation,
        _result: Result<Option<&LaunchOutput>, &NodeError>,
    ) {
    }
}

/// Observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl BuildObserver for NullObserver {}
