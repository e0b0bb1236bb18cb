//! Progress callbacks for pipeline runs.

use vaultintel_shared::{AgentKind, AgentResult};

use crate::coordinator::PipelineOutcome;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn stage(&self, name: &str);
    /// Called when an agent is scheduled.
    fn agent_started(&self, agent: AgentKind);
    /// Called with each agent's final result.
    fn agent_finished(&self, result: &AgentResult);
    /// Called when the whole pipeline completes.
    fn done(&self, outcome: &PipelineOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage(&self, _name: &str) {}
    fn agent_started(&self, _agent: AgentKind) {}
    fn agent_finished(&self, _result: &AgentResult) {}
    fn done(&self, _outcome: &PipelineOutcome) {}
}
