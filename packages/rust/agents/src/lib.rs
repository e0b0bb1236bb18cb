//! The five vault-intel agents and their common entry point.
//!
//! Every agent takes an [`AgentContext`] plus the results of earlier stages
//! and returns a finalized [`AgentResult`]. Agents never return `Err`:
//! recoverable failures are recorded on the result itself.

pub mod briefing;
pub mod context;
pub mod crossref;
pub mod holdings;
pub mod hygiene;
pub mod portfolio;
pub mod position_risk;
pub mod tasks;

pub use context::AgentContext;

use vaultintel_shared::{AgentKind, AgentResult, ResultSet};

/// Run one agent. `upstream` is only read by the briefing agent.
pub fn run_agent(kind: AgentKind, ctx: &AgentContext, upstream: &ResultSet) -> AgentResult {
    match kind {
        AgentKind::Hygiene => hygiene::run(ctx),
        AgentKind::CrossReference => crossref::run(ctx),
        AgentKind::PositionRisk => position_risk::run(ctx),
        AgentKind::HoldingsDelta => holdings::run(ctx),
        AgentKind::Briefing => briefing::run(ctx, upstream),
    }
}

#[cfg(test)]
mod tests {
    use vaultintel_shared::AppConfig;

    use super::*;
    use crate::context::testing::{context, temp_root};

    #[test]
    fn every_agent_runs_against_an_empty_tree() {
        let tmp = temp_root("dispatch");
        let ctx = context(&tmp, AppConfig::default()).with_dry_run(true);

        for kind in AgentKind::ALL {
            let result = run_agent(kind, &ctx, &ResultSet::new());
            assert_eq!(result.agent, kind);
            assert!(result.completed_at.is_some());
            assert!(!result.is_failed(), "{kind} failed: {:?}", result.errors);
        }

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
