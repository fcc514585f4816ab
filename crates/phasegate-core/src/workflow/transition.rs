//! Legal phase transitions.
//!
//! The phase graph is a fixed adjacency table checked on every move, rather
//! than something inferred from where control flow happens to go. Self-loops
//! are the retry edges; `Validation -> Generation` is the remediation edge.

use phasegate_types::workflow::Phase;

use super::orchestrator::OrchestratorError;

/// Phases reachable from `from` in one step.
pub fn successors(from: Phase) -> &'static [Phase] {
    match from {
        Phase::Requirements => &[Phase::Requirements, Phase::Planning, Phase::Failed],
        Phase::Planning => &[Phase::Planning, Phase::Generation, Phase::Failed],
        Phase::Generation => &[Phase::Generation, Phase::Validation, Phase::Failed],
        Phase::Validation => &[
            Phase::Validation,
            Phase::Generation,
            Phase::Complete,
            Phase::Failed,
        ],
        Phase::Complete | Phase::Failed => &[],
    }
}

pub fn is_legal(from: Phase, to: Phase) -> bool {
    successors(from).contains(&to)
}

/// Error unless `from -> to` is in the table.
pub fn check(from: Phase, to: Phase) -> Result<(), OrchestratorError> {
    if is_legal(from, to) {
        Ok(())
    } else {
        Err(OrchestratorError::IllegalTransition { from, to })
    }
}
