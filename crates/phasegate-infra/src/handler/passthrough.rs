//! Dry-run phase handler.

use phasegate_core::workflow::invoker::{PhaseHandler, PhaseInput, PhaseOutcome};
use serde_json::json;

/// Completes immediately, echoing what it was given as its artifact.
///
/// Useful for exercising gates and checkpointing without real phase work.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughHandler;

impl PhaseHandler for PassthroughHandler {
    async fn execute(&self, input: &PhaseInput) -> PhaseOutcome {
        PhaseOutcome::Completed(json!({
            "phase": input.phase,
            "attempt": input.attempt,
            "inputs": input.inputs,
            "artifacts": input.artifacts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use phasegate_types::workflow::Phase;

    #[tokio::test]
    async fn echoes_allow_listed_input() {
        let mut inputs = serde_json::Map::new();
        inputs.insert("chart".to_string(), json!("nginx"));
        let input = PhaseInput {
            execution_id: Default::default(),
            phase: Phase::Planning,
            attempt: 2,
            inputs: Some(inputs),
            artifacts: BTreeMap::from([(Phase::Requirements, json!({"replicas": 3}))]),
            open_issues: Vec::new(),
            resolutions: BTreeMap::new(),
        };

        let PhaseOutcome::Completed(artifact) = PassthroughHandler.execute(&input).await else {
            panic!("expected completion");
        };
        assert_eq!(artifact["phase"], "planning");
        assert_eq!(artifact["attempt"], 2);
        assert_eq!(artifact["inputs"]["chart"], "nginx");
        assert_eq!(artifact["artifacts"]["requirements"]["replicas"], 3);
    }
}
