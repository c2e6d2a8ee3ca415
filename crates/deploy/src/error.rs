//! Typed errors for the deployment orchestrator.
//!
//! Configuration mistakes (`InvalidOffset`, `PlanInvalid`, `DuplicateComponent`) fail fast and
//! are never retried. `CreationFailure` aborts the whole plan. Integrity mismatches and
//! verification results are reported as data, not through this type.

use thiserror::Error;

/// Errors raised by plan construction, address prediction and plan execution.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Invalid sequence offset {offset} from base nonce {base}")]
    InvalidOffset { base: u64, offset: i64 },

    #[error("Invalid plan '{plan}': {reason}")]
    PlanInvalid { plan: String, reason: String },

    #[error("Component '{name}' is already recorded in the ledger")]
    DuplicateComponent { name: String },

    #[error(
        "Creation of component #{index} '{name}' failed (args: [{}]): {source:#}",
        .args.join(", ")
    )]
    CreationFailure {
        index: usize,
        name: String,
        args: Vec<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    pub(crate) fn plan_invalid(plan: &str, reason: impl Into<String>) -> Self {
        Self::PlanInvalid {
            plan: plan.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias for results produced by the orchestrator core.
pub type DeployResult<T> = Result<T, DeployError>;
