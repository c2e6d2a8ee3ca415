//! Deployment events and the observers that narrate them.
//!
//! The executor and verification worker never log from their control flow; they emit a
//! [`DeployEvent`] at every phase and attempt boundary and let the observer decide how to
//! present it.

use std::{path::PathBuf, sync::Mutex, time::Duration};

use alloy_core::primitives::{Address, TxHash};
use serde::Serialize;

use crate::verify::VerificationOutcome;

/// Events emitted while a plan is executed, checked and verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEvent {
    PlanStarted {
        plan: String,
        deployer: Address,
        nonce: u64,
        components: usize,
    },
    AddressPredicted {
        name: String,
        address: Address,
        nonce: u64,
        forward_referenced: bool,
    },
    ComponentSubmitted {
        index: usize,
        name: String,
        tx_hash: TxHash,
    },
    ComponentDeployed {
        index: usize,
        name: String,
        address: Address,
    },
    PredictionConfirmed {
        name: String,
        address: Address,
    },
    /// A forward-referenced component landed somewhere other than predicted.
    AddressMismatch {
        name: String,
        predicted: Address,
        actual: Address,
    },
    PlanAborted {
        plan: String,
        index: usize,
        name: String,
        error: String,
        deployed: Vec<(String, Address)>,
    },
    PlanCompleted {
        plan: String,
        deployed: usize,
    },
    LedgerPersisted {
        network: String,
        path: PathBuf,
    },
    /// The ledger could not be written after every creation succeeded.
    LedgerPersistFailed {
        network: String,
        error: String,
        deployed: Vec<(String, Address)>,
    },
    VerificationAttempt {
        name: String,
        attempt: u32,
        max_attempts: u32,
    },
    VerificationRetry {
        name: String,
        attempt: u32,
        error: String,
        delay: Duration,
    },
    VerificationFinished {
        name: String,
        outcome: VerificationOutcome,
    },
}

/// Receives [`DeployEvent`]s.
pub trait DeployObserver: Send + Sync {
    fn notify(&self, event: &DeployEvent);
}

/// Default observer: narrates events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl DeployObserver for TracingObserver {
    fn notify(&self, event: &DeployEvent) {
        match event {
            DeployEvent::PlanStarted {
                plan,
                deployer,
                nonce,
                components,
            } => {
                tracing::info!(
                    plan = %plan,
                    deployer = %deployer,
                    nonce,
                    components,
                    "Starting plan"
                );
            }
            DeployEvent::AddressPredicted {
                name,
                address,
                nonce,
                forward_referenced,
            } => {
                tracing::info!(
                    component = %name,
                    address = %address,
                    nonce,
                    forward_referenced,
                    "Predicted address"
                );
            }
            DeployEvent::ComponentSubmitted {
                index,
                name,
                tx_hash,
            } => {
                tracing::info!(
                    index,
                    component = %name,
                    tx_hash = %tx_hash,
                    "Creation transaction sent"
                );
            }
            DeployEvent::ComponentDeployed {
                index,
                name,
                address,
            } => {
                tracing::info!(
                    index,
                    component = %name,
                    address = %address,
                    "✓ Component deployed"
                );
            }
            DeployEvent::PredictionConfirmed { name, address } => {
                tracing::info!(
                    component = %name,
                    address = %address,
                    "✓ Address matches prediction"
                );
            }
            DeployEvent::AddressMismatch {
                name,
                predicted,
                actual,
            } => {
                tracing::error!(
                    component = %name,
                    predicted = %predicted,
                    actual = %actual,
                    "Address mismatch: the deployer nonce drifted, components embedding the \
                     predicted address are wired to the wrong contract"
                );
            }
            DeployEvent::PlanAborted {
                plan,
                index,
                name,
                error,
                deployed,
            } => {
                tracing::error!(
                    plan = %plan,
                    index,
                    component = %name,
                    error = %error,
                    "Plan aborted"
                );
                for (name, address) in deployed {
                    tracing::error!(
                        component = %name,
                        address = %address,
                        "Deployed before the failure"
                    );
                }
            }
            DeployEvent::PlanCompleted { plan, deployed } => {
                tracing::info!(plan = %plan, deployed, "✓ Plan complete");
            }
            DeployEvent::LedgerPersisted { network, path } => {
                tracing::info!(network = %network, path = %path.display(), "Ledger saved");
            }
            DeployEvent::LedgerPersistFailed {
                network,
                error,
                deployed,
            } => {
                tracing::error!(network = %network, error = %error, "Failed to save the ledger");
                for (name, address) in deployed {
                    tracing::error!(
                        component = %name,
                        address = %address,
                        "Created but not recorded"
                    );
                }
            }
            DeployEvent::VerificationAttempt {
                name,
                attempt,
                max_attempts,
            } => {
                tracing::info!(component = %name, attempt, max_attempts, "Verifying");
            }
            DeployEvent::VerificationRetry {
                name,
                attempt,
                error,
                delay,
            } => {
                tracing::warn!(
                    component = %name,
                    attempt,
                    error = %error,
                    delay_secs = delay.as_secs(),
                    "Verification attempt failed, retrying"
                );
            }
            DeployEvent::VerificationFinished { name, outcome } => match outcome {
                VerificationOutcome::Verified { .. } => {
                    tracing::info!(component = %name, "✓ Verified");
                }
                VerificationOutcome::AlreadyVerified { .. } => {
                    tracing::info!(component = %name, "Already verified");
                }
                VerificationOutcome::ExhaustedFailure {
                    attempts,
                    last_error,
                    remediation,
                } => {
                    tracing::warn!(
                        component = %name,
                        attempts,
                        error = %last_error,
                        "Verification failed"
                    );
                    tracing::warn!("Manual command: {}", remediation);
                }
            },
        }
    }
}

/// Observer that keeps every event, for inspection after a run.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<DeployEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeployEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl DeployObserver for RecordingObserver {
    fn notify(&self, event: &DeployEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
