//! Sequential plan execution.
//!
//! Components are created strictly in plan order, one transaction at a time: component `N` may
//! need the confirmed address of component `N - 1`. The first failed creation aborts the plan.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use alloy_core::primitives::{Address, TxHash};

use crate::{
    error::{DeployError, DeployResult},
    ledger::{DeploymentLedger, DeploymentRecord},
    observer::{DeployEvent, DeployObserver, TracingObserver},
    plan::{ArgValue, ComponentSpec, DependencyPlan, Param},
    predictor::{DeployerIdentity, Predictions},
};

/// Handle to a submitted, not yet confirmed creation transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCreation {
    pub component: String,
    pub tx_hash: TxHash,
}

/// The external service that sends creation transactions.
pub trait CreationService: Send + Sync {
    /// Submit one creation transaction for `component` with fully resolved arguments.
    ///
    /// `nonce` is the deployer nonce the transaction must use: the snapshot plus the
    /// component's offset in the plan.
    fn submit(
        &self,
        component: &ComponentSpec,
        args: &[ArgValue],
        nonce: u64,
    ) -> impl Future<Output = anyhow::Result<PendingCreation>> + Send;

    /// Block until the transaction is confirmed and return the created address.
    fn await_confirmation(
        &self,
        pending: PendingCreation,
    ) -> impl Future<Output = anyhow::Result<Address>> + Send;
}

impl<T: CreationService> CreationService for &T {
    fn submit(
        &self,
        component: &ComponentSpec,
        args: &[ArgValue],
        nonce: u64,
    ) -> impl Future<Output = anyhow::Result<PendingCreation>> + Send {
        (**self).submit(component, args, nonce)
    }

    fn await_confirmation(
        &self,
        pending: PendingCreation,
    ) -> impl Future<Output = anyhow::Result<Address>> + Send {
        (**self).await_confirmation(pending)
    }
}

/// Result of a successful plan execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub ledger: DeploymentLedger,
    pub predictions: Predictions,
}

/// Walks a [`DependencyPlan`] and creates each component through a [`CreationService`].
pub struct DeploymentExecutor<C> {
    creation: C,
    recorded: BTreeMap<String, Address>,
    observer: Arc<dyn DeployObserver>,
}

impl<C: CreationService> DeploymentExecutor<C> {
    pub fn new(creation: C) -> Self {
        Self {
            creation,
            recorded: BTreeMap::new(),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Addresses recorded by earlier plans, resolvable through [`Param::Recorded`].
    pub fn recorded(mut self, recorded: BTreeMap<String, Address>) -> Self {
        self.recorded = recorded;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DeployObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn creation_service(&self) -> &C {
        &self.creation
    }

    /// Execute `plan` from `deployer`'s current nonce.
    ///
    /// Predictions are computed once, before any transaction is sent. A failed creation
    /// returns [`DeployError::CreationFailure`] and no further component is attempted.
    /// Re-running after a failure needs a fresh nonce snapshot: the failed attempt may have
    /// consumed nonces and invalidated the earlier predictions.
    pub async fn execute(
        &self,
        plan: &DependencyPlan,
        deployer: &DeployerIdentity,
    ) -> DeployResult<Execution> {
        if let Some(missing) = plan
            .recorded_references()
            .into_iter()
            .find(|name| !self.recorded.contains_key(*name))
        {
            return Err(DeployError::PlanInvalid {
                plan: plan.name().to_string(),
                reason: format!("'{missing}' is not recorded in the network ledger"),
            });
        }

        let predictions = Predictions::compute(plan, deployer)?;

        self.observer.notify(&DeployEvent::PlanStarted {
            plan: plan.name().to_string(),
            deployer: deployer.address,
            nonce: deployer.nonce,
            components: plan.len(),
        });
        for (name, predicted) in predictions.iter() {
            self.observer.notify(&DeployEvent::AddressPredicted {
                name: name.to_string(),
                address: predicted.address,
                nonce: predicted.nonce,
                forward_referenced: predictions.is_forward_referenced(name),
            });
        }

        let mut ledger = DeploymentLedger::new();

        for (index, component) in plan.components().iter().enumerate() {
            let args = self.resolve(component, &ledger, &predictions, deployer)?;
            let nonce = predictions
                .get(&component.name)
                .map(|predicted| predicted.nonce)
                .ok_or_else(|| missing_nonce(component))?;

            let address = match self.create(index, component, &args, nonce).await {
                Ok(address) => address,
                Err(source) => {
                    self.observer.notify(&DeployEvent::PlanAborted {
                        plan: plan.name().to_string(),
                        index,
                        name: component.name.clone(),
                        error: format!("{source:#}"),
                        deployed: ledger
                            .records()
                            .iter()
                            .map(|r| (r.name.clone(), r.address))
                            .collect(),
                    });
                    return Err(DeployError::CreationFailure {
                        index,
                        name: component.name.clone(),
                        args: args.iter().map(ToString::to_string).collect(),
                        source,
                    });
                }
            };

            self.observer.notify(&DeployEvent::ComponentDeployed {
                index,
                name: component.name.clone(),
                address,
            });

            if predictions.is_forward_referenced(&component.name) {
                self.check_prediction(&component.name, address, &predictions);
            }

            ledger.insert(DeploymentRecord {
                name: component.name.clone(),
                address,
                args,
                contract: component.contract.clone(),
            })?;
        }

        self.observer.notify(&DeployEvent::PlanCompleted {
            plan: plan.name().to_string(),
            deployed: ledger.len(),
        });

        Ok(Execution {
            ledger,
            predictions,
        })
    }

    async fn create(
        &self,
        index: usize,
        component: &ComponentSpec,
        args: &[ArgValue],
        nonce: u64,
    ) -> anyhow::Result<Address> {
        let pending = self.creation.submit(component, args, nonce).await?;
        self.observer.notify(&DeployEvent::ComponentSubmitted {
            index,
            name: component.name.clone(),
            tx_hash: pending.tx_hash,
        });
        self.creation.await_confirmation(pending).await
    }

    fn resolve(
        &self,
        component: &ComponentSpec,
        ledger: &DeploymentLedger,
        predictions: &Predictions,
        deployer: &DeployerIdentity,
    ) -> DeployResult<Vec<ArgValue>> {
        // Plan validation guarantees every lookup below succeeds; a miss is a bug, not a
        // recoverable condition.
        let unresolved = |target: &str| {
            DeployError::Other(anyhow::anyhow!(
                "Unresolved reference to '{target}' while deploying '{}'",
                component.name
            ))
        };

        component
            .params
            .iter()
            .map(|param| -> DeployResult<ArgValue> {
                Ok(match param {
                    Param::Literal(value) => value.clone(),
                    Param::Predicted(target) => predictions
                        .get(target)
                        .map(|p| ArgValue::Address(p.address))
                        .ok_or_else(|| unresolved(target))?,
                    Param::Actual(target) => ledger
                        .address_of(target)
                        .map(ArgValue::Address)
                        .ok_or_else(|| unresolved(target))?,
                    Param::Recorded(target) => self
                        .recorded
                        .get(target)
                        .copied()
                        .map(ArgValue::Address)
                        .ok_or_else(|| unresolved(target))?,
                    Param::Deployer => ArgValue::Address(deployer.address),
                })
            })
            .collect()
    }

    fn check_prediction(&self, name: &str, actual: Address, predictions: &Predictions) {
        let Some(predicted) = predictions.get(name) else {
            return;
        };

        if predicted.address == actual {
            self.observer.notify(&DeployEvent::PredictionConfirmed {
                name: name.to_string(),
                address: actual,
            });
        } else {
            self.observer.notify(&DeployEvent::AddressMismatch {
                name: name.to_string(),
                predicted: predicted.address,
                actual,
            });
        }
    }
}

fn missing_nonce(component: &ComponentSpec) -> DeployError {
    DeployError::Other(anyhow::anyhow!("No predicted nonce for '{}'", component.name))
}
