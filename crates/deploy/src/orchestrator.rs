//! End-to-end runs: plan execution, integrity check, ledger persistence and verification.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use alloy_core::primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;

use crate::{
    config::DeployConfig,
    creation::TransactionSender,
    error::{DeployError, DeployResult},
    executor::{CreationService, DeploymentExecutor},
    integrity::{IntegrityChecker, Mismatch},
    ledger::{DeploymentLedger, LedgerSnapshot, LedgerStore},
    observer::{DeployEvent, DeployObserver, TracingObserver},
    plan::DependencyPlan,
    predictor::{DeployerIdentity, Predictions},
    rpc::RpcClient,
    verify::{
        HardhatVerifier, Sleeper, TokioSleeper, VerificationReport, VerificationService,
        VerificationTask, VerificationWorker,
    },
};

/// Fail unless the node's chain id matches the configured one. Nothing is checked when no
/// chain id is configured.
pub fn check_chain_id(config: &DeployConfig, reported: u64) -> anyhow::Result<()> {
    match config.chain_id {
        Some(expected) if expected != reported => anyhow::bail!(
            "Chain id mismatch for network '{}': configured {expected}, node reports {reported}",
            config.network
        ),
        _ => Ok(()),
    }
}

/// A connection to the target network, with the deployer account resolved.
#[derive(Debug, Clone)]
pub struct NetworkSession {
    pub rpc: RpcClient,
    pub chain_id: u64,
    pub deployer: Address,
    /// Local signer of the deployer. `None` when the node holds the account.
    pub signer: Option<PrivateKeySigner>,
}

impl NetworkSession {
    /// Connect to `config.rpc_url`, check the chain id and resolve the deployer account.
    ///
    /// Runs before any transaction: a chain id mismatch aborts here.
    pub async fn connect(config: &DeployConfig) -> anyhow::Result<Self> {
        let signer = config.signer()?;
        let rpc = RpcClient::new(config.rpc_url.clone())?;

        let chain_id = rpc
            .chain_id()
            .await
            .with_context(|| format!("Failed to reach {}", config.rpc_url))?;
        check_chain_id(config, chain_id)?;

        let deployer = match (&signer, config.deployer) {
            (Some(signer), Some(deployer)) if signer.address() != deployer => anyhow::bail!(
                "The private key belongs to {}, not to the configured deployer {deployer}",
                signer.address()
            ),
            (Some(signer), _) => signer.address(),
            (None, Some(deployer)) => deployer,
            (None, None) => {
                let accounts = rpc.accounts().await?;
                accounts.first().copied().context(
                    "The node exposes no unlocked account, set KEYSTONE_PRIVATE_KEY or `deployer`",
                )?
            }
        };

        tracing::info!(
            network = %config.network,
            chain_id,
            deployer = %deployer,
            "Connected"
        );

        Ok(Self {
            rpc,
            chain_id,
            deployer,
            signer,
        })
    }

    /// How creation transactions are sent from the deployer.
    pub fn sender(&self) -> TransactionSender {
        match &self.signer {
            Some(signer) => TransactionSender::Local {
                signer: signer.clone(),
                chain_id: self.chain_id,
            },
            None => TransactionSender::Unlocked(self.deployer),
        }
    }

    /// Snapshot the deployer's next nonce. Every prediction of a run derives from this value.
    pub async fn deployer_identity(&self) -> anyhow::Result<DeployerIdentity> {
        let nonce = self
            .rpc
            .transaction_count(self.deployer)
            .await
            .context("Failed to read the deployer nonce")?;
        Ok(DeployerIdentity::new(self.deployer, nonce))
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub plan: String,
    pub ledger: DeploymentLedger,
    pub predictions: Predictions,
    pub mismatches: Vec<Mismatch>,
    /// The network ledger, including components from earlier runs.
    pub snapshot: LedgerSnapshot,
    /// Where the ledger was written. `None` when saving it failed.
    pub ledger_path: Option<PathBuf>,
    /// Why the ledger could not be saved. The created components are still in `ledger`.
    pub persist_error: Option<String>,
    /// Empty when verification is disabled.
    pub verification: Vec<VerificationReport>,
}

impl RunReport {
    pub fn verification_failures(&self) -> impl Iterator<Item = &VerificationReport> {
        self.verification.iter().filter(|r| !r.outcome.is_success())
    }
}

/// Runs plans against one network.
pub struct Orchestrator<C, L, V = HardhatVerifier, S = TokioSleeper> {
    network: String,
    chain_id: u64,
    creation: C,
    store: L,
    verifier: Option<VerificationWorker<V, S>>,
    observer: Arc<dyn DeployObserver>,
    fresh: bool,
}

impl<C: CreationService, L: LedgerStore> Orchestrator<C, L> {
    pub fn new(network: impl Into<String>, chain_id: u64, creation: C, store: L) -> Self {
        Self {
            network: network.into(),
            chain_id,
            creation,
            store,
            verifier: None,
            observer: Arc::new(TracingObserver),
            fresh: false,
        }
    }
}

impl<C, L, V, S> Orchestrator<C, L, V, S>
where
    C: CreationService,
    L: LedgerStore,
    V: VerificationService,
    S: Sleeper,
{
    /// Verify every component created by a run.
    pub fn verifier<V2: VerificationService, S2: Sleeper>(
        self,
        worker: VerificationWorker<V2, S2>,
    ) -> Orchestrator<C, L, V2, S2> {
        Orchestrator {
            network: self.network,
            chain_id: self.chain_id,
            creation: self.creation,
            store: self.store,
            verifier: Some(worker.observer(self.observer.clone())),
            observer: self.observer,
            fresh: self.fresh,
        }
    }

    pub fn observer(mut self, observer: Arc<dyn DeployObserver>) -> Self {
        self.verifier = self.verifier.map(|worker| worker.observer(observer.clone()));
        self.observer = observer;
        self
    }

    /// Ignore the persisted ledger and overwrite it with this run's components.
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn creation_service(&self) -> &C {
        &self.creation
    }

    /// Execute `plan` from `deployer`, check integrity, persist the ledger and verify.
    ///
    /// A creation failure returns before anything is persisted. Mismatches, a failure to save
    /// the ledger and verification failures are reported in the [`RunReport`] and never turn
    /// the run into an error: every component it lists already exists on chain.
    pub async fn run(
        &self,
        plan: &DependencyPlan,
        deployer: &DeployerIdentity,
    ) -> DeployResult<RunReport> {
        let prior = if self.fresh {
            None
        } else {
            self.store.load(&self.network)?
        };

        // A name already in the network ledger would be overwritten. Refuse before any
        // transaction is sent.
        if let Some(component) = plan.components().iter().find(|c| {
            prior
                .as_ref()
                .is_some_and(|prior| prior.contracts.contains_key(&c.name))
        }) {
            return Err(DeployError::DuplicateComponent {
                name: component.name.clone(),
            });
        }

        let recorded: BTreeMap<String, Address> = prior
            .iter()
            .flat_map(|snapshot| snapshot.contracts.iter())
            .map(|(name, entry)| (name.clone(), entry.address))
            .collect();

        let execution = DeploymentExecutor::new(&self.creation)
            .recorded(recorded)
            .observer(self.observer.clone())
            .execute(plan, deployer)
            .await?;

        let mismatches = IntegrityChecker::verify(&execution.ledger, &execution.predictions);

        let mut snapshot =
            prior.unwrap_or_else(|| LedgerSnapshot::empty(&self.network, self.chain_id));
        snapshot.merge(execution.ledger.snapshot(&self.network, self.chain_id))?;
        let (ledger_path, persist_error) = match self.store.save(&snapshot) {
            Ok(path) => {
                self.observer.notify(&DeployEvent::LedgerPersisted {
                    network: self.network.clone(),
                    path: path.clone(),
                });
                (Some(path), None)
            }
            Err(error) => {
                let error = format!("{error:#}");
                self.observer.notify(&DeployEvent::LedgerPersistFailed {
                    network: self.network.clone(),
                    error: error.clone(),
                    deployed: execution
                        .ledger
                        .records()
                        .iter()
                        .map(|r| (r.name.clone(), r.address))
                        .collect(),
                });
                (None, Some(error))
            }
        };

        let verification = match &self.verifier {
            Some(worker) => {
                let tasks = execution
                    .ledger
                    .records()
                    .iter()
                    .map(VerificationTask::from_record)
                    .collect();
                worker.verify_all(tasks).await
            }
            None => Vec::new(),
        };

        Ok(RunReport {
            plan: plan.name().to_string(),
            ledger: execution.ledger,
            predictions: execution.predictions,
            mismatches,
            snapshot,
            ledger_path,
            persist_error,
            verification,
        })
    }
}

/// Verification tasks for the components of `snapshot`, restricted to `only` when non-empty.
pub fn verification_tasks(
    snapshot: &LedgerSnapshot,
    only: &[String],
) -> DeployResult<Vec<VerificationTask>> {
    if let Some(unknown) = only
        .iter()
        .find(|name| !snapshot.contracts.contains_key(name.as_str()))
    {
        return Err(DeployError::Other(anyhow::anyhow!(
            "'{unknown}' is not recorded in the {} ledger",
            snapshot.network
        )));
    }

    Ok(snapshot
        .contracts
        .iter()
        .filter(|(name, _)| only.is_empty() || only.contains(name))
        .map(|(name, entry)| VerificationTask::from_entry(name, entry))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerEntry;
    use alloy_core::primitives::address;

    fn snapshot() -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::empty("sepolia", 11155111);
        for (name, address) in [
            ("Vault", address!("0000000000000000000000000000000000000001")),
            ("Router", address!("0000000000000000000000000000000000000002")),
        ] {
            snapshot.contracts.insert(
                name.to_string(),
                LedgerEntry {
                    address,
                    args: vec!["1".to_string()],
                    contract: None,
                },
            );
        }
        snapshot
    }

    #[test]
    fn test_verification_tasks_all_and_filtered() {
        let snapshot = snapshot();

        let all = verification_tasks(&snapshot, &[]).unwrap();
        assert_eq!(all.len(), 2);

        let only = verification_tasks(&snapshot, &["Router".to_string()]).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name, "Router");
        assert_eq!(only[0].constructor_args, vec!["1".to_string()]);
        assert_eq!(only[0].attempt_count, 0);
    }

    #[test]
    fn test_chain_id_check() {
        let url = url::Url::parse("https://ethereum-sepolia-rpc.publicnode.com").unwrap();

        let config = DeployConfig::new("sepolia", url.clone()).chain_id(11155111);
        assert!(check_chain_id(&config, 11155111).is_ok());
        let err = check_chain_id(&config, 1).unwrap_err();
        assert!(err.to_string().contains("configured 11155111, node reports 1"));

        // Custom networks accept whatever the node reports.
        assert!(check_chain_id(&DeployConfig::new("holesky", url), 17000).is_ok());
    }

    #[test]
    fn test_verification_tasks_unknown_name() {
        assert!(verification_tasks(&snapshot(), &["BatchRouter".to_string()]).is_err());
    }
}
