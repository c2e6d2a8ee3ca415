//! Integration tests for keystone-deploy.
//!
//! Plans from `plans/` are run end to end against an in-memory chain that assigns CREATE
//! addresses from its own nonce counter, with ledgers written to a temporary directory.
//! Run with: cargo test --test orchestrator_test

use std::{
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_core::primitives::{Address, address, keccak256};
use keystone_deploy::{
    ArgValue, ComponentSpec, CreationService, DependencyPlan, DeployError, DeployEvent,
    DeployerIdentity, JsonLedgerStore, LedgerSnapshot, LedgerStore, Orchestrator,
    PendingCreation, RecordingObserver, Sleeper, Submission, VerificationOutcome,
    VerificationService, VerificationTask, VerificationWorker, hardhat_verify_command,
};
use rand::Rng;
use tempdir::TempDir;

const DEPLOYER: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
const NETWORK: &str = "sepolia";
const CHAIN_ID: u64 = 11155111;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Random starting nonce, so no test depends on a particular nonce value.
fn random_nonce() -> u64 {
    rand::rng().random_range(0..=10_000)
}

fn plan_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../plans")
        .join(format!("{name}.toml"))
}

fn load_plan(name: &str) -> DependencyPlan {
    DependencyPlan::load_from_file(&plan_path(name)).expect("Failed to load plan")
}

/// In-memory chain: every confirmed creation consumes the next nonce of the deployer.
struct StubChain {
    nonce: Mutex<u64>,
    /// Component whose creation lands at a fixed address instead of its CREATE address.
    redirect: Option<(&'static str, Address)>,
    fail_on: Option<&'static str>,
    submitted: Mutex<Vec<(String, Vec<ArgValue>)>>,
}

impl StubChain {
    fn new(nonce: u64) -> Self {
        Self {
            nonce: Mutex::new(nonce),
            redirect: None,
            fail_on: None,
            submitted: Mutex::new(Vec::new()),
        }
    }

    fn submitted(&self) -> Vec<(String, Vec<ArgValue>)> {
        self.submitted.lock().unwrap().clone()
    }

    fn args_of(&self, name: &str) -> Vec<ArgValue> {
        self.submitted()
            .into_iter()
            .find(|(submitted, _)| submitted == name)
            .map(|(_, args)| args)
            .unwrap_or_default()
    }
}

impl CreationService for StubChain {
    async fn submit(
        &self,
        component: &ComponentSpec,
        args: &[ArgValue],
        _nonce: u64,
    ) -> anyhow::Result<PendingCreation> {
        self.submitted
            .lock()
            .unwrap()
            .push((component.name.clone(), args.to_vec()));
        Ok(PendingCreation {
            component: component.name.clone(),
            tx_hash: keccak256(component.name.as_bytes()),
        })
    }

    async fn await_confirmation(&self, pending: PendingCreation) -> anyhow::Result<Address> {
        let mut nonce = self.nonce.lock().unwrap();
        let address = DEPLOYER.create(*nonce);
        *nonce += 1;

        if self.fail_on == Some(pending.component.as_str()) {
            anyhow::bail!("transaction {} reverted", pending.tx_hash);
        }
        match self.redirect {
            Some((name, redirected)) if name == pending.component => Ok(redirected),
            _ => Ok(address),
        }
    }
}

/// Verification service that succeeds on the second attempt for every component.
#[derive(Default)]
struct EventuallyVerified {
    attempts: Mutex<Vec<String>>,
}

impl VerificationService for EventuallyVerified {
    async fn submit(&self, task: &VerificationTask) -> anyhow::Result<Submission> {
        self.attempts.lock().unwrap().push(task.name.clone());
        if task.attempt_count < 2 {
            anyhow::bail!("Unable to locate ContractCode at {}", task.address);
        }
        Ok(Submission::Verified)
    }

    fn remediation_command(&self, task: &VerificationTask) -> String {
        hardhat_verify_command("npx", NETWORK, task)
    }
}

/// Ledger store whose writes always fail.
struct ReadOnlyStore;

impl LedgerStore for ReadOnlyStore {
    fn load(&self, _network: &str) -> anyhow::Result<Option<LedgerSnapshot>> {
        Ok(None)
    }

    fn save(&self, _snapshot: &LedgerSnapshot) -> anyhow::Result<PathBuf> {
        anyhow::bail!("read-only file system")
    }
}

struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}

#[tokio::test]
async fn test_core_plan_lands_at_predicted_addresses() {
    init_tracing();
    let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
    let nonce = random_nonce();
    let identity = DeployerIdentity::new(DEPLOYER, nonce);
    let observer = Arc::new(RecordingObserver::new());

    let orchestrator = Orchestrator::new(
        NETWORK,
        CHAIN_ID,
        StubChain::new(nonce),
        JsonLedgerStore::new(temp_dir.path()),
    )
    .observer(observer.clone());

    let report = orchestrator
        .run(&load_plan("core"), &identity)
        .await
        .expect("Core plan should deploy");

    assert!(report.mismatches.is_empty(), "{:?}", report.mismatches);

    // The Vault is the fourth creation of the run.
    let vault = identity.predict(3).unwrap();
    assert_eq!(report.ledger.address_of("Vault"), Some(vault));

    let chain = orchestrator.creation_service();
    for name in ["VaultAdmin", "VaultExtension", "ProtocolFeeController"] {
        assert_eq!(chain.args_of(name)[0], ArgValue::Address(vault), "{name}");
    }
    assert_eq!(
        chain.args_of("Vault"),
        vec![
            ArgValue::Address(identity.predict(1).unwrap()),
            ArgValue::Address(DEPLOYER),
            ArgValue::Address(identity.predict(2).unwrap()),
        ]
    );

    // The ledger is persisted with rendered arguments.
    let snapshot = JsonLedgerStore::new(temp_dir.path())
        .load(NETWORK)
        .unwrap()
        .expect("Ledger should be persisted");
    assert_eq!(snapshot.chain_id, CHAIN_ID);
    assert_eq!(snapshot.contracts.len(), 4);
    assert_eq!(
        snapshot.contracts["VaultAdmin"].args[1..],
        ["7776000", "2592000", "1000000000000", "1000000000000"]
    );
    assert_eq!(
        snapshot.contracts["ProtocolFeeController"].args[1..],
        ["5000000000000000", "5000000000000000"]
    );

    let events = observer.events();
    assert!(events.iter().any(|e| matches!(
        e,
        DeployEvent::PredictionConfirmed { name, .. } if name == "Vault"
    )));
    assert!(events.iter().any(|e| matches!(e, DeployEvent::LedgerPersisted { .. })));
}

#[tokio::test]
async fn test_core_plan_reports_vault_mismatch() {
    init_tracing();
    let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
    let nonce = random_nonce();
    let identity = DeployerIdentity::new(DEPLOYER, nonce);
    let elsewhere = address!("00000000219ab540356cBB839Cbe05303d7705Fa");

    let mut chain = StubChain::new(nonce);
    chain.redirect = Some(("Vault", elsewhere));

    let report = Orchestrator::new(NETWORK, CHAIN_ID, chain, JsonLedgerStore::new(temp_dir.path()))
        .run(&load_plan("core"), &identity)
        .await
        .expect("A mismatch is not fatal");

    assert_eq!(report.mismatches.len(), 1);
    let mismatch = &report.mismatches[0];
    assert_eq!(mismatch.name, "Vault");
    assert_eq!(mismatch.predicted, identity.predict(3).unwrap());
    assert_eq!(mismatch.actual, elsewhere);

    // What was created is still recorded.
    assert_eq!(report.snapshot.address_of("Vault"), Some(elsewhere));
    assert!(report.ledger_path.as_ref().is_some_and(|path| path.exists()));
    assert!(report.persist_error.is_none());
}

#[tokio::test]
async fn test_follow_up_plan_uses_recorded_vault() {
    let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
    let nonce = random_nonce();
    let store = JsonLedgerStore::new(temp_dir.path());

    let core = Orchestrator::new(NETWORK, CHAIN_ID, StubChain::new(nonce), store.clone())
        .run(&load_plan("core"), &DeployerIdentity::new(DEPLOYER, nonce))
        .await
        .unwrap();
    let vault = core.ledger.address_of("Vault").unwrap();

    let next = nonce + 4;
    let routers = Orchestrator::new(NETWORK, CHAIN_ID, StubChain::new(next), store.clone());
    let report = routers
        .run(&load_plan("routers"), &DeployerIdentity::new(DEPLOYER, next))
        .await
        .unwrap();

    assert_eq!(report.ledger.len(), 4);
    for (_, args) in routers.creation_service().submitted() {
        assert_eq!(args[0], ArgValue::Address(vault));
        assert_eq!(args[3], ArgValue::String("v1.0.0".to_string()));
    }

    // Both plans share the network ledger.
    let snapshot = store.load(NETWORK).unwrap().unwrap();
    assert_eq!(snapshot.contracts.len(), 8);
    assert_eq!(snapshot.address_of("Vault"), Some(vault));
}

#[tokio::test]
async fn test_rerun_is_refused_before_any_transaction() {
    let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
    let store = JsonLedgerStore::new(temp_dir.path());
    let identity = DeployerIdentity::new(DEPLOYER, 0);

    Orchestrator::new(NETWORK, CHAIN_ID, StubChain::new(0), store.clone())
        .run(&load_plan("core"), &identity)
        .await
        .unwrap();

    let rerun = Orchestrator::new(NETWORK, CHAIN_ID, StubChain::new(4), store.clone());
    let err = rerun
        .run(&load_plan("core"), &DeployerIdentity::new(DEPLOYER, 4))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::DuplicateComponent { ref name } if name == "VaultAdmin"));
    assert!(rerun.creation_service().submitted().is_empty());

    // A fresh run replaces the ledger instead of merging into it.
    let fresh = Orchestrator::new(NETWORK, CHAIN_ID, StubChain::new(4), store.clone()).fresh(true);
    let report = fresh
        .run(&load_plan("core"), &DeployerIdentity::new(DEPLOYER, 4))
        .await
        .unwrap();
    assert_eq!(report.snapshot.contracts.len(), 4);
    assert_eq!(
        report.snapshot.address_of("Vault"),
        Some(DeployerIdentity::new(DEPLOYER, 4).predict(3).unwrap())
    );
}

#[tokio::test]
async fn test_creation_failure_persists_nothing() {
    let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
    let store = JsonLedgerStore::new(temp_dir.path());

    let mut chain = StubChain::new(0);
    chain.fail_on = Some("ProtocolFeeController");

    let orchestrator = Orchestrator::new(NETWORK, CHAIN_ID, chain, store.clone());
    let err = orchestrator
        .run(&load_plan("core"), &DeployerIdentity::new(DEPLOYER, 0))
        .await
        .unwrap_err();

    let DeployError::CreationFailure {
        index, name, args, ..
    } = err
    else {
        panic!("expected a creation failure");
    };
    assert_eq!(index, 2);
    assert_eq!(name, "ProtocolFeeController");
    assert_eq!(args.len(), 3);

    // The Vault was never attempted and no ledger was written.
    assert!(
        !orchestrator
            .creation_service()
            .submitted()
            .iter()
            .any(|(name, _)| name == "Vault")
    );
    assert!(store.load(NETWORK).unwrap().is_none());
}

#[tokio::test]
async fn test_save_failure_still_reports_created_components() {
    init_tracing();
    let nonce = random_nonce();
    let identity = DeployerIdentity::new(DEPLOYER, nonce);
    let observer = Arc::new(RecordingObserver::new());
    let worker = VerificationWorker::with_sleeper(EventuallyVerified::default(), InstantSleeper);

    let report = Orchestrator::new(NETWORK, CHAIN_ID, StubChain::new(nonce), ReadOnlyStore)
        .verifier(worker)
        .observer(observer.clone())
        .run(&load_plan("core"), &identity)
        .await
        .expect("Components were created, the run must still report them");

    assert!(report.ledger_path.is_none());
    assert!(report.persist_error.as_deref().unwrap().contains("read-only"));
    assert_eq!(report.ledger.len(), 4);
    assert_eq!(report.ledger.address_of("Vault"), Some(identity.predict(3).unwrap()));
    assert_eq!(report.verification.len(), 4);

    assert!(observer.events().iter().any(|e| matches!(
        e,
        DeployEvent::LedgerPersistFailed { deployed, .. } if deployed.len() == 4
    )));
}

#[tokio::test]
async fn test_run_verifies_every_created_component() {
    init_tracing();
    let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
    let identity = DeployerIdentity::new(DEPLOYER, 7);

    let worker = VerificationWorker::with_sleeper(EventuallyVerified::default(), InstantSleeper)
        .concurrency(2);
    let report = Orchestrator::new(
        NETWORK,
        CHAIN_ID,
        StubChain::new(7),
        JsonLedgerStore::new(temp_dir.path()),
    )
    .verifier(worker)
    .run(&load_plan("factories"), &identity)
    .await;

    // The factories plan depends on a recorded Vault, absent from an empty ledger.
    assert!(matches!(report, Err(DeployError::PlanInvalid { .. })));

    let worker = VerificationWorker::with_sleeper(EventuallyVerified::default(), InstantSleeper);
    let report = Orchestrator::new(
        NETWORK,
        CHAIN_ID,
        StubChain::new(7),
        JsonLedgerStore::new(temp_dir.path()),
    )
    .verifier(worker)
    .run(&load_plan("core"), &identity)
    .await
    .unwrap();

    assert_eq!(report.verification.len(), 4);
    assert_eq!(report.verification_failures().count(), 0);
    for verification in &report.verification {
        assert_eq!(verification.outcome, VerificationOutcome::Verified { attempts: 2 });
    }
}

#[test]
fn test_bundled_plans_are_valid() {
    for name in ["core", "routers", "factories", "advanced-factories"] {
        let plan = load_plan(name);
        assert_eq!(plan.name(), name);
        assert_eq!(plan.len(), 4, "{name}");
    }

    let core = load_plan("core");
    assert_eq!(
        core.forward_references().into_iter().collect::<Vec<_>>(),
        vec!["Vault"]
    );

    let factories = load_plan("factories");
    assert_eq!(
        factories.get("Gyro2CLPPoolFactory").unwrap().contract.as_deref(),
        Some("pkg-vault-only/pool-factories/Gyro2CLPPoolFactory.sol:Gyro2CLPPoolFactory")
    );
}
