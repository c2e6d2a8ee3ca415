//! keystone-deploy - Deployment orchestration for interdependent Ethereum contracts.
//!
//! Contracts whose constructors reference each other in a cycle are deployed by predicting
//! the CREATE address of every component up front, from a single snapshot of the deployer
//! nonce. A [`DependencyPlan`] fixes the creation order; the [`DeploymentExecutor`] walks it
//! sequentially, the [`IntegrityChecker`] compares predictions with the addresses actually
//! created, and the [`VerificationWorker`] submits every component for source verification.

mod config;
pub use config::{CONFIG_FILENAME, DeployConfig, ENV_PREFIX, PrivateKey};

mod creation;
pub use creation::{
    ArtifactStore, ConfirmationConfig, HardhatArtifact, RpcCreationService, TransactionSender,
    encode_constructor_args, sign_creation,
};

mod error;
pub use error::{DeployError, DeployResult};

mod executor;
pub use executor::{CreationService, DeploymentExecutor, Execution, PendingCreation};

mod integrity;
pub use integrity::{IntegrityChecker, Mismatch};

mod ledger;
pub use ledger::{
    DeploymentLedger, DeploymentRecord, JsonLedgerStore, LedgerEntry, LedgerSnapshot, LedgerStore,
};

mod observer;
pub use observer::{DeployEvent, DeployObserver, RecordingObserver, TracingObserver};

mod orchestrator;
pub use orchestrator::{
    NetworkSession, Orchestrator, RunReport, check_chain_id, verification_tasks,
};

mod plan;
pub use plan::{
    ArgValue, ComponentDocument, ComponentSpec, DependencyPlan, Param, ParamDocument,
    PlanDocument, UintLiteral,
};

mod predictor;
pub use predictor::{AddressPredictor, DeployerIdentity, PredictedAddress, Predictions};

pub mod rpc;

mod verify;
pub use verify::{
    DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, HardhatVerifier,
    RetryPolicy, Sleeper, Submission, TokioSleeper, VerificationConfig, VerificationOutcome,
    VerificationReport, VerificationService, VerificationState, VerificationTask,
    VerificationWorker, hardhat_verify_command,
};
