//! keystone deploys contracts whose constructors reference each other, at addresses predicted
//! before the first transaction is sent, and verifies their sources afterwards.

mod cli;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};

use cli::{
    Cli, Command, DeployArgs, InitArgs, Network, NetworkOverrides, PredictArgs, VerifyArgs,
};
use keystone_deploy::{
    ArtifactStore, CONFIG_FILENAME, DependencyPlan, DeployConfig, DeployerIdentity,
    HardhatVerifier, JsonLedgerStore, LedgerStore, NetworkSession, Orchestrator, Predictions,
    RetryPolicy, RpcCreationService, RunReport, VerificationConfig, VerificationOutcome,
    VerificationReport, VerificationWorker, verification_tasks,
};
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        Command::Init(args) => init(&cli.config, args),
        Command::Deploy(args) => deploy(&cli.config, args).await,
        Command::Predict(args) => predict(&cli.config, args).await,
        Command::Verify(args) => verify(&cli.config, args).await,
    }
}

fn init(config_path: &Path, args: InitArgs) -> Result<()> {
    let path = if config_path.is_dir() {
        config_path.join(CONFIG_FILENAME)
    } else {
        config_path.to_path_buf()
    };
    if path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }

    let rpc_url = match args.rpc_url {
        Some(url) => url,
        None => Url::parse(args.network.default_rpc_url())?,
    };
    let mut config = DeployConfig::new(args.network.to_string(), rpc_url);
    if let Some(chain_id) = args.network.to_chain_id() {
        config = config.chain_id(chain_id);
    }
    if let Some(deployer) = args.deployer {
        config = config.deployer(deployer);
    }

    config.save_to_file(&path)
}

/// Load the configuration and apply command-line overrides. Returns the project directory
/// relative paths in the configuration resolve against.
fn load_config(config_path: &Path, overrides: NetworkOverrides) -> Result<(DeployConfig, PathBuf)> {
    let mut config = DeployConfig::load(config_path)?;

    if let Some(network) = overrides.network {
        config.network = network;
    }
    if let Some(rpc_url) = overrides.rpc_url {
        config.rpc_url = rpc_url;
    }
    if let Some(deployer) = overrides.deployer {
        config.deployer = Some(deployer);
    }
    if config.chain_id.is_none() {
        config.chain_id = config
            .network
            .parse::<Network>()
            .ok()
            .and_then(|network| network.to_chain_id());
    }

    let root = if config_path.is_dir() {
        config_path.to_path_buf()
    } else {
        config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    };
    Ok((config, root))
}

fn verification_worker(
    config: &DeployConfig,
    root: &Path,
) -> VerificationWorker<HardhatVerifier> {
    let settings = VerificationConfig {
        project_dir: config.resolve(root, &config.verification.project_dir),
        ..config.verification.clone()
    };

    VerificationWorker::new(HardhatVerifier::new(&config.network, &settings))
        .policy(RetryPolicy::from(&settings))
        .concurrency(settings.concurrency)
}

async fn deploy(config_path: &Path, args: DeployArgs) -> Result<()> {
    let (config, root) = load_config(config_path, args.overrides)?;
    let plan = DependencyPlan::load_from_file(&args.plan)?;

    let session = NetworkSession::connect(&config).await?;
    let identity = session.deployer_identity().await?;

    let creation = RpcCreationService::new(
        session.rpc.clone(),
        ArtifactStore::new(config.resolve(&root, &config.artifacts_dir)),
        session.sender(),
    )
    .confirmation(config.confirmation.clone());
    let store = JsonLedgerStore::new(config.resolve(&root, &config.deployments_dir));

    let mut orchestrator =
        Orchestrator::new(&config.network, session.chain_id, creation, store).fresh(args.fresh);
    if config.verification.enabled && !args.no_verify {
        orchestrator = orchestrator.verifier(verification_worker(&config, &root));
    }

    let report = orchestrator
        .run(&plan, &identity)
        .await
        .with_context(|| format!("Plan '{}' failed", plan.name()))?;

    print_run_report(&report);

    if let Some(error) = &report.persist_error {
        anyhow::bail!(
            "Plan '{}' deployed but the {} ledger was not saved ({error}), record the addresses \
             above by hand",
            report.plan,
            config.network
        );
    }
    Ok(())
}

async fn predict(config_path: &Path, args: PredictArgs) -> Result<()> {
    let (config, _) = load_config(config_path, args.overrides)?;
    let plan = DependencyPlan::load_from_file(&args.plan)?;

    let identity = match (args.nonce, config.deployer) {
        (Some(nonce), Some(deployer)) => DeployerIdentity::new(deployer, nonce),
        _ => {
            NetworkSession::connect(&config)
                .await?
                .deployer_identity()
                .await?
        }
    };

    let predictions = Predictions::compute(&plan, &identity)?;

    if args.json {
        let addresses: serde_json::Map<String, serde_json::Value> = predictions
            .iter()
            .map(|(name, predicted)| (name.to_string(), serde_json::json!(predicted.address)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&addresses)?);
        return Ok(());
    }

    let mut table = new_table(vec![
        "#",
        "Component",
        "Nonce",
        "Predicted address",
        "Forward-referenced",
    ]);
    for (index, component) in plan.components().iter().enumerate() {
        let Some(predicted) = predictions.get(&component.name) else {
            continue;
        };
        table.add_row(vec![
            index.to_string(),
            component.name.clone(),
            predicted.nonce.to_string(),
            predicted.address.to_string(),
            if predictions.is_forward_referenced(&component.name) {
                "yes".to_string()
            } else {
                String::new()
            },
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn verify(config_path: &Path, args: VerifyArgs) -> Result<()> {
    let (config, root) = load_config(config_path, args.overrides)?;

    let store = JsonLedgerStore::new(config.resolve(&root, &config.deployments_dir));
    let snapshot = store
        .load(&config.network)?
        .with_context(|| format!("No ledger recorded for network '{}'", config.network))?;

    let tasks = verification_tasks(&snapshot, &args.components)?;
    let reports = verification_worker(&config, &root).verify_all(tasks).await;

    print_verification(&reports);
    Ok(())
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn print_run_report(report: &RunReport) {
    let mut table = new_table(vec!["#", "Component", "Address", "Prediction"]);
    for (index, record) in report.ledger.records().iter().enumerate() {
        let prediction = if !report.predictions.is_forward_referenced(&record.name) {
            String::new()
        } else if report.mismatches.iter().any(|m| m.name == record.name) {
            "MISMATCH".to_string()
        } else {
            "matched".to_string()
        };
        table.add_row(vec![
            index.to_string(),
            record.name.clone(),
            record.address.to_string(),
            prediction,
        ]);
    }
    println!("{table}");

    for mismatch in &report.mismatches {
        tracing::error!(
            component = %mismatch.name,
            predicted = %mismatch.predicted,
            actual = %mismatch.actual,
            "Components built against the predicted address must be redeployed"
        );
    }

    if let Some(path) = &report.ledger_path {
        tracing::info!(
            path = %path.display(),
            components = report.snapshot.contracts.len(),
            "Ledger written"
        );
    }

    if !report.verification.is_empty() {
        print_verification(&report.verification);
    }
}

fn print_verification(reports: &[VerificationReport]) {
    let mut table = new_table(vec!["Component", "Address", "Verification", "Attempts"]);
    for report in reports {
        let status = match &report.outcome {
            VerificationOutcome::Verified { .. } => "verified",
            VerificationOutcome::AlreadyVerified { .. } => "already verified",
            VerificationOutcome::ExhaustedFailure { .. } => "FAILED",
        };
        table.add_row(vec![
            report.name.clone(),
            report.address.to_string(),
            status.to_string(),
            report.outcome.attempts().to_string(),
        ]);
    }
    println!("{table}");

    let failures: Vec<&str> = reports
        .iter()
        .filter_map(|report| match &report.outcome {
            VerificationOutcome::ExhaustedFailure { remediation, .. } => Some(remediation.as_str()),
            _ => None,
        })
        .collect();
    if !failures.is_empty() {
        tracing::warn!(
            count = failures.len(),
            "Some components could not be verified, run manually:"
        );
        for command in failures {
            println!("  {command}");
        }
    }
}
