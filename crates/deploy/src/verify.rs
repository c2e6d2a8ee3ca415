//! Source verification of deployed components.
//!
//! Each component is verified independently by a small state machine:
//!
//! ```text
//! Waiting(initial delay) -> Pending -> Verified
//!                                   -> AlreadyVerified
//!                                   -> Waiting(retry delay) -> Pending ...
//!                                   -> ExhaustedFailure
//! ```
//!
//! Failures are reported with a manual remediation command and never abort the run.

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use alloy_core::primitives::Address;
use anyhow::Context;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};

use crate::{
    ledger::{DeploymentRecord, LedgerEntry},
    observer::{DeployEvent, DeployObserver, TracingObserver},
};

/// Default number of verification attempts per component.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Delay before the first attempt, so the verification service can index the new contract.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(10);
/// Delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Configuration for the verification stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Whether deployed components are verified after a run.
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_secs: u64,
    pub retry_delay_secs: u64,
    /// How many components are verified at the same time.
    pub concurrency: usize,
    /// Case-insensitive phrases identifying an "already verified" response.
    pub already_verified_phrases: Vec<String>,
    /// Program used to run the Hardhat CLI.
    pub command: String,
    /// Hardhat project directory.
    pub project_dir: PathBuf,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_secs: DEFAULT_INITIAL_DELAY.as_secs(),
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            concurrency: 4,
            already_verified_phrases: default_already_verified_phrases(),
            command: "npx".to_string(),
            project_dir: PathBuf::from("."),
        }
    }
}

fn default_already_verified_phrases() -> Vec<String> {
    vec![
        "already verified".to_string(),
        "already been verified".to_string(),
    ]
}

/// Retry policy applied to each verification task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub retry_delay: Duration,
    pub already_verified_phrases: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            retry_delay: DEFAULT_RETRY_DELAY,
            already_verified_phrases: default_already_verified_phrases(),
        }
    }
}

impl From<&VerificationConfig> for RetryPolicy {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            already_verified_phrases: config
                .already_verified_phrases
                .iter()
                .map(|phrase| phrase.to_lowercase())
                .collect(),
        }
    }
}

/// One component to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationTask {
    pub name: String,
    pub address: Address,
    /// Constructor arguments rendered as literal text.
    pub constructor_args: Vec<String>,
    /// Fully-qualified source identifier, for same-named contracts in different files.
    pub contract: Option<String>,
    pub attempt_count: u32,
}

impl VerificationTask {
    pub fn from_record(record: &DeploymentRecord) -> Self {
        Self {
            name: record.name.clone(),
            address: record.address,
            constructor_args: record.rendered_args(),
            contract: record.contract.clone(),
            attempt_count: 0,
        }
    }

    pub fn from_entry(name: &str, entry: &LedgerEntry) -> Self {
        Self {
            name: name.to_string(),
            address: entry.address,
            constructor_args: entry.args.clone(),
            contract: entry.contract.clone(),
            attempt_count: 0,
        }
    }
}

/// Terminal result of a verification task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified {
        attempts: u32,
    },
    AlreadyVerified {
        attempts: u32,
    },
    ExhaustedFailure {
        attempts: u32,
        last_error: String,
        /// Command an operator can run to finish verification by hand.
        remediation: String,
    },
}

impl VerificationOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::ExhaustedFailure { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Verified { attempts }
            | Self::AlreadyVerified { attempts }
            | Self::ExhaustedFailure { attempts, .. } => *attempts,
        }
    }
}

/// Intermediate states of a verification task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationState {
    /// Sleeping before the next attempt.
    Waiting {
        delay: Duration,
        after_error: Option<String>,
    },
    /// Ready to submit.
    Pending,
    Done(VerificationOutcome),
}

/// Result of verifying one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub name: String,
    pub address: Address,
    pub outcome: VerificationOutcome,
}

/// A successful answer of the verification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Verified,
    AlreadyVerified,
}

/// The external source-verification service.
pub trait VerificationService: Send + Sync {
    /// Submit the task's address and constructor arguments. An error whose message contains an
    /// "already verified" phrase is treated as [`Submission::AlreadyVerified`] by the worker.
    fn submit(
        &self,
        task: &VerificationTask,
    ) -> impl Future<Output = anyhow::Result<Submission>> + Send;

    /// The command an operator runs to verify `task` by hand.
    fn remediation_command(&self, task: &VerificationTask) -> String;
}

/// Abstracts waiting so backoff can be driven deterministically in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Drives [`VerificationTask`]s through the verification state machine.
pub struct VerificationWorker<V, S = TokioSleeper> {
    service: V,
    sleeper: S,
    policy: RetryPolicy,
    concurrency: usize,
    observer: Arc<dyn DeployObserver>,
}

impl<V: VerificationService> VerificationWorker<V, TokioSleeper> {
    pub fn new(service: V) -> Self {
        Self::with_sleeper(service, TokioSleeper)
    }
}

impl<V: VerificationService, S: Sleeper> VerificationWorker<V, S> {
    pub fn with_sleeper(service: V, sleeper: S) -> Self {
        Self {
            service,
            sleeper,
            policy: RetryPolicy::default(),
            concurrency: 4,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DeployObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn service(&self) -> &V {
        &self.service
    }

    /// Run one task to a terminal outcome.
    pub async fn verify(&self, mut task: VerificationTask) -> VerificationOutcome {
        let mut state = VerificationState::Waiting {
            delay: self.policy.initial_delay,
            after_error: None,
        };

        loop {
            state = match state {
                VerificationState::Waiting { delay, after_error } => {
                    if let Some(error) = after_error {
                        self.observer.notify(&DeployEvent::VerificationRetry {
                            name: task.name.clone(),
                            attempt: task.attempt_count,
                            error,
                            delay,
                        });
                    }
                    self.sleeper.sleep(delay).await;
                    VerificationState::Pending
                }
                VerificationState::Pending => {
                    task.attempt_count += 1;
                    self.observer.notify(&DeployEvent::VerificationAttempt {
                        name: task.name.clone(),
                        attempt: task.attempt_count,
                        max_attempts: self.policy.max_attempts,
                    });
                    let result = self.service.submit(&task).await;
                    self.transition(&task, result)
                }
                VerificationState::Done(outcome) => {
                    self.observer.notify(&DeployEvent::VerificationFinished {
                        name: task.name.clone(),
                        outcome: outcome.clone(),
                    });
                    return outcome;
                }
            };
        }
    }

    /// The state following an attempt that produced `result`.
    pub fn transition(
        &self,
        task: &VerificationTask,
        result: anyhow::Result<Submission>,
    ) -> VerificationState {
        let attempts = task.attempt_count;
        let error = match result {
            Ok(Submission::Verified) => {
                return VerificationState::Done(VerificationOutcome::Verified { attempts });
            }
            Ok(Submission::AlreadyVerified) => {
                return VerificationState::Done(VerificationOutcome::AlreadyVerified { attempts });
            }
            Err(error) => format!("{error:#}"),
        };

        if mentions_any(&self.policy.already_verified_phrases, &error) {
            VerificationState::Done(VerificationOutcome::AlreadyVerified { attempts })
        } else if attempts < self.policy.max_attempts {
            VerificationState::Waiting {
                delay: self.policy.retry_delay,
                after_error: Some(error),
            }
        } else {
            VerificationState::Done(VerificationOutcome::ExhaustedFailure {
                attempts,
                last_error: error,
                remediation: self.service.remediation_command(task),
            })
        }
    }

    /// Verify every task, at most `concurrency` at a time. One failure never affects another
    /// task. Reports come back in task order.
    pub async fn verify_all(&self, tasks: Vec<VerificationTask>) -> Vec<VerificationReport> {
        let mut reports: Vec<(usize, VerificationReport)> =
            stream::iter(tasks.into_iter().enumerate())
                .map(|(index, task)| async move {
                    let name = task.name.clone();
                    let address = task.address;
                    let outcome = self.verify(task).await;
                    (
                        index,
                        VerificationReport {
                            name,
                            address,
                            outcome,
                        },
                    )
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }
}

/// Whether `text` contains one of `phrases`, ignoring case.
fn mentions_any(phrases: &[String], text: &str) -> bool {
    let text = text.to_lowercase();
    phrases
        .iter()
        .any(|phrase| text.contains(&phrase.to_lowercase()))
}

/// Double-quote `arg` for a POSIX shell.
fn shell_quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Render the shell command verifying `task` on `network`, with `program` running the Hardhat
/// CLI (usually `npx`).
pub fn hardhat_verify_command(program: &str, network: &str, task: &VerificationTask) -> String {
    let mut command = format!("{program} hardhat verify --network {network}");
    if let Some(contract) = &task.contract {
        command.push_str(&format!(" --contract {}", shell_quote(contract)));
    }
    command.push_str(&format!(" {}", task.address));
    for arg in &task.constructor_args {
        command.push(' ');
        command.push_str(&shell_quote(arg));
    }
    command
}

/// Verifies through `hardhat verify`, the same command offered as remediation.
#[derive(Debug, Clone)]
pub struct HardhatVerifier {
    network: String,
    command: String,
    project_dir: PathBuf,
    already_verified_phrases: Vec<String>,
}

impl HardhatVerifier {
    pub fn new(network: impl Into<String>, config: &VerificationConfig) -> Self {
        Self {
            network: network.into(),
            command: config.command.clone(),
            project_dir: config.project_dir.clone(),
            already_verified_phrases: config.already_verified_phrases.clone(),
        }
    }

    fn cli_args(&self, task: &VerificationTask) -> Vec<String> {
        let mut args = vec![
            "hardhat".to_string(),
            "verify".to_string(),
            "--network".to_string(),
            self.network.clone(),
        ];
        if let Some(contract) = &task.contract {
            args.push("--contract".to_string());
            args.push(contract.clone());
        }
        args.push(task.address.to_string());
        args.extend(task.constructor_args.iter().cloned());
        args
    }
}

impl VerificationService for HardhatVerifier {
    async fn submit(&self, task: &VerificationTask) -> anyhow::Result<Submission> {
        let output = tokio::process::Command::new(&self.command)
            .args(self.cli_args(task))
            .current_dir(&self.project_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run '{} hardhat verify'", self.command))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // hardhat-verify exits successfully for a contract that is already verified.
        if output.status.success() {
            let already_verified = mentions_any(&self.already_verified_phrases, &stdout)
                || mentions_any(&self.already_verified_phrases, &stderr);
            return Ok(if already_verified {
                Submission::AlreadyVerified
            } else {
                Submission::Verified
            });
        }

        anyhow::bail!(
            "hardhat verify exited with {}: {} {}",
            output.status,
            stderr.trim(),
            stdout.trim()
        )
    }

    fn remediation_command(&self, task: &VerificationTask) -> String {
        hardhat_verify_command(&self.command, &self.network, task)
    }
}
