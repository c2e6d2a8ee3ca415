//! Contract creation over JSON-RPC from Hardhat build artifacts.
//!
//! Transactions are either signed locally from a private key and sent raw, or sent from an
//! account unlocked on the node. Both paths set the nonce explicitly.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, Bytes, TxHash, TxKind, U64, U128},
};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{
    executor::{CreationService, PendingCreation},
    plan::{ArgValue, ComponentSpec},
    rpc::RpcClient,
};

/// How confirmation of a creation transaction is awaited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Seconds between two receipt polls.
    pub poll_interval_secs: u64,
    /// Receipt polls before a creation is reported as failed.
    pub max_polls: usize,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            max_polls: 300,
        }
    }
}

/// The subset of a Hardhat artifact needed to create a contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardhatArtifact {
    pub contract_name: String,
    pub bytecode: Bytes,
}

/// Finds Hardhat artifacts under an `artifacts/` directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locate the artifact of `component`.
    ///
    /// A fully-qualified `path/File.sol:Name` maps directly to `path/File.sol/Name.json`. A bare
    /// contract name must match exactly one artifact.
    pub fn locate(&self, component: &ComponentSpec) -> anyhow::Result<PathBuf> {
        if let Some((source, name)) = component
            .contract
            .as_deref()
            .and_then(|fq| fq.rsplit_once(':'))
        {
            let path = self.root.join(source).join(format!("{name}.json"));
            if !path.is_file() {
                anyhow::bail!("Artifact not found: {}", path.display());
            }
            return Ok(path);
        }

        let file_name = format!("{}.json", component.contract_name());
        let matches: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == file_name.as_str())
            .map(|entry| entry.into_path())
            .collect();

        match matches.as_slice() {
            [] => anyhow::bail!(
                "No artifact named {} under {}",
                file_name,
                self.root.display()
            ),
            [path] => Ok(path.clone()),
            _ => anyhow::bail!(
                "Contract name '{}' is ambiguous ({} artifacts), set a fully-qualified \
                 `contract` for component '{}'",
                component.contract_name(),
                matches.len(),
                component.name
            ),
        }
    }

    /// Load the creation bytecode of `component`.
    pub fn bytecode(&self, component: &ComponentSpec) -> anyhow::Result<Bytes> {
        let path = self.locate(component)?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        let artifact: HardhatArtifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;

        if artifact.bytecode.is_empty() {
            anyhow::bail!(
                "Artifact {} has no bytecode (abstract contract or interface?)",
                artifact.contract_name
            );
        }
        Ok(artifact.bytecode)
    }
}

/// ABI-encode constructor arguments, to be appended to the creation bytecode.
pub fn encode_constructor_args(args: &[ArgValue]) -> Vec<u8> {
    if args.is_empty() {
        return Vec::new();
    }
    let values = args
        .iter()
        .map(|arg| match arg {
            ArgValue::Address(address) => DynSolValue::Address(*address),
            ArgValue::Uint(value) => DynSolValue::Uint(*value, 256),
            ArgValue::Bool(value) => DynSolValue::Bool(*value),
            ArgValue::String(value) => DynSolValue::String(value.clone()),
        })
        .collect();
    DynSolValue::Tuple(values).abi_encode_params()
}

/// Sign a legacy (EIP-155) creation transaction and return its raw encoding.
pub fn sign_creation(
    signer: &PrivateKeySigner,
    chain_id: u64,
    nonce: u64,
    gas_limit: u64,
    gas_price: u128,
    input: Bytes,
) -> anyhow::Result<Bytes> {
    let tx = TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price,
        gas_limit,
        to: TxKind::Create,
        input,
        ..Default::default()
    };
    let signature = signer
        .sign_hash_sync(&tx.signature_hash())
        .context("Failed to sign creation transaction")?;

    Ok(TxEnvelope::Legacy(tx.into_signed(signature)).encoded_2718().into())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreationReceipt {
    status: Option<U64>,
    contract_address: Option<Address>,
}

/// The address created by a mined transaction. A reverted receipt, or one without a contract
/// address, is a failed creation.
fn created_address(pending: &PendingCreation, receipt: CreationReceipt) -> anyhow::Result<Address> {
    if receipt.status.is_some_and(|status| status.is_zero()) {
        anyhow::bail!("Creation transaction {} reverted", pending.tx_hash);
    }

    receipt
        .contract_address
        .with_context(|| format!("Receipt of {} has no contract address", pending.tx_hash))
}

/// The account creation transactions are sent from.
#[derive(Debug, Clone)]
pub enum TransactionSender {
    /// An account unlocked on the node, sent with `eth_sendTransaction`.
    Unlocked(Address),
    /// A local key. Transactions are signed here and sent with `eth_sendRawTransaction`.
    Local {
        signer: PrivateKeySigner,
        chain_id: u64,
    },
}

impl TransactionSender {
    pub fn address(&self) -> Address {
        match self {
            Self::Unlocked(address) => *address,
            Self::Local { signer, .. } => signer.address(),
        }
    }
}

/// Creates contracts over JSON-RPC. Gas and fees are left to the node.
#[derive(Debug, Clone)]
pub struct RpcCreationService {
    rpc: RpcClient,
    artifacts: ArtifactStore,
    sender: TransactionSender,
    confirmation: ConfirmationConfig,
}

impl RpcCreationService {
    pub fn new(rpc: RpcClient, artifacts: ArtifactStore, sender: TransactionSender) -> Self {
        Self {
            rpc,
            artifacts,
            sender,
            confirmation: ConfirmationConfig::default(),
        }
    }

    pub fn confirmation(mut self, confirmation: ConfirmationConfig) -> Self {
        self.confirmation = confirmation;
        self
    }

    async fn send(&self, data: Bytes, nonce: u64) -> anyhow::Result<TxHash> {
        match &self.sender {
            TransactionSender::Unlocked(from) => {
                self.rpc
                    .call(
                        "eth_sendTransaction",
                        vec![serde_json::json!({
                            "from": from,
                            "data": data,
                            "nonce": U64::from(nonce),
                        })],
                    )
                    .await
            }
            TransactionSender::Local { signer, chain_id } => {
                let gas_limit: U64 = self
                    .rpc
                    .call(
                        "eth_estimateGas",
                        vec![serde_json::json!({
                            "from": signer.address(),
                            "data": data,
                        })],
                    )
                    .await
                    .context("Failed to estimate gas")?;
                let gas_price: U128 = self.rpc.call("eth_gasPrice", vec![]).await?;

                let raw = sign_creation(
                    signer,
                    *chain_id,
                    nonce,
                    gas_limit.to::<u64>(),
                    gas_price.to::<u128>(),
                    data,
                )?;
                self.rpc
                    .call("eth_sendRawTransaction", vec![serde_json::json!(raw)])
                    .await
            }
        }
    }
}

impl CreationService for RpcCreationService {
    async fn submit(
        &self,
        component: &ComponentSpec,
        args: &[ArgValue],
        nonce: u64,
    ) -> anyhow::Result<PendingCreation> {
        let mut data = self.artifacts.bytecode(component)?.to_vec();
        data.extend(encode_constructor_args(args));

        let tx_hash = self
            .send(Bytes::from(data), nonce)
            .await
            .with_context(|| {
                format!("Failed to send creation transaction for {}", component.name)
            })?;

        Ok(PendingCreation {
            component: component.name.clone(),
            tx_hash,
        })
    }

    async fn await_confirmation(&self, pending: PendingCreation) -> anyhow::Result<Address> {
        let backoff = ConstantBuilder::default()
            .with_delay(Duration::from_secs(self.confirmation.poll_interval_secs))
            .with_max_times(self.confirmation.max_polls);

        let receipt = (|| async {
            self.rpc
                .transaction_receipt::<CreationReceipt>(pending.tx_hash)
                .await?
                .with_context(|| format!("Transaction {} is not mined yet", pending.tx_hash))
        })
        .retry(backoff)
        .notify(|err: &anyhow::Error, delay: Duration| {
            tracing::trace!(error = %err, delay_secs = delay.as_secs(), "Waiting for receipt");
        })
        .await
        .with_context(|| format!("No receipt for {} ({})", pending.component, pending.tx_hash))?;

        created_address(&pending, receipt)
    }
}
