use std::path::PathBuf;

use alloy_core::primitives::Address;
use clap::{Parser, Subcommand};
use keystone_deploy::CONFIG_FILENAME;
use tracing::level_filters::LevelFilter;
use url::Url;

/// The default network for `keystone init`.
const DEFAULT_NETWORK: Network = Network::Localhost;

#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Network {
    Sepolia,
    Mainnet,
    Localhost,
    Hardhat,
    #[strum(default)]
    Custom(String),
}

impl Network {
    /// The chain id of a well-known network. Custom networks are checked against nothing.
    pub fn to_chain_id(&self) -> Option<u64> {
        match self {
            Network::Sepolia => Some(11155111),
            Network::Mainnet => Some(1),
            Network::Localhost | Network::Hardhat => Some(31337),
            Network::Custom(_) => None,
        }
    }

    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Network::Sepolia => "https://ethereum-sepolia-rpc.publicnode.com",
            Network::Mainnet => "https://ethereum-rpc.publicnode.com",
            Network::Localhost | Network::Hardhat | Network::Custom(_) => "http://127.0.0.1:8545",
        }
    }
}

#[derive(Parser)]
#[command(name = "keystone")]
#[command(
    author,
    version,
    about = "Deploy interdependent contracts at predicted addresses, then verify them"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "KEYSTONE_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the project configuration, or to the directory holding it.
    #[arg(short, long, alias = "conf", env = "KEYSTONE_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a starting configuration file.
    Init(InitArgs),
    /// Execute a plan: predict, create, check integrity, persist the ledger and verify.
    Deploy(DeployArgs),
    /// Print the address every component of a plan would be created at. Sends nothing.
    Predict(PredictArgs),
    /// Verify components already recorded in the network ledger.
    Verify(VerifyArgs),
}

#[derive(Debug, Clone, Parser)]
pub struct InitArgs {
    /// The network the project deploys to.
    #[arg(long, default_value_t = DEFAULT_NETWORK)]
    pub network: Network,

    /// The RPC endpoint. Defaults to a public node for well-known networks.
    #[arg(long)]
    pub rpc_url: Option<Url>,

    /// The deployer account. Defaults to the first account unlocked on the node.
    #[arg(long)]
    pub deployer: Option<Address>,

    /// Overwrite an existing configuration file.
    #[arg(long)]
    pub force: bool,
}

/// Overrides applied on top of the configuration file.
#[derive(Debug, Clone, Parser)]
pub struct NetworkOverrides {
    /// Override the configured network name.
    #[arg(long)]
    pub network: Option<String>,

    /// Override the configured RPC endpoint.
    #[arg(long)]
    pub rpc_url: Option<Url>,

    /// Override the configured deployer account.
    #[arg(long)]
    pub deployer: Option<Address>,
}

#[derive(Debug, Clone, Parser)]
pub struct DeployArgs {
    /// The plan document to execute.
    pub plan: PathBuf,

    /// Start a new network ledger instead of adding to the persisted one.
    #[arg(long)]
    pub fresh: bool,

    /// Skip source verification.
    #[arg(long)]
    pub no_verify: bool,

    #[clap(flatten)]
    pub overrides: NetworkOverrides,
}

#[derive(Debug, Clone, Parser)]
pub struct PredictArgs {
    /// The plan document to predict.
    pub plan: PathBuf,

    /// Predict from this nonce instead of reading the deployer's pending nonce.
    #[arg(long, requires = "deployer")]
    pub nonce: Option<u64>,

    /// Print the predictions as JSON.
    #[arg(long)]
    pub json: bool,

    #[clap(flatten)]
    pub overrides: NetworkOverrides,
}

#[derive(Debug, Clone, Parser)]
pub struct VerifyArgs {
    /// Components to verify. Every recorded component when empty.
    pub components: Vec<String>,

    #[clap(flatten)]
    pub overrides: NetworkOverrides,
}
