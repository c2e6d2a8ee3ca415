//! Dependency plans: the ordered list of components to create and how their constructor
//! parameters are resolved.
//!
//! A plan breaks a constructor-level dependency cycle by letting the earliest components
//! reference later ones through their *predicted* address, while later components reference
//! earlier ones through their *actual* address. Plans are usually written as TOML documents:
//!
//! ```toml
//! name = "core"
//!
//! [[components]]
//! name = "VaultExtension"
//! args = [{ predicted = "Vault" }, { actual = "VaultAdmin" }]
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    str::FromStr,
};

use alloy_core::primitives::{Address, U256, utils::parse_ether};
use anyhow::Context;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};

/// A fully resolved constructor argument.
#[derive(Debug, Clone, PartialEq, Eq, Display, From)]
pub enum ArgValue {
    #[display("{_0}")]
    Address(Address),
    #[display("{_0}")]
    Uint(U256),
    #[display("{_0}")]
    Bool(bool),
    #[display("{_0}")]
    String(String),
}

impl From<u64> for ArgValue {
    fn from(value: u64) -> Self {
        Self::Uint(U256::from(value))
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// A constructor parameter template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// A value passed through unchanged.
    Literal(ArgValue),
    /// The predicted address of a component that is not deployed yet.
    Predicted(String),
    /// The actual address of a component deployed earlier in the same plan.
    Actual(String),
    /// The address of a component recorded in the network ledger by an earlier plan.
    Recorded(String),
    /// The deployer identity's own address.
    Deployer,
}

impl Param {
    pub fn literal(value: impl Into<ArgValue>) -> Self {
        Self::Literal(value.into())
    }

    pub fn predicted(name: impl Into<String>) -> Self {
        Self::Predicted(name.into())
    }

    pub fn actual(name: impl Into<String>) -> Self {
        Self::Actual(name.into())
    }

    pub fn recorded(name: impl Into<String>) -> Self {
        Self::Recorded(name.into())
    }
}

/// A single component of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    /// Unique name within the plan; also the ledger key.
    pub name: String,
    /// Optional fully-qualified source identifier, e.g. `pool/Factory.sol:Factory`.
    pub contract: Option<String>,
    /// Constructor parameter templates, in constructor order.
    pub params: Vec<Param>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contract: None,
            params: Vec::new(),
        }
    }

    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.params.extend(params);
        self
    }

    /// The contract name used to look up build artifacts.
    pub fn contract_name(&self) -> &str {
        self.contract
            .as_deref()
            .and_then(|fq| fq.rsplit_once(':').map(|(_, name)| name))
            .unwrap_or(&self.name)
    }
}

/// A validated, ordered list of components. The order is the deployment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyPlan {
    name: String,
    components: Vec<ComponentSpec>,
}

impl DependencyPlan {
    /// Validate and build a plan.
    ///
    /// Fails with [`DeployError::PlanInvalid`] when:
    /// - the plan is empty, or a name is empty or used twice;
    /// - a parameter references a name that is not part of the plan;
    /// - `actual` references a component that is not ordered strictly before the referrer;
    /// - `predicted` references a component already deployed when the referrer is created;
    /// - `recorded` shadows a component of this plan.
    pub fn new(name: impl Into<String>, components: Vec<ComponentSpec>) -> DeployResult<Self> {
        let name = name.into();

        if components.is_empty() {
            return Err(DeployError::plan_invalid(&name, "plan has no components"));
        }

        let mut positions = HashMap::with_capacity(components.len());
        for (index, component) in components.iter().enumerate() {
            if component.name.trim().is_empty() {
                return Err(DeployError::plan_invalid(
                    &name,
                    format!("component #{index} has an empty name"),
                ));
            }
            if positions.insert(component.name.as_str(), index).is_some() {
                return Err(DeployError::plan_invalid(
                    &name,
                    format!("component name '{}' is used more than once", component.name),
                ));
            }
        }

        for (index, component) in components.iter().enumerate() {
            for param in &component.params {
                match param {
                    Param::Actual(target) => match positions.get(target.as_str()) {
                        None => {
                            return Err(unknown_reference(&name, component, target));
                        }
                        Some(&position) if position >= index => {
                            return Err(DeployError::plan_invalid(
                                &name,
                                format!(
                                    "'{}' references the actual address of '{target}', which is \
                                     not deployed before it",
                                    component.name
                                ),
                            ));
                        }
                        Some(_) => {}
                    },
                    Param::Predicted(target) => match positions.get(target.as_str()) {
                        None => {
                            return Err(unknown_reference(&name, component, target));
                        }
                        Some(&position) if position < index => {
                            return Err(DeployError::plan_invalid(
                                &name,
                                format!(
                                    "'{}' references the predicted address of '{target}', which \
                                     is already deployed; use its actual address",
                                    component.name
                                ),
                            ));
                        }
                        Some(_) => {}
                    },
                    Param::Recorded(target) if positions.contains_key(target.as_str()) => {
                        return Err(DeployError::plan_invalid(
                            &name,
                            format!(
                                "'{}' references recorded '{target}', which is also deployed \
                                 by this plan",
                                component.name
                            ),
                        ));
                    }
                    Param::Recorded(_) | Param::Literal(_) | Param::Deployer => {}
                }
            }
        }

        Ok(Self { name, components })
    }

    /// Load and validate a plan from a TOML document.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let document = PlanDocument::load_from_file(path)?;
        let plan = document
            .into_plan()
            .with_context(|| format!("Invalid plan document {}", path.display()))?;
        tracing::info!(path = %path.display(), plan = %plan.name, "Plan loaded");
        Ok(plan)
    }

    /// Parse and validate a plan from TOML text.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let document: PlanDocument =
            toml::from_str(content).context("Failed to parse plan document as TOML")?;
        Ok(document.into_plan()?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> &[ComponentSpec] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Names of components whose predicted address is embedded by some component.
    pub fn forward_references(&self) -> BTreeSet<&str> {
        self.referenced(|param| match param {
            Param::Predicted(target) => Some(target.as_str()),
            _ => None,
        })
    }

    /// Names this plan expects to find in the network ledger of earlier plans.
    pub fn recorded_references(&self) -> BTreeSet<&str> {
        self.referenced(|param| match param {
            Param::Recorded(target) => Some(target.as_str()),
            _ => None,
        })
    }

    fn referenced<'a>(&'a self, pick: impl Fn(&'a Param) -> Option<&'a str>) -> BTreeSet<&'a str> {
        self.components
            .iter()
            .flat_map(|c| c.params.iter())
            .filter_map(pick)
            .collect()
    }
}

fn unknown_reference(plan: &str, component: &ComponentSpec, target: &str) -> DeployError {
    DeployError::plan_invalid(
        plan,
        format!(
            "'{}' references unknown component '{target}'",
            component.name
        ),
    )
}

/// On-disk representation of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub components: Vec<ComponentDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default)]
    pub args: Vec<ParamDocument>,
}

/// A parameter as written in a plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamDocument {
    Predicted(String),
    Actual(String),
    Recorded(String),
    Deployer,
    Address(String),
    Uint(UintLiteral),
    /// Decimal ether amount, converted to wei.
    Ether(String),
    String(String),
    Bool(bool),
}

/// An unsigned integer written either as a TOML integer or as a decimal/hex string.
///
/// TOML integers are signed; a negative one is rejected when the plan is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UintLiteral {
    Number(i64),
    Text(String),
}

impl PlanDocument {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse plan {} as TOML", path.display()))
    }

    /// Convert literals to typed values and validate the resulting plan.
    pub fn into_plan(self) -> DeployResult<DependencyPlan> {
        let plan_name = self.name;
        let components = self
            .components
            .into_iter()
            .map(|component| {
                let params = component
                    .args
                    .into_iter()
                    .enumerate()
                    .map(|(position, param)| {
                        param.into_param().map_err(|reason| {
                            DeployError::plan_invalid(
                                &plan_name,
                                format!(
                                    "argument #{position} of '{}': {reason}",
                                    component.name
                                ),
                            )
                        })
                    })
                    .collect::<DeployResult<Vec<_>>>()?;

                Ok(ComponentSpec {
                    name: component.name,
                    contract: component.contract,
                    params,
                })
            })
            .collect::<DeployResult<Vec<_>>>()?;

        DependencyPlan::new(plan_name, components)
    }
}

impl ParamDocument {
    fn into_param(self) -> Result<Param, String> {
        Ok(match self {
            Self::Predicted(name) => Param::Predicted(name),
            Self::Actual(name) => Param::Actual(name),
            Self::Recorded(name) => Param::Recorded(name),
            Self::Deployer => Param::Deployer,
            Self::Address(text) => Param::literal(
                Address::from_str(&text).map_err(|e| format!("invalid address '{text}': {e}"))?,
            ),
            Self::Uint(UintLiteral::Number(value)) => Param::literal(
                u64::try_from(value).map_err(|_| format!("negative uint '{value}'"))?,
            ),
            Self::Uint(UintLiteral::Text(text)) => Param::literal(
                U256::from_str(&text).map_err(|e| format!("invalid uint '{text}': {e}"))?,
            ),
            Self::Ether(text) => Param::literal(
                parse_ether(&text).map_err(|e| format!("invalid ether amount '{text}': {e}"))?,
            ),
            Self::String(text) => Param::literal(text),
            Self::Bool(value) => Param::literal(value),
        })
    }
}
