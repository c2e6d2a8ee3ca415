//! Post-deployment address integrity check.

use alloy_core::primitives::Address;
use serde::Serialize;

use crate::{ledger::DeploymentLedger, predictor::Predictions};

/// A forward-referenced component that was not created at its predicted address.
///
/// Every component that embedded `predicted` now points at the wrong contract. This is never
/// corrected automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub name: String,
    pub predicted: Address,
    pub actual: Address,
}

pub struct IntegrityChecker;

impl IntegrityChecker {
    /// Compare predicted and actual addresses of every forward-referenced component.
    ///
    /// Addresses compare by value, so checksum casing never causes a mismatch. Components
    /// missing from the ledger are skipped.
    pub fn verify(ledger: &DeploymentLedger, predictions: &Predictions) -> Vec<Mismatch> {
        predictions
            .forward_referenced()
            .filter_map(|name| {
                let predicted = predictions.get(name)?.address;
                let actual = ledger.address_of(name)?;
                (predicted != actual).then(|| Mismatch {
                    name: name.to_string(),
                    predicted,
                    actual,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::DeploymentRecord,
        plan::{ComponentSpec, DependencyPlan, Param},
        predictor::DeployerIdentity,
    };
    use alloy_core::primitives::address;
    use std::str::FromStr;

    fn plan() -> DependencyPlan {
        DependencyPlan::new(
            "core",
            vec![
                ComponentSpec::new("VaultAdmin").param(Param::predicted("Vault")),
                ComponentSpec::new("Vault").param(Param::actual("VaultAdmin")),
            ],
        )
        .unwrap()
    }

    fn ledger_with(admin: Address, vault: Address) -> DeploymentLedger {
        let mut ledger = DeploymentLedger::new();
        for (name, address) in [("VaultAdmin", admin), ("Vault", vault)] {
            ledger
                .insert(DeploymentRecord {
                    name: name.to_string(),
                    address,
                    args: Vec::new(),
                    contract: None,
                })
                .unwrap();
        }
        ledger
    }

    #[test]
    fn test_matching_addresses_ignore_casing() {
        let identity =
            DeployerIdentity::new(address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"), 3);
        let predictions = Predictions::compute(&plan(), &identity).unwrap();

        // The node reports lowercase hex; the prediction is checksummed.
        let vault_lower = identity.predict(1).unwrap().to_string().to_lowercase();
        let ledger = ledger_with(
            identity.predict(0).unwrap(),
            Address::from_str(&vault_lower).unwrap(),
        );

        assert!(IntegrityChecker::verify(&ledger, &predictions).is_empty());
    }

    #[test]
    fn test_reports_drifted_component() {
        let identity =
            DeployerIdentity::new(address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"), 3);
        let predictions = Predictions::compute(&plan(), &identity).unwrap();

        let drifted = identity.predict(2).unwrap();
        let ledger = ledger_with(identity.predict(0).unwrap(), drifted);

        let mismatches = IntegrityChecker::verify(&ledger, &predictions);
        assert_eq!(
            mismatches,
            vec![Mismatch {
                name: "Vault".to_string(),
                predicted: identity.predict(1).unwrap(),
                actual: drifted,
            }]
        );
    }

    #[test]
    fn test_only_forward_referenced_components_are_checked() {
        let identity =
            DeployerIdentity::new(address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"), 3);
        let predictions = Predictions::compute(&plan(), &identity).unwrap();

        // VaultAdmin was never referenced by prediction, so its address is not compared.
        let ledger = ledger_with(
            address!("0000000000000000000000000000000000000001"),
            identity.predict(1).unwrap(),
        );

        assert!(IntegrityChecker::verify(&ledger, &predictions).is_empty());
    }
}
