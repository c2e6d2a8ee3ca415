//! Deterministic CREATE-address prediction.
//!
//! A contract created by a plain creation transaction lands at
//! `keccak256(rlp([sender, nonce]))[12..]`, so the address of every component in a plan is
//! known as soon as the deployer's nonce is read at plan start.

use std::collections::{BTreeMap, BTreeSet};

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeployError, DeployResult},
    plan::DependencyPlan,
};

/// The deploying account together with the nonce observed when the plan started.
///
/// Nothing but the executor may send transactions from `address` until the plan completes,
/// otherwise every prediction derived from `nonce` is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployerIdentity {
    pub address: Address,
    pub nonce: u64,
}

impl DeployerIdentity {
    pub fn new(address: Address, nonce: u64) -> Self {
        Self { address, nonce }
    }

    /// Predict the address created by the `offset`-th creation transaction from this identity.
    pub fn predict(&self, offset: i64) -> DeployResult<Address> {
        AddressPredictor::predict(self.address, self.nonce, offset)
    }
}

/// Pure CREATE-address derivation.
pub struct AddressPredictor;

impl AddressPredictor {
    /// Compute the address of the contract created by `deployer` once `offset` more creation
    /// transactions have been sent after `base_sequence`.
    ///
    /// Negative offsets (and offsets overflowing the nonce space) fail with
    /// [`DeployError::InvalidOffset`].
    pub fn predict(deployer: Address, base_sequence: u64, offset: i64) -> DeployResult<Address> {
        let nonce = u64::try_from(offset)
            .ok()
            .and_then(|offset| base_sequence.checked_add(offset))
            .ok_or(DeployError::InvalidOffset {
                base: base_sequence,
                offset,
            })?;

        Ok(deployer.create(nonce))
    }
}

/// A predicted address and the nonce it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictedAddress {
    pub address: Address,
    pub nonce: u64,
}

/// Predicted addresses for every component of a plan, computed once at plan start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predictions {
    deployer: DeployerIdentity,
    addresses: BTreeMap<String, PredictedAddress>,
    forward_referenced: BTreeSet<String>,
}

impl Predictions {
    /// Predict the address of each component from its position in the plan.
    ///
    /// Every component consumes exactly one nonce, so the component at index `i` is created
    /// with nonce `deployer.nonce + i`.
    pub fn compute(plan: &DependencyPlan, deployer: &DeployerIdentity) -> DeployResult<Self> {
        let mut addresses = BTreeMap::new();
        for (index, component) in plan.components().iter().enumerate() {
            let address = deployer.predict(index as i64)?;
            addresses.insert(
                component.name.clone(),
                PredictedAddress {
                    address,
                    nonce: deployer.nonce + index as u64,
                },
            );
        }

        let forward_referenced = plan
            .forward_references()
            .into_iter()
            .map(String::from)
            .collect();

        Ok(Self {
            deployer: *deployer,
            addresses,
            forward_referenced,
        })
    }

    pub fn deployer(&self) -> &DeployerIdentity {
        &self.deployer
    }

    pub fn get(&self, name: &str) -> Option<&PredictedAddress> {
        self.addresses.get(name)
    }

    /// Whether an earlier component embedded this component's predicted address.
    pub fn is_forward_referenced(&self, name: &str) -> bool {
        self.forward_referenced.contains(name)
    }

    /// Names of components whose predicted address was referenced ahead of deployment.
    pub fn forward_referenced(&self) -> impl Iterator<Item = &str> {
        self.forward_referenced.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PredictedAddress)> {
        self.addresses.iter().map(|(name, p)| (name.as_str(), p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;
    use rand::Rng;

    #[test]
    fn test_predict_known_create_addresses() {
        let sender = address!("b20a608c624Ca5003905aA834De7156C68b2E1d0");

        assert_eq!(
            AddressPredictor::predict(sender, 0, 0).unwrap(),
            address!("00000000219ab540356cBB839Cbe05303d7705Fa")
        );
        assert_eq!(
            AddressPredictor::predict(sender, 0, 1).unwrap(),
            address!("e33c6e89e69d085897f98e92b06ebd541d1daa99")
        );
        // Base and offset only matter through their sum.
        assert_eq!(
            AddressPredictor::predict(sender, 1, 0).unwrap(),
            AddressPredictor::predict(sender, 0, 1).unwrap()
        );
    }

    #[test]
    fn test_predict_rejects_negative_offset() {
        let sender = address!("b20a608c624Ca5003905aA834De7156C68b2E1d0");
        let err = AddressPredictor::predict(sender, 5, -1).unwrap_err();

        assert!(matches!(
            err,
            DeployError::InvalidOffset { base: 5, offset: -1 }
        ));
    }

    #[test]
    fn test_predict_rejects_nonce_overflow() {
        let sender = address!("b20a608c624Ca5003905aA834De7156C68b2E1d0");
        let result = AddressPredictor::predict(sender, u64::MAX, 1);

        assert!(matches!(result, Err(DeployError::InvalidOffset { .. })));
    }

    #[test]
    fn test_predict_is_deterministic_and_distinct() {
        let mut rng = rand::rng();

        for _ in 0..64 {
            let deployer = Address::from(rng.random::<[u8; 20]>());
            let base = rng.random_range(0..1_000_000u64);
            let first = rng.random_range(0..1_000i64);
            let second = first + rng.random_range(1..1_000i64);

            let a = AddressPredictor::predict(deployer, base, first).unwrap();
            let b = AddressPredictor::predict(deployer, base, second).unwrap();

            assert_ne!(a, b, "distinct offsets must yield distinct addresses");
            assert_eq!(a, AddressPredictor::predict(deployer, base, first).unwrap());
            assert_eq!(b, AddressPredictor::predict(deployer, base, second).unwrap());
        }
    }
}
