use crate::activations::{ActivationConfig, Activations, ConsensusRule};
use crate::election::{AddressBasedAuthorizer, MinimumRequired};
use crate::federation::{Federation, FederationKind, FederationMember};
use crate::Error;
use bitcoin::address::NetworkUnchecked;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address as BitcoinAddress, Network};
use ethers::types::Address;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConstants {
    /// Bitcoin network the federation addresses live on
    pub network: Network,
    /// BTC keys of the federation active before any vote
    pub genesis_federation_public_keys: Vec<PublicKey>,
    /// Genesis federation creation time, milliseconds
    pub genesis_federation_creation_time: u64,
    pub federation_change_authorizer: AddressBasedAuthorizer,
    pub fee_per_kb_change_authorizer: AddressBasedAuthorizer,
    /// Blocks a committed federation waits before becoming active
    pub federation_activation_age_legacy: u64,
    pub federation_activation_age: u64,
    /// Blocks after activation before retiring funds start moving
    pub funds_migration_age_since_activation_begin: u64,
    /// Blocks after activation at which the retiring federation is dropped
    pub funds_migration_age_since_activation_end: u64,
    /// Satoshis
    pub minimum_pegin_tx_value: u64,
    /// Satoshis per kilobyte
    pub genesis_fee_per_kb: u64,
    pub max_fee_per_kb: u64,
    pub erp_federation_public_keys: Vec<PublicKey>,
    /// CSV delay of the emergency branch, in bitcoin blocks
    pub erp_federation_activation_delay: u64,
    /// Address of the federation that predates stored federation tracking
    pub old_federation_address: Option<String>,
    pub pegout_tx_index_activation_btc_height: u64,
    pub pegout_tx_index_grace_period_in_btc_blocks: u64,
    pub max_inputs_per_migration_tx: usize,
    /// Host-chain blocks a pegout waits before it is handed over for signing
    pub pegout_confirmations_required: u64,
    pub activations: ActivationConfig,
}

impl BridgeConstants {
    pub fn genesis_federation(&self) -> Result<Federation, Error> {
        Federation::new(
            self.genesis_federation_public_keys
                .iter()
                .map(|key| FederationMember::from_single_key(*key))
                .collect(),
            self.genesis_federation_creation_time,
            0,
            self.network,
            FederationKind::Standard,
        )
    }

    pub fn federation_activation_age(&self, activations: &dyn Activations) -> u64 {
        if activations.is_active(ConsensusRule::FederationActivationAgeUpdate) {
            self.federation_activation_age
        } else {
            self.federation_activation_age_legacy
        }
    }

    pub fn old_federation_address(&self) -> Result<Option<BitcoinAddress>, Error> {
        self.old_federation_address
            .as_deref()
            .map(|address| {
                BitcoinAddress::<NetworkUnchecked>::from_str(address)
                    .and_then(|address| address.require_network(self.network))
                    .map_err(Error::AddressError)
            })
            .transpose()
    }
}

fn preset_keys(keys: &[&str]) -> Vec<PublicKey> {
    keys.iter()
        .map(|key| PublicKey::from_str(key).expect("preset keys are valid"))
        .collect()
}

fn preset_addresses(addresses: &[&str]) -> Vec<Address> {
    addresses
        .iter()
        .map(|address| address.parse().expect("preset addresses are valid"))
        .collect()
}

const DEV_FEDERATION_KEYS: [&str; 3] = [
    "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
    "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5",
    "02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9",
];

const DEV_ERP_KEYS: [&str; 2] = [
    "02e493dbf1c10d80f3581e4904930b1404cc6c13900ee0758474fa94abe8c4cd13",
    "022f8bde4d1a07209355b4a7250a5c5128e88b84bddc619ab7cba8d569b240efe4",
];

const DEV_AUTHORIZED_ADDRESSES: [&str; 3] = [
    "0x2e80ab37dfb510a64526296fd1f295c42ef19c29",
    "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
    "0x2b5ad5c4795c026514f8317c7a215e218dccd6cf",
];

pub static REGTEST: Lazy<BridgeConstants> = Lazy::new(|| BridgeConstants {
    network: Network::Regtest,
    genesis_federation_public_keys: preset_keys(&DEV_FEDERATION_KEYS),
    genesis_federation_creation_time: 1_000,
    federation_change_authorizer: AddressBasedAuthorizer::new(
        preset_addresses(&DEV_AUTHORIZED_ADDRESSES),
        MinimumRequired::Majority,
    ),
    fee_per_kb_change_authorizer: AddressBasedAuthorizer::new(
        preset_addresses(&DEV_AUTHORIZED_ADDRESSES),
        MinimumRequired::Majority,
    ),
    federation_activation_age_legacy: 10,
    federation_activation_age: 20,
    funds_migration_age_since_activation_begin: 15,
    funds_migration_age_since_activation_end: 150,
    minimum_pegin_tx_value: 250_000,
    genesis_fee_per_kb: 10_000,
    max_fee_per_kb: 5_000_000,
    erp_federation_public_keys: preset_keys(&DEV_ERP_KEYS),
    erp_federation_activation_delay: 500,
    old_federation_address: None,
    pegout_tx_index_activation_btc_height: 250,
    pegout_tx_index_grace_period_in_btc_blocks: 100,
    max_inputs_per_migration_tx: 50,
    pegout_confirmations_required: 3,
    activations: ActivationConfig::all_active_from(0),
});

/// Public networks take their genesis federation, ERP keys and authorized voters
/// from a constants file; the presets carry none of them.
fn network_preset(network: Network) -> BridgeConstants {
    BridgeConstants {
        network,
        genesis_federation_public_keys: vec![],
        federation_change_authorizer: AddressBasedAuthorizer::new(vec![], MinimumRequired::Majority),
        fee_per_kb_change_authorizer: AddressBasedAuthorizer::new(vec![], MinimumRequired::Majority),
        erp_federation_public_keys: vec![],
        ..REGTEST.clone()
    }
}

pub static TESTNET: Lazy<BridgeConstants> = Lazy::new(|| BridgeConstants {
    federation_activation_age_legacy: 60,
    federation_activation_age: 120,
    funds_migration_age_since_activation_begin: 60,
    funds_migration_age_since_activation_end: 900,
    minimum_pegin_tx_value: 500_000,
    genesis_fee_per_kb: 10_000,
    erp_federation_activation_delay: 52_560,
    old_federation_address: Some("2N7ZgQyhFKm17RbaLqygYbS7KLrQfapyZzu".to_string()),
    pegout_tx_index_activation_btc_height: 2_589_553,
    pegout_tx_index_grace_period_in_btc_blocks: 1_440,
    pegout_confirmations_required: 10,
    activations: ActivationConfig::default()
        .with_rule(ConsensusRule::ErpFederations, 1_700_000)
        .with_rule(ConsensusRule::P2shErpFederations, 4_150_000)
        .with_rule(ConsensusRule::FederationActivationAgeUpdate, 4_150_000)
        .with_rule(ConsensusRule::PegoutTxIndex, 4_150_000),
    ..network_preset(Network::Testnet)
});

pub static MAINNET: Lazy<BridgeConstants> = Lazy::new(|| BridgeConstants {
    genesis_federation_creation_time: 1_514_948_400_000,
    federation_activation_age_legacy: 18_500,
    federation_activation_age: 40_320,
    funds_migration_age_since_activation_begin: 0,
    funds_migration_age_since_activation_end: 10_585,
    minimum_pegin_tx_value: 500_000,
    genesis_fee_per_kb: 5_000,
    max_fee_per_kb: 5_000_000,
    erp_federation_activation_delay: 52_560,
    pegout_tx_index_activation_btc_height: 837_589,
    pegout_tx_index_grace_period_in_btc_blocks: 4_320,
    pegout_confirmations_required: 4_000,
    activations: ActivationConfig::default()
        .with_rule(ConsensusRule::ErpFederations, 4_598_500)
        .with_rule(ConsensusRule::P2shErpFederations, 5_468_376)
        .with_rule(ConsensusRule::FederationActivationAgeUpdate, 5_468_376)
        .with_rule(ConsensusRule::PegoutTxIndex, 5_468_376),
    ..network_preset(Network::Bitcoin)
});

impl Default for BridgeConstants {
    fn default() -> Self {
        REGTEST.clone()
    }
}

/// Resolves a preset name or reads the constants from a JSON file.
pub fn constants_value_parser(s: &str) -> eyre::Result<BridgeConstants, eyre::Error> {
    Ok(match s {
        "mainnet" => MAINNET.clone(),
        "testnet" => TESTNET.clone(),
        "regtest" => REGTEST.clone(),
        _ => {
            let raw = std::fs::read_to_string(PathBuf::from(s))?;
            serde_json::from_str(&raw)?
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::ActivationsForBlock;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn regtest_builds_dev_genesis_federation() {
        let genesis = REGTEST.genesis_federation().unwrap();
        assert_eq!(genesis.size(), DEV_FEDERATION_KEYS.len());
        assert_eq!(genesis.creation_block_number(), 0);
        assert_eq!(genesis.network(), Network::Regtest);
    }

    #[test]
    fn public_presets_carry_no_dev_keys() {
        for constants in [&*TESTNET, &*MAINNET] {
            assert!(constants.genesis_federation_public_keys.is_empty());
            assert!(constants.erp_federation_public_keys.is_empty());
            assert!(constants.federation_change_authorizer.authorized.is_empty());
            assert!(constants.fee_per_kb_change_authorizer.authorized.is_empty());
            assert!(matches!(
                constants.genesis_federation(),
                Err(Error::EmptyFederation)
            ));
        }
    }

    #[test]
    fn testnet_resolves_old_federation_address() {
        let address = TESTNET.old_federation_address().unwrap().unwrap();
        assert!(address.script_pubkey().is_p2sh());
        assert_eq!(MAINNET.old_federation_address().unwrap(), None);
    }

    #[test]
    fn activation_age_depends_on_rule() {
        assert_eq!(REGTEST.federation_activation_age(&ActivationsForBlock::none()), 10);
        assert_eq!(REGTEST.federation_activation_age(&ActivationsForBlock::all()), 20);
    }

    #[test]
    fn parser_resolves_presets() {
        assert_eq!(constants_value_parser("mainnet").unwrap(), *MAINNET);
        assert_eq!(constants_value_parser("regtest").unwrap(), *REGTEST);
    }

    #[test]
    fn parser_reads_json_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "minimumPeginTxValue": 42, "federationActivationAge": 7 }}"#
        )
        .unwrap();

        let constants = constants_value_parser(file.path().to_str().unwrap()).unwrap();
        assert_eq!(constants.minimum_pegin_tx_value, 42);
        assert_eq!(constants.federation_activation_age, 7);
        assert_eq!(constants.genesis_fee_per_kb, REGTEST.genesis_fee_per_kb);
    }

    #[test]
    fn constants_round_trip_through_json() {
        let json = serde_json::to_string(&*TESTNET).unwrap();
        let parsed: BridgeConstants = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, *TESTNET);
    }

    #[test]
    fn old_federation_address_must_match_network() {
        let genesis = REGTEST.genesis_federation().unwrap();
        let constants = BridgeConstants {
            old_federation_address: Some(genesis.address().to_string()),
            ..REGTEST.clone()
        };
        // regtest and testnet share the P2SH prefix, so compare scripts
        assert_eq!(
            constants
                .old_federation_address()
                .unwrap()
                .map(|address| address.script_pubkey()),
            Some(genesis.p2sh_script())
        );

        let mainnet = BridgeConstants {
            old_federation_address: Some(genesis.address().to_string()),
            ..MAINNET.clone()
        };
        assert!(mainnet.old_federation_address().is_err());
        assert_eq!(REGTEST.old_federation_address().unwrap(), None);
    }
}
