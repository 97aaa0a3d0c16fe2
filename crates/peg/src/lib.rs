mod activations;
mod classifier;
mod config;
mod election;
mod events;
mod federation;
mod federation_support;
mod fee_support;
pub mod metrics;
mod migration;
mod serialization;
mod storage;
mod utxo;

use thiserror::Error;

pub use bitcoin;
pub use ethers::types::Address;

pub use activations::{ActivationConfig, Activations, ActivationsForBlock, ConsensusRule};
pub use classifier::{
    classify_peg_transaction, first_input_sighash, select_strategy, ClassificationContext,
    LegacyWatchWalletStrategy, PegClassificationStrategy, PegTxType, PegoutIndexStrategy,
};
pub use config::{constants_value_parser, BridgeConstants, MAINNET, REGTEST, TESTNET};
pub use election::{
    AddressBasedAuthorizer, Authorizer, CallSpec, MinimumRequired, ThresholdElection, VoteOutcome,
};
pub use events::{BridgeEvent, BridgeEventLogger, NoopEventLogger, RecordingEventLogger};
pub use federation::{
    Federation, FederationKind, FederationMember, KeyType, PendingFederation,
    MIN_FEDERATION_SIZE,
};
pub use federation_support::{
    BlockContext, FederationChangeResponse, FederationSupport, PENDING_FEDERATION_NON_EXISTENT,
    RETIRING_FEDERATION_NON_EXISTENT,
};
pub use fee_support::{FeePerKbResponse, FeePerKbSupport};
pub use migration::{MigrationCoordinator, MigrationOutcome, MigrationTransaction};
pub use storage::{BridgeState, BridgeStorage, KeyValueStore, MemoryStore, StorageKey};
pub use utxo::Utxo;

/// Public keys are plain secp256k1 keys, serialized compressed.
pub use bitcoin::secp256k1::PublicKey;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage access error: {0}")]
    StorageError(String),
    #[error("Persisted value under {0} is corrupted")]
    CorruptedState(&'static str),
    #[error("Member index {index} out of range for federation of size {size}")]
    MemberIndexOutOfRange { index: usize, size: usize },
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Federation has no members")]
    EmptyFederation,
    #[error("Unable to derive federation address: {0}")]
    AddressError(#[from] bitcoin::address::Error),
    #[error("Sighash computation failed: {0}")]
    SighashError(String),
    #[error("Watch wallet error: {0}")]
    WalletError(String),
}
