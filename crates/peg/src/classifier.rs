//! Peg transaction classification.
//!
//! Two strategies coexist and are selected by activation and bitcoin height:
//! the pegout index strategy recognises pegouts by the sighash of their first
//! input, while the legacy watch wallet strategy recognises them by the redeem
//! scripts their inputs reveal. Blocks below the switch must keep classifying
//! with the legacy strategy so historical blocks replay identically.

use crate::activations::{Activations, ConsensusRule};
use crate::federation::Federation;
use crate::federation_support::FederationSupport;
use crate::metrics::CLASSIFIED_TRANSACTIONS;
use crate::Error;
use bdk::database::{BatchOperations, Database, MemoryDatabase};
use bdk::KeychainKind;
use bitcoin::hashes::Hash;
use bitcoin::script::Instruction;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Script, ScriptBuf, Transaction};
use std::collections::BTreeSet;
use strum::IntoStaticStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PegTxType {
    Pegin,
    PegoutOrMigration,
    Unknown,
}

/// Everything classification reads. Nothing in it is mutated.
#[derive(Clone)]
pub struct ClassificationContext<'a> {
    pub activations: &'a dyn Activations,
    pub pegout_tx_sig_hashes: &'a BTreeSet<[u8; 32]>,
    /// Satoshis
    pub minimum_pegin_value: u64,
    pub pegout_tx_index_activation_height: u64,
    pub pegout_tx_index_grace_period: u64,
    /// Script of the federation that predates stored federation tracking
    pub old_federation_script: Option<ScriptBuf>,
    pub last_retired_federation_p2sh_script: Option<&'a Script>,
    pub active_federation: &'a Federation,
    pub retiring_federation: Option<&'a Federation>,
}

impl<'a> ClassificationContext<'a> {
    pub fn new(support: &'a FederationSupport<'_>) -> Result<Self, Error> {
        let constants = support.constants();
        let state = support.state();
        let old_federation_script = constants
            .old_federation_address()?
            .map(|address| address.script_pubkey());
        Ok(Self {
            activations: support.activations(),
            pegout_tx_sig_hashes: &state.pegout_tx_sig_hashes,
            minimum_pegin_value: constants.minimum_pegin_tx_value,
            pegout_tx_index_activation_height: constants.pegout_tx_index_activation_btc_height,
            pegout_tx_index_grace_period: constants.pegout_tx_index_grace_period_in_btc_blocks,
            old_federation_script,
            last_retired_federation_p2sh_script: state
                .last_retired_federation_p2sh_script
                .as_deref(),
            active_federation: support.active_federation(),
            retiring_federation: support.retiring_federation(),
        })
    }

    fn live_federations(&self) -> impl Iterator<Item = &'a Federation> {
        std::iter::once(self.active_federation).chain(self.retiring_federation)
    }

    /// Satoshis paid to the active or retiring federation.
    fn value_to_live_federations(&self, transaction: &Transaction) -> u64 {
        let scripts = self
            .live_federations()
            .map(Federation::p2sh_script)
            .collect::<Vec<_>>();
        transaction
            .output
            .iter()
            .filter(|output| scripts.contains(&output.script_pubkey))
            .map(|output| output.value)
            .sum()
    }
}

pub trait PegClassificationStrategy {
    fn name(&self) -> &'static str;

    fn classify(
        &self,
        context: &ClassificationContext,
        transaction: &Transaction,
    ) -> Result<PegTxType, Error>;
}

/// Matches the first input's sighash against the registry of known pegouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct PegoutIndexStrategy;

impl PegClassificationStrategy for PegoutIndexStrategy {
    fn name(&self) -> &'static str {
        "pegout_index"
    }

    fn classify(
        &self,
        context: &ClassificationContext,
        transaction: &Transaction,
    ) -> Result<PegTxType, Error> {
        if !transaction.input.is_empty() {
            for federation in context.live_federations() {
                let sighash = first_input_sighash(transaction, federation.redeem_script())?;
                if context.pegout_tx_sig_hashes.contains(&sighash) {
                    return Ok(PegTxType::PegoutOrMigration);
                }
            }
        }

        if context.value_to_live_federations(transaction) > 0 {
            Ok(PegTxType::Pegin)
        } else {
            Ok(PegTxType::Unknown)
        }
    }
}

/// Watches every federation script the bridge ever controlled and treats any
/// transaction spending from one of them as signed by federators.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyWatchWalletStrategy;

impl LegacyWatchWalletStrategy {
    fn watch_wallet(&self, context: &ClassificationContext) -> Result<MemoryDatabase, Error> {
        let mut scripts = context
            .live_federations()
            .map(Federation::p2sh_script)
            .collect::<Vec<_>>();
        scripts.extend(context.old_federation_script.clone());
        scripts.extend(
            context
                .last_retired_federation_p2sh_script
                .map(|script| script.to_owned()),
        );

        let mut wallet = MemoryDatabase::new();
        for (index, script) in scripts.iter().enumerate() {
            wallet
                .set_script_pubkey(script, KeychainKind::External, index as u32)
                .map_err(|err| Error::WalletError(err.to_string()))?;
        }
        Ok(wallet)
    }
}

impl PegClassificationStrategy for LegacyWatchWalletStrategy {
    fn name(&self) -> &'static str {
        "legacy_watch_wallet"
    }

    fn classify(
        &self,
        context: &ClassificationContext,
        transaction: &Transaction,
    ) -> Result<PegTxType, Error> {
        let wallet = self.watch_wallet(context)?;
        for input in &transaction.input {
            let Some(redeem_script) = revealed_redeem_script(&input.script_sig) else {
                continue;
            };
            if wallet
                .get_path_from_script_pubkey(&redeem_script.to_p2sh())
                .map_err(|err| Error::WalletError(err.to_string()))?
                .is_some()
            {
                return Ok(PegTxType::PegoutOrMigration);
            }
        }

        if context.value_to_live_federations(transaction) >= context.minimum_pegin_value {
            Ok(PegTxType::Pegin)
        } else {
            Ok(PegTxType::Unknown)
        }
    }
}

/// The last push of a P2SH scriptSig is the redeem script being spent.
fn revealed_redeem_script(script_sig: &Script) -> Option<ScriptBuf> {
    match script_sig.instructions().last()? {
        Ok(Instruction::PushBytes(bytes)) if !bytes.is_empty() => {
            Some(ScriptBuf::from(bytes.as_bytes().to_vec()))
        }
        _ => None,
    }
}

static PEGOUT_INDEX: PegoutIndexStrategy = PegoutIndexStrategy;
static LEGACY_WATCH_WALLET: LegacyWatchWalletStrategy = LegacyWatchWalletStrategy;

pub fn select_strategy(
    context: &ClassificationContext,
    btc_height: u64,
) -> &'static dyn PegClassificationStrategy {
    let switch_height =
        context.pegout_tx_index_activation_height + context.pegout_tx_index_grace_period;
    if context.activations.is_active(ConsensusRule::PegoutTxIndex) && btc_height >= switch_height {
        &PEGOUT_INDEX
    } else {
        &LEGACY_WATCH_WALLET
    }
}

pub fn classify_peg_transaction(
    context: &ClassificationContext,
    transaction: &Transaction,
    btc_height: u64,
) -> Result<PegTxType, Error> {
    let strategy = select_strategy(context, btc_height);
    let peg_type = strategy.classify(context, transaction)?;
    let label: &'static str = peg_type.into();
    debug!(
        "Classified {} at bitcoin height {btc_height} as {label} using {}",
        transaction.txid(),
        strategy.name()
    );
    CLASSIFIED_TRANSACTIONS
        .with_label_values(&[label, strategy.name()])
        .inc();
    Ok(peg_type)
}

/// Legacy SIGHASH_ALL hash of input 0 spending `redeem_script`.
pub fn first_input_sighash(
    transaction: &Transaction,
    redeem_script: &Script,
) -> Result<[u8; 32], Error> {
    SighashCache::new(transaction)
        .legacy_signature_hash(0, redeem_script, EcdsaSighashType::All.to_u32())
        .map(|sighash| sighash.to_byte_array())
        .map_err(|err| Error::SighashError(err.to_string()))
}
