use crate::activations::ConsensusRule;
use crate::classifier::first_input_sighash;
use crate::federation::Federation;
use crate::federation_support::FederationSupport;
use crate::metrics::MIGRATED_UTXOS;
use crate::utxo::{total_value, Utxo};
use crate::Error;
use bitcoin::absolute::LockTime;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

const TRANSACTION_VERSION: i32 = 2;

/// An unsigned transaction moving retiring funds to the active federation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTransaction {
    pub transaction: Transaction,
    pub spent: Vec<Utxo>,
    /// Satoshis
    pub fee: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub migration: Option<MigrationTransaction>,
    /// The retiring federation was cleared in this block
    pub decommissioned: bool,
    /// Outputs at or below the migration threshold abandoned when the retiring
    /// federation aged out
    pub dropped: Vec<Utxo>,
}

/// Moves funds from the retiring to the active federation, once per block.
pub struct MigrationCoordinator<'s, 'a> {
    support: &'s mut FederationSupport<'a>,
}

impl<'s, 'a> MigrationCoordinator<'s, 'a> {
    pub fn new(support: &'s mut FederationSupport<'a>) -> Self {
        Self { support }
    }

    /// Outputs at or below this value stay behind rather than be migrated at a loss.
    pub fn migration_threshold(&self) -> u64 {
        let minimum_migration_amount = self.fee_per_kb() / 2;
        minimum_migration_amount / 2
    }

    fn fee_per_kb(&self) -> u64 {
        self.support.state().fee_per_kb(self.support.constants())
    }

    pub fn is_migratable(&self, utxo: &Utxo) -> bool {
        utxo.value > self.migration_threshold()
    }

    pub fn process_funds_migration(&mut self) -> Result<MigrationOutcome, Error> {
        let Some(retiring) = self.support.retiring_federation().cloned() else {
            return Ok(MigrationOutcome::default());
        };
        let active = self.support.active_federation().clone();
        let constants = self.support.constants();
        let activation_age = self.support.activation_age();
        let age = self
            .support
            .block()
            .number
            .saturating_sub(active.creation_block_number());
        let in_migration_window =
            age >= activation_age + constants.funds_migration_age_since_activation_begin;
        let past_migration_age =
            age >= activation_age + constants.funds_migration_age_since_activation_end;

        let mut outcome = MigrationOutcome::default();
        if in_migration_window && !self.support.state().old_federation_utxos.is_empty() {
            outcome.migration = self.migrate_batch(&retiring, &active)?;
        }

        let remaining = &self.support.state().old_federation_utxos;
        let migratable_left = remaining.iter().any(|utxo| self.is_migratable(utxo));
        if remaining.is_empty() || (past_migration_age && !migratable_left) {
            outcome.dropped = std::mem::take(&mut self.support.state_mut().old_federation_utxos);
            if !outcome.dropped.is_empty() {
                warn!(
                    "Dropping {} retiring federation outputs worth {} satoshis",
                    outcome.dropped.len(),
                    total_value(&outcome.dropped)
                );
            }
            self.decommission(&retiring);
            outcome.decommissioned = true;
        }
        Ok(outcome)
    }

    fn migrate_batch(
        &mut self,
        retiring: &Federation,
        active: &Federation,
    ) -> Result<Option<MigrationTransaction>, Error> {
        let max_inputs = self.support.constants().max_inputs_per_migration_tx;
        let batch = self
            .support
            .state()
            .old_federation_utxos
            .iter()
            .filter(|utxo| self.is_migratable(utxo))
            .take(max_inputs)
            .cloned()
            .collect::<Vec<_>>();
        if batch.is_empty() {
            debug!(
                "No retiring output above the migration threshold of {}",
                self.migration_threshold()
            );
            return Ok(None);
        }

        let value = total_value(&batch);
        let mut transaction = Transaction {
            version: TRANSACTION_VERSION,
            lock_time: LockTime::ZERO,
            input: batch
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::default(),
                })
                .collect(),
            output: vec![TxOut {
                value,
                script_pubkey: active.address().script_pubkey(),
            }],
        };

        // each signed scriptSig also widens its length prefix from 1 to 3 bytes
        let signed_size =
            transaction.vsize() + batch.len() * (retiring.scriptsig_size_estimate() + 2);
        let estimated_fee = self.fee_per_kb() * signed_size as u64 / 1000;
        // the migrated output never falls below the migration threshold
        let fee = estimated_fee.min(value - self.migration_threshold());
        if fee < estimated_fee {
            warn!("Migration fee capped at {fee}, estimated {estimated_fee} for {value} satoshis");
        }
        transaction.output[0].value = value - fee;

        let activations = self.support.activations();
        let sighash = if activations.is_active(ConsensusRule::PegoutTxIndex) {
            Some(first_input_sighash(&transaction, retiring.redeem_script())?)
        } else {
            None
        };

        let block_number = self.support.block().number;
        let state = self.support.state_mut();
        let spent = batch
            .iter()
            .map(|utxo| utxo.outpoint)
            .collect::<BTreeSet<OutPoint>>();
        state
            .old_federation_utxos
            .retain(|utxo| !spent.contains(&utxo.outpoint));
        state
            .pegouts_waiting_for_confirmations
            .push((block_number, transaction.clone()));
        if let Some(sighash) = sighash {
            debug!("Registered pegout sighash {}", hex::encode(sighash));
            state.pegout_tx_sig_hashes.insert(sighash);
        }

        MIGRATED_UTXOS.inc_by(batch.len() as u64);
        info!(
            "Migrating {} outputs worth {value} satoshis to {} in {}, fee {fee}",
            batch.len(),
            active.address(),
            transaction.txid()
        );
        Ok(Some(MigrationTransaction {
            transaction,
            spent: batch,
            fee,
        }))
    }

    fn decommission(&mut self, retiring: &Federation) {
        let state = self.support.state_mut();
        state.last_retired_federation_p2sh_script = Some(retiring.p2sh_script());
        state.old_federation = None;
        state.old_federation_utxos.clear();
        info!("Retiring federation {} decommissioned", retiring.address());
    }
}
