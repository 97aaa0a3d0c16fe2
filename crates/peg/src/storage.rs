use crate::config::BridgeConstants;
use crate::election::{CallSpec, ThresholdElection};
use crate::federation::{Federation, PendingFederation};
use crate::serialization::*;
use crate::utxo::Utxo;
use crate::Error;
use bitcoin::{ScriptBuf, Transaction};
use rlp::DecoderError;
use std::collections::{BTreeMap, BTreeSet};
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, EnumIter)]
pub enum StorageKey {
    #[strum(serialize = "newFederation")]
    NewFederation,
    #[strum(serialize = "oldFederation")]
    OldFederation,
    #[strum(serialize = "pendingFederation")]
    PendingFederation,
    #[strum(serialize = "newFederationBtcUTXOs")]
    NewFederationUtxos,
    #[strum(serialize = "oldFederationBtcUTXOs")]
    OldFederationUtxos,
    #[strum(serialize = "federationElection")]
    FederationElection,
    #[strum(serialize = "feePerKbElection")]
    FeePerKbElection,
    #[strum(serialize = "feePerKb")]
    FeePerKb,
    #[strum(serialize = "lastRetiredFedP2SHScript")]
    LastRetiredFederationP2shScript,
    #[strum(serialize = "activeFedCreationBlockHeight")]
    ActiveFederationCreationBlockHeight,
    #[strum(serialize = "nextFedCreationBlockHeight")]
    NextFederationCreationBlockHeight,
    #[strum(serialize = "pegoutTxSigHashes")]
    PegoutTxSigHashes,
    #[strum(serialize = "pegoutsWaitingForConfirmations")]
    PegoutsWaitingForConfirmations,
}

impl StorageKey {
    pub fn as_bytes(&self) -> &'static [u8] {
        let name: &'static str = self.into();
        name.as_bytes()
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Flat byte store the bridge state is persisted in.
pub trait KeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), Error>;
    fn delete(&mut self, key: &[u8]) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), Error> {
        self.entries.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Working copy of the persisted bridge state for one block or transaction.
///
/// Everything is mutated in place and written back by [`BridgeStorage::save`].
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeState {
    /// The most recently committed federation
    pub new_federation: Option<Federation>,
    /// The federation that was active when `new_federation` was committed
    pub old_federation: Option<Federation>,
    pub pending_federation: Option<PendingFederation>,
    pub new_federation_utxos: Vec<Utxo>,
    pub old_federation_utxos: Vec<Utxo>,
    pub federation_election: ThresholdElection<CallSpec>,
    pub fee_per_kb_election: ThresholdElection<CallSpec>,
    /// Satoshis per kilobyte, `None` until the first fee vote succeeds
    pub fee_per_kb: Option<u64>,
    pub last_retired_federation_p2sh_script: Option<ScriptBuf>,
    pub active_federation_creation_block_height: Option<u64>,
    pub next_federation_creation_block_height: Option<u64>,
    pub pegout_tx_sig_hashes: BTreeSet<[u8; 32]>,
    pub pegouts_waiting_for_confirmations: Vec<(u64, Transaction)>,
}

impl BridgeState {
    pub fn new(constants: &BridgeConstants) -> Self {
        Self {
            new_federation: None,
            old_federation: None,
            pending_federation: None,
            new_federation_utxos: vec![],
            old_federation_utxos: vec![],
            federation_election: ThresholdElection::new(
                constants.federation_change_authorizer.clone(),
            ),
            fee_per_kb_election: ThresholdElection::new(
                constants.fee_per_kb_change_authorizer.clone(),
            ),
            fee_per_kb: None,
            last_retired_federation_p2sh_script: None,
            active_federation_creation_block_height: None,
            next_federation_creation_block_height: None,
            pegout_tx_sig_hashes: BTreeSet::new(),
            pegouts_waiting_for_confirmations: vec![],
        }
    }

    pub fn fee_per_kb(&self, constants: &BridgeConstants) -> u64 {
        self.fee_per_kb.unwrap_or(constants.genesis_fee_per_kb)
    }

    pub fn has_pegout_tx_sig_hash(&self, sighash: &[u8; 32]) -> bool {
        self.pegout_tx_sig_hashes.contains(sighash)
    }

    /// Removes and returns the pegouts created at least
    /// `pegout_confirmations_required` blocks before `block_number`, oldest first.
    /// They are handed to federators for signing.
    pub fn take_confirmed_pegouts(
        &mut self,
        constants: &BridgeConstants,
        block_number: u64,
    ) -> Vec<Transaction> {
        let confirmations = constants.pegout_confirmations_required;
        let (confirmed, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pegouts_waiting_for_confirmations)
                .into_iter()
                .partition(|(created, _)| block_number >= created + confirmations);
        self.pegouts_waiting_for_confirmations = waiting;
        if !confirmed.is_empty() {
            debug!("{} pegouts confirmed at block {block_number}", confirmed.len());
        }
        confirmed
            .into_iter()
            .map(|(_, transaction)| transaction)
            .collect()
    }

    fn encode(&self, key: StorageKey) -> Option<Vec<u8>> {
        match key {
            StorageKey::NewFederation => self.new_federation.as_ref().map(serialize_federation),
            StorageKey::OldFederation => self.old_federation.as_ref().map(serialize_federation),
            StorageKey::PendingFederation => self
                .pending_federation
                .as_ref()
                .map(serialize_pending_federation),
            StorageKey::NewFederationUtxos => {
                non_empty(&self.new_federation_utxos).map(serialize_utxos)
            }
            StorageKey::OldFederationUtxos => {
                non_empty(&self.old_federation_utxos).map(serialize_utxos)
            }
            StorageKey::FederationElection => {
                let votes = self.federation_election.votes();
                (!votes.is_empty()).then(|| serialize_election(votes))
            }
            StorageKey::FeePerKbElection => {
                let votes = self.fee_per_kb_election.votes();
                (!votes.is_empty()).then(|| serialize_election(votes))
            }
            StorageKey::FeePerKb => self.fee_per_kb.map(serialize_u64),
            StorageKey::LastRetiredFederationP2shScript => self
                .last_retired_federation_p2sh_script
                .as_ref()
                .map(serialize_script),
            StorageKey::ActiveFederationCreationBlockHeight => self
                .active_federation_creation_block_height
                .map(serialize_u64),
            StorageKey::NextFederationCreationBlockHeight => {
                self.next_federation_creation_block_height.map(serialize_u64)
            }
            StorageKey::PegoutTxSigHashes => (!self.pegout_tx_sig_hashes.is_empty())
                .then(|| serialize_sighashes(&self.pegout_tx_sig_hashes)),
            StorageKey::PegoutsWaitingForConfirmations => {
                non_empty(&self.pegouts_waiting_for_confirmations)
                    .map(serialize_pegouts)
            }
        }
    }
}

fn non_empty<T>(items: &[T]) -> Option<&[T]> {
    (!items.is_empty()).then_some(items)
}

/// Loads and saves [`BridgeState`] under fixed keys of a [`KeyValueStore`].
pub struct BridgeStorage<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> BridgeStorage<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn read<T>(
        &self,
        key: StorageKey,
        decode: impl FnOnce(&[u8]) -> Result<T, DecoderError>,
    ) -> Result<Option<T>, Error> {
        let Some(bytes) = self.store.get(key.as_bytes())? else {
            return Ok(None);
        };
        decode(&bytes).map(Some).map_err(|err| {
            error!("Unable to decode {}: {err}", key.name());
            Error::CorruptedState(key.name())
        })
    }

    /// Reads the full state. Undecodable values are fatal.
    pub fn load(&self, constants: &BridgeConstants) -> Result<BridgeState, Error> {
        let network = constants.network;
        let federation_votes = self
            .read(StorageKey::FederationElection, deserialize_election)?
            .unwrap_or_default();
        let fee_votes = self
            .read(StorageKey::FeePerKbElection, deserialize_election)?
            .unwrap_or_default();

        Ok(BridgeState {
            new_federation: self.read(StorageKey::NewFederation, |bytes| {
                deserialize_federation(bytes, network)
            })?,
            old_federation: self.read(StorageKey::OldFederation, |bytes| {
                deserialize_federation(bytes, network)
            })?,
            pending_federation: self
                .read(StorageKey::PendingFederation, deserialize_pending_federation)?,
            new_federation_utxos: self
                .read(StorageKey::NewFederationUtxos, deserialize_utxos)?
                .unwrap_or_default(),
            old_federation_utxos: self
                .read(StorageKey::OldFederationUtxos, deserialize_utxos)?
                .unwrap_or_default(),
            federation_election: ThresholdElection::with_votes(
                constants.federation_change_authorizer.clone(),
                federation_votes,
            ),
            fee_per_kb_election: ThresholdElection::with_votes(
                constants.fee_per_kb_change_authorizer.clone(),
                fee_votes,
            ),
            fee_per_kb: self.read(StorageKey::FeePerKb, deserialize_u64)?,
            last_retired_federation_p2sh_script: self
                .read(StorageKey::LastRetiredFederationP2shScript, deserialize_script)?,
            active_federation_creation_block_height: self
                .read(StorageKey::ActiveFederationCreationBlockHeight, deserialize_u64)?,
            next_federation_creation_block_height: self
                .read(StorageKey::NextFederationCreationBlockHeight, deserialize_u64)?,
            pegout_tx_sig_hashes: self
                .read(StorageKey::PegoutTxSigHashes, deserialize_sighashes)?
                .unwrap_or_default(),
            pegouts_waiting_for_confirmations: self
                .read(StorageKey::PegoutsWaitingForConfirmations, deserialize_pegouts)?
                .unwrap_or_default(),
        })
    }

    /// Writes every value whose encoding differs from what is stored. Absent values
    /// and empty collections delete their key.
    pub fn save(&mut self, state: &BridgeState) -> Result<(), Error> {
        for key in StorageKey::iter() {
            let encoded = state.encode(key);
            if self.store.get(key.as_bytes())? == encoded {
                continue;
            }
            debug!("Writing {}", key.name());
            match encoded {
                Some(bytes) => self.store.put(key.as_bytes(), bytes)?,
                None => self.store.delete(key.as_bytes())?,
            }
        }
        Ok(())
    }
}
