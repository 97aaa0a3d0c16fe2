use crate::activations::Activations;
use crate::config::BridgeConstants;
use crate::election::{Authorizer, CallSpec, ThresholdElection, VoteOutcome};
use crate::events::BridgeEventLogger;
use crate::federation::{Federation, FederationMember, KeyType, PendingFederation};
use crate::metrics::{FEDERATION_COMMITS, FEDERATION_VOTES};
use crate::storage::BridgeState;
use crate::Error;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Address as BitcoinAddress;
use ethers::types::{Address, H256};
use strum::IntoStaticStr;
use tracing::{debug, info, warn};

pub const RETIRING_FEDERATION_NON_EXISTENT: i32 = -1;
pub const PENDING_FEDERATION_NON_EXISTENT: i32 = -1;

const CREATE: &str = "create";
const ADD: &str = "add";
const ADD_MULTI: &str = "add-multi";
const ROLLBACK: &str = "rollback";
const COMMIT: &str = "commit";
const FUNCTIONS: [&str; 5] = [CREATE, ADD, ADD_MULTI, ROLLBACK, COMMIT];

/// The block the bridge is executing in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    /// Milliseconds since the epoch
    pub timestamp_millis: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FederationChangeResponse {
    Success,
    /// Vote counted, no winner yet
    VoteRecorded,
    PendingFederationExists,
    AwaitingActivation,
    RetiringFederationExists,
    NoPendingFederation,
    KeyAlreadyExists,
    MalformedKey,
    IncompleteFederation,
    HashMismatch,
    UnauthorizedCaller,
    NonExistingFunction,
    GenericError,
}

impl FederationChangeResponse {
    /// Code returned to the host chain caller.
    pub fn code(&self) -> i32 {
        use FederationChangeResponse::*;
        match self {
            Success | VoteRecorded => 1,
            PendingFederationExists | NoPendingFederation => -1,
            AwaitingActivation | KeyAlreadyExists | IncompleteFederation => -2,
            RetiringFederationExists | HashMismatch => -3,
            MalformedKey | UnauthorizedCaller | NonExistingFunction | GenericError => -10,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == 1
    }

    pub fn label(&self) -> &'static str {
        self.into()
    }
}

/// Federation lifecycle over one block's working copy of the bridge state.
pub struct FederationSupport<'a> {
    state: &'a mut BridgeState,
    constants: &'a BridgeConstants,
    activations: &'a dyn Activations,
    block: BlockContext,
    genesis: Federation,
}

impl<'a> FederationSupport<'a> {
    pub fn new(
        state: &'a mut BridgeState,
        constants: &'a BridgeConstants,
        activations: &'a dyn Activations,
        block: BlockContext,
    ) -> Result<Self, Error> {
        let genesis = constants.genesis_federation()?;
        Ok(Self {
            state,
            constants,
            activations,
            block,
            genesis,
        })
    }

    pub fn state(&self) -> &BridgeState {
        &*self.state
    }

    pub fn state_mut(&mut self) -> &mut BridgeState {
        &mut *self.state
    }

    pub fn constants(&self) -> &BridgeConstants {
        self.constants
    }

    pub fn activations(&self) -> &dyn Activations {
        self.activations
    }

    pub fn block(&self) -> BlockContext {
        self.block
    }

    pub fn genesis_federation(&self) -> &Federation {
        &self.genesis
    }

    pub fn activation_age(&self) -> u64 {
        self.constants.federation_activation_age(self.activations)
    }

    fn should_be_active(&self, federation: &Federation) -> bool {
        self.block.number >= federation.creation_block_number() + self.activation_age()
    }

    pub fn active_federation(&self) -> &Federation {
        match (&self.state.new_federation, &self.state.old_federation) {
            (None, _) => &self.genesis,
            (Some(new), _) if self.should_be_active(new) => new,
            (Some(_), Some(old)) => old,
            (Some(_), None) => &self.genesis,
        }
    }

    /// The previous federation, observable only while the new one is active and
    /// funds have not been fully migrated.
    pub fn retiring_federation(&self) -> Option<&Federation> {
        let new = self.state.new_federation.as_ref()?;
        if self.should_be_active(new) {
            self.state.old_federation.as_ref()
        } else {
            None
        }
    }

    pub fn active_federation_size(&self) -> usize {
        self.active_federation().size()
    }

    pub fn active_federation_threshold(&self) -> usize {
        self.active_federation().number_of_signatures_required()
    }

    pub fn active_federation_address(&self) -> &BitcoinAddress {
        self.active_federation().address()
    }

    pub fn active_federation_creation_time(&self) -> u64 {
        self.active_federation().creation_time()
    }

    pub fn active_federation_creation_block_number(&self) -> u64 {
        self.active_federation().creation_block_number()
    }

    pub fn active_federator_btc_public_key(&self, index: usize) -> Result<PublicKey, Error> {
        self.active_federation().btc_public_key(index)
    }

    pub fn active_federator_public_key_of_type(
        &self,
        index: usize,
        key_type: KeyType,
    ) -> Result<PublicKey, Error> {
        self.active_federation().public_key_of_type(index, key_type)
    }

    pub fn retiring_federation_size(&self) -> i32 {
        self.retiring_federation()
            .map(|federation| federation.size() as i32)
            .unwrap_or(RETIRING_FEDERATION_NON_EXISTENT)
    }

    pub fn retiring_federation_threshold(&self) -> i32 {
        self.retiring_federation()
            .map(|federation| federation.number_of_signatures_required() as i32)
            .unwrap_or(RETIRING_FEDERATION_NON_EXISTENT)
    }

    pub fn retiring_federation_address(&self) -> Option<&BitcoinAddress> {
        self.retiring_federation().map(Federation::address)
    }

    pub fn retiring_federation_creation_time(&self) -> Option<u64> {
        self.retiring_federation().map(Federation::creation_time)
    }

    pub fn retiring_federation_creation_block_number(&self) -> Option<u64> {
        self.retiring_federation()
            .map(Federation::creation_block_number)
    }

    pub fn retiring_federator_btc_public_key(
        &self,
        index: usize,
    ) -> Result<Option<PublicKey>, Error> {
        self.retiring_federation()
            .map(|federation| federation.btc_public_key(index))
            .transpose()
    }

    pub fn retiring_federator_public_key_of_type(
        &self,
        index: usize,
        key_type: KeyType,
    ) -> Result<Option<PublicKey>, Error> {
        self.retiring_federation()
            .map(|federation| federation.public_key_of_type(index, key_type))
            .transpose()
    }

    pub fn pending_federation_size(&self) -> i32 {
        self.state
            .pending_federation
            .as_ref()
            .map(|pending| pending.size() as i32)
            .unwrap_or(PENDING_FEDERATION_NON_EXISTENT)
    }

    pub fn pending_federation_hash(&self) -> Option<H256> {
        self.state.pending_federation.as_ref().map(PendingFederation::hash)
    }

    pub fn pending_federator_btc_public_key(
        &self,
        index: usize,
    ) -> Result<Option<PublicKey>, Error> {
        self.state
            .pending_federation
            .as_ref()
            .map(|pending| pending.btc_public_key(index))
            .transpose()
    }

    pub fn pending_federator_public_key_of_type(
        &self,
        index: usize,
        key_type: KeyType,
    ) -> Result<Option<PublicKey>, Error> {
        self.state
            .pending_federation
            .as_ref()
            .map(|pending| pending.public_key_of_type(index, key_type))
            .transpose()
    }

    /// Creation height of the active federation as recorded by
    /// [`Self::update_federation_creation_block_heights`], or 0 before any commit.
    pub fn active_federation_creation_block_height(&self) -> u64 {
        if let Some(next) = self.state.next_federation_creation_block_height {
            if self.block.number >= next + self.activation_age() {
                return next;
            }
        }
        self.state.active_federation_creation_block_height.unwrap_or(0)
    }

    /// Promotes the recorded next creation height once that federation is active.
    pub fn update_federation_creation_block_heights(&mut self) {
        let Some(next) = self.state.next_federation_creation_block_height else {
            return;
        };
        if self.block.number >= next + self.activation_age() {
            debug!("Federation created at block {next} is now active");
            self.state.active_federation_creation_block_height = Some(next);
            self.state.next_federation_creation_block_height = None;
        }
    }

    pub fn create_federation(&mut self, dry_run: bool) -> FederationChangeResponse {
        if self.state.pending_federation.is_some() {
            return FederationChangeResponse::PendingFederationExists;
        }
        if let Some(new) = &self.state.new_federation {
            if !self.should_be_active(new) {
                return FederationChangeResponse::AwaitingActivation;
            }
        }
        if self.retiring_federation().is_some() {
            return FederationChangeResponse::RetiringFederationExists;
        }
        if dry_run {
            return FederationChangeResponse::Success;
        }

        self.state.pending_federation = Some(PendingFederation::new(vec![]));
        info!("Pending federation created at block {}", self.block.number);
        FederationChangeResponse::Success
    }

    pub fn add_federator_public_key(
        &mut self,
        dry_run: bool,
        member: FederationMember,
    ) -> FederationChangeResponse {
        let Some(pending) = self.state.pending_federation.as_mut() else {
            return FederationChangeResponse::NoPendingFederation;
        };
        if pending.conflicts_with(&member) {
            return FederationChangeResponse::KeyAlreadyExists;
        }
        if dry_run {
            return FederationChangeResponse::Success;
        }

        pending.add_member(member);
        debug!(
            "Added federator {} to the pending federation, now of size {}",
            member.btc_public_key,
            pending.size()
        );
        FederationChangeResponse::Success
    }

    pub fn rollback_federation(&mut self, dry_run: bool) -> FederationChangeResponse {
        if self.state.pending_federation.is_none() {
            return FederationChangeResponse::NoPendingFederation;
        }
        if dry_run {
            return FederationChangeResponse::Success;
        }

        self.state.pending_federation = None;
        self.state.federation_election.clear();
        info!("Pending federation rolled back at block {}", self.block.number);
        FederationChangeResponse::Success
    }

    pub fn commit_federation(
        &mut self,
        dry_run: bool,
        hash: H256,
        logger: &mut dyn BridgeEventLogger,
    ) -> FederationChangeResponse {
        let Some(pending) = self.state.pending_federation.as_ref() else {
            return FederationChangeResponse::NoPendingFederation;
        };
        if !pending.is_complete() {
            return FederationChangeResponse::IncompleteFederation;
        }
        if pending.hash() != hash {
            return FederationChangeResponse::HashMismatch;
        }
        if dry_run {
            return FederationChangeResponse::Success;
        }

        let new_federation = match pending.build_federation(
            self.block.timestamp_millis,
            self.block.number,
            self.constants,
            self.activations,
        ) {
            Ok(federation) => federation,
            Err(err) => {
                warn!("Unable to build the pending federation: {err}");
                return FederationChangeResponse::GenericError;
            }
        };
        let previous_active = self.active_federation().clone();

        self.state.old_federation_utxos = std::mem::take(&mut self.state.new_federation_utxos);
        self.state.old_federation = Some(previous_active.clone());
        self.state.new_federation = Some(new_federation.clone());
        self.state.pending_federation = None;
        self.state.federation_election.clear();
        self.state.next_federation_creation_block_height = Some(self.block.number);

        let activation_block_number = self.block.number + self.activation_age();
        logger.log_commit_federation(
            &self.block,
            &previous_active,
            &new_federation,
            activation_block_number,
        );
        FEDERATION_COMMITS.inc();
        info!(
            "Committed federation {} replacing {}, active from block {activation_block_number}",
            new_federation.address(),
            previous_active.address()
        );
        FederationChangeResponse::Success
    }

    fn execute(
        &mut self,
        spec: &CallSpec,
        dry_run: bool,
        logger: &mut dyn BridgeEventLogger,
    ) -> FederationChangeResponse {
        match spec.function.as_str() {
            CREATE => self.create_federation(dry_run),
            ADD => match parse_member(&spec.arguments, 1) {
                Some(member) => self.add_federator_public_key(dry_run, member),
                None => FederationChangeResponse::MalformedKey,
            },
            ADD_MULTI => match parse_member(&spec.arguments, 3) {
                Some(member) => self.add_federator_public_key(dry_run, member),
                None => FederationChangeResponse::MalformedKey,
            },
            ROLLBACK => self.rollback_federation(dry_run),
            COMMIT => match spec.arguments.as_slice() {
                [hash] if hash.len() == 32 => {
                    self.commit_federation(dry_run, H256::from_slice(hash), logger)
                }
                _ => FederationChangeResponse::GenericError,
            },
            _ => FederationChangeResponse::NonExistingFunction,
        }
    }

    /// Validates `spec` against the current state, records `sender`'s vote, and
    /// executes the winning spec once it reaches the required votes.
    pub fn vote_federation_change(
        &mut self,
        sender: Address,
        spec: CallSpec,
        logger: &mut dyn BridgeEventLogger,
    ) -> FederationChangeResponse {
        let function = if FUNCTIONS.contains(&spec.function.as_str()) {
            spec.function.clone()
        } else {
            "unknown".to_string()
        };
        let response = self.vote(sender, spec, logger);
        debug!(
            "Federation change vote for {function} by {sender:?}: {}",
            response.code()
        );
        FEDERATION_VOTES
            .with_label_values(&[function.as_str(), response.label()])
            .inc();
        response
    }

    fn vote(
        &mut self,
        sender: Address,
        spec: CallSpec,
        logger: &mut dyn BridgeEventLogger,
    ) -> FederationChangeResponse {
        if !self
            .state
            .federation_election
            .authorizer()
            .is_authorized(&sender)
        {
            return FederationChangeResponse::UnauthorizedCaller;
        }
        if !FUNCTIONS.contains(&spec.function.as_str()) {
            return FederationChangeResponse::NonExistingFunction;
        }

        let validation = self.execute(&spec, true, logger);
        if !validation.is_success() {
            return validation;
        }

        let outcome = ThresholdElection::vote_and_apply_within(
            self,
            |support| &mut support.state.federation_election,
            spec,
            sender,
            |support, winner| support.execute(winner, false, logger),
        );
        match outcome {
            VoteOutcome::Rejected => FederationChangeResponse::GenericError,
            VoteOutcome::Recorded => FederationChangeResponse::VoteRecorded,
            VoteOutcome::Applied(response) => response,
        }
    }
}

fn parse_member(arguments: &[Vec<u8>], expected: usize) -> Option<FederationMember> {
    if arguments.len() != expected {
        return None;
    }
    let keys = arguments
        .iter()
        .map(|bytes| PublicKey::from_slice(bytes).ok())
        .collect::<Option<Vec<_>>>()?;
    match keys.as_slice() {
        [key] => Some(FederationMember::from_single_key(*key)),
        [btc, chain, mst] => Some(FederationMember::new(*btc, *chain, *mst)),
        _ => None,
    }
}
