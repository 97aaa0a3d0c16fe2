use crate::activations::{Activations, ConsensusRule};
use crate::config::BridgeConstants;
use crate::Error;
use bitcoin::opcodes::all;
use bitcoin::script::Builder;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Network, Script, ScriptBuf};
use ethers::types::{Address as ChainAddress, H256};
use ethers::utils::keccak256;
use rlp::RlpStream;
use std::cmp::Ordering;

/// Smallest pending federation that may be committed.
pub const MIN_FEDERATION_SIZE: usize = 2;

// DER signature upper bound plus the sighash type byte
const MAX_SIGNATURE_PUSH_SIZE: usize = 73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Btc,
    Chain,
    Mst,
}

/// A federator: the key signing on the bitcoin side, the key identifying it on the
/// host chain, and the key used for multisig threshold operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FederationMember {
    pub btc_public_key: PublicKey,
    pub chain_public_key: PublicKey,
    pub mst_public_key: PublicKey,
}

impl FederationMember {
    pub fn new(
        btc_public_key: PublicKey,
        chain_public_key: PublicKey,
        mst_public_key: PublicKey,
    ) -> Self {
        Self {
            btc_public_key,
            chain_public_key,
            mst_public_key,
        }
    }

    /// Member using one key for every role, as genesis federators do.
    pub fn from_single_key(key: PublicKey) -> Self {
        Self::new(key, key, key)
    }

    pub fn public_key(&self, key_type: KeyType) -> PublicKey {
        match key_type {
            KeyType::Btc => self.btc_public_key,
            KeyType::Chain => self.chain_public_key,
            KeyType::Mst => self.mst_public_key,
        }
    }

    /// Host-chain address controlled by the chain key.
    pub fn chain_address(&self) -> ChainAddress {
        public_key_to_chain_address(&self.chain_public_key)
    }
}

impl PartialOrd for FederationMember {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// canonical order: btc key, then chain key, then mst key, compared as compressed bytes
impl Ord for FederationMember {
    fn cmp(&self, other: &Self) -> Ordering {
        self.btc_public_key
            .serialize()
            .cmp(&other.btc_public_key.serialize())
            .then_with(|| {
                self.chain_public_key
                    .serialize()
                    .cmp(&other.chain_public_key.serialize())
            })
            .then_with(|| {
                self.mst_public_key
                    .serialize()
                    .cmp(&other.mst_public_key.serialize())
            })
    }
}

pub fn public_key_to_chain_address(key: &PublicKey) -> ChainAddress {
    let uncompressed = key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    ChainAddress::from_slice(&hash[12..])
}

/// Redemption script variant of a federation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FederationKind {
    Standard,
    /// Shares a single trailing `OP_CHECKMULTISIG` between both branches.
    NonStandardErp {
        erp_keys: Vec<PublicKey>,
        activation_delay: u64,
    },
    P2shErp {
        erp_keys: Vec<PublicKey>,
        activation_delay: u64,
    },
}

impl FederationKind {
    pub fn tag(&self) -> u8 {
        match self {
            FederationKind::Standard => 0,
            FederationKind::NonStandardErp { .. } => 1,
            FederationKind::P2shErp { .. } => 2,
        }
    }

    pub fn erp_keys(&self) -> &[PublicKey] {
        match self {
            FederationKind::Standard => &[],
            FederationKind::NonStandardErp { erp_keys, .. }
            | FederationKind::P2shErp { erp_keys, .. } => erp_keys,
        }
    }

    pub fn activation_delay(&self) -> Option<u64> {
        match self {
            FederationKind::Standard => None,
            FederationKind::NonStandardErp {
                activation_delay, ..
            }
            | FederationKind::P2shErp {
                activation_delay, ..
            } => Some(*activation_delay),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Federation {
    members: Vec<FederationMember>,
    creation_time: u64,
    creation_block_number: u64,
    network: Network,
    kind: FederationKind,
    redeem_script: ScriptBuf,
    address: Address,
}

impl Federation {
    /// Builds a federation, sorting and deduplicating `members`.
    ///
    /// `creation_time` is the creating block's timestamp in milliseconds.
    pub fn new(
        members: Vec<FederationMember>,
        creation_time: u64,
        creation_block_number: u64,
        network: Network,
        kind: FederationKind,
    ) -> Result<Self, Error> {
        let mut members = members;
        members.sort();
        members.dedup();
        if members.is_empty() {
            return Err(Error::EmptyFederation);
        }

        let btc_keys = members
            .iter()
            .map(|member| member.btc_public_key)
            .collect::<Vec<_>>();
        let redeem_script = redeem_script_for(&btc_keys, &kind);
        let address = Address::p2sh(&redeem_script, network)?;

        Ok(Self {
            members,
            creation_time,
            creation_block_number,
            network,
            kind,
            redeem_script,
            address,
        })
    }

    pub fn members(&self) -> &[FederationMember] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn number_of_signatures_required(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn creation_block_number(&self) -> u64 {
        self.creation_block_number
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn kind(&self) -> &FederationKind {
        &self.kind
    }

    pub fn redeem_script(&self) -> &Script {
        &self.redeem_script
    }

    /// The plain multisig over the members, without any recovery branch.
    pub fn default_redeem_script(&self) -> ScriptBuf {
        standard_multisig(&self.btc_public_keys(), true)
    }

    pub fn p2sh_script(&self) -> ScriptBuf {
        self.redeem_script.to_p2sh()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn btc_public_keys(&self) -> Vec<PublicKey> {
        self.members
            .iter()
            .map(|member| member.btc_public_key)
            .collect()
    }

    fn member(&self, index: usize) -> Result<&FederationMember, Error> {
        self.members.get(index).ok_or(Error::MemberIndexOutOfRange {
            index,
            size: self.members.len(),
        })
    }

    pub fn btc_public_key(&self, index: usize) -> Result<PublicKey, Error> {
        self.public_key_of_type(index, KeyType::Btc)
    }

    pub fn public_key_of_type(&self, index: usize, key_type: KeyType) -> Result<PublicKey, Error> {
        Ok(self.member(index)?.public_key(key_type))
    }

    pub fn has_btc_public_key(&self, key: &PublicKey) -> bool {
        self.members
            .iter()
            .any(|member| member.btc_public_key == *key)
    }

    pub fn has_member_with_chain_address(&self, address: &ChainAddress) -> bool {
        self.members
            .iter()
            .any(|member| member.chain_address() == *address)
    }

    /// Size of the scriptSig spending one of this federation's outputs once fully
    /// signed: the dummy `OP_0`, the required signatures and the redeem script push.
    pub fn scriptsig_size_estimate(&self) -> usize {
        let signatures = self.number_of_signatures_required() * (1 + MAX_SIGNATURE_PUSH_SIZE);
        // erp spends push an extra selector for the default branch
        let selector = match self.kind {
            FederationKind::Standard => 0,
            _ => 1,
        };
        1 + signatures + selector + push_size(self.redeem_script.len())
    }
}

impl PartialEq for Federation {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network && self.kind == other.kind && self.members == other.members
    }
}

impl Eq for Federation {}

fn push_size(len: usize) -> usize {
    match len {
        0..=75 => 1 + len,
        76..=0xff => 2 + len,
        0x100..=0xffff => 3 + len,
        _ => 5 + len,
    }
}

/// `OP_m <keys> OP_n [OP_CHECKMULTISIG]` with `m = n / 2 + 1`.
fn multisig_builder(builder: Builder, keys: &[PublicKey]) -> Builder {
    let threshold = keys.len() / 2 + 1;
    keys.iter()
        .fold(builder.push_int(threshold as i64), |builder, key| {
            builder.push_key(&bitcoin::PublicKey::new(*key))
        })
        .push_int(keys.len() as i64)
}

fn sorted_keys(keys: &[PublicKey]) -> Vec<PublicKey> {
    let mut keys = keys.to_vec();
    keys.sort_by_key(|key| key.serialize());
    keys
}

fn standard_multisig(keys: &[PublicKey], with_checkmultisig: bool) -> ScriptBuf {
    let builder = multisig_builder(Builder::new(), &sorted_keys(keys));
    if with_checkmultisig {
        builder.push_opcode(all::OP_CHECKMULTISIG).into_script()
    } else {
        builder.into_script()
    }
}

fn redeem_script_for(keys: &[PublicKey], kind: &FederationKind) -> ScriptBuf {
    let keys = sorted_keys(keys);
    match kind {
        FederationKind::Standard => standard_multisig(&keys, true),
        FederationKind::NonStandardErp {
            erp_keys,
            activation_delay,
        } => {
            let builder = multisig_builder(Builder::new().push_opcode(all::OP_NOTIF), &keys)
                .push_opcode(all::OP_ELSE)
                .push_int(*activation_delay as i64)
                .push_opcode(all::OP_CSV)
                .push_opcode(all::OP_DROP);
            multisig_builder(builder, &sorted_keys(erp_keys))
                .push_opcode(all::OP_ENDIF)
                .push_opcode(all::OP_CHECKMULTISIG)
                .into_script()
        }
        FederationKind::P2shErp {
            erp_keys,
            activation_delay,
        } => {
            let builder = multisig_builder(Builder::new().push_opcode(all::OP_NOTIF), &keys)
                .push_opcode(all::OP_CHECKMULTISIG)
                .push_opcode(all::OP_ELSE)
                .push_int(*activation_delay as i64)
                .push_opcode(all::OP_CSV)
                .push_opcode(all::OP_DROP);
            multisig_builder(builder, &sorted_keys(erp_keys))
                .push_opcode(all::OP_CHECKMULTISIG)
                .push_opcode(all::OP_ENDIF)
                .into_script()
        }
    }
}

/// A federation being assembled by votes. It has no address until committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingFederation {
    members: Vec<FederationMember>,
}

impl PendingFederation {
    pub fn new(members: Vec<FederationMember>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[FederationMember] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_complete(&self) -> bool {
        self.members.len() >= MIN_FEDERATION_SIZE
    }

    pub fn add_member(&mut self, member: FederationMember) {
        self.members.push(member);
    }

    /// Whether any of `member`'s keys is already in use by a role of the same kind.
    pub fn conflicts_with(&self, member: &FederationMember) -> bool {
        self.members.iter().any(|existing| {
            existing.btc_public_key == member.btc_public_key
                || existing.chain_public_key == member.chain_public_key
                || existing.mst_public_key == member.mst_public_key
        })
    }

    pub fn btc_public_key(&self, index: usize) -> Result<PublicKey, Error> {
        self.public_key_of_type(index, KeyType::Btc)
    }

    pub fn public_key_of_type(&self, index: usize, key_type: KeyType) -> Result<PublicKey, Error> {
        self.members
            .get(index)
            .map(|member| member.public_key(key_type))
            .ok_or(Error::MemberIndexOutOfRange {
                index,
                size: self.members.len(),
            })
    }

    /// Identity of the member set: keccak256 over the RLP list of BTC keys in
    /// canonical order. Voters commit by this hash.
    pub fn hash(&self) -> H256 {
        let mut members = self.members.clone();
        members.sort();
        let mut stream = RlpStream::new_list(members.len());
        for member in &members {
            stream.append(&member.btc_public_key.serialize().to_vec());
        }
        H256::from(keccak256(stream.out()))
    }

    pub fn build_federation(
        &self,
        creation_time: u64,
        creation_block_number: u64,
        constants: &BridgeConstants,
        activations: &dyn Activations,
    ) -> Result<Federation, Error> {
        let kind = if activations.is_active(ConsensusRule::P2shErpFederations) {
            FederationKind::P2shErp {
                erp_keys: constants.erp_federation_public_keys.clone(),
                activation_delay: constants.erp_federation_activation_delay,
            }
        } else if activations.is_active(ConsensusRule::ErpFederations) {
            FederationKind::NonStandardErp {
                erp_keys: constants.erp_federation_public_keys.clone(),
                activation_delay: constants.erp_federation_activation_delay,
            }
        } else {
            FederationKind::Standard
        };

        Federation::new(
            self.members.clone(),
            creation_time,
            creation_block_number,
            constants.network,
            kind,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::activations::ActivationsForBlock;
    use crate::config::REGTEST;
    use bitcoin::script::Instruction;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    pub(crate) fn key(seed: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        bytes[31] = seed;
        SecretKey::from_slice(&bytes).unwrap().public_key(&secp)
    }

    pub(crate) fn member(seed: u8) -> FederationMember {
        FederationMember::new(key(seed), key(seed + 100), key(seed + 200))
    }

    pub(crate) fn federation(seeds: &[u8]) -> Federation {
        Federation::new(
            seeds.iter().map(|seed| member(*seed)).collect(),
            0,
            0,
            Network::Regtest,
            FederationKind::Standard,
        )
        .unwrap()
    }

    #[test]
    fn signatures_required_is_majority() {
        for size in 1..=10u8 {
            let seeds = (1..=size).collect::<Vec<_>>();
            let federation = federation(&seeds);
            assert_eq!(federation.number_of_signatures_required(), size as usize / 2 + 1);
        }
    }

    #[test]
    fn members_are_sorted_and_deduplicated() {
        let federation = federation(&[3, 1, 2, 1]);
        assert_eq!(federation.size(), 3);
        let keys = federation.btc_public_keys();
        let mut sorted = keys.clone();
        sorted.sort_by_key(|key| key.serialize());
        assert_eq!(keys, sorted);
    }

    #[test]
    fn empty_federation_is_rejected() {
        let result = Federation::new(vec![], 0, 0, Network::Regtest, FederationKind::Standard);
        assert!(matches!(result, Err(Error::EmptyFederation)));
    }

    #[test]
    fn standard_redeem_script_is_plain_multisig() {
        let federation = federation(&[1, 2, 3]);
        let instructions = federation
            .redeem_script()
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(instructions.len(), 6);
        assert_eq!(instructions[0], Instruction::Op(all::OP_PUSHNUM_2));
        assert_eq!(instructions[4], Instruction::Op(all::OP_PUSHNUM_3));
        assert_eq!(instructions[5], Instruction::Op(all::OP_CHECKMULTISIG));
        assert_eq!(federation.redeem_script(), federation.default_redeem_script().as_script());
    }

    #[test]
    fn address_is_p2sh_of_redeem_script() {
        let federation = federation(&[1, 2, 3]);
        assert!(federation.p2sh_script().is_p2sh());
        assert_eq!(federation.address().script_pubkey(), federation.p2sh_script());
    }

    #[test]
    fn erp_variants_derive_distinct_scripts() {
        let members = vec![member(1), member(2), member(3)];
        let erp_keys = vec![key(50), key(51)];
        let standard =
            Federation::new(members.clone(), 0, 0, Network::Regtest, FederationKind::Standard)
                .unwrap();
        let non_standard = Federation::new(
            members.clone(),
            0,
            0,
            Network::Regtest,
            FederationKind::NonStandardErp {
                erp_keys: erp_keys.clone(),
                activation_delay: 500,
            },
        )
        .unwrap();
        let p2sh_erp = Federation::new(
            members,
            0,
            0,
            Network::Regtest,
            FederationKind::P2shErp {
                erp_keys,
                activation_delay: 500,
            },
        )
        .unwrap();

        assert_ne!(standard.redeem_script(), non_standard.redeem_script());
        assert_ne!(non_standard.redeem_script(), p2sh_erp.redeem_script());
        assert_ne!(standard.address(), p2sh_erp.address());
        assert_eq!(standard.default_redeem_script(), p2sh_erp.default_redeem_script());
        assert_ne!(standard, p2sh_erp);

        let bytes = non_standard.redeem_script().as_bytes();
        assert_eq!(bytes.first(), Some(&all::OP_NOTIF.to_u8()));
        assert_eq!(bytes.last(), Some(&all::OP_CHECKMULTISIG.to_u8()));
        let bytes = p2sh_erp.redeem_script().as_bytes();
        assert_eq!(bytes.last(), Some(&all::OP_ENDIF.to_u8()));
    }

    #[test]
    fn member_index_out_of_range_is_reported() {
        let federation = federation(&[1, 2]);
        assert!(federation.btc_public_key(1).is_ok());
        assert!(matches!(
            federation.public_key_of_type(2, KeyType::Mst),
            Err(Error::MemberIndexOutOfRange { index: 2, size: 2 })
        ));
    }

    #[test]
    fn key_accessors_return_each_role() {
        let federation = federation(&[7]);
        assert_eq!(federation.public_key_of_type(0, KeyType::Btc).unwrap(), key(7));
        assert_eq!(federation.public_key_of_type(0, KeyType::Chain).unwrap(), key(107));
        assert_eq!(federation.public_key_of_type(0, KeyType::Mst).unwrap(), key(207));
        assert!(federation.has_member_with_chain_address(&member(7).chain_address()));
    }

    #[test]
    fn pending_hash_ignores_insertion_order() {
        let first = PendingFederation::new(vec![member(1), member(2)]);
        let second = PendingFederation::new(vec![member(2), member(1)]);
        let third = PendingFederation::new(vec![member(1), member(3)]);
        assert_eq!(first.hash(), second.hash());
        assert_ne!(first.hash(), third.hash());
    }

    #[test]
    fn pending_federation_completeness() {
        let mut pending = PendingFederation::default();
        assert!(!pending.is_complete());
        pending.add_member(member(1));
        assert!(!pending.is_complete());
        pending.add_member(member(2));
        assert!(pending.is_complete());
        assert!(pending.conflicts_with(&FederationMember::new(key(1), key(90), key(91))));
        assert!(!pending.conflicts_with(&member(3)));
    }

    #[test]
    fn build_federation_selects_kind_from_activations() {
        let pending = PendingFederation::new(vec![member(1), member(2), member(3)]);

        let standard = pending
            .build_federation(1_000, 5, &REGTEST, &ActivationsForBlock::none())
            .unwrap();
        assert_eq!(standard.kind(), &FederationKind::Standard);
        assert_eq!(standard.creation_time(), 1_000);
        assert_eq!(standard.creation_block_number(), 5);

        let p2sh_erp = pending
            .build_federation(1_000, 5, &REGTEST, &ActivationsForBlock::all())
            .unwrap();
        assert!(matches!(p2sh_erp.kind(), FederationKind::P2shErp { .. }));
    }

    #[test]
    fn scriptsig_estimate_grows_with_threshold() {
        let small = federation(&[1, 2, 3]);
        let large = federation(&[1, 2, 3, 4, 5, 6, 7]);
        assert!(large.scriptsig_size_estimate() > small.scriptsig_size_estimate());
        assert!(small.scriptsig_size_estimate() > small.redeem_script().len());
    }
}
