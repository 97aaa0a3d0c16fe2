//! Property tests for federation lifecycle invariants

use peg::bitcoin::hashes::Hash;
use peg::bitcoin::secp256k1::{Secp256k1, SecretKey};
use peg::bitcoin::{Network, OutPoint, ScriptBuf, Txid};
use peg::{
    ActivationsForBlock, Address, AddressBasedAuthorizer, BlockContext, BridgeState, CallSpec,
    Federation, FederationKind, FederationMember, FederationSupport, MinimumRequired,
    NoopEventLogger, PublicKey, ThresholdElection, Utxo, REGTEST,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

fn key(seed: u8) -> PublicKey {
    let mut bytes = [0u8; 32];
    bytes[31] = seed;
    SecretKey::from_slice(&bytes)
        .unwrap()
        .public_key(&Secp256k1::new())
}

fn member(seed: u8) -> FederationMember {
    FederationMember::new(key(seed), key(seed + 100), key(seed + 200))
}

fn federation(size: u8, creation_block_number: u64) -> Federation {
    Federation::new(
        (1..=size).map(member).collect(),
        0,
        creation_block_number,
        Network::Regtest,
        FederationKind::Standard,
    )
    .unwrap()
}

fn block(number: u64) -> BlockContext {
    BlockContext {
        number,
        timestamp_millis: number * 1_000,
    }
}

fn utxo(seed: u8) -> Utxo {
    Utxo::new(
        OutPoint {
            txid: Txid::from_byte_array([seed; 32]),
            vout: 0,
        },
        10_000,
        1,
        ScriptBuf::new(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn signatures_required_is_strict_majority(size in 1u8..=15) {
        let federation = federation(size, 0);
        prop_assert_eq!(federation.size(), size as usize);
        prop_assert_eq!(federation.number_of_signatures_required(), size as usize / 2 + 1);
    }

    #[test]
    fn repeated_votes_count_once(
        votes in prop::collection::vec((0u8..8, 0usize..3), 0..60)
    ) {
        let authorized = (1..=5).map(Address::repeat_byte).collect::<Vec<_>>();
        let mut election = ThresholdElection::new(AddressBasedAuthorizer::new(
            authorized.clone(),
            MinimumRequired::All,
        ));
        let specs = ["create", "rollback", "commit"];
        let mut model: BTreeMap<usize, BTreeSet<Address>> = BTreeMap::new();

        for (voter, spec) in votes {
            let voter = Address::repeat_byte(voter);
            let counted = election.vote(CallSpec::new(specs[spec], vec![]), voter);
            let expected = authorized.contains(&voter) && model.entry(spec).or_default().insert(voter);
            prop_assert_eq!(counted, expected);
        }

        for (index, name) in specs.iter().enumerate() {
            let tally = election.votes_for(&CallSpec::new(*name, vec![]));
            prop_assert!(tally <= authorized.len());
            prop_assert_eq!(tally, model.get(&index).map(BTreeSet::len).unwrap_or(0));
        }
    }

    #[test]
    fn active_federation_follows_activation_age(
        creation in 0u64..1_000,
        height in 0u64..2_000,
        with_old in any::<bool>(),
    ) {
        let activations = ActivationsForBlock::all();
        let mut state = BridgeState::new(&REGTEST);
        let new = federation(4, creation);
        let old = federation(2, 0);
        state.new_federation = Some(new.clone());
        state.old_federation = with_old.then(|| old.clone());

        let support = FederationSupport::new(&mut state, &REGTEST, &activations, block(height)).unwrap();
        let promoted = height >= creation + support.activation_age();

        if promoted {
            prop_assert_eq!(support.active_federation(), &new);
            prop_assert_eq!(support.retiring_federation(), with_old.then_some(&old));
        } else {
            let fallback = if with_old { old.clone() } else { REGTEST.genesis_federation().unwrap() };
            prop_assert_eq!(support.active_federation(), &fallback);
            prop_assert!(support.retiring_federation().is_none());
        }
    }

    #[test]
    fn commit_succeeds_only_for_complete_matching_pending(
        size in 0u8..6,
        correct_hash in any::<bool>(),
        funds in 0u8..5,
    ) {
        let activations = ActivationsForBlock::all();
        let mut state = BridgeState::new(&REGTEST);
        state.new_federation_utxos = (1..=funds).map(utxo).collect();
        let before_funds = state.new_federation_utxos.clone();
        let genesis = REGTEST.genesis_federation().unwrap();

        let mut support = FederationSupport::new(&mut state, &REGTEST, &activations, block(7)).unwrap();
        prop_assert!(support.create_federation(false).is_success());
        for seed in 1..=size {
            prop_assert!(support.add_federator_public_key(false, member(seed)).is_success());
        }
        let hash = if correct_hash {
            support.pending_federation_hash().unwrap()
        } else {
            peg::bitcoin::hashes::sha256::Hash::hash(&[size]).to_byte_array().into()
        };

        let response = support.commit_federation(false, hash, &mut NoopEventLogger);
        let expected_success = size >= 2 && correct_hash;
        prop_assert_eq!(response.is_success(), expected_success);

        let state = support.state();
        if expected_success {
            prop_assert!(state.pending_federation.is_none());
            prop_assert_eq!(state.old_federation.as_ref(), Some(&genesis));
            prop_assert_eq!(
                state.new_federation.as_ref().map(Federation::size),
                Some(size as usize)
            );
            prop_assert_eq!(&state.old_federation_utxos, &before_funds);
            prop_assert!(state.new_federation_utxos.is_empty());
        } else {
            prop_assert_eq!(state.pending_federation.as_ref().map(|p| p.size()), Some(size as usize));
            prop_assert!(state.new_federation.is_none());
            prop_assert_eq!(&state.new_federation_utxos, &before_funds);
        }
    }
}
