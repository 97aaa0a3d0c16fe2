//! Canonical RLP encoding of the persisted peg state.
//!
//! Every node has to produce the same bytes for the same state, so collections are
//! always written in their stored order and sets are written sorted.

use crate::election::CallSpec;
use crate::federation::{Federation, FederationKind, FederationMember, PendingFederation};
use crate::utxo::Utxo;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Network, OutPoint, ScriptBuf, Transaction, Txid};
use ethers::types::Address;
use rlp::{DecoderError, Rlp, RlpStream};
use std::collections::{BTreeMap, BTreeSet};

const KIND_STANDARD: u8 = 0;
const KIND_NON_STANDARD_ERP: u8 = 1;
const KIND_P2SH_ERP: u8 = 2;

fn list_of<T>(
    rlp: &Rlp,
    decode_item: impl Fn(&Rlp) -> Result<T, DecoderError>,
) -> Result<Vec<T>, DecoderError> {
    if !rlp.is_list() {
        return Err(DecoderError::RlpExpectedToBeList);
    }
    rlp.iter().map(|item| decode_item(&item)).collect()
}

fn append_public_key(stream: &mut RlpStream, key: &PublicKey) {
    stream.append(&key.serialize().to_vec());
}

fn decode_public_key(rlp: &Rlp) -> Result<PublicKey, DecoderError> {
    PublicKey::from_slice(rlp.data()?).map_err(|_| DecoderError::Custom("invalid public key"))
}

fn append_member(stream: &mut RlpStream, member: &FederationMember) {
    stream.begin_list(3);
    append_public_key(stream, &member.btc_public_key);
    append_public_key(stream, &member.chain_public_key);
    append_public_key(stream, &member.mst_public_key);
}

fn decode_member(rlp: &Rlp) -> Result<FederationMember, DecoderError> {
    if rlp.item_count()? != 3 {
        return Err(DecoderError::RlpIncorrectListLen);
    }
    Ok(FederationMember::new(
        decode_public_key(&rlp.at(0)?)?,
        decode_public_key(&rlp.at(1)?)?,
        decode_public_key(&rlp.at(2)?)?,
    ))
}

fn append_members(stream: &mut RlpStream, members: &[FederationMember]) {
    stream.begin_list(members.len());
    for member in members {
        append_member(stream, member);
    }
}

pub fn serialize_federation(federation: &Federation) -> Vec<u8> {
    let mut stream = RlpStream::new_list(6);
    append_members(&mut stream, federation.members());
    stream.append(&federation.creation_time());
    stream.append(&federation.creation_block_number());
    let kind = federation.kind();
    stream.append(&kind.tag());
    let erp_keys = kind.erp_keys();
    stream.begin_list(erp_keys.len());
    for key in erp_keys {
        append_public_key(&mut stream, key);
    }
    stream.append(&kind.activation_delay().unwrap_or(0));
    stream.out().to_vec()
}

/// The network is not part of the encoding; it comes from the bridge constants.
pub fn deserialize_federation(bytes: &[u8], network: Network) -> Result<Federation, DecoderError> {
    let rlp = Rlp::new(bytes);
    if rlp.item_count()? != 6 {
        return Err(DecoderError::RlpIncorrectListLen);
    }
    let members = list_of(&rlp.at(0)?, decode_member)?;
    let creation_time: u64 = rlp.val_at(1)?;
    let creation_block_number: u64 = rlp.val_at(2)?;
    let tag: u8 = rlp.val_at(3)?;
    let erp_keys = list_of(&rlp.at(4)?, decode_public_key)?;
    let activation_delay: u64 = rlp.val_at(5)?;

    let kind = match tag {
        KIND_STANDARD => FederationKind::Standard,
        KIND_NON_STANDARD_ERP => FederationKind::NonStandardErp {
            erp_keys,
            activation_delay,
        },
        KIND_P2SH_ERP => FederationKind::P2shErp {
            erp_keys,
            activation_delay,
        },
        _ => return Err(DecoderError::Custom("unknown federation kind")),
    };

    Federation::new(members, creation_time, creation_block_number, network, kind)
        .map_err(|_| DecoderError::Custom("invalid federation"))
}

pub fn serialize_pending_federation(pending: &PendingFederation) -> Vec<u8> {
    let mut stream = RlpStream::new();
    append_members(&mut stream, pending.members());
    stream.out().to_vec()
}

pub fn deserialize_pending_federation(bytes: &[u8]) -> Result<PendingFederation, DecoderError> {
    Ok(PendingFederation::new(list_of(&Rlp::new(bytes), decode_member)?))
}

pub fn serialize_utxos(utxos: &[Utxo]) -> Vec<u8> {
    let mut stream = RlpStream::new_list(utxos.len());
    for utxo in utxos {
        stream.begin_list(5);
        stream.append(&utxo.outpoint.txid.to_byte_array().to_vec());
        stream.append(&utxo.outpoint.vout);
        stream.append(&utxo.value);
        stream.append(&utxo.height);
        stream.append(&utxo.script_pubkey.to_bytes());
    }
    stream.out().to_vec()
}

pub fn deserialize_utxos(bytes: &[u8]) -> Result<Vec<Utxo>, DecoderError> {
    list_of(&Rlp::new(bytes), |item| {
        if item.item_count()? != 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let txid = Txid::from_slice(item.at(0)?.data()?)
            .map_err(|_| DecoderError::Custom("invalid txid"))?;
        Ok(Utxo::new(
            OutPoint {
                txid,
                vout: item.val_at(1)?,
            },
            item.val_at(2)?,
            item.val_at(3)?,
            ScriptBuf::from_bytes(item.val_at::<Vec<u8>>(4)?),
        ))
    })
}

pub fn serialize_election(votes: &BTreeMap<CallSpec, BTreeSet<Address>>) -> Vec<u8> {
    let mut stream = RlpStream::new_list(votes.len());
    for (spec, voters) in votes {
        stream.begin_list(2);
        stream.begin_list(2);
        stream.append(&spec.function.as_bytes().to_vec());
        stream.begin_list(spec.arguments.len());
        for argument in &spec.arguments {
            stream.append(argument);
        }
        stream.begin_list(voters.len());
        for voter in voters {
            stream.append(&voter.as_bytes().to_vec());
        }
    }
    stream.out().to_vec()
}

pub fn deserialize_election(
    bytes: &[u8],
) -> Result<BTreeMap<CallSpec, BTreeSet<Address>>, DecoderError> {
    let entries = list_of(&Rlp::new(bytes), |entry| {
        let spec = entry.at(0)?;
        let function = String::from_utf8(spec.val_at::<Vec<u8>>(0)?)
            .map_err(|_| DecoderError::Custom("invalid function name"))?;
        let arguments = list_of(&spec.at(1)?, |argument| argument.as_val::<Vec<u8>>())?;
        let voters = list_of(&entry.at(1)?, |voter| {
            let bytes = voter.data()?;
            if bytes.len() != Address::len_bytes() {
                return Err(DecoderError::Custom("invalid voter address"));
            }
            Ok(Address::from_slice(bytes))
        })?;
        Ok((
            CallSpec::new(function, arguments),
            voters.into_iter().collect::<BTreeSet<_>>(),
        ))
    })?;
    Ok(entries.into_iter().collect())
}

pub fn serialize_u64(value: u64) -> Vec<u8> {
    rlp::encode(&value).to_vec()
}

pub fn deserialize_u64(bytes: &[u8]) -> Result<u64, DecoderError> {
    Rlp::new(bytes).as_val()
}

pub fn serialize_script(script: &ScriptBuf) -> Vec<u8> {
    rlp::encode(&script.to_bytes()).to_vec()
}

pub fn deserialize_script(bytes: &[u8]) -> Result<ScriptBuf, DecoderError> {
    Ok(ScriptBuf::from_bytes(Rlp::new(bytes).as_val::<Vec<u8>>()?))
}

pub fn serialize_sighashes(sighashes: &BTreeSet<[u8; 32]>) -> Vec<u8> {
    let mut stream = RlpStream::new_list(sighashes.len());
    for sighash in sighashes {
        stream.append(&sighash.to_vec());
    }
    stream.out().to_vec()
}

pub fn deserialize_sighashes(bytes: &[u8]) -> Result<BTreeSet<[u8; 32]>, DecoderError> {
    let hashes = list_of(&Rlp::new(bytes), |item| {
        <[u8; 32]>::try_from(item.data()?).map_err(|_| DecoderError::Custom("invalid sighash"))
    })?;
    Ok(hashes.into_iter().collect())
}

/// Transactions awaiting confirmations, keyed by the host-chain block that created them.
pub fn serialize_pegouts(pegouts: &[(u64, Transaction)]) -> Vec<u8> {
    let mut stream = RlpStream::new_list(pegouts.len());
    for (block_number, transaction) in pegouts {
        stream.begin_list(2);
        stream.append(block_number);
        stream.append(&encode::serialize(transaction));
    }
    stream.out().to_vec()
}

pub fn deserialize_pegouts(bytes: &[u8]) -> Result<Vec<(u64, Transaction)>, DecoderError> {
    list_of(&Rlp::new(bytes), |item| {
        let block_number: u64 = item.val_at(0)?;
        let transaction: Transaction = encode::deserialize(item.at(1)?.data()?)
            .map_err(|_| DecoderError::Custom("invalid transaction"))?;
        Ok((block_number, transaction))
    })
}
