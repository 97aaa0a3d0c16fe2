use bitcoin::{OutPoint, ScriptBuf};

/// An unspent output held by one of the federations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Utxo {
    pub outpoint: OutPoint,
    /// Satoshis
    pub value: u64,
    /// Bitcoin block height the output was confirmed at
    pub height: u32,
    pub script_pubkey: ScriptBuf,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, value: u64, height: u32, script_pubkey: ScriptBuf) -> Self {
        Self {
            outpoint,
            value,
            height,
            script_pubkey,
        }
    }
}

pub fn total_value(utxos: &[Utxo]) -> u64 {
    utxos.iter().map(|utxo| utxo.value).sum()
}
