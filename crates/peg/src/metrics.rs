use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, IntCounter,
    IntCounterVec, Registry,
};

lazy_static! {
    pub static ref PEG_REGISTRY: Registry =
        Registry::new_custom(Some("peg".to_string()), None).unwrap();
}

// Register metrics with the `peg` registry
lazy_static! {
    pub static ref FEDERATION_VOTES: IntCounterVec = register_int_counter_vec_with_registry!(
        "federation_votes_total",
        "Federation change votes received, by function and response",
        &["function", "result"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref FEDERATION_COMMITS: IntCounter = register_int_counter_with_registry!(
        "federation_commits_total",
        "Pending federations committed",
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref FEE_PER_KB_VOTES: IntCounterVec = register_int_counter_vec_with_registry!(
        "fee_per_kb_votes_total",
        "Fee per kb change votes received, by response",
        &["result"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref MIGRATED_UTXOS: IntCounter = register_int_counter_with_registry!(
        "migrated_utxos_total",
        "Retiring federation UTXOs spent by migration transactions",
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref CLASSIFIED_TRANSACTIONS: IntCounterVec =
        register_int_counter_vec_with_registry!(
            "classified_transactions_total",
            "Bitcoin transactions classified, by peg type and strategy",
            &["type", "strategy"],
            PEG_REGISTRY
        )
        .unwrap();
}
