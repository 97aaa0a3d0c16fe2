use crate::federation::Federation;
use crate::federation_support::BlockContext;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    CommitFederation {
        block_number: u64,
        old_federation: Federation,
        new_federation: Federation,
        /// Block at which `new_federation` becomes active
        activation_block_number: u64,
    },
}

/// Receives the events the bridge emits into the host chain's logs.
pub trait BridgeEventLogger {
    fn log_commit_federation(
        &mut self,
        block: &BlockContext,
        old_federation: &Federation,
        new_federation: &Federation,
        activation_block_number: u64,
    );
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventLogger;

impl BridgeEventLogger for NoopEventLogger {
    fn log_commit_federation(&mut self, _: &BlockContext, _: &Federation, _: &Federation, _: u64) {}
}

/// Keeps every event in emission order.
#[derive(Debug, Default, Clone)]
pub struct RecordingEventLogger {
    pub events: Vec<BridgeEvent>,
}

impl BridgeEventLogger for RecordingEventLogger {
    fn log_commit_federation(
        &mut self,
        block: &BlockContext,
        old_federation: &Federation,
        new_federation: &Federation,
        activation_block_number: u64,
    ) {
        info!(
            "Federation {} committed at block {}, active from {activation_block_number}",
            new_federation.address(),
            block.number
        );
        self.events.push(BridgeEvent::CommitFederation {
            block_number: block.number,
            old_federation: old_federation.clone(),
            new_federation: new_federation.clone(),
            activation_block_number,
        });
    }
}
