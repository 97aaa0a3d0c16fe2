use crate::config::BridgeConstants;
use crate::election::{Authorizer, CallSpec, VoteOutcome};
use crate::metrics::FEE_PER_KB_VOTES;
use crate::storage::BridgeState;
use ethers::types::Address;
use strum::IntoStaticStr;
use tracing::{debug, info, warn};

const SET_FEE_PER_KB: &str = "setFeePerKb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FeePerKbResponse {
    Success,
    UnauthorizedCaller,
    UnsuccessfulVote,
    NegativeFee,
    ExcessiveFee,
}

impl FeePerKbResponse {
    pub fn code(&self) -> i32 {
        match self {
            FeePerKbResponse::Success => 1,
            FeePerKbResponse::UnsuccessfulVote => -1,
            FeePerKbResponse::NegativeFee => -2,
            FeePerKbResponse::ExcessiveFee => -3,
            FeePerKbResponse::UnauthorizedCaller => -10,
        }
    }
}

/// Fee per kilobyte used for migration transactions, changed by authorized vote.
pub struct FeePerKbSupport<'a> {
    state: &'a mut BridgeState,
    constants: &'a BridgeConstants,
}

impl<'a> FeePerKbSupport<'a> {
    pub fn new(state: &'a mut BridgeState, constants: &'a BridgeConstants) -> Self {
        Self { state, constants }
    }

    pub fn fee_per_kb(&self) -> u64 {
        self.state.fee_per_kb(self.constants)
    }

    /// `fee` is in satoshis and signed as received from the caller.
    pub fn vote_fee_per_kb_change(&mut self, sender: Address, fee: i64) -> FeePerKbResponse {
        let response = self.vote(sender, fee);
        debug!("Fee per kb vote of {fee} by {sender:?}: {}", response.code());
        let label: &'static str = response.into();
        FEE_PER_KB_VOTES.with_label_values(&[label]).inc();
        response
    }

    fn vote(&mut self, sender: Address, fee: i64) -> FeePerKbResponse {
        let election = &mut self.state.fee_per_kb_election;
        if !election.authorizer().is_authorized(&sender) {
            return FeePerKbResponse::UnauthorizedCaller;
        }
        if fee <= 0 {
            return FeePerKbResponse::NegativeFee;
        }
        let fee = fee as u64;
        if fee > self.constants.max_fee_per_kb {
            warn!(
                "Voted fee per kb {fee} exceeds the maximum of {}",
                self.constants.max_fee_per_kb
            );
            return FeePerKbResponse::ExcessiveFee;
        }

        let spec = CallSpec::new(SET_FEE_PER_KB, vec![fee.to_be_bytes().to_vec()]);
        match election.vote_and_apply(spec, sender, decode_fee) {
            VoteOutcome::Rejected => FeePerKbResponse::UnsuccessfulVote,
            VoteOutcome::Recorded => FeePerKbResponse::Success,
            VoteOutcome::Applied(Some(winner)) => {
                info!("Fee per kb changed to {winner}");
                self.state.fee_per_kb = Some(winner);
                FeePerKbResponse::Success
            }
            VoteOutcome::Applied(None) => {
                warn!("Winning fee per kb vote carries a malformed fee");
                FeePerKbResponse::UnsuccessfulVote
            }
        }
    }
}

fn decode_fee(spec: &CallSpec) -> Option<u64> {
    match spec.arguments.as_slice() {
        [fee] => Some(u64::from_be_bytes(fee.as_slice().try_into().ok()?)),
        _ => None,
    }
}
