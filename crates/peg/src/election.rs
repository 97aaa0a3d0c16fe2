use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome<R> {
    Rejected,
    Recorded,
    Applied(R),
}

/// A function call that voters agree on: the function name plus its encoded arguments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallSpec {
    pub function: String,
    pub arguments: Vec<Vec<u8>>,
}

impl CallSpec {
    pub fn new(function: impl Into<String>, arguments: Vec<Vec<u8>>) -> Self {
        Self {
            function: function.into(),
            arguments,
        }
    }
}

pub trait Authorizer {
    fn is_authorized(&self, address: &Address) -> bool;
    fn required_votes(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MinimumRequired {
    One,
    Majority,
    All,
}

/// Authorizes a fixed set of host-chain addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBasedAuthorizer {
    pub authorized: Vec<Address>,
    pub policy: MinimumRequired,
}

impl AddressBasedAuthorizer {
    pub fn new(authorized: Vec<Address>, policy: MinimumRequired) -> Self {
        Self { authorized, policy }
    }
}

impl Authorizer for AddressBasedAuthorizer {
    fn is_authorized(&self, address: &Address) -> bool {
        self.authorized.contains(address)
    }

    fn required_votes(&self) -> usize {
        let keys = self.authorized.len();
        match self.policy {
            MinimumRequired::One => 1,
            MinimumRequired::Majority => keys / 2 + 1,
            MinimumRequired::All => keys,
        }
    }
}

/// Tallies votes of authorized voters over call specs until one reaches the
/// authorizer's required vote count.
///
/// Specs are kept in their `Ord` order, so when several specs reach the threshold
/// at once the smallest one wins on every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdElection<S: Ord + Clone, A: Authorizer = AddressBasedAuthorizer> {
    authorizer: A,
    votes: BTreeMap<S, BTreeSet<Address>>,
}

impl<S: Ord + Clone, A: Authorizer> ThresholdElection<S, A> {
    pub fn new(authorizer: A) -> Self {
        Self::with_votes(authorizer, BTreeMap::new())
    }

    pub fn with_votes(authorizer: A, votes: BTreeMap<S, BTreeSet<Address>>) -> Self {
        Self { authorizer, votes }
    }

    pub fn authorizer(&self) -> &A {
        &self.authorizer
    }

    pub fn votes(&self) -> &BTreeMap<S, BTreeSet<Address>> {
        &self.votes
    }

    pub fn votes_for(&self, spec: &S) -> usize {
        self.votes.get(spec).map(BTreeSet::len).unwrap_or(0)
    }

    /// Records `voter`'s vote for `spec`. Returns false, leaving the election
    /// untouched, when the voter is not authorized or already voted for `spec`.
    pub fn vote(&mut self, spec: S, voter: Address) -> bool {
        if !self.authorizer.is_authorized(&voter) {
            return false;
        }
        if self
            .votes
            .get(&spec)
            .is_some_and(|voters| voters.contains(&voter))
        {
            return false;
        }
        self.votes.entry(spec).or_default().insert(voter);
        true
    }

    pub fn winner(&self) -> Option<&S> {
        let required = self.authorizer.required_votes();
        self.votes
            .iter()
            .find(|(_, voters)| voters.len() >= required)
            .map(|(spec, _)| spec)
    }

    /// Removes the winning spec's tally so its effect cannot be applied twice.
    pub fn clear_winners(&mut self) -> Option<S> {
        let winner = self.winner().cloned()?;
        self.votes.remove(&winner);
        Some(winner)
    }

    pub fn clear(&mut self) {
        self.votes.clear();
    }

    /// Votes and, once a winner exists, applies it and clears it.
    pub fn vote_and_apply<R>(
        &mut self,
        spec: S,
        voter: Address,
        apply: impl FnOnce(&S) -> R,
    ) -> VoteOutcome<R> {
        Self::vote_and_apply_within(self, |election| election, spec, voter, |_, winner| {
            apply(winner)
        })
    }

    /// [`Self::vote_and_apply`] for an election held by `owner`. The effect gets
    /// `owner` back mutably, so it may change anything the owner holds, the
    /// election included.
    pub fn vote_and_apply_within<T: ?Sized, R>(
        owner: &mut T,
        election: impl Fn(&mut T) -> &mut Self,
        spec: S,
        voter: Address,
        apply: impl FnOnce(&mut T, &S) -> R,
    ) -> VoteOutcome<R> {
        let this = election(owner);
        if !this.vote(spec, voter) {
            return VoteOutcome::Rejected;
        }
        let Some(winner) = this.winner().cloned() else {
            return VoteOutcome::Recorded;
        };
        debug!(
            "Election reached the required {} votes",
            this.authorizer.required_votes()
        );
        let result = apply(owner, &winner);
        election(owner).clear_winners();
        VoteOutcome::Applied(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voters(n: u8) -> Vec<Address> {
        (1..=n).map(|i| Address::repeat_byte(i)).collect()
    }

    fn election(n: u8, policy: MinimumRequired) -> ThresholdElection<CallSpec> {
        ThresholdElection::new(AddressBasedAuthorizer::new(voters(n), policy))
    }

    fn spec(name: &str) -> CallSpec {
        CallSpec::new(name, vec![])
    }

    #[test]
    fn required_votes_follow_policy() {
        assert_eq!(AddressBasedAuthorizer::new(voters(5), MinimumRequired::One).required_votes(), 1);
        assert_eq!(
            AddressBasedAuthorizer::new(voters(5), MinimumRequired::Majority).required_votes(),
            3
        );
        assert_eq!(
            AddressBasedAuthorizer::new(voters(4), MinimumRequired::Majority).required_votes(),
            3
        );
        assert_eq!(AddressBasedAuthorizer::new(voters(5), MinimumRequired::All).required_votes(), 5);
    }

    #[test]
    fn unauthorized_voter_is_rejected() {
        let mut election = election(3, MinimumRequired::Majority);
        assert!(!election.vote(spec("create"), Address::repeat_byte(9)));
        assert!(election.votes().is_empty());
    }

    #[test]
    fn repeated_vote_is_not_counted() {
        let mut election = election(3, MinimumRequired::Majority);
        assert!(election.vote(spec("create"), Address::repeat_byte(1)));
        assert!(!election.vote(spec("create"), Address::repeat_byte(1)));
        assert_eq!(election.votes_for(&spec("create")), 1);
        assert!(election.winner().is_none());
    }

    #[test]
    fn winner_appears_at_threshold() {
        let mut election = election(3, MinimumRequired::Majority);
        election.vote(spec("create"), Address::repeat_byte(1));
        election.vote(spec("rollback"), Address::repeat_byte(2));
        assert!(election.winner().is_none());

        election.vote(spec("create"), Address::repeat_byte(3));
        assert_eq!(election.winner(), Some(&spec("create")));
    }

    #[test]
    fn clear_winners_keeps_other_tallies() {
        let mut election = election(3, MinimumRequired::Majority);
        election.vote(spec("create"), Address::repeat_byte(1));
        election.vote(spec("create"), Address::repeat_byte(2));
        election.vote(spec("rollback"), Address::repeat_byte(3));

        assert_eq!(election.clear_winners(), Some(spec("create")));
        assert!(election.winner().is_none());
        assert_eq!(election.votes_for(&spec("create")), 0);
        assert_eq!(election.votes_for(&spec("rollback")), 1);
    }

    #[test]
    fn simultaneous_winners_resolve_in_spec_order() {
        let mut election = election(1, MinimumRequired::One);
        let authorizer = election.authorizer().clone();
        let mut votes = BTreeMap::new();
        votes.insert(spec("zeta"), BTreeSet::from([Address::repeat_byte(1)]));
        votes.insert(spec("alpha"), BTreeSet::from([Address::repeat_byte(1)]));
        election = ThresholdElection::with_votes(authorizer, votes);

        assert_eq!(election.winner(), Some(&spec("alpha")));
    }

    #[test]
    fn vote_and_apply_runs_effect_once() {
        let mut election = election(3, MinimumRequired::Majority);
        let mut applied = 0;

        assert_eq!(
            election.vote_and_apply(spec("create"), Address::repeat_byte(1), |_| ()),
            VoteOutcome::Recorded
        );
        let result = election.vote_and_apply(spec("create"), Address::repeat_byte(2), |winner| {
            applied += 1;
            winner.function.clone()
        });
        assert_eq!(result, VoteOutcome::Applied("create".to_string()));
        assert_eq!(applied, 1);
        assert!(election.votes().is_empty());
        assert_eq!(
            election.vote_and_apply(spec("create"), Address::repeat_byte(9), |_| ()),
            VoteOutcome::Rejected
        );
    }

    #[test]
    fn applied_winner_does_not_fire_again() {
        let mut election = election(3, MinimumRequired::Majority);
        election.vote(spec("rollback"), Address::repeat_byte(3));
        election.vote(spec("create"), Address::repeat_byte(1));
        let mut applied = Vec::new();

        let outcome = election.vote_and_apply(spec("create"), Address::repeat_byte(2), |winner| {
            applied.push(winner.clone())
        });
        assert_eq!(outcome, VoteOutcome::Applied(()));

        let outcome = election.vote_and_apply(spec("rollback"), Address::repeat_byte(1), |winner| {
            applied.push(winner.clone())
        });
        assert_eq!(outcome, VoteOutcome::Applied(()));
        assert_eq!(applied, vec![spec("create"), spec("rollback")]);
        assert!(election.votes().is_empty());
    }

    struct Owner {
        applied: Vec<CallSpec>,
        election: ThresholdElection<CallSpec>,
    }

    #[test]
    fn effect_can_reset_the_owning_election() {
        let mut owner = Owner {
            applied: vec![],
            election: election(3, MinimumRequired::Majority),
        };
        owner.election.vote(spec("rollback"), Address::repeat_byte(3));
        owner.election.vote(spec("commit"), Address::repeat_byte(1));

        let outcome = ThresholdElection::vote_and_apply_within(
            &mut owner,
            |owner| &mut owner.election,
            spec("commit"),
            Address::repeat_byte(2),
            |owner, winner| {
                owner.applied.push(winner.clone());
                owner.election.clear();
                winner.function.len()
            },
        );

        assert_eq!(outcome, VoteOutcome::Applied(6));
        assert_eq!(owner.applied, vec![spec("commit")]);
        assert!(owner.election.votes().is_empty());
    }
}
