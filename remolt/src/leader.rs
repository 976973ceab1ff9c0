//! The forward/leader hook.  A replica may be configured with a leader to which clients forward
//! reconfiguration proposals instead of driving them themselves; the leader serializes competing
//! proposals into a single reconfiguration path.  The driving loop itself lives outside this
//! crate; here is the sink the replicas hand proposals to.

use std::collections::VecDeque;
use std::sync::Mutex;

use remolt_pb::Blueprint;

/////////////////////////////////////////// ProposalSink ///////////////////////////////////////////

/// Receives blueprints forwarded through a replica.
pub trait ProposalSink: Send + Sync {
    /// Hand over one proposal.  Must not block on I/O; the replica calls this while servicing an
    /// RPC.
    fn propose(&self, prop: Blueprint);
}

////////////////////////////////////////////// Leader //////////////////////////////////////////////

/// A leader that queues forwarded proposals in arrival order for an external driver to drain and
/// reconfigure with.
#[derive(Default)]
pub struct Leader {
    proposals: Mutex<VecDeque<Blueprint>>,
}

impl Leader {
    /// Create a leader with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued proposal, oldest first.
    pub fn drain(&self) -> Vec<Blueprint> {
        self.proposals.lock().unwrap().drain(..).collect()
    }

    /// The merge of every queued proposal, for drivers that reconfigure once per batch.
    pub fn merged(&self) -> Option<Blueprint> {
        let proposals = self.proposals.lock().unwrap();
        proposals
            .iter()
            .fold(None, |acc: Option<Blueprint>, prop| match acc {
                Some(acc) => Some(acc.merge(prop)),
                None => Some(prop.clone()),
            })
    }
}

impl ProposalSink for Leader {
    fn propose(&self, prop: Blueprint) {
        self.proposals.lock().unwrap().push_back(prop);
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use remolt_pb::NodeID;

    use super::*;

    fn bp(add: &[u32]) -> Blueprint {
        Blueprint::new(add.iter().copied().map(NodeID::new).collect(), Vec::new())
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let leader = Leader::new();
        leader.propose(bp(&[1, 2, 3, 4]));
        leader.propose(bp(&[1, 2, 3, 5]));
        assert_eq!(vec![bp(&[1, 2, 3, 4]), bp(&[1, 2, 3, 5])], leader.drain());
        assert!(leader.drain().is_empty());
    }

    #[test]
    fn merged_joins_the_batch() {
        let leader = Leader::new();
        assert_eq!(None, leader.merged());
        leader.propose(bp(&[1, 2, 3, 4]));
        leader.propose(bp(&[1, 2, 3, 5]));
        assert_eq!(Some(bp(&[1, 2, 3, 4, 5])), leader.merged());
    }
}
