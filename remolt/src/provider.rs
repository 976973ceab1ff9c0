//! The configuration provider.  A [Configuration] materializes a blueprint's membership and
//! quorum sizes into something a fan-out can contact; [ContactPlan]s carve out the subset of
//! members still worth contacting when part of a quorum has already replied.

use std::time::Duration;

use remolt_pb::{Blueprint, NodeID, QuorumSpec};

//////////////////////////////////////////// ContactPlan ///////////////////////////////////////////

/// A plan for one quorum call:  which replicas to contact, how many replies satisfy the call, and
/// how long to wait for them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContactPlan {
    /// The replicas to contact.
    pub nodes: Vec<NodeID>,
    /// How many replies satisfy the call.
    pub threshold: usize,
    /// The deadline for the call.
    pub timeout: Duration,
}

/////////////////////////////////////////// Configuration //////////////////////////////////////////

/// A materialized configuration:  the live membership of a blueprint plus its quorum sizes.
/// Configurations are created once per blueprint the client learns and are cheap to copy from.
#[derive(Clone, Debug)]
pub struct Configuration {
    ids: Vec<NodeID>,
    quorum: QuorumSpec,
    timeout: Duration,
}

impl Configuration {
    /// Materialize `blueprint` with the provided per-call timeout.
    pub fn new(blueprint: &Blueprint, timeout: Duration) -> Self {
        Self {
            ids: blueprint.ids(),
            quorum: blueprint.quorum(),
            timeout,
        }
    }

    /// The live membership.
    pub fn ids(&self) -> &[NodeID] {
        &self.ids
    }

    /// The number of replies a read requires.
    pub fn read_quorum(&self) -> usize {
        self.quorum.read
    }

    /// The number of replies a write requires.
    pub fn write_quorum(&self) -> usize {
        self.quorum.write
    }

    /// The full-membership read plan.
    pub fn read_plan(&self) -> ContactPlan {
        self.plan(self.quorum.read)
    }

    /// The full-membership write plan.
    pub fn write_plan(&self) -> ContactPlan {
        self.plan(self.quorum.write)
    }

    /// A read plan that skips `contacted` replicas, counting their earlier replies toward the
    /// quorum.  `None` means every needed reply is already in hand:  the caller must account for
    /// the round as if it had been transmitted and succeeded.
    pub fn read_plan_excluding(&self, contacted: &[NodeID]) -> Option<ContactPlan> {
        self.plan_excluding(self.quorum.read, contacted)
    }

    /// The write-quorum analogue of [Configuration::read_plan_excluding].
    pub fn write_plan_excluding(&self, contacted: &[NodeID]) -> Option<ContactPlan> {
        self.plan_excluding(self.quorum.write, contacted)
    }

    fn plan(&self, need: usize) -> ContactPlan {
        ContactPlan {
            nodes: self.ids.clone(),
            threshold: need,
            timeout: self.timeout,
        }
    }

    fn plan_excluding(&self, need: usize, contacted: &[NodeID]) -> Option<ContactPlan> {
        let already = self.ids.iter().filter(|id| contacted.contains(id)).count();
        if already >= need {
            return None;
        }
        let nodes: Vec<NodeID> = self
            .ids
            .iter()
            .filter(|id| !contacted.contains(id))
            .copied()
            .collect();
        Some(ContactPlan {
            nodes,
            threshold: need - already,
            timeout: self.timeout,
        })
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[u32]) -> Vec<NodeID> {
        ids.iter().copied().map(NodeID::new).collect()
    }

    fn config(ids: &[u32]) -> Configuration {
        let blueprint = Blueprint::new(nodes(ids), Vec::new());
        Configuration::new(&blueprint, Duration::from_secs(1))
    }

    #[test]
    fn full_plans_cover_the_membership() {
        let config = config(&[1, 2, 3]);
        let plan = config.read_plan();
        assert_eq!(nodes(&[1, 2, 3]), plan.nodes);
        assert_eq!(2, plan.threshold);
        let plan = config.write_plan();
        assert_eq!(2, plan.threshold);
    }

    #[test]
    fn exclusion_reduces_nodes_and_threshold() {
        let config = config(&[1, 2, 3, 4, 5]);
        let plan = config.write_plan_excluding(&nodes(&[1, 2])).unwrap();
        assert_eq!(nodes(&[3, 4, 5]), plan.nodes);
        assert_eq!(1, plan.threshold);
    }

    #[test]
    fn exclusion_of_non_members_changes_nothing() {
        let config = config(&[1, 2, 3]);
        let plan = config.write_plan_excluding(&nodes(&[7, 8])).unwrap();
        assert_eq!(nodes(&[1, 2, 3]), plan.nodes);
        assert_eq!(2, plan.threshold);
    }

    #[test]
    fn satisfied_quorum_yields_no_plan() {
        let config = config(&[1, 2, 3]);
        assert_eq!(None, config.read_plan_excluding(&nodes(&[1, 2])));
        assert_eq!(None, config.write_plan_excluding(&nodes(&[1, 2, 3])));
    }
}
