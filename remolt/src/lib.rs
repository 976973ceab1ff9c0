//! remolt is a replicated atomic register whose membership reconfigures without downtime.
//!
//! The register's replica set is described by a [remolt_pb::Blueprint], a join-semilattice of
//! add/remove sets.  Clients propose successor blueprints while reads and writes continue; every
//! operation walks the client's chain of known configurations, propagating the register value
//! through overlapping quorums until a single current configuration with no pending successor
//! remains.
//!
//! Two agreement flavours decide successors:
//!
//! * the lattice flavour ([replica::LatticeReplica] driven by [client::LatticeSession]) merges
//!   concurrent proposals, so every competing reconfiguration survives into the union;
//! * the consensus flavour ([consensus::ConsensusReplica] driven by [client::ConsensusSession])
//!   runs a prepare/accept exchange per configuration, so exactly one successor is decided and
//!   competing proposals adopt it.
//!
//! The quorum fan-out is abstract ([fanout::LatticeFanout], [fanout::ConsensusFanout]); the
//! [memory::MemoryFanout] reference implementation drives in-process replicas through the full
//! wire path and powers the integration tests.

use biometrics::Collector;

pub mod client;
pub mod consensus;
pub mod fanout;
pub mod leader;
pub mod memory;
pub mod provider;
pub mod replica;

pub use client::{ConsensusSession, LatticeSession, Mode, SessionOptions};
pub use consensus::ConsensusReplica;
pub use fanout::{ConsensusFanout, LatticeFanout, Quorum};
pub use leader::{Leader, ProposalSink};
pub use memory::MemoryFanout;
pub use provider::{Configuration, ContactPlan};
pub use replica::LatticeReplica;

////////////////////////////////////////////// indicio /////////////////////////////////////////////

/// The collector to which this crate's clues are emitted.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Register this crate's counters with the provided collector.
pub fn register_biometrics(collector: &mut Collector) {
    client::register_biometrics(collector);
    consensus::register_biometrics(collector);
    memory::register_biometrics(collector);
    replica::register_biometrics(collector);
}
