//! The quorum-call fan-out abstraction.  A fan-out sends one request to every replica in a
//! [ContactPlan] and returns once the plan's threshold of replies is in hand; how the messages
//! travel is the implementor's business.  The client engine treats each call as a single
//! synchronous step.

use remolt_pb::{
    AdvReadReply, CNewCur, Conf, ConfReply, DRead, Error, LAProposal, LAReply, Learn, NewCur,
    NewCurReply, NewState, NewStateReply, NodeID, Prepare, Promise, Propose, ReadReply, WriteN,
    WriteNReply, WriteS,
};

use crate::provider::ContactPlan;

////////////////////////////////////////////// Quorum //////////////////////////////////////////////

/// The replies gathered by one quorum call, together with the replicas that produced them.
#[derive(Clone, Debug, Default)]
pub struct Quorum<T> {
    /// The replies, at least the plan's threshold of them.
    pub replies: Vec<T>,
    /// The replicas that replied.
    pub responders: Vec<NodeID>,
}

impl<T> Quorum<T> {
    /// A quorum with no replies, used when every needed replica was already contacted.
    pub fn empty() -> Self {
        Self {
            replies: Vec::new(),
            responders: Vec::new(),
        }
    }
}

/////////////////////////////////////////// LatticeFanout //////////////////////////////////////////

/// Fan-out over the lattice-agreement replica surface.
pub trait LatticeFanout: Send + Sync + 'static {
    /// Read the register from a quorum.
    fn read(&self, plan: &ContactPlan, req: &Conf) -> Result<Quorum<ReadReply>, Error>;
    /// Write the register at a quorum.
    fn write(&self, plan: &ContactPlan, req: &WriteS) -> Result<Quorum<ConfReply>, Error>;
    /// Record a successor blueprint at a quorum.
    fn write_next(&self, plan: &ContactPlan, req: &WriteN) -> Result<Quorum<WriteNReply>, Error>;
    /// Run one lattice-agreement round at a quorum.
    fn la_prop(&self, plan: &ContactPlan, req: &LAProposal) -> Result<Quorum<LAReply>, Error>;
    /// Propagate register and agreement state into a configuration.
    fn set_state(&self, plan: &ContactPlan, req: &NewState)
        -> Result<Quorum<NewStateReply>, Error>;
    /// Install a current configuration.
    fn set_cur(&self, plan: &ContactPlan, req: &NewCur) -> Result<Quorum<NewCurReply>, Error>;
}

////////////////////////////////////////// ConsensusFanout /////////////////////////////////////////

/// Fan-out over the consensus replica surface.
pub trait ConsensusFanout: Send + Sync + 'static {
    /// Read the register from a quorum.
    fn read(&self, plan: &ContactPlan, req: &Conf) -> Result<Quorum<ReadReply>, Error>;
    /// Write the register at a quorum.
    fn write(&self, plan: &ContactPlan, req: &WriteS) -> Result<Quorum<ConfReply>, Error>;
    /// Record the decided successor and read the register in one round.
    fn write_next(&self, plan: &ContactPlan, req: &DRead) -> Result<Quorum<AdvReadReply>, Error>;
    /// Install register state and current configuration in one round.
    fn set_state(&self, plan: &ContactPlan, req: &CNewCur)
        -> Result<Quorum<NewStateReply>, Error>;
    /// Run phase one of the successor decision.
    fn prepare(&self, plan: &ContactPlan, req: &Prepare) -> Result<Quorum<Promise>, Error>;
    /// Run phase two of the successor decision.
    fn accept(&self, plan: &ContactPlan, req: &Propose) -> Result<Quorum<Learn>, Error>;
}
