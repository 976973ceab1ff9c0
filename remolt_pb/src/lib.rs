//! remolt_pb provides the protocol buffers for remolt, a reconfigurable replicated register.
//!
//! The centerpiece is the [Blueprint]: a membership descriptor that forms a join-semilattice.
//! Replicas and clients exchange blueprints to agree on the next configuration of the register
//! while reads and writes proceed concurrently.  Everything on the wire lives in this crate;
//! the state machines that animate these messages live in the remolt crate.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use prototk_derive::Message;

use rpc_pb::service;

use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The configuration identifier reserved for "uninstalled".
pub const UNINSTALLED: u32 = 0;

////////////////////////////////////////////// NodeID //////////////////////////////////////////////

/// A process identifier.  Replicas and clients draw from the same identifier space.  The zero
/// identifier is reserved for "nobody" and doubles as the writer of the initial register state.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct NodeID {
    /// The raw identifier.
    #[prototk(1, uint32)]
    pub id: u32,
}

impl NodeID {
    /// The reserved "nobody" identifier.
    pub const BOTTOM: NodeID = NodeID { id: 0 };

    /// Construct a new NodeID.
    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

impl From<u32> for NodeID {
    fn from(id: u32) -> Self {
        Self { id }
    }
}

impl std::fmt::Display for NodeID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "node:{}", self.id)
    }
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type shared by both replica services.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(612352, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(612353, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: prototk::Error,
    },
    /// There was an error at the RPC layer.
    #[prototk(612354, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// A quorum call could not gather enough replies.
    #[prototk(612355, message)]
    QuorumFailure {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// How many replies were gathered.
        #[prototk(2, uint64)]
        have: u64,
        /// How many replies were needed.
        #[prototk(3, uint64)]
        need: u64,
    },
    /// A write-next tried to install a successor different from the one already recorded.
    #[prototk(612356, message)]
    OverwriteNext {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The configuration whose successor was contested.
        #[prototk(2, uint32)]
        cur_c: u32,
    },
    /// A new current configuration was incomparable to the installed one.
    #[prototk(612357, message)]
    IncomparableCurrent {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// The requested facility is not wired up on this replica.
    #[prototk(612358, message)]
    NotImplemented {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what was missing.
        #[prototk(2, string)]
        what: String,
    },
    /// A reconfiguration would install a configuration below the minimum size.
    #[prototk(612359, message)]
    UnacceptableConfiguration {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The size the agreed configuration would have.
        #[prototk(2, uint64)]
        have: u64,
        /// The minimum permissible size.
        #[prototk(3, uint64)]
        need: u64,
    },
    /// A set-state request carried no register state.
    #[prototk(612360, message)]
    EmptyNewState {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
}

impl Error {
    /// Construct a NotImplemented error.
    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    /// Construct a QuorumFailure error.
    pub fn quorum_failure(have: u64, need: u64) -> Self {
        Self::QuorumFailure {
            core: ErrorCore::default(),
            have,
            need,
        }
    }
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(what: buffertk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<rpc_pb::Error> for Error {
    fn from(what: rpc_pb::Error) -> Self {
        Self::RpcError {
            core: ErrorCore::default(),
            what,
        }
    }
}

//////////////////////////////////////////// QuorumSpec ////////////////////////////////////////////

/// The quorum sizes of a configuration.  Reads and writes each require a majority of the live
/// membership, so overlapping quorums intersect in at least one replica.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QuorumSpec {
    /// Number of replies a read quorum requires.
    pub read: usize,
    /// Number of replies a write quorum requires.
    pub write: usize,
}

///////////////////////////////////////////// Blueprint ////////////////////////////////////////////

/// A membership descriptor.  Blueprints form a join-semilattice:  a blueprint is a pair of
/// add/remove sets, ordered by componentwise inclusion, merged by componentwise union.  The live
/// membership is `add \ remove`, so removing a replica grows the blueprint rather than shrinking
/// it and ranks stay strictly monotone along any chain of configurations.
///
/// [Blueprint::rank] is the total size of both sets.  Along a single chain of configurations the
/// rank uniquely identifies a blueprint and doubles as the configuration identifier installed on
/// replicas.  [Blueprint::learned_cmp] compares by rank alone and is the order used to walk
/// chains; `PartialOrd` is the full lattice order and is `None` for incomparable proposals.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Blueprint {
    /// Replicas added across the history of this blueprint.
    #[prototk(1, message)]
    add: Vec<NodeID>,
    /// Replicas removed across the history of this blueprint.
    #[prototk(2, message)]
    remove: Vec<NodeID>,
}

impl Blueprint {
    /// Construct a blueprint from add and remove sets.  The inputs are deduplicated and sorted.
    pub fn new(add: Vec<NodeID>, remove: Vec<NodeID>) -> Self {
        Self {
            add: normalize(add),
            remove: normalize(remove),
        }
    }

    /// The live membership: every added replica not since removed.
    pub fn ids(&self) -> Vec<NodeID> {
        self.add
            .iter()
            .filter(|id| !self.remove.contains(id))
            .copied()
            .collect()
    }

    /// The replicas ever added.
    pub fn added(&self) -> &[NodeID] {
        &self.add
    }

    /// The replicas ever removed.
    pub fn removed(&self) -> &[NodeID] {
        &self.remove
    }

    /// The rank of this blueprint: the total size of the add and remove sets.  Monotone under
    /// merge and unique along a chain of configurations.
    pub fn rank(&self) -> u32 {
        (self.add.len() + self.remove.len()) as u32
    }

    /// True iff this blueprint carries no membership information.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// The least upper bound of two blueprints.  Commutative, associative, idempotent.
    pub fn merge(&self, other: &Blueprint) -> Blueprint {
        Blueprint {
            add: union(&self.add, &other.add),
            remove: union(&self.remove, &other.remove),
        }
    }

    /// Compare two blueprints by how far along a chain they are.  Blueprints on the same chain
    /// are totally ordered by rank; this is the cheap comparison used everywhere the full lattice
    /// order is unnecessary.
    pub fn learned_cmp(&self, other: &Blueprint) -> Ordering {
        self.rank().cmp(&other.rank())
    }

    /// True iff the two blueprints are at the same point of the chain.
    pub fn learned_equals(&self, other: &Blueprint) -> bool {
        self.learned_cmp(other) == Ordering::Equal
    }

    /// The quorum sizes for this blueprint's live membership.
    pub fn quorum(&self) -> QuorumSpec {
        let majority = self.ids().len() / 2 + 1;
        QuorumSpec {
            read: majority,
            write: majority,
        }
    }
}

impl PartialOrd for Blueprint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let le = subset(&self.add, &other.add) && subset(&self.remove, &other.remove);
        let ge = subset(&other.add, &self.add) && subset(&other.remove, &self.remove);
        match (le, ge) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

fn normalize(ids: Vec<NodeID>) -> Vec<NodeID> {
    let set: BTreeSet<NodeID> = ids.into_iter().collect();
    set.into_iter().collect()
}

fn union(lhs: &[NodeID], rhs: &[NodeID]) -> Vec<NodeID> {
    let mut set: BTreeSet<NodeID> = lhs.iter().copied().collect();
    set.extend(rhs.iter().copied());
    set.into_iter().collect()
}

fn subset(lhs: &[NodeID], rhs: &[NodeID]) -> bool {
    lhs.iter().all(|id| rhs.contains(id))
}

/////////////////////////////////////////////// State //////////////////////////////////////////////

/// The register state:  an opaque value stamped with a timestamp and the writer that produced it.
/// States are totally ordered lexicographically by `(timestamp, writer)`; the value does not
/// participate in the order.  The zero state is the initial value of every register.
#[derive(Clone, Debug, Default, Message)]
pub struct State {
    /// The register value.
    #[prototk(1, bytes)]
    pub value: Vec<u8>,
    /// The timestamp at which the value was written.
    #[prototk(2, int32)]
    pub timestamp: i32,
    /// The writer that produced the value.
    #[prototk(3, message)]
    pub writer: NodeID,
}

impl State {
    /// Construct a state stamped one past `prev` by `writer`.
    pub fn stamped(value: Vec<u8>, prev: &State, writer: NodeID) -> Self {
        Self {
            value,
            timestamp: prev.timestamp + 1,
            writer,
        }
    }
}

impl Eq for State {}

impl PartialEq for State {
    fn eq(&self, other: &State) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for State {
    fn cmp(&self, other: &State) -> Ordering {
        (self.timestamp, self.writer).cmp(&(other.timestamp, other.writer))
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &State) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

////////////////////////////////////////////// Decree //////////////////////////////////////////////

/// A round-stamped blueprint accepted by the consensus variant.  `rnd = 0` means "no prepare
/// seen".
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Decree {
    /// The round in which the value was proposed.
    #[prototk(1, uint32)]
    pub rnd: u32,
    /// The proposed successor.
    #[prototk(2, message)]
    pub value: Blueprint,
}

/////////////////////////////////////////////// Conf ///////////////////////////////////////////////

/// A client's view of where it stands:  `this` is the configuration the request addresses, `cur`
/// the most current configuration the client knows.  Both are configuration identifiers (ranks).
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq)]
pub struct Conf {
    /// The configuration this request is addressed to.
    #[prototk(1, uint32)]
    pub this: u32,
    /// The most current configuration the sender knows.
    #[prototk(2, uint32)]
    pub cur: u32,
}

///////////////////////////////////////////// ConfReply ////////////////////////////////////////////

/// The configuration section of a reply.  A non-empty `cur` tells the client to adopt a newer
/// configuration and continue; it is a protocol reply, not an error.  The `abort` flag is carried
/// for forward compatibility.
#[derive(Clone, Debug, Default, Message)]
pub struct ConfReply {
    /// A newer current configuration, if the sender's view was outdated.
    #[prototk(1, message)]
    pub cur: Option<Blueprint>,
    /// Whether the replica refused to process the request.
    #[prototk(2, Bool)]
    pub abort: bool,
    /// Successor configurations newer than the one addressed.
    #[prototk(3, message)]
    pub next: Vec<Blueprint>,
}

///////////////////////////////////////////// ReadReply ////////////////////////////////////////////

/// Reply to a register read.
#[derive(Clone, Debug, Default, Message)]
pub struct ReadReply {
    /// The register state, omitted on abort.
    #[prototk(1, message)]
    pub state: Option<State>,
    /// Configuration updates for the client.
    #[prototk(2, message)]
    pub cur: Option<ConfReply>,
    /// Learned successors of the addressed configuration.
    #[prototk(3, message)]
    pub next: Vec<Blueprint>,
}

////////////////////////////////////////////// WriteS //////////////////////////////////////////////

/// A register write.
#[derive(Clone, Debug, Default, Message)]
pub struct WriteS {
    /// The state to install if newer than the replica's.
    #[prototk(1, message)]
    pub state: Option<State>,
    /// The sender's view.
    #[prototk(2, message)]
    pub conf: Option<Conf>,
}

////////////////////////////////////////////// WriteN //////////////////////////////////////////////

/// Record `next` as a successor of configuration `cur_c`.
#[derive(Clone, Debug, Default, Message)]
pub struct WriteN {
    /// The configuration being extended.
    #[prototk(1, uint32)]
    pub cur_c: u32,
    /// The proposed successor.
    #[prototk(2, message)]
    pub next: Option<Blueprint>,
}

//////////////////////////////////////////// WriteNReply ///////////////////////////////////////////

/// Reply to [WriteN].
#[derive(Clone, Debug, Default, Message)]
pub struct WriteNReply {
    /// Configuration updates for the client.
    #[prototk(1, message)]
    pub cur: Option<ConfReply>,
    /// The replica's register state.
    #[prototk(2, message)]
    pub state: Option<State>,
    /// The replica's lattice-agreement working value.
    #[prototk(3, message)]
    pub la_state: Option<Blueprint>,
}

//////////////////////////////////////////// LAProposal ////////////////////////////////////////////

/// A lattice-agreement proposal.
#[derive(Clone, Debug, Default, Message)]
pub struct LAProposal {
    /// The sender's view.
    #[prototk(1, message)]
    pub conf: Option<Conf>,
    /// The proposed blueprint.
    #[prototk(2, message)]
    pub prop: Option<Blueprint>,
}

////////////////////////////////////////////// LAReply /////////////////////////////////////////////

/// Reply to [LAProposal].  An empty `la_state` means the proposal was accepted as-is; a non-empty
/// one carries the merged value the client must re-propose.
#[derive(Clone, Debug, Default, Message)]
pub struct LAReply {
    /// Configuration updates for the client.
    #[prototk(1, message)]
    pub cur: Option<ConfReply>,
    /// The merged working value, when the proposal was not accepted.
    #[prototk(2, message)]
    pub la_state: Option<Blueprint>,
}

///////////////////////////////////////////// NewState /////////////////////////////////////////////

/// Propagate register and lattice-agreement state into configuration `cur_c`.
#[derive(Clone, Debug, Default, Message)]
pub struct NewState {
    /// The configuration being written to.
    #[prototk(1, uint32)]
    pub cur_c: u32,
    /// The blueprint of that configuration.
    #[prototk(2, message)]
    pub cur: Option<Blueprint>,
    /// The register state to install if newer.
    #[prototk(3, message)]
    pub state: Option<State>,
    /// The lattice-agreement value to merge.
    #[prototk(4, message)]
    pub la_state: Option<Blueprint>,
}

////////////////////////////////////////// NewStateReply ///////////////////////////////////////////

/// Reply to [NewState] and to the consensus combined installer.
#[derive(Clone, Debug, Default, Message)]
pub struct NewStateReply {
    /// A newer current configuration, if the sender's view was outdated.
    #[prototk(1, message)]
    pub cur: Option<Blueprint>,
    /// Learned successors newer than the addressed configuration.
    #[prototk(2, message)]
    pub next: Vec<Blueprint>,
}

////////////////////////////////////////////// NewCur //////////////////////////////////////////////

/// Install a configuration as current.
#[derive(Clone, Debug, Default, Message)]
pub struct NewCur {
    /// The identifier of the configuration (its rank).
    #[prototk(1, uint32)]
    pub cur_c: u32,
    /// The configuration to install.
    #[prototk(2, message)]
    pub cur: Option<Blueprint>,
}

//////////////////////////////////////////// NewCurReply ///////////////////////////////////////////

/// Reply to [NewCur].
#[derive(Clone, Debug, Default, Message)]
pub struct NewCurReply {
    /// True iff the configuration was newly installed.
    #[prototk(1, Bool)]
    pub new: bool,
}

////////////////////////////////////////////// CNewCur /////////////////////////////////////////////

/// The consensus variant's combined state-and-current installer.
#[derive(Clone, Debug, Default, Message)]
pub struct CNewCur {
    /// The identifier of the configuration (its rank).
    #[prototk(1, uint32)]
    pub cur_c: u32,
    /// The configuration to install.
    #[prototk(2, message)]
    pub cur: Option<Blueprint>,
    /// The register state to install if newer.
    #[prototk(3, message)]
    pub state: Option<State>,
}

/////////////////////////////////////////////// DRead //////////////////////////////////////////////

/// The consensus variant's advanced read:  record a decided successor and read the register in
/// one round.
#[derive(Clone, Debug, Default, Message)]
pub struct DRead {
    /// The configuration whose successor is recorded.
    #[prototk(1, uint32)]
    pub cur_c: u32,
    /// The decided successor, if any.
    #[prototk(2, message)]
    pub prop: Option<Blueprint>,
}

//////////////////////////////////////////// AdvReadReply //////////////////////////////////////////

/// Reply to [DRead].
#[derive(Clone, Debug, Default, Message)]
pub struct AdvReadReply {
    /// The replica's register state.
    #[prototk(1, message)]
    pub state: Option<State>,
    /// A newer current configuration, if the sender's view was outdated.
    #[prototk(2, message)]
    pub cur: Option<Blueprint>,
    /// The learned successor of the addressed configuration.
    #[prototk(3, message)]
    pub next: Vec<Blueprint>,
}

////////////////////////////////////////////// Prepare /////////////////////////////////////////////

/// Phase-one message of the consensus variant:  rally support for round `rnd` in the instance
/// deciding the successor of configuration `cur_c`.
#[derive(Clone, Copy, Debug, Default, Message)]
pub struct Prepare {
    /// The configuration whose successor is being decided.
    #[prototk(1, uint32)]
    pub cur_c: u32,
    /// The round support is rallied for.
    #[prototk(2, uint32)]
    pub rnd: u32,
}

////////////////////////////////////////////// Promise /////////////////////////////////////////////

/// Reply to [Prepare].  A zero `rnd` grants the promise; a non-zero `rnd` is a nack carrying the
/// round already promised.  A non-empty `dec` short-circuits the instance: the successor was
/// already decided.
#[derive(Clone, Debug, Default, Message)]
pub struct Promise {
    /// A newer current configuration, if the sender's view was outdated.
    #[prototk(1, message)]
    pub cur: Option<Blueprint>,
    /// The already-decided successor, if any.
    #[prototk(2, message)]
    pub dec: Option<Blueprint>,
    /// The round already promised, when the prepare was refused.
    #[prototk(3, uint32)]
    pub rnd: u32,
    /// The highest-round decree accepted so far.
    #[prototk(4, message)]
    pub val: Option<Decree>,
}

////////////////////////////////////////////// Propose /////////////////////////////////////////////

/// Phase-two message of the consensus variant:  ask acceptance of a decree.
#[derive(Clone, Debug, Default, Message)]
pub struct Propose {
    /// The configuration whose successor is being decided.
    #[prototk(1, uint32)]
    pub cur_c: u32,
    /// The decree to accept.
    #[prototk(2, message)]
    pub val: Option<Decree>,
}

/////////////////////////////////////////////// Learn //////////////////////////////////////////////

/// Reply to [Propose].
#[derive(Clone, Debug, Default, Message)]
pub struct Learn {
    /// A newer current configuration, if the sender's view was outdated.
    #[prototk(1, message)]
    pub cur: Option<Blueprint>,
    /// The already-decided successor, if any.
    #[prototk(2, message)]
    pub dec: Option<Blueprint>,
    /// True iff the decree was accepted.
    #[prototk(3, Bool)]
    pub learned: bool,
}

////////////////////////////////////////////// Proposal ////////////////////////////////////////////

/// A reconfiguration proposal forwarded to a replica's leader.
#[derive(Clone, Debug, Default, Message)]
pub struct Proposal {
    /// The proposed blueprint.
    #[prototk(1, message)]
    pub prop: Option<Blueprint>,
}

//////////////////////////////////////////////// Ack ///////////////////////////////////////////////

/// An empty acknowledgement.
#[derive(Clone, Debug, Default, Message)]
pub struct Ack {}

////////////////////////////////////////// ReplicaService //////////////////////////////////////////

// [ReplicaService] is the lattice-agreement surface of a replica.  Successors are agreed by
// merging concurrent proposals; a configuration may accumulate several pending successors.
service! {
    name = ReplicaService;
    server = ReplicaServer;
    client = ReplicaClient;
    error = Error;

    rpc read(Conf) -> ReadReply;
    rpc write(WriteS) -> ConfReply;
    rpc write_next(WriteN) -> WriteNReply;
    rpc la_prop(LAProposal) -> LAReply;
    rpc set_state(NewState) -> NewStateReply;
    rpc set_cur(NewCur) -> NewCurReply;
    rpc forward(Proposal) -> Ack;
}

///////////////////////////////////////// ConsensusService /////////////////////////////////////////

// [ConsensusService] is the consensus surface of a replica.  Each configuration decides exactly
// one successor through a prepare/accept exchange; the decided value is recorded by write_next
// and never overwritten.
service! {
    name = ConsensusService;
    server = ConsensusServer;
    client = ConsensusClient;
    error = Error;

    rpc read(Conf) -> ReadReply;
    rpc write(WriteS) -> ConfReply;
    rpc write_next(DRead) -> AdvReadReply;
    rpc set_state(CNewCur) -> NewStateReply;
    rpc prepare(Prepare) -> Promise;
    rpc accept(Propose) -> Learn;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use buffertk::{stack_pack, Unpackable};

    use guacamole::{FromGuacamole, Guacamole};

    use super::*;

    fn nodes(ids: &[u32]) -> Vec<NodeID> {
        ids.iter().copied().map(NodeID::new).collect()
    }

    fn bp(add: &[u32], remove: &[u32]) -> Blueprint {
        Blueprint::new(nodes(add), nodes(remove))
    }

    #[test]
    fn ids_exclude_removed() {
        let b = bp(&[1, 2, 3, 4], &[2]);
        assert_eq!(nodes(&[1, 3, 4]), b.ids());
        assert_eq!(5, b.rank());
    }

    #[test]
    fn rank_counts_both_sets() {
        assert_eq!(0, Blueprint::default().rank());
        assert_eq!(3, bp(&[1, 2, 3], &[]).rank());
        assert_eq!(5, bp(&[1, 2, 3], &[2, 3]).rank());
    }

    #[test]
    fn normalization_dedupes() {
        let b = Blueprint::new(nodes(&[3, 1, 2, 1, 3]), vec![]);
        assert_eq!(nodes(&[1, 2, 3]), b.ids());
        assert_eq!(3, b.rank());
    }

    #[test]
    fn lattice_order() {
        let abc = bp(&[1, 2, 3], &[]);
        let abcd = bp(&[1, 2, 3, 4], &[]);
        let abce = bp(&[1, 2, 3, 5], &[]);
        assert!(abc < abcd);
        assert!(abcd > abc);
        assert_eq!(None, abcd.partial_cmp(&abce));
        assert!(abc <= abc);
        // A removal extends the blueprint rather than shrinking it.
        let shrink = bp(&[1, 2, 3], &[2, 3]);
        assert!(abc < shrink);
        assert_eq!(None, shrink.partial_cmp(&abcd));
    }

    #[test]
    fn learned_order_is_rank_order() {
        let abc = bp(&[1, 2, 3], &[]);
        let abcd = bp(&[1, 2, 3, 4], &[]);
        let abce = bp(&[1, 2, 3, 5], &[]);
        assert_eq!(std::cmp::Ordering::Less, abc.learned_cmp(&abcd));
        assert_eq!(std::cmp::Ordering::Greater, abcd.learned_cmp(&abc));
        assert!(abcd.learned_equals(&abce));
        assert!(!abcd.learned_equals(&abc));
    }

    #[test]
    fn merge_is_union() {
        let abcd = bp(&[1, 2, 3, 4], &[]);
        let abce = bp(&[1, 2, 3, 5], &[]);
        let merged = abcd.merge(&abce);
        assert_eq!(bp(&[1, 2, 3, 4, 5], &[]), merged);
        assert!(abcd <= merged);
        assert!(abce <= merged);
    }

    #[test]
    fn merge_laws() {
        let mut guac = Guacamole::new(0x1eaf1e55);
        let random_bp = |guac: &mut Guacamole| {
            let adds = u8::from_guacamole(&mut (), guac) % 6;
            let rems = u8::from_guacamole(&mut (), guac) % 3;
            let add: Vec<NodeID> = (0..adds)
                .map(|_| NodeID::new(u8::from_guacamole(&mut (), guac) as u32 % 16))
                .collect();
            let remove: Vec<NodeID> = (0..rems)
                .map(|_| NodeID::new(u8::from_guacamole(&mut (), guac) as u32 % 16))
                .collect();
            Blueprint::new(add, remove)
        };
        for _ in 0..1000 {
            let a = random_bp(&mut guac);
            let b = random_bp(&mut guac);
            let c = random_bp(&mut guac);
            assert_eq!(a.merge(&b), b.merge(&a));
            assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
            assert_eq!(a, a.merge(&a));
            assert!(a <= a.merge(&b));
        }
    }

    #[test]
    fn quorum_is_majority() {
        assert_eq!(QuorumSpec { read: 2, write: 2 }, bp(&[1, 2, 3], &[]).quorum());
        assert_eq!(
            QuorumSpec { read: 3, write: 3 },
            bp(&[1, 2, 3, 4], &[]).quorum()
        );
        // Removal shrinks the live membership and the quorum with it.
        assert_eq!(
            QuorumSpec { read: 2, write: 2 },
            bp(&[1, 2, 3, 4], &[4]).quorum()
        );
    }

    #[test]
    fn state_order_ignores_value() {
        let zero = State::default();
        let one = State {
            value: b"x".to_vec(),
            timestamp: 1,
            writer: NodeID::new(7),
        };
        let one_other_writer = State {
            value: b"y".to_vec(),
            timestamp: 1,
            writer: NodeID::new(9),
        };
        assert!(zero < one);
        assert!(one < one_other_writer);
        let same_key = State {
            value: b"z".to_vec(),
            ..one.clone()
        };
        assert_eq!(one, same_key);
    }

    #[test]
    fn stamped_bumps_timestamp() {
        let prev = State {
            value: b"a".to_vec(),
            timestamp: 4,
            writer: NodeID::new(1),
        };
        let next = State::stamped(b"b".to_vec(), &prev, NodeID::new(2));
        assert_eq!(5, next.timestamp);
        assert_eq!(NodeID::new(2), next.writer);
        assert!(prev < next);
    }

    #[test]
    fn write_n_round_trip() {
        let msg = WriteN {
            cur_c: 3,
            next: Some(bp(&[1, 2, 3, 4], &[])),
        };
        let buf = stack_pack(msg.clone()).to_vec();
        let (got, _) = WriteN::unpack(&buf).unwrap();
        assert_eq!(3, got.cur_c);
        assert_eq!(msg.next, got.next);
    }

    #[test]
    fn promise_round_trip() {
        let msg = Promise {
            cur: None,
            dec: None,
            rnd: 5,
            val: Some(Decree {
                rnd: 5,
                value: bp(&[1, 2, 3, 4], &[]),
            }),
        };
        let buf = stack_pack(msg.clone()).to_vec();
        let (got, _) = Promise::unpack(&buf).unwrap();
        assert_eq!(5, got.rnd);
        assert!(got.cur.is_none());
        assert_eq!(msg.val, got.val);
    }
}
