//! An in-memory fan-out.  Every request is packed, dispatched through the generated server
//! dispatcher of each replica in the plan, and unpacked again, so the full wire path is exercised
//! without a network.  Replicas can be partitioned away to exercise retry widening and quorum
//! failures.  Useful for tests and single-process clusters.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};

use buffertk::{stack_pack, Unpackable};

use rpc_pb::{ClientID, Context};

use remolt_pb::{
    Ack, AdvReadReply, CNewCur, Conf, ConfReply, ConsensusServer, ConsensusService, DRead, Error,
    LAProposal, LAReply, Learn, NewCur, NewCurReply, NewState, NewStateReply, NodeID, Prepare,
    Promise, Proposal, Propose, ReadReply, ReplicaServer, ReplicaService, WriteN, WriteNReply,
    WriteS,
};

use crate::consensus::ConsensusReplica;
use crate::fanout::{ConsensusFanout, LatticeFanout, Quorum};
use crate::provider::ContactPlan;
use crate::replica::LatticeReplica;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static FAN_CALL: Counter = Counter::new("remolt.memory.call");
static FAN_PARTITIONED: Counter = Counter::new("remolt.memory.partitioned");
static FAN_MISSING: Counter = Counter::new("remolt.memory.missing");
static FAN_RPC_ERROR: Counter = Counter::new("remolt.memory.rpc_error");

/// Register this module's counters with the provided collector.
pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&FAN_CALL);
    collector.register_counter(&FAN_PARTITIONED);
    collector.register_counter(&FAN_MISSING);
    collector.register_counter(&FAN_RPC_ERROR);
}

////////////////////////////////////////////// Shared /////////////////////////////////////////////

// The generated server dispatchers take their service by value; this keeps the replica shared
// with whoever else holds it.
struct Shared<S>(Arc<S>);

impl ReplicaService for Shared<LatticeReplica> {
    fn read(&self, ctx: &Context, req: Conf) -> Result<ReadReply, Error> {
        self.0.read(ctx, req)
    }

    fn write(&self, ctx: &Context, req: WriteS) -> Result<ConfReply, Error> {
        self.0.write(ctx, req)
    }

    fn write_next(&self, ctx: &Context, req: WriteN) -> Result<WriteNReply, Error> {
        self.0.write_next(ctx, req)
    }

    fn la_prop(&self, ctx: &Context, req: LAProposal) -> Result<LAReply, Error> {
        self.0.la_prop(ctx, req)
    }

    fn set_state(&self, ctx: &Context, req: NewState) -> Result<NewStateReply, Error> {
        self.0.set_state(ctx, req)
    }

    fn set_cur(&self, ctx: &Context, req: NewCur) -> Result<NewCurReply, Error> {
        self.0.set_cur(ctx, req)
    }

    fn forward(&self, ctx: &Context, req: Proposal) -> Result<Ack, Error> {
        self.0.forward(ctx, req)
    }
}

impl ConsensusService for Shared<ConsensusReplica> {
    fn read(&self, ctx: &Context, req: Conf) -> Result<ReadReply, Error> {
        self.0.read(ctx, req)
    }

    fn write(&self, ctx: &Context, req: WriteS) -> Result<ConfReply, Error> {
        self.0.write(ctx, req)
    }

    fn write_next(&self, ctx: &Context, req: DRead) -> Result<AdvReadReply, Error> {
        self.0.write_next(ctx, req)
    }

    fn set_state(&self, ctx: &Context, req: CNewCur) -> Result<NewStateReply, Error> {
        self.0.set_state(ctx, req)
    }

    fn prepare(&self, ctx: &Context, req: Prepare) -> Result<Promise, Error> {
        self.0.prepare(ctx, req)
    }

    fn accept(&self, ctx: &Context, req: Propose) -> Result<Learn, Error> {
        self.0.accept(ctx, req)
    }
}

/////////////////////////////////////////// MemoryFanout ///////////////////////////////////////////

/// A fan-out over in-process replicas.  Construct with [MemoryFanout::lattice] or
/// [MemoryFanout::consensus]; the two surfaces share the dispatch machinery but a fan-out only
/// answers for the surface it was built with.
pub struct MemoryFanout {
    servers: HashMap<NodeID, Box<dyn rpc_pb::Server + Send + Sync + 'static>>,
    partitioned: Mutex<HashSet<NodeID>>,
    client: ClientID,
}

impl MemoryFanout {
    /// A fan-out over lattice-agreement replicas.
    pub fn lattice(replicas: impl IntoIterator<Item = (NodeID, Arc<LatticeReplica>)>) -> Self {
        let mut servers: HashMap<NodeID, Box<dyn rpc_pb::Server + Send + Sync + 'static>> =
            HashMap::new();
        for (id, replica) in replicas {
            servers.insert(id, Box::new(ReplicaServer::bind(Shared(replica))));
        }
        Self::new(servers)
    }

    /// A fan-out over consensus replicas.
    pub fn consensus(replicas: impl IntoIterator<Item = (NodeID, Arc<ConsensusReplica>)>) -> Self {
        let mut servers: HashMap<NodeID, Box<dyn rpc_pb::Server + Send + Sync + 'static>> =
            HashMap::new();
        for (id, replica) in replicas {
            servers.insert(id, Box::new(ConsensusServer::bind(Shared(replica))));
        }
        Self::new(servers)
    }

    fn new(servers: HashMap<NodeID, Box<dyn rpc_pb::Server + Send + Sync + 'static>>) -> Self {
        Self {
            servers,
            partitioned: Mutex::new(HashSet::new()),
            client: ClientID::generate().unwrap_or(ClientID::BOTTOM),
        }
    }

    /// Stop delivering to `id` until healed.
    pub fn partition(&self, id: NodeID) {
        self.partitioned.lock().unwrap().insert(id);
    }

    /// Resume delivering to `id`.
    pub fn heal(&self, id: NodeID) {
        self.partitioned.lock().unwrap().remove(&id);
    }

    // Dispatch `req` to every reachable replica in the plan.  Replies are returned raw.  A
    // service-level error from any replica is fatal to the whole call.
    fn fan(
        &self,
        plan: &ContactPlan,
        method: &str,
        req: &[u8],
    ) -> Result<(Vec<Vec<u8>>, Vec<NodeID>), Error> {
        FAN_CALL.click();
        let ctx = Context::default().with_client(self.client);
        let mut bodies = Vec::new();
        let mut responders = Vec::new();
        for node in plan.nodes.iter() {
            if self.partitioned.lock().unwrap().contains(node) {
                FAN_PARTITIONED.click();
                continue;
            }
            let Some(server) = self.servers.get(node) else {
                FAN_MISSING.click();
                continue;
            };
            match server.call(&ctx, method, req) {
                Ok(Ok(body)) => {
                    bodies.push(body);
                    responders.push(*node);
                }
                Ok(Err(err)) => {
                    return Err(Error::unpack(&err)?.0);
                }
                Err(_) => {
                    FAN_RPC_ERROR.click();
                }
            }
        }
        if bodies.len() < plan.threshold {
            return Err(Error::quorum_failure(
                bodies.len() as u64,
                plan.threshold as u64,
            ));
        }
        Ok((bodies, responders))
    }
}

// One fan-out method:  pack the request, dispatch, unpack each reply.
macro_rules! fan_method {
    ($method:ident, $req:ty, $resp:ty) => {
        fn $method(&self, plan: &ContactPlan, req: &$req) -> Result<Quorum<$resp>, Error> {
            let buf = stack_pack(req.clone()).to_vec();
            let (bodies, responders) = self.fan(plan, stringify!($method), &buf)?;
            let mut replies = Vec::with_capacity(bodies.len());
            for body in bodies.iter() {
                replies.push(<$resp as Unpackable>::unpack(body)?.0);
            }
            Ok(Quorum {
                replies,
                responders,
            })
        }
    };
}

impl LatticeFanout for MemoryFanout {
    fan_method! { read, Conf, ReadReply }
    fan_method! { write, WriteS, ConfReply }
    fan_method! { write_next, WriteN, WriteNReply }
    fan_method! { la_prop, LAProposal, LAReply }
    fan_method! { set_state, NewState, NewStateReply }
    fan_method! { set_cur, NewCur, NewCurReply }
}

impl ConsensusFanout for MemoryFanout {
    fan_method! { read, Conf, ReadReply }
    fan_method! { write, WriteS, ConfReply }
    fan_method! { write_next, DRead, AdvReadReply }
    fan_method! { set_state, CNewCur, NewStateReply }
    fan_method! { prepare, Prepare, Promise }
    fan_method! { accept, Propose, Learn }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use remolt_pb::Blueprint;

    use super::*;

    fn nodes(ids: &[u32]) -> Vec<NodeID> {
        ids.iter().copied().map(NodeID::new).collect()
    }

    fn bp(add: &[u32]) -> Blueprint {
        Blueprint::new(nodes(add), Vec::new())
    }

    fn cluster(ids: &[u32]) -> (HashMap<NodeID, Arc<LatticeReplica>>, MemoryFanout) {
        let blueprint = bp(ids);
        let mut replicas = HashMap::new();
        for id in nodes(ids) {
            replicas.insert(
                id,
                Arc::new(LatticeReplica::with_cur(blueprint.clone(), blueprint.rank(), false)),
            );
        }
        let fanout = MemoryFanout::lattice(replicas.iter().map(|(k, v)| (*k, Arc::clone(v))));
        (replicas, fanout)
    }

    fn plan(ids: &[u32], threshold: usize) -> ContactPlan {
        ContactPlan {
            nodes: nodes(ids),
            threshold,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn reads_reach_a_quorum() {
        let (_, fanout) = cluster(&[1, 2, 3]);
        let q = LatticeFanout::read(&fanout, &plan(&[1, 2, 3], 2), &Conf { this: 3, cur: 3 })
            .unwrap();
        assert_eq!(3, q.replies.len());
        assert_eq!(nodes(&[1, 2, 3]), q.responders);
    }

    #[test]
    fn partitions_fail_quorums() {
        let (_, fanout) = cluster(&[1, 2, 3]);
        fanout.partition(NodeID::new(2));
        fanout.partition(NodeID::new(3));
        let err = LatticeFanout::read(&fanout, &plan(&[1, 2, 3], 2), &Conf { this: 3, cur: 3 })
            .unwrap_err();
        assert!(matches!(err, Error::QuorumFailure { have: 1, need: 2, .. }));
        fanout.heal(NodeID::new(2));
        let q = LatticeFanout::read(&fanout, &plan(&[1, 2, 3], 2), &Conf { this: 3, cur: 3 })
            .unwrap();
        assert_eq!(nodes(&[1, 2]), q.responders);
    }

    #[test]
    fn writes_traverse_the_wire() {
        let (replicas, fanout) = cluster(&[1, 2, 3]);
        let state = remolt_pb::State {
            value: b"x".to_vec(),
            timestamp: 1,
            writer: NodeID::new(9),
        };
        LatticeFanout::write(
            &fanout,
            &plan(&[1, 2, 3], 2),
            &WriteS {
                state: Some(state.clone()),
                conf: Some(Conf { this: 3, cur: 3 }),
            },
        )
        .unwrap();
        for replica in replicas.values() {
            assert_eq!(b"x".to_vec(), replica.register_state().value);
        }
    }

    #[test]
    fn service_errors_are_fatal() {
        let blueprint = bp(&[1]);
        let mut replicas = HashMap::new();
        replicas.insert(
            NodeID::new(1),
            Arc::new(ConsensusReplica::with_cur(blueprint.clone(), blueprint.rank())),
        );
        let fanout = MemoryFanout::consensus(replicas.iter().map(|(k, v)| (*k, Arc::clone(v))));
        ConsensusFanout::write_next(
            &fanout,
            &plan(&[1], 1),
            &DRead {
                cur_c: 1,
                prop: Some(bp(&[1, 2])),
            },
        )
        .unwrap();
        let err = ConsensusFanout::write_next(
            &fanout,
            &plan(&[1], 1),
            &DRead {
                cur_c: 1,
                prop: Some(bp(&[1, 3])),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::OverwriteNext { cur_c: 1, .. }));
    }
}
