//! The consensus replica.  Instead of merging concurrent proposals, every configuration decides
//! exactly one successor through a prepare/accept exchange; the decided successor is recorded
//! once and never overwritten.  Paxos state is kept per configuration identifier.

use std::collections::HashMap;
use std::sync::RwLock;

use biometrics::{Collector, Counter};

use rpc_pb::Context;

use zerror_core::ErrorCore;

use remolt_pb::{
    AdvReadReply, Blueprint, CNewCur, Conf, ConfReply, ConsensusService, DRead, Decree, Error,
    Learn, NewStateReply, Prepare, Promise, Propose, ReadReply, State, UNINSTALLED, WriteS,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static HANDLE_READ: Counter = Counter::new("remolt.consensus.read");
static HANDLE_WRITE: Counter = Counter::new("remolt.consensus.write");
static HANDLE_WRITE_NEXT: Counter = Counter::new("remolt.consensus.write_next");
static HANDLE_SET_STATE: Counter = Counter::new("remolt.consensus.set_state");
static CUR_INSTALLED: Counter = Counter::new("remolt.consensus.set_state.installed");
static HANDLE_PREPARE: Counter = Counter::new("remolt.consensus.prepare");
static PREPARE_NACKED: Counter = Counter::new("remolt.consensus.prepare.nacked");
static HANDLE_ACCEPT: Counter = Counter::new("remolt.consensus.accept");
static ACCEPT_LEARNED: Counter = Counter::new("remolt.consensus.accept.learned");

/// Register this module's counters with the provided collector.
pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&HANDLE_READ);
    collector.register_counter(&HANDLE_WRITE);
    collector.register_counter(&HANDLE_WRITE_NEXT);
    collector.register_counter(&HANDLE_SET_STATE);
    collector.register_counter(&CUR_INSTALLED);
    collector.register_counter(&HANDLE_PREPARE);
    collector.register_counter(&PREPARE_NACKED);
    collector.register_counter(&HANDLE_ACCEPT);
    collector.register_counter(&ACCEPT_LEARNED);
}

///////////////////////////////////////// ConsensusReplica /////////////////////////////////////////

#[derive(Default)]
struct Inner {
    cur: Option<Blueprint>,
    cur_c: u32,
    rstate: State,
    next: HashMap<u32, Blueprint>,
    rnd: HashMap<u32, u32>,
    val: HashMap<u32, Decree>,
}

impl Inner {
    fn installed_rank(&self) -> u32 {
        self.cur.as_ref().map(Blueprint::rank).unwrap_or(0)
    }

    fn outdated_cur(&self, cur_c: u32) -> Option<Blueprint> {
        if cur_c < self.cur_c {
            self.cur.clone()
        } else {
            None
        }
    }

    fn learned(&self, cur_c: u32) -> Vec<Blueprint> {
        self.next.get(&cur_c).cloned().into_iter().collect()
    }
}

/// A replica of the register running the consensus flavour of reconfiguration.
pub struct ConsensusReplica {
    inner: RwLock<Inner>,
}

impl ConsensusReplica {
    /// Create a replica with no configuration installed.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Create a replica with `(cur, cur_c)` installed, as from a bootstrap.
    pub fn with_cur(cur: Blueprint, cur_c: u32) -> Self {
        let replica = Self::new();
        {
            let mut inner = replica.inner.write().unwrap();
            inner.cur = Some(cur);
            inner.cur_c = cur_c;
        }
        replica
    }

    /// The installed configuration and its identifier.
    pub fn current(&self) -> (Option<Blueprint>, u32) {
        let inner = self.inner.read().unwrap();
        (inner.cur.clone(), inner.cur_c)
    }

    /// The register state.
    pub fn register_state(&self) -> State {
        self.inner.read().unwrap().rstate.clone()
    }

    /// The successor decided for `cur_c`, if this replica learned it.
    pub fn learned(&self, cur_c: u32) -> Option<Blueprint> {
        self.inner.read().unwrap().next.get(&cur_c).cloned()
    }

    /// The round promised for `cur_c`.
    pub fn promised(&self, cur_c: u32) -> u32 {
        self.inner
            .read()
            .unwrap()
            .rnd
            .get(&cur_c)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for ConsensusReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsensusService for ConsensusReplica {
    fn read(&self, _: &Context, req: Conf) -> Result<ReadReply, Error> {
        HANDLE_READ.click();
        let inner = self.inner.read().unwrap();
        if req.this < inner.cur_c {
            return Ok(ReadReply {
                state: None,
                cur: Some(ConfReply {
                    cur: inner.cur.clone(),
                    abort: true,
                    next: Vec::new(),
                }),
                next: Vec::new(),
            });
        }
        let next = inner.learned(req.this);
        if req.cur < inner.cur_c {
            return Ok(ReadReply {
                state: Some(inner.rstate.clone()),
                cur: Some(ConfReply {
                    cur: inner.cur.clone(),
                    abort: false,
                    next: Vec::new(),
                }),
                next,
            });
        }
        Ok(ReadReply {
            state: Some(inner.rstate.clone()),
            cur: None,
            next,
        })
    }

    fn write(&self, _: &Context, req: WriteS) -> Result<ConfReply, Error> {
        HANDLE_WRITE.click();
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = &req.state {
            if *state > inner.rstate {
                inner.rstate = state.clone();
            }
        }
        let conf = req.conf.unwrap_or_default();
        if conf.this < inner.cur_c {
            return Ok(ConfReply {
                cur: inner.cur.clone(),
                abort: true,
                next: Vec::new(),
            });
        }
        let next = inner.learned(conf.this);
        if conf.cur < inner.cur_c {
            return Ok(ConfReply {
                cur: inner.cur.clone(),
                abort: false,
                next,
            });
        }
        Ok(ConfReply {
            cur: None,
            abort: false,
            next,
        })
    }

    fn write_next(&self, _: &Context, req: DRead) -> Result<AdvReadReply, Error> {
        HANDLE_WRITE_NEXT.click();
        let mut inner = self.inner.write().unwrap();
        if let Some(prop) = &req.prop {
            match inner.next.get(&req.cur_c) {
                Some(learned) if learned != prop => {
                    return Err(Error::OverwriteNext {
                        core: ErrorCore::default(),
                        cur_c: req.cur_c,
                    });
                }
                Some(_) => {}
                None => {
                    inner.next.insert(req.cur_c, prop.clone());
                }
            }
        }
        let next = inner.learned(req.cur_c);
        Ok(AdvReadReply {
            state: Some(inner.rstate.clone()),
            cur: inner.outdated_cur(req.cur_c),
            next,
        })
    }

    fn set_state(&self, _: &Context, req: CNewCur) -> Result<NewStateReply, Error> {
        HANDLE_SET_STATE.click();
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = &req.state {
            if *state > inner.rstate {
                inner.rstate = state.clone();
            }
        }
        let Some(new_cur) = req.cur else {
            return Ok(NewStateReply {
                cur: inner.cur.clone(),
                next: Vec::new(),
            });
        };
        if req.cur_c == UNINSTALLED || new_cur.rank() < inner.installed_rank() {
            return Ok(NewStateReply {
                cur: inner.cur.clone(),
                next: Vec::new(),
            });
        }
        let next = inner.learned(req.cur_c);
        if req.cur_c == inner.cur_c {
            return Ok(NewStateReply { cur: None, next });
        }
        if let Some(cur) = &inner.cur {
            if cur.partial_cmp(&new_cur).is_none() {
                return Err(Error::IncomparableCurrent {
                    core: ErrorCore::default(),
                });
            }
        }
        CUR_INSTALLED.click();
        inner.cur = Some(new_cur);
        inner.cur_c = req.cur_c;
        Ok(NewStateReply { cur: None, next })
    }

    fn prepare(&self, _: &Context, req: Prepare) -> Result<Promise, Error> {
        HANDLE_PREPARE.click();
        let mut inner = self.inner.write().unwrap();
        let cur = inner.outdated_cur(req.cur_c);
        if let Some(dec) = inner.next.get(&req.cur_c) {
            // The instance already decided; no further rounds matter.
            return Ok(Promise {
                cur,
                dec: Some(dec.clone()),
                rnd: 0,
                val: None,
            });
        }
        let promised = inner.rnd.get(&req.cur_c).copied();
        let val = inner.val.get(&req.cur_c).cloned();
        if promised.map_or(true, |rnd| req.rnd > rnd) {
            inner.rnd.insert(req.cur_c, req.rnd);
            return Ok(Promise {
                cur,
                dec: None,
                rnd: 0,
                val,
            });
        }
        PREPARE_NACKED.click();
        Ok(Promise {
            cur,
            dec: None,
            rnd: promised.unwrap_or(0),
            val,
        })
    }

    fn accept(&self, _: &Context, req: Propose) -> Result<Learn, Error> {
        HANDLE_ACCEPT.click();
        let mut inner = self.inner.write().unwrap();
        let cur = inner.outdated_cur(req.cur_c);
        if let Some(dec) = inner.next.get(&req.cur_c) {
            return Ok(Learn {
                cur,
                dec: Some(dec.clone()),
                learned: false,
            });
        }
        let val = req.val.unwrap_or_default();
        if inner.rnd.get(&req.cur_c).copied().unwrap_or(0) > val.rnd {
            return Ok(Learn {
                cur,
                dec: None,
                learned: false,
            });
        }
        ACCEPT_LEARNED.click();
        inner.rnd.insert(req.cur_c, val.rnd);
        inner.val.insert(req.cur_c, val);
        Ok(Learn {
            cur,
            dec: None,
            learned: true,
        })
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use remolt_pb::NodeID;

    use super::*;

    fn nodes(ids: &[u32]) -> Vec<NodeID> {
        ids.iter().copied().map(NodeID::new).collect()
    }

    fn bp(add: &[u32]) -> Blueprint {
        Blueprint::new(nodes(add), Vec::new())
    }

    fn ctx() -> Context {
        Context::default()
    }

    #[test]
    fn prepare_promises_higher_rounds() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3]), 3);
        let reply = replica.prepare(&ctx(), Prepare { cur_c: 3, rnd: 7 }).unwrap();
        assert_eq!(0, reply.rnd);
        assert!(reply.dec.is_none());
        assert_eq!(7, replica.promised(3));
        // A lower round is nacked with evidence.
        let reply = replica.prepare(&ctx(), Prepare { cur_c: 3, rnd: 5 }).unwrap();
        assert_eq!(7, reply.rnd);
        assert_eq!(7, replica.promised(3));
    }

    #[test]
    fn promise_carries_highest_accepted_decree() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3]), 3);
        replica
            .accept(
                &ctx(),
                Propose {
                    cur_c: 3,
                    val: Some(Decree {
                        rnd: 4,
                        value: bp(&[1, 2, 3, 4]),
                    }),
                },
            )
            .unwrap();
        let reply = replica.prepare(&ctx(), Prepare { cur_c: 3, rnd: 9 }).unwrap();
        assert_eq!(0, reply.rnd);
        assert_eq!(
            Some(Decree {
                rnd: 4,
                value: bp(&[1, 2, 3, 4]),
            }),
            reply.val
        );
    }

    #[test]
    fn accept_refuses_superseded_rounds() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3]), 3);
        replica.prepare(&ctx(), Prepare { cur_c: 3, rnd: 9 }).unwrap();
        let reply = replica
            .accept(
                &ctx(),
                Propose {
                    cur_c: 3,
                    val: Some(Decree {
                        rnd: 4,
                        value: bp(&[1, 2, 3, 4]),
                    }),
                },
            )
            .unwrap();
        assert!(!reply.learned);
        assert_eq!(9, replica.promised(3));
    }

    #[test]
    fn decided_successor_is_sticky() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3]), 3);
        replica
            .write_next(
                &ctx(),
                DRead {
                    cur_c: 3,
                    prop: Some(bp(&[1, 2, 3, 4])),
                },
            )
            .unwrap();
        // A competing accept cannot displace the decided successor.
        let reply = replica
            .accept(
                &ctx(),
                Propose {
                    cur_c: 3,
                    val: Some(Decree {
                        rnd: 99,
                        value: bp(&[1, 2, 3, 5]),
                    }),
                },
            )
            .unwrap();
        assert!(!reply.learned);
        assert_eq!(Some(bp(&[1, 2, 3, 4])), reply.dec);
        assert_eq!(Some(bp(&[1, 2, 3, 4])), replica.learned(3));
        // And a later prepare reports the decision outright.
        let reply = replica.prepare(&ctx(), Prepare { cur_c: 3, rnd: 100 }).unwrap();
        assert_eq!(Some(bp(&[1, 2, 3, 4])), reply.dec);
    }

    #[test]
    fn write_next_refuses_overwrites() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3]), 3);
        replica
            .write_next(
                &ctx(),
                DRead {
                    cur_c: 3,
                    prop: Some(bp(&[1, 2, 3, 4])),
                },
            )
            .unwrap();
        let err = replica
            .write_next(
                &ctx(),
                DRead {
                    cur_c: 3,
                    prop: Some(bp(&[1, 2, 3, 5])),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::OverwriteNext { cur_c: 3, .. }));
        assert_eq!(Some(bp(&[1, 2, 3, 4])), replica.learned(3));
        // Re-recording the decided value is fine.
        let reply = replica
            .write_next(
                &ctx(),
                DRead {
                    cur_c: 3,
                    prop: Some(bp(&[1, 2, 3, 4])),
                },
            )
            .unwrap();
        assert_eq!(vec![bp(&[1, 2, 3, 4])], reply.next);
    }

    #[test]
    fn set_state_with_zero_cur_c_changes_nothing() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3]), 3);
        let reply = replica
            .set_state(
                &ctx(),
                CNewCur {
                    cur_c: 0,
                    cur: Some(bp(&[1, 2, 3, 4])),
                    state: Some(State::default()),
                },
            )
            .unwrap();
        assert_eq!(Some(bp(&[1, 2, 3])), reply.cur);
        assert_eq!((Some(bp(&[1, 2, 3])), 3), replica.current());
    }

    #[test]
    fn set_state_installs_comparable_successors() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3]), 3);
        let reply = replica
            .set_state(
                &ctx(),
                CNewCur {
                    cur_c: 4,
                    cur: Some(bp(&[1, 2, 3, 4])),
                    state: Some(State::default()),
                },
            )
            .unwrap();
        assert!(reply.cur.is_none());
        assert_eq!((Some(bp(&[1, 2, 3, 4])), 4), replica.current());
    }

    #[test]
    fn set_state_refuses_incomparable_currents() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3, 4]), 4);
        let err = replica
            .set_state(
                &ctx(),
                CNewCur {
                    cur_c: 5,
                    cur: Some(bp(&[1, 2, 3, 5, 6])),
                    state: Some(State::default()),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::IncomparableCurrent { .. }));
        assert_eq!((Some(bp(&[1, 2, 3, 4])), 4), replica.current());
    }

    #[test]
    fn writes_update_state_and_redirect_stale_views() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3, 4]), 4);
        let reply = replica
            .write(
                &ctx(),
                WriteS {
                    state: Some(State {
                        value: b"x".to_vec(),
                        timestamp: 1,
                        writer: NodeID::new(9),
                    }),
                    conf: Some(Conf { this: 3, cur: 3 }),
                },
            )
            .unwrap();
        assert!(reply.abort);
        assert_eq!(Some(bp(&[1, 2, 3, 4])), reply.cur);
        // The state lands even when the view is stale.
        assert_eq!(b"x".to_vec(), replica.register_state().value);
        let reply = replica
            .write(
                &ctx(),
                WriteS {
                    state: Some(State {
                        value: b"y".to_vec(),
                        timestamp: 0,
                        writer: NodeID::new(9),
                    }),
                    conf: Some(Conf { this: 4, cur: 4 }),
                },
            )
            .unwrap();
        assert!(!reply.abort);
        assert!(reply.cur.is_none());
        assert_eq!(b"x".to_vec(), replica.register_state().value);
    }

    #[test]
    fn stale_reads_abort_with_redirect() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3, 4]), 4);
        let reply = replica.read(&ctx(), Conf { this: 3, cur: 3 }).unwrap();
        assert!(reply.state.is_none());
        let cr = reply.cur.expect("stale read should carry cur");
        assert!(cr.abort);
        assert_eq!(Some(bp(&[1, 2, 3, 4])), cr.cur);
    }

    #[test]
    fn lagging_reads_still_see_state() {
        let replica = ConsensusReplica::with_cur(bp(&[1, 2, 3, 4]), 4);
        let reply = replica.read(&ctx(), Conf { this: 4, cur: 3 }).unwrap();
        assert!(reply.state.is_some());
        let cr = reply.cur.expect("lagging read should carry cur");
        assert!(!cr.abort);
    }
}
