//! The lattice-agreement replica.  Stores the current configuration, the register state, the
//! lattice-agreement working value, and every successor blueprint learned so far.  All state
//! transitions happen inside RPC handlers under a single reader-writer lock; there is no
//! background mutator.

use std::sync::{Arc, Mutex, RwLock};

use biometrics::{Collector, Counter};

use rpc_pb::Context;

use zerror_core::ErrorCore;

use remolt_pb::{
    Ack, Blueprint, Conf, ConfReply, Error, LAProposal, LAReply, NewCur, NewCurReply, NewState,
    NewStateReply, Proposal, ReadReply, ReplicaService, State, WriteN, WriteNReply, WriteS,
};

use crate::leader::ProposalSink;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static HANDLE_READ: Counter = Counter::new("remolt.replica.read");
static HANDLE_WRITE: Counter = Counter::new("remolt.replica.write");
static HANDLE_WRITE_NEXT: Counter = Counter::new("remolt.replica.write_next");
static HANDLE_LA_PROP: Counter = Counter::new("remolt.replica.la_prop");
static LA_ACCEPTED: Counter = Counter::new("remolt.replica.la_prop.accepted");
static LA_MERGED: Counter = Counter::new("remolt.replica.la_prop.merged");
static HANDLE_SET_STATE: Counter = Counter::new("remolt.replica.set_state");
static HANDLE_SET_CUR: Counter = Counter::new("remolt.replica.set_cur");
static CUR_INSTALLED: Counter = Counter::new("remolt.replica.set_cur.installed");
static HANDLE_FORWARD: Counter = Counter::new("remolt.replica.forward");

/// Register this module's counters with the provided collector.
pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&HANDLE_READ);
    collector.register_counter(&HANDLE_WRITE);
    collector.register_counter(&HANDLE_WRITE_NEXT);
    collector.register_counter(&HANDLE_LA_PROP);
    collector.register_counter(&LA_ACCEPTED);
    collector.register_counter(&LA_MERGED);
    collector.register_counter(&HANDLE_SET_STATE);
    collector.register_counter(&HANDLE_SET_CUR);
    collector.register_counter(&CUR_INSTALLED);
    collector.register_counter(&HANDLE_FORWARD);
}

////////////////////////////////////////// LatticeReplica //////////////////////////////////////////

#[derive(Default)]
struct Inner {
    cur: Option<Blueprint>,
    cur_c: u32,
    la_state: Blueprint,
    rstate: State,
    next: Vec<Blueprint>,
}

/// A replica of the register running the lattice-agreement flavour of reconfiguration.
///
/// `no_abort` trades safety reporting for liveness:  a replica with `no_abort` set keeps serving
/// clients whose configuration lags the installed one instead of redirecting them first.
pub struct LatticeReplica {
    no_abort: bool,
    inner: RwLock<Inner>,
    leader: Mutex<Option<Arc<dyn ProposalSink>>>,
}

impl LatticeReplica {
    /// Create a replica with no configuration installed.
    pub fn new(no_abort: bool) -> Self {
        Self {
            no_abort,
            inner: RwLock::new(Inner::default()),
            leader: Mutex::new(None),
        }
    }

    /// Create a replica with `(cur, cur_c)` installed, as from a bootstrap.
    pub fn with_cur(cur: Blueprint, cur_c: u32, no_abort: bool) -> Self {
        let replica = Self::new(no_abort);
        {
            let mut inner = replica.inner.write().unwrap();
            inner.cur = Some(cur);
            inner.cur_c = cur_c;
        }
        replica
    }

    /// Attach a leader to which forwarded proposals are handed.
    pub fn set_leader(&self, leader: Arc<dyn ProposalSink>) {
        *self.leader.lock().unwrap() = Some(leader);
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

    /// The lattice-agreement working value.
    pub fn la_state(&self) -> Blueprint {
        self.inner.read().unwrap().la_state.clone()
    }

    /// The successors learned and not yet evicted.
    pub fn pending(&self) -> Vec<Blueprint> {
        self.inner.read().unwrap().next.clone()
    }

    // The configuration section of a reply.  None means the sender's view needs no update.  A
    // missing conf, or one addressing a superseded configuration on a replica without no_abort,
    // earns a redirect carrying the installed current.
    fn config_reply(inner: &Inner, conf: Option<&Conf>, no_abort: bool) -> Option<ConfReply> {
        let Some(conf) = conf else {
            return Some(ConfReply {
                cur: inner.cur.clone(),
                abort: false,
                next: Vec::new(),
            });
        };
        if conf.this < inner.cur_c && !no_abort {
            return Some(ConfReply {
                cur: inner.cur.clone(),
                abort: false,
                next: Vec::new(),
            });
        }
        let next: Vec<Blueprint> = inner
            .next
            .iter()
            .filter(|b| b.rank() > conf.this)
            .cloned()
            .collect();
        if conf.cur < inner.cur_c {
            return Some(ConfReply {
                cur: inner.cur.clone(),
                abort: false,
                next,
            });
        }
        if !next.is_empty() {
            return Some(ConfReply {
                cur: None,
                abort: false,
                next,
            });
        }
        None
    }

    fn note_next(inner: &mut Inner, next: &Blueprint) {
        if !inner.next.iter().any(|b| b.learned_equals(next)) {
            inner.next.push(next.clone());
        }
    }

    fn stale(inner: &Inner, this: u32, no_abort: bool) -> bool {
        this < inner.cur_c && !no_abort
    }
}

impl ReplicaService for LatticeReplica {
    fn read(&self, _: &Context, req: Conf) -> Result<ReadReply, Error> {
        HANDLE_READ.click();
        let inner = self.inner.read().unwrap();
        let cr = Self::config_reply(&inner, Some(&req), self.no_abort);
        if matches!(&cr, Some(c) if c.abort) {
            return Ok(ReadReply {
                state: None,
                cur: cr,
                next: Vec::new(),
            });
        }
        Ok(ReadReply {
            state: Some(inner.rstate.clone()),
            cur: cr,
            next: Vec::new(),
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
        if let Some(cr) = Self::config_reply(&inner, req.conf.as_ref(), self.no_abort) {
            return Ok(cr);
        }
        Ok(ConfReply::default())
    }

    fn write_next(&self, _: &Context, req: WriteN) -> Result<WriteNReply, Error> {
        HANDLE_WRITE_NEXT.click();
        let mut inner = self.inner.write().unwrap();
        let conf = Conf {
            this: req.cur_c,
            cur: req.cur_c,
        };
        if !Self::stale(&inner, conf.this, self.no_abort) {
            if let Some(next) = &req.next {
                Self::note_next(&mut inner, next);
            }
        }
        let cr = Self::config_reply(&inner, Some(&conf), self.no_abort);
        if matches!(&cr, Some(c) if c.abort) {
            return Ok(WriteNReply {
                cur: cr,
                state: None,
                la_state: None,
            });
        }
        let la_state = (!inner.la_state.is_empty()).then(|| inner.la_state.clone());
        Ok(WriteNReply {
            cur: cr,
            state: Some(inner.rstate.clone()),
            la_state,
        })
    }

    fn la_prop(&self, _: &Context, req: LAProposal) -> Result<LAReply, Error> {
        HANDLE_LA_PROP.click();
        let mut inner = self.inner.write().unwrap();
        let cr = Self::config_reply(&inner, req.conf.as_ref(), self.no_abort);
        if matches!(&cr, Some(c) if c.abort) {
            return Ok(LAReply {
                cur: cr,
                la_state: None,
            });
        }
        let prop = req.prop.unwrap_or_default();
        if inner.la_state <= prop {
            LA_ACCEPTED.click();
            inner.la_state = prop;
            return Ok(LAReply {
                cur: cr,
                la_state: None,
            });
        }
        LA_MERGED.click();
        inner.la_state = inner.la_state.merge(&prop);
        // The client has to re-propose in this configuration before successors matter.
        let cr = cr.map(|mut c| {
            c.next.clear();
            c
        });
        Ok(LAReply {
            cur: cr,
            la_state: Some(inner.la_state.clone()),
        })
    }

    fn set_state(&self, _: &Context, req: NewState) -> Result<NewStateReply, Error> {
        HANDLE_SET_STATE.click();
        let mut inner = self.inner.write().unwrap();
        let Some(state) = &req.state else {
            return Err(Error::EmptyNewState {
                core: ErrorCore::default(),
            });
        };
        if let Some(la_state) = &req.la_state {
            inner.la_state = inner.la_state.merge(la_state);
        }
        if *state > inner.rstate {
            inner.rstate = state.clone();
        }
        if inner.cur_c > req.cur_c {
            return Ok(NewStateReply {
                cur: inner.cur.clone(),
                next: Vec::new(),
            });
        }
        let next: Vec<Blueprint> = inner
            .next
            .iter()
            .filter(|b| b.rank() > req.cur_c)
            .cloned()
            .collect();
        Ok(NewStateReply { cur: None, next })
    }

    fn set_cur(&self, _: &Context, req: NewCur) -> Result<NewCurReply, Error> {
        HANDLE_SET_CUR.click();
        let mut inner = self.inner.write().unwrap();
        let Some(cur) = req.cur else {
            return Ok(NewCurReply { new: false });
        };
        if req.cur_c == inner.cur_c {
            return Ok(NewCurReply { new: false });
        }
        let installed = inner.cur.as_ref().map(Blueprint::rank).unwrap_or(0);
        if cur.rank() <= installed {
            return Ok(NewCurReply { new: false });
        }
        CUR_INSTALLED.click();
        inner.cur = Some(cur);
        inner.cur_c = req.cur_c;
        let cur_c = inner.cur_c;
        inner.next.retain(|b| b.rank() > cur_c);
        Ok(NewCurReply { new: true })
    }

    fn forward(&self, _: &Context, req: Proposal) -> Result<Ack, Error> {
        HANDLE_FORWARD.click();
        let leader = self.leader.lock().unwrap();
        let Some(leader) = leader.as_ref() else {
            return Err(Error::not_implemented("no leader attached to this replica"));
        };
        if let Some(prop) = req.prop {
            leader.propose(prop);
        }
        Ok(Ack {})
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
