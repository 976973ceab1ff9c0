//! The client engine.  A session owns an ordered chain of configurations it believes leads to
//! the current one, and drives every operation as a walk of that chain:  newer configurations
//! learned from replies are spliced in mid-flight, the register state is carried forward through
//! every configuration on the path, and the walk ends once a single current configuration with no
//! pending successor has answered.
//!
//! Reads, writes, and reconfigurations all share one driver, [LatticeSession::doreconf] (resp.
//! [ConsensusSession::doreconf]), parameterized by [Mode].

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use biometrics::{Collector, Counter};

use indicio::{clue, ERROR, INFO};

use zerror::Z;
use zerror_core::ErrorCore;

use remolt_pb::{
    Blueprint, CNewCur, Conf, ConfReply, DRead, Decree, Error, LAProposal, NewCur, NewState,
    NodeID, Prepare, Propose, State, WriteN,
};

use crate::fanout::{ConsensusFanout, LatticeFanout, Quorum};
use crate::provider::{Configuration, ContactPlan};
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static RECONF: Counter = Counter::new("remolt.client.reconf");
static DORECONF: Counter = Counter::new("remolt.client.doreconf");
static DOREAD: Counter = Counter::new("remolt.client.doread");
static LAGREE: Counter = Counter::new("remolt.client.lagree");
static LAGREE_REPROPOSE: Counter = Counter::new("remolt.client.lagree.repropose");
static AGREE_ROUNDS: Counter = Counter::new("remolt.client.agree.rounds");
static WIDENED: Counter = Counter::new("remolt.client.widened");
static NULL_PLAN: Counter = Counter::new("remolt.client.null_plan");
static INSTALLED: Counter = Counter::new("remolt.client.installed");

/// Register this module's counters with the provided collector.
pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&RECONF);
    collector.register_counter(&DORECONF);
    collector.register_counter(&DOREAD);
    collector.register_counter(&LAGREE);
    collector.register_counter(&LAGREE_REPROPOSE);
    collector.register_counter(&AGREE_ROUNDS);
    collector.register_counter(&WIDENED);
    collector.register_counter(&NULL_PLAN);
    collector.register_counter(&INSTALLED);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

// Competing proposers salt their consensus rounds modulo this stride so they never collide.
const ROUND_STRIDE: u32 = 256;

/////////////////////////////////////////////// Mode ///////////////////////////////////////////////

/// What a drive of the engine is trying to accomplish.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Install a proposed successor configuration.
    Reconfigure,
    /// Read the register; skip the write-back unless the chain demands it.
    RegularRead,
    /// Read and write back, optionally installing a new value:  the atomic read-or-write.
    Atomic,
}

////////////////////////////////////////// SessionOptions //////////////////////////////////////////

/// Knobs for a client session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// How many additional full-membership attempts a quorum call gets after the optimized
    /// attempt failed.
    pub retry: usize,
    /// The smallest live membership a reconfiguration may install.
    pub min_size: usize,
    /// The per-call deadline handed to the fan-out.
    pub timeout: Duration,
}

impl SessionOptions {
    /// Set the retry budget.
    pub fn with_retry(mut self, retry: usize) -> Self {
        self.retry = retry;
        self
    }

    /// Set the minimum membership size.
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Set the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry: 3,
            min_size: 1,
            timeout: Duration::from_secs(1),
        }
    }
}

////////////////////////////////////////////// helpers /////////////////////////////////////////////

// Stamp a new state when there is a value to write.  The value is consumed so the stamp happens
// exactly once per drive no matter how many configurations the walk visits.
fn write_value(value: &mut Option<Vec<u8>>, state: State, writer: NodeID) -> State {
    match value.take() {
        Some(value) => State::stamped(value, &state, writer),
        None => state,
    }
}

fn union_ids(rid: &mut Vec<NodeID>, more: &[NodeID]) {
    for id in more {
        if !rid.contains(id) {
            rid.push(*id);
        }
    }
}

// One quorum call under the retry policy:  a single optimized attempt, then widening to the full
// membership, then up to `retry` further attempts before the error surfaces.  A `None` plan means
// every needed replica already replied; the round still counts but nothing is transmitted.
fn with_widening<T>(
    opts: &SessionOptions,
    what: &'static str,
    optimized: Option<ContactPlan>,
    full: ContactPlan,
    cnt: &mut usize,
    call: impl Fn(&ContactPlan) -> Result<Quorum<T>, Error>,
) -> Result<Quorum<T>, Error> {
    let Some(mut plan) = optimized else {
        NULL_PLAN.click();
        *cnt += 1;
        return Ok(Quorum::empty());
    };
    let mut attempt = 0;
    loop {
        *cnt += 1;
        match call(&plan) {
            Ok(quorum) => return Ok(quorum),
            Err(err) => {
                if attempt == 0 {
                    WIDENED.click();
                    clue!(COLLECTOR, ERROR, {
                        widen: {
                            call: what,
                            error: err.long_form(),
                        },
                    });
                    plan = full.clone();
                }
                if attempt == opts.retry {
                    clue!(COLLECTOR, ERROR, {
                        retries_exhausted: {
                            call: what,
                            error: err.long_form(),
                        },
                    });
                    return Err(err);
                }
                attempt += 1;
            }
        }
    }
}

/////////////////////////////////////////////// Chain //////////////////////////////////////////////

// The client's chain of known configurations.  blueps[0] is the oldest configuration still
// believed current; later entries are successors in strictly increasing rank order.  confs runs
// parallel to blueps so a quorum-call plan is one index away.
struct Chain {
    blueps: Vec<Blueprint>,
    confs: Vec<Configuration>,
    timeout: Duration,
}

impl Chain {
    fn new(initial: Blueprint, timeout: Duration) -> Self {
        let confs = vec![Configuration::new(&initial, timeout)];
        Self {
            blueps: vec![initial],
            confs,
            timeout,
        }
    }

    fn len(&self) -> usize {
        self.blueps.len()
    }

    fn bluep(&self, i: usize) -> &Blueprint {
        &self.blueps[i]
    }

    fn conf(&self, i: usize) -> &Configuration {
        &self.confs[i]
    }

    fn rank(&self, i: usize) -> u32 {
        self.blueps[i].rank()
    }

    fn last(&self) -> &Blueprint {
        self.blueps.last().expect("chain is never empty")
    }

    fn insert(&mut self, i: usize, blueprint: &Blueprint) {
        let conf = Configuration::new(blueprint, self.timeout);
        self.blueps.insert(i, blueprint.clone());
        self.confs.insert(i, conf);
    }

    // Walk upward from `i` looking for the blueprint's place in the chain.  Known blueprints are
    // found, outdated ones are dropped, and anything genuinely new is spliced in rank order.
    fn find_or_insert(&mut self, mut i: usize, blueprint: &Blueprint) -> usize {
        if blueprint.is_empty() {
            return i;
        }
        let mut old = true;
        while i < self.blueps.len() {
            match self.blueps[i].learned_cmp(blueprint) {
                Ordering::Equal => return i,
                Ordering::Less => {
                    old = false;
                    i += 1;
                }
                Ordering::Greater => {
                    if old {
                        // Nothing below it on the walk:  the incoming blueprint is outdated.
                        return i;
                    }
                    self.insert(i, blueprint);
                    return i;
                }
            }
        }
        self.insert(i, blueprint);
        i
    }

    fn handle_new_cur(&mut self, cur: usize, reply: Option<&ConfReply>) -> usize {
        let Some(reply) = reply else {
            return cur;
        };
        let mut cur = cur;
        if let Some(blueprint) = &reply.cur {
            cur = self.find_or_insert(cur, blueprint);
        }
        self.handle_next(cur, &reply.next);
        cur
    }

    fn handle_one_cur(&mut self, i: usize, blueprint: Option<&Blueprint>) -> usize {
        match blueprint {
            Some(blueprint) => self.find_or_insert(i, blueprint),
            None => i,
        }
    }

    fn handle_next(&mut self, i: usize, next: &[Blueprint]) {
        let mut i = i;
        for blueprint in next {
            i = self.find_or_insert(i, blueprint);
        }
    }

    // Drop every configuration before `cur`; it is no longer believed current.
    fn advance(&mut self, cur: usize) {
        if cur == 0 {
            return;
        }
        self.blueps.drain(..cur);
        self.confs.drain(..cur);
    }
}

////////////////////////////////////////// LatticeSession //////////////////////////////////////////

/// A client session over the lattice-agreement surface.  The session's writer id stamps every
/// value it writes and never changes.
pub struct LatticeSession {
    id: NodeID,
    fanout: Arc<dyn LatticeFanout>,
    chain: Chain,
    opts: SessionOptions,
}

impl LatticeSession {
    /// Create a session rooted at `initial` and install `initial` on its replicas.  Installation
    /// is idempotent, so any number of clients may bootstrap the same configuration.
    pub fn new(
        fanout: Arc<dyn LatticeFanout>,
        initial: Blueprint,
        id: NodeID,
        opts: SessionOptions,
    ) -> Result<Self, Error> {
        let chain = Chain::new(initial, opts.timeout);
        let mut session = Self {
            id,
            fanout,
            chain,
            opts,
        };
        let mut cnt = 0;
        session.install_cur(&mut cnt)?;
        Ok(session)
    }

    /// The oldest configuration this session still believes current.
    pub fn head(&self) -> &Blueprint {
        &self.chain.blueps[0]
    }

    /// Propose `prop` as a successor of the current configuration.  Returns the number of quorum
    /// rounds spent.  A proposal already contained in the current configuration is a no-op.
    pub fn reconf(&mut self, prop: &Blueprint) -> Result<usize, Error> {
        RECONF.click();
        if *prop <= self.chain.blueps[0] {
            return Ok(0);
        }
        let (_, cnt) = self.doreconf(prop.clone(), Mode::Reconfigure, None)?;
        Ok(cnt)
    }

    /// Read the register.
    pub fn read(&mut self) -> Result<(State, usize), Error> {
        self.doreconf(Blueprint::default(), Mode::RegularRead, None)
    }

    /// Overwrite the register with `value`.
    pub fn write(&mut self, value: Vec<u8>) -> Result<usize, Error> {
        let (_, cnt) = self.doreconf(Blueprint::default(), Mode::Atomic, Some(value))?;
        Ok(cnt)
    }

    /// The unified driver behind [LatticeSession::reconf], [LatticeSession::read], and
    /// [LatticeSession::write].
    pub fn doreconf(
        &mut self,
        mut prop: Blueprint,
        mode: Mode,
        mut value: Option<Vec<u8>>,
    ) -> Result<(State, usize), Error> {
        DORECONF.click();
        let mut cnt = 0;
        if !(prop <= self.chain.blueps[0]) {
            // A genuinely new blueprint:  solve lattice agreement first.
            prop = self.lagree(prop, &mut cnt)?;
            let have = prop.ids().len();
            if have < self.opts.min_size {
                return Err(Error::UnacceptableConfiguration {
                    core: ErrorCore::default(),
                    have: have as u64,
                    need: self.opts.min_size as u64,
                });
            }
        }
        let mut cur = 0;
        let mut las = Blueprint::default();
        let mut rid: Vec<NodeID> = Vec::new();
        let mut rst = State::default();
        let mut i = 0;
        while i < self.chain.len() {
            if i < cur {
                i += 1;
                continue;
            }
            if prop.learned_cmp(self.chain.bluep(i)) != Ordering::Greater {
                if i + 1 == self.chain.len() && (cur == i || mode != Mode::Reconfigure) {
                    // In the current configuration:  read, both for the value and to discover
                    // successors recorded by others.
                    let st = self.doread(&mut cur, i, &rid, &mut cnt)?;
                    if st > rst {
                        rst = st;
                    }
                    if i < cur {
                        i += 1;
                        continue;
                    }
                }
                prop = self.chain.last().clone();
                rid.clear();
            }
            if prop.learned_cmp(self.chain.bluep(i)) == Ordering::Greater {
                // A successor exists:  teach it to this configuration.
                let req = WriteN {
                    cur_c: self.chain.rank(i),
                    next: Some(prop.clone()),
                };
                let optimized = self.chain.conf(i).write_plan_excluding(&rid);
                let full = self.chain.conf(i).write_plan();
                let fanout = &self.fanout;
                let quorum = with_widening(&self.opts, "write_next", optimized, full, &mut cnt, |plan| {
                    fanout.write_next(plan, &req)
                })?;
                let mut aborted = false;
                for reply in &quorum.replies {
                    cur = self.chain.handle_new_cur(cur, reply.cur.as_ref());
                    if let Some(la_state) = &reply.la_state {
                        las = las.merge(la_state);
                    }
                    if let Some(state) = &reply.state {
                        if *state > rst {
                            rst = state.clone();
                        }
                    }
                    if matches!(&reply.cur, Some(c) if c.abort) {
                        aborted = true;
                    }
                }
                if !aborted {
                    union_ids(&mut rid, &quorum.responders);
                }
            } else if i > cur || mode == Mode::Atomic {
                rst = write_value(&mut value, rst, self.id);
                let req = NewState {
                    cur_c: self.chain.rank(i),
                    cur: Some(self.chain.bluep(i).clone()),
                    state: Some(rst.clone()),
                    la_state: (!las.is_empty()).then(|| las.clone()),
                };
                let optimized = self.chain.conf(i).write_plan_excluding(&[]);
                let full = self.chain.conf(i).write_plan();
                let fanout = &self.fanout;
                let quorum = with_widening(&self.opts, "set_state", optimized, full, &mut cnt, |plan| {
                    fanout.set_state(plan, &req)
                })?;
                for reply in &quorum.replies {
                    cur = cur.max(self.chain.handle_one_cur(i, reply.cur.as_ref()));
                    self.chain.handle_next(i, &reply.next);
                }
            }
            i += 1;
        }
        self.chain.advance(cur);
        if mode == Mode::Reconfigure && self.chain.len() > 1 {
            // A successor beyond the entry head was fully propagated:  make it current.
            self.install_cur(&mut cnt)?;
        }
        Ok((rst, cnt))
    }

    // Merge the proposal with every configuration on the chain until a quorum of each accepts it.
    fn lagree(&mut self, mut prop: Blueprint, cnt: &mut usize) -> Result<Blueprint, Error> {
        LAGREE.click();
        let mut cur = 0;
        let mut rid: Vec<NodeID> = Vec::new();
        prop = prop.merge(&self.chain.blueps[0]);
        let mut i = 0;
        while i < self.chain.len() {
            if i < cur {
                i += 1;
                continue;
            }
            let req = LAProposal {
                conf: Some(Conf {
                    this: self.chain.rank(i),
                    cur: self.chain.rank(cur),
                }),
                prop: Some(prop.clone()),
            };
            let optimized = self.chain.conf(i).write_plan_excluding(&rid);
            let full = self.chain.conf(i).write_plan();
            let fanout = &self.fanout;
            let quorum = with_widening(&self.opts, "la_prop", optimized, full, cnt, |plan| {
                fanout.la_prop(plan, &req)
            })?;
            let mut merged: Option<Blueprint> = None;
            let mut aborted = false;
            for reply in &quorum.replies {
                cur = self.chain.handle_new_cur(cur, reply.cur.as_ref());
                if let Some(la_state) = &reply.la_state {
                    merged = Some(match merged {
                        Some(acc) => acc.merge(la_state),
                        None => la_state.clone(),
                    });
                }
                if matches!(&reply.cur, Some(c) if c.abort) {
                    aborted = true;
                }
            }
            if let Some(merged) = merged {
                if !prop.learned_equals(&merged) {
                    // Someone disagreed:  re-propose the merge in the same configuration.
                    LAGREE_REPROPOSE.click();
                    prop = merged;
                    rid.clear();
                    continue;
                }
            }
            if i + 1 < self.chain.len() && !aborted {
                union_ids(&mut rid, &quorum.responders);
            }
            i += 1;
        }
        self.chain.advance(cur);
        clue!(COLLECTOR, INFO, {
            lagree: {
                rank: prop.rank() as u64,
            },
        });
        Ok(prop)
    }

    // Read a quorum of configuration `i`, merging any discovered configurations into the chain.
    fn doread(
        &mut self,
        cur: &mut usize,
        i: usize,
        rid: &[NodeID],
        cnt: &mut usize,
    ) -> Result<State, Error> {
        DOREAD.click();
        let req = Conf {
            this: self.chain.rank(i),
            cur: self.chain.rank(i),
        };
        let optimized = self.chain.conf(i).read_plan_excluding(rid);
        let full = self.chain.conf(i).read_plan();
        let fanout = &self.fanout;
        let quorum = with_widening(&self.opts, "read", optimized, full, cnt, |plan| {
            fanout.read(plan, &req)
        })?;
        let mut st = State::default();
        for reply in &quorum.replies {
            *cur = self.chain.handle_new_cur(*cur, reply.cur.as_ref());
            self.chain.handle_next(i, &reply.next);
            if let Some(state) = &reply.state {
                if *state > st {
                    st = state.clone();
                }
            }
        }
        Ok(st)
    }

    // Install the newest chain entry as the current configuration and trim the chain to it.
    fn install_cur(&mut self, cnt: &mut usize) -> Result<(), Error> {
        let last = self.chain.len() - 1;
        let head = self.chain.bluep(last).clone();
        let req = NewCur {
            cur_c: head.rank(),
            cur: Some(head.clone()),
        };
        let full = self.chain.conf(last).write_plan();
        let fanout = &self.fanout;
        with_widening(
            &self.opts,
            "set_cur",
            Some(full.clone()),
            full,
            cnt,
            |plan| fanout.set_cur(plan, &req),
        )?;
        INSTALLED.click();
        clue!(COLLECTOR, INFO, {
            installed: {
                rank: head.rank() as u64,
            },
        });
        self.chain.advance(last);
        Ok(())
    }
}

///////////////////////////////////////// ConsensusSession /////////////////////////////////////////

/// A client session over the consensus surface.  Structurally the same walk as
/// [LatticeSession], with per-configuration consensus in place of lattice agreement:  each
/// configuration decides exactly one successor, and a competing client adopts the decided value
/// it observes.
pub struct ConsensusSession {
    id: NodeID,
    fanout: Arc<dyn ConsensusFanout>,
    chain: Chain,
    opts: SessionOptions,
}

impl ConsensusSession {
    /// Create a session rooted at `initial` and install `initial` on its replicas.
    pub fn new(
        fanout: Arc<dyn ConsensusFanout>,
        initial: Blueprint,
        id: NodeID,
        opts: SessionOptions,
    ) -> Result<Self, Error> {
        let chain = Chain::new(initial.clone(), opts.timeout);
        let session = Self {
            id,
            fanout,
            chain,
            opts,
        };
        let req = CNewCur {
            cur_c: initial.rank(),
            cur: Some(initial),
            state: Some(State::default()),
        };
        let full = session.chain.conf(0).write_plan();
        let fanout = &session.fanout;
        let mut cnt = 0;
        with_widening(
            &session.opts,
            "set_state",
            Some(full.clone()),
            full,
            &mut cnt,
            |plan| fanout.set_state(plan, &req),
        )?;
        Ok(session)
    }

    /// The oldest configuration this session still believes current.
    pub fn head(&self) -> &Blueprint {
        &self.chain.blueps[0]
    }

    /// Propose `prop` as a successor of the current configuration.  If a competing proposal was
    /// decided first, the session adopts it and the caller may re-propose from the new head.
    pub fn reconf(&mut self, prop: &Blueprint) -> Result<usize, Error> {
        RECONF.click();
        if *prop <= self.chain.blueps[0] {
            return Ok(0);
        }
        let (_, cnt) = self.doreconf(prop.clone(), Mode::Reconfigure, None)?;
        Ok(cnt)
    }

    /// Read the register.
    pub fn read(&mut self) -> Result<(State, usize), Error> {
        self.doreconf(Blueprint::default(), Mode::RegularRead, None)
    }

    /// Overwrite the register with `value`.
    pub fn write(&mut self, value: Vec<u8>) -> Result<usize, Error> {
        let (_, cnt) = self.doreconf(Blueprint::default(), Mode::Atomic, Some(value))?;
        Ok(cnt)
    }

    /// The unified driver behind [ConsensusSession::reconf], [ConsensusSession::read], and
    /// [ConsensusSession::write].
    pub fn doreconf(
        &mut self,
        mut prop: Blueprint,
        mode: Mode,
        mut value: Option<Vec<u8>>,
    ) -> Result<(State, usize), Error> {
        DORECONF.click();
        let mut cnt = 0;
        let mut cur = 0;
        let mut rid: Vec<NodeID> = Vec::new();
        let mut rst = State::default();
        let mut i = 0;
        while i < self.chain.len() {
            if i < cur {
                i += 1;
                continue;
            }
            if prop.learned_cmp(self.chain.bluep(i)) != Ordering::Greater {
                if i + 1 == self.chain.len() && (cur == i || mode != Mode::Reconfigure) {
                    let st = self.doread(&mut cur, i, &rid, &mut cnt)?;
                    if st > rst {
                        rst = st;
                    }
                    if i < cur {
                        i += 1;
                        continue;
                    }
                }
                prop = self.chain.last().clone();
                rid.clear();
            }
            if prop.learned_cmp(self.chain.bluep(i)) == Ordering::Greater {
                // Decide the successor of this configuration, then teach it while reading.
                let decided = self.agree(i, prop.clone(), &mut cur, &mut cnt)?;
                let req = DRead {
                    cur_c: self.chain.rank(i),
                    prop: Some(decided.clone()),
                };
                let optimized = self.chain.conf(i).write_plan_excluding(&rid);
                let full = self.chain.conf(i).write_plan();
                let fanout = &self.fanout;
                let quorum = with_widening(&self.opts, "write_next", optimized, full, &mut cnt, |plan| {
                    fanout.write_next(plan, &req)
                })?;
                for reply in &quorum.replies {
                    if let Some(state) = &reply.state {
                        if *state > rst {
                            rst = state.clone();
                        }
                    }
                    cur = cur.max(self.chain.handle_one_cur(cur, reply.cur.as_ref()));
                    self.chain.handle_next(i, &reply.next);
                }
                union_ids(&mut rid, &quorum.responders);
                prop = decided;
            } else if i > cur || mode == Mode::Atomic {
                rst = write_value(&mut value, rst, self.id);
                let req = CNewCur {
                    cur_c: self.chain.rank(i),
                    cur: Some(self.chain.bluep(i).clone()),
                    state: Some(rst.clone()),
                };
                let optimized = self.chain.conf(i).write_plan_excluding(&[]);
                let full = self.chain.conf(i).write_plan();
                let fanout = &self.fanout;
                let quorum = with_widening(&self.opts, "set_state", optimized, full, &mut cnt, |plan| {
                    fanout.set_state(plan, &req)
                })?;
                for reply in &quorum.replies {
                    cur = cur.max(self.chain.handle_one_cur(i, reply.cur.as_ref()));
                    self.chain.handle_next(i, &reply.next);
                }
            }
            i += 1;
        }
        self.chain.advance(cur);
        if mode == Mode::Reconfigure && self.chain.len() > 1 {
            // The combined installer already ran against the newest configuration; the older
            // entries are no longer current.
            let last = self.chain.len() - 1;
            self.chain.advance(last);
        }
        Ok((rst, cnt))
    }

    // Classic two-phase consensus on the successor of configuration `i`.  Returns the decided
    // blueprint, which may be a competing proposal decided first.
    fn agree(
        &mut self,
        i: usize,
        mut proposal: Blueprint,
        cur: &mut usize,
        cnt: &mut usize,
    ) -> Result<Blueprint, Error> {
        let cur_c = self.chain.rank(i);
        let mut rnd = self.next_round(0);
        loop {
            AGREE_ROUNDS.click();
            // Phase one:  rally a write quorum behind rnd.
            let req = Prepare { cur_c, rnd };
            let full = self.chain.conf(i).write_plan();
            let fanout = &self.fanout;
            let quorum = with_widening(
                &self.opts,
                "prepare",
                Some(full.clone()),
                full,
                cnt,
                |plan| fanout.prepare(plan, &req),
            )?;
            let mut decided: Option<Blueprint> = None;
            let mut promised = 0;
            let mut max_nack = 0;
            let mut highest: Option<Decree> = None;
            for reply in &quorum.replies {
                *cur = self.chain.handle_one_cur(*cur, reply.cur.as_ref());
                if let Some(dec) = &reply.dec {
                    decided = Some(dec.clone());
                }
                if reply.rnd == 0 {
                    promised += 1;
                    if let Some(val) = &reply.val {
                        if highest.as_ref().map_or(true, |h| val.rnd > h.rnd) {
                            highest = Some(val.clone());
                        }
                    }
                } else {
                    max_nack = max_nack.max(reply.rnd);
                }
            }
            if let Some(decided) = decided {
                return Ok(decided);
            }
            if promised < self.chain.conf(i).write_quorum() {
                rnd = self.next_round(max_nack.max(rnd));
                continue;
            }
            if let Some(highest) = highest {
                // An earlier round may already have chosen a value; champion it.
                proposal = highest.value;
            }
            // Phase two:  ask the quorum to accept the decree.
            let req = Propose {
                cur_c,
                val: Some(Decree {
                    rnd,
                    value: proposal.clone(),
                }),
            };
            let full = self.chain.conf(i).write_plan();
            let fanout = &self.fanout;
            let quorum = with_widening(
                &self.opts,
                "accept",
                Some(full.clone()),
                full,
                cnt,
                |plan| fanout.accept(plan, &req),
            )?;
            let mut decided: Option<Blueprint> = None;
            let mut learned = 0;
            for reply in &quorum.replies {
                *cur = self.chain.handle_one_cur(*cur, reply.cur.as_ref());
                if let Some(dec) = &reply.dec {
                    decided = Some(dec.clone());
                }
                if reply.learned {
                    learned += 1;
                }
            }
            if let Some(decided) = decided {
                return Ok(decided);
            }
            if learned >= self.chain.conf(i).write_quorum() {
                return Ok(proposal);
            }
            rnd = self.next_round(rnd);
        }
    }

    fn doread(
        &mut self,
        cur: &mut usize,
        i: usize,
        rid: &[NodeID],
        cnt: &mut usize,
    ) -> Result<State, Error> {
        DOREAD.click();
        let req = Conf {
            this: self.chain.rank(i),
            cur: self.chain.rank(i),
        };
        let optimized = self.chain.conf(i).read_plan_excluding(rid);
        let full = self.chain.conf(i).read_plan();
        let fanout = &self.fanout;
        let quorum = with_widening(&self.opts, "read", optimized, full, cnt, |plan| {
            fanout.read(plan, &req)
        })?;
        let mut st = State::default();
        for reply in &quorum.replies {
            *cur = self.chain.handle_new_cur(*cur, reply.cur.as_ref());
            self.chain.handle_next(i, &reply.next);
            if let Some(state) = &reply.state {
                if *state > st {
                    st = state.clone();
                }
            }
        }
        Ok(st)
    }

    // Rounds salted by writer id:  strictly above `seen`, never colliding with another writer's.
    fn next_round(&self, seen: u32) -> u32 {
        let salt = self.id.id % ROUND_STRIDE;
        (seen / ROUND_STRIDE + 1) * ROUND_STRIDE + salt
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use guacamole::{FromGuacamole, Guacamole};

    use super::*;

    fn nodes(ids: &[u32]) -> Vec<NodeID> {
        ids.iter().copied().map(NodeID::new).collect()
    }

    fn bp(add: &[u32]) -> Blueprint {
        Blueprint::new(nodes(add), Vec::new())
    }

    fn chain(ids: &[u32]) -> Chain {
        Chain::new(bp(ids), Duration::from_secs(1))
    }

    #[test]
    fn find_or_insert_is_idempotent() {
        let mut chain = chain(&[1, 2, 3]);
        let next = bp(&[1, 2, 3, 4]);
        assert_eq!(1, chain.find_or_insert(0, &next));
        let blueps = chain.blueps.clone();
        assert_eq!(1, chain.find_or_insert(0, &next));
        assert_eq!(blueps, chain.blueps);
        assert_eq!(2, chain.len());
    }

    #[test]
    fn find_or_insert_drops_outdated_blueprints() {
        let mut chain = chain(&[1, 2, 3, 4]);
        assert_eq!(0, chain.find_or_insert(0, &bp(&[1, 2, 3])));
        assert_eq!(1, chain.len());
        assert_eq!(bp(&[1, 2, 3, 4]), chain.blueps[0]);
    }

    #[test]
    fn find_or_insert_splices_in_rank_order() {
        let mut chain = chain(&[1, 2, 3]);
        chain.find_or_insert(0, &bp(&[1, 2, 3, 4, 5]));
        let mid = bp(&[1, 2, 3, 4]);
        assert_eq!(1, chain.find_or_insert(0, &mid));
        let ranks: Vec<u32> = chain.blueps.iter().map(Blueprint::rank).collect();
        assert_eq!(vec![3, 4, 5], ranks);
        assert_eq!(chain.blueps.len(), chain.confs.len());
    }

    #[test]
    fn find_or_insert_appends_new_heads() {
        let mut chain = chain(&[1, 2, 3]);
        assert_eq!(1, chain.find_or_insert(0, &bp(&[1, 2, 3, 4])));
        assert_eq!(2, chain.find_or_insert(0, &bp(&[1, 2, 3, 4, 5])));
        assert_eq!(3, chain.len());
    }

    #[test]
    fn handle_new_cur_consumes_cur_and_next() {
        let mut chain = chain(&[1, 2, 3]);
        let reply = ConfReply {
            cur: Some(bp(&[1, 2, 3, 4])),
            abort: false,
            next: vec![bp(&[1, 2, 3, 4, 5])],
        };
        let cur = chain.handle_new_cur(0, Some(&reply));
        assert_eq!(1, cur);
        assert_eq!(3, chain.len());
        assert_eq!(5, chain.blueps[2].rank());
    }

    #[test]
    fn advance_drops_the_prefix() {
        let mut chain = chain(&[1, 2, 3]);
        chain.find_or_insert(0, &bp(&[1, 2, 3, 4]));
        chain.advance(1);
        assert_eq!(1, chain.len());
        assert_eq!(bp(&[1, 2, 3, 4]), chain.blueps[0]);
        chain.advance(0);
        assert_eq!(1, chain.len());
    }

    #[test]
    fn chains_stay_sorted_under_random_insertions() {
        let mut guac = Guacamole::new(0xc0ffee);
        let mut chain = chain(&[1, 2, 3]);
        for _ in 0..256 {
            let extra = u8::from_guacamole(&mut (), &mut guac) % 8;
            let mut add = nodes(&[1, 2, 3]);
            for i in 0..extra {
                add.push(NodeID::new(4 + i as u32));
            }
            chain.find_or_insert(0, &Blueprint::new(add, Vec::new()));
        }
        let ranks: Vec<u32> = chain.blueps.iter().map(Blueprint::rank).collect();
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, ranks);
        assert_eq!(chain.blueps.len(), chain.confs.len());
    }

    #[test]
    fn write_value_stamps_exactly_once() {
        let writer = NodeID::new(7);
        let mut value = Some(b"x".to_vec());
        let st = write_value(&mut value, State::default(), writer);
        assert_eq!(1, st.timestamp);
        assert_eq!(writer, st.writer);
        assert_eq!(b"x".to_vec(), st.value);
        // The second application is a no-op:  the value was consumed.
        let st = write_value(&mut value, st, writer);
        assert_eq!(1, st.timestamp);
    }

    #[test]
    fn null_plans_still_count_a_round() {
        let opts = SessionOptions::default();
        let full = ContactPlan {
            nodes: nodes(&[1, 2, 3]),
            threshold: 2,
            timeout: Duration::from_secs(1),
        };
        let mut cnt = 0;
        let quorum: Quorum<()> = with_widening(&opts, "test", None, full, &mut cnt, |_| {
            panic!("a null plan must not transmit");
        })
        .unwrap();
        assert_eq!(1, cnt);
        assert!(quorum.replies.is_empty());
    }

    #[test]
    fn widening_retries_until_the_budget_is_spent() {
        let opts = SessionOptions::default().with_retry(2);
        let narrow = ContactPlan {
            nodes: nodes(&[1]),
            threshold: 1,
            timeout: Duration::from_secs(1),
        };
        let full = ContactPlan {
            nodes: nodes(&[1, 2, 3]),
            threshold: 2,
            timeout: Duration::from_secs(1),
        };
        let mut cnt = 0;
        let err = with_widening::<()>(
            &opts,
            "test",
            Some(narrow.clone()),
            full.clone(),
            &mut cnt,
            |plan| {
                if *plan == narrow {
                    Err(Error::quorum_failure(0, 1))
                } else {
                    Err(Error::quorum_failure(1, 2))
                }
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::QuorumFailure { have: 1, need: 2, .. }));
        // One optimized attempt plus the widened retries.
        assert_eq!(3, cnt);
    }

    #[test]
    fn widening_recovers_after_the_first_failure() {
        let opts = SessionOptions::default();
        let narrow = ContactPlan {
            nodes: nodes(&[1]),
            threshold: 1,
            timeout: Duration::from_secs(1),
        };
        let full = ContactPlan {
            nodes: nodes(&[1, 2, 3]),
            threshold: 2,
            timeout: Duration::from_secs(1),
        };
        let mut cnt = 0;
        let quorum = with_widening(
            &opts,
            "test",
            Some(narrow.clone()),
            full,
            &mut cnt,
            |plan| {
                if *plan == narrow {
                    Err(Error::quorum_failure(0, 1))
                } else {
                    Ok(Quorum {
                        replies: vec![()],
                        responders: nodes(&[2]),
                    })
                }
            },
        )
        .unwrap();
        assert_eq!(2, cnt);
        assert_eq!(1, quorum.replies.len());
    }
}
