//! The consensus state machine:  leader recovery (phase 1), value proposal and acceptance
//! (phase 2), commit dissemination, and the leader lease that permits local reads between
//! proposals.
//!
//! The machine is single-threaded cooperative.  Message handlers, timer callbacks, and service
//! calls execute serially and never suspend mid-body; invariants hold between invocations, not
//! within.  Protocol violations are assertions and halt the monitor.  Stale messages are counted
//! and dropped.  Liveness failures surface through [Monitor::call_election]; the core never
//! retries a message itself.

use std::collections::BTreeSet;

use biometrics::Counter;

use indicio::{clue, ERROR, INFO, WARNING};

use tatl::{HeyListen, Stationary};

use zerror_core::ErrorCore;

use synod_pb::{Op, PaxosMessage, ValueMap};

use crate::log::LogView;
use crate::waiters::{Completion, WaitQueue};
use crate::{Error, Monitor, PaxosOptions, PaxosState, Store, Timeout, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static COLLECT: Counter = Counter::new("synod.collect");
static COLLECT_RESTART: Counter = Counter::new("synod.collect.restart");
static HANDLE_COLLECT: Counter = Counter::new("synod.handle_collect");
static REJECTED_PN: Counter = Counter::new("synod.handle_collect.reject");
static HANDLE_LAST: Counter = Counter::new("synod.handle_last");
static CATCH_UP_PUSH: Counter = Counter::new("synod.catch_up.push");
static CATCH_UP_PULL: Counter = Counter::new("synod.catch_up.pull");
static BEGIN: Counter = Counter::new("synod.begin");
static HANDLE_BEGIN: Counter = Counter::new("synod.handle_begin");
static HANDLE_ACCEPT: Counter = Counter::new("synod.handle_accept");
static COMMIT: Counter = Counter::new("synod.commit");
static HANDLE_COMMIT: Counter = Counter::new("synod.handle_commit");
static EXTEND_LEASE: Counter = Counter::new("synod.extend_lease");
static HANDLE_LEASE: Counter = Counter::new("synod.handle_lease");
static HANDLE_LEASE_ACK: Counter = Counter::new("synod.handle_lease_ack");
static DUP_LEASE_ACK: Counter = Counter::new("synod.handle_lease_ack.dup");
static LEASE_RENEW: Counter = Counter::new("synod.lease_renew");
static PROPOSE: Counter = Counter::new("synod.propose");
static LEADER_INIT: Counter = Counter::new("synod.leader_init");
static PEON_INIT: Counter = Counter::new("synod.peon_init");

static DROP_STARTING: Counter = Counter::new("synod.drop.starting");
static DROP_NOT_LEADER: Counter = Counter::new("synod.drop.not_leader");
static DROP_STALE_BEGIN: Counter = Counter::new("synod.drop.stale_begin");
static DROP_STALE_ACCEPT: Counter = Counter::new("synod.drop.stale_accept");
static DROP_STALE_LEASE: Counter = Counter::new("synod.drop.stale_lease");

static ACCEPT_TIMEOUT: Counter = Counter::new("synod.election.accept_timeout");
static ACCEPT_TIMEOUT_MONITOR: Stationary =
    Stationary::new("synod.election.accept_timeout", &ACCEPT_TIMEOUT);
static LEASE_ACK_TIMEOUT: Counter = Counter::new("synod.election.lease_ack_timeout");
static LEASE_ACK_TIMEOUT_MONITOR: Stationary =
    Stationary::new("synod.election.lease_ack_timeout", &LEASE_ACK_TIMEOUT);

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&COLLECT);
    collector.register_counter(&COLLECT_RESTART);
    collector.register_counter(&HANDLE_COLLECT);
    collector.register_counter(&REJECTED_PN);
    collector.register_counter(&HANDLE_LAST);
    collector.register_counter(&CATCH_UP_PUSH);
    collector.register_counter(&CATCH_UP_PULL);
    collector.register_counter(&BEGIN);
    collector.register_counter(&HANDLE_BEGIN);
    collector.register_counter(&HANDLE_ACCEPT);
    collector.register_counter(&COMMIT);
    collector.register_counter(&HANDLE_COMMIT);
    collector.register_counter(&EXTEND_LEASE);
    collector.register_counter(&HANDLE_LEASE);
    collector.register_counter(&HANDLE_LEASE_ACK);
    collector.register_counter(&DUP_LEASE_ACK);
    collector.register_counter(&LEASE_RENEW);
    collector.register_counter(&PROPOSE);
    collector.register_counter(&LEADER_INIT);
    collector.register_counter(&PEON_INIT);
    collector.register_counter(&DROP_STARTING);
    collector.register_counter(&DROP_NOT_LEADER);
    collector.register_counter(&DROP_STALE_BEGIN);
    collector.register_counter(&DROP_STALE_ACCEPT);
    collector.register_counter(&DROP_STALE_LEASE);
    collector.register_counter(&ACCEPT_TIMEOUT);
    collector.register_counter(&LEASE_ACK_TIMEOUT);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&ACCEPT_TIMEOUT_MONITOR);
    hey_listen.register_stationary(&LEASE_ACK_TIMEOUT_MONITOR);
}

/////////////////////////////////////////////// Paxos //////////////////////////////////////////////

/// One instance of the coordination core, scoped to one machine name.  Several instances may
/// share a monitor, distinguished by machine id.
pub struct Paxos<S: Store> {
    options: PaxosOptions,
    machine_id: u64,
    log: LogView<S>,

    state: PaxosState,
    last_committed: u64,
    accepted_pn: u64,
    accepted_pn_from: u64,

    // the highest-numbered accepted-but-uncommitted value learned during the current recovery
    old_accepted_v: u64,
    old_accepted_pn: u64,
    old_accepted_value: Vec<u8>,
    num_last: u64,

    num_accepted: u64,
    new_value: Vec<u8>,

    lease_expire: u64,
    acked_lease: BTreeSet<u64>,

    accept_timeout_pending: bool,
    lease_renew_pending: bool,
    lease_ack_timeout_pending: bool,

    waiting_for_readable: WaitQueue,
    waiting_for_writeable: WaitQueue,
    waiting_for_active: WaitQueue,
    waiting_for_commit: WaitQueue,
}

impl<S: Store> Paxos<S> {
    /// Create the machine over `log`, recovering last_committed from the store.  The machine
    /// starts Recovering; the first leader_init or peon_init puts it to work.
    pub fn new(options: PaxosOptions, machine_id: u64, log: LogView<S>) -> Result<Self, Error> {
        let last_committed = log.last_committed()?;
        Ok(Self {
            options,
            machine_id,
            log,
            state: PaxosState::Recovering,
            last_committed,
            accepted_pn: 0,
            accepted_pn_from: 0,
            old_accepted_v: 0,
            old_accepted_pn: 0,
            old_accepted_value: Vec::new(),
            num_last: 0,
            num_accepted: 0,
            new_value: Vec::new(),
            lease_expire: 0,
            acked_lease: BTreeSet::new(),
            accept_timeout_pending: false,
            lease_renew_pending: false,
            lease_ack_timeout_pending: false,
            waiting_for_readable: WaitQueue::default(),
            waiting_for_writeable: WaitQueue::default(),
            waiting_for_active: WaitQueue::default(),
            waiting_for_commit: WaitQueue::default(),
        })
    }

    /// The machine id stamped on every outbound message.
    pub fn machine_id(&self) -> u64 {
        self.machine_id
    }

    /// The machine name this instance coordinates.
    pub fn name(&self) -> &str {
        self.log.name()
    }

    /// The phase of the consensus cycle.
    pub fn state(&self) -> PaxosState {
        self.state
    }

    pub fn is_recovering(&self) -> bool {
        self.state == PaxosState::Recovering
    }

    pub fn is_active(&self) -> bool {
        self.state == PaxosState::Active
    }

    pub fn is_updating(&self) -> bool {
        self.state == PaxosState::Updating
    }

    /// The highest version known committed on this monitor.
    pub fn last_committed(&self) -> u64 {
        self.last_committed
    }

    /// The proposal number this monitor currently operates under.
    pub fn accepted_pn(&self) -> u64 {
        self.accepted_pn
    }

    /// The time before which the current lease permits local reads.  Zero means no lease.
    pub fn lease_expire(&self) -> u64 {
        self.lease_expire
    }

    fn message(&self, m: &impl Monitor, op: Op) -> PaxosMessage {
        PaxosMessage {
            epoch: m.epoch(),
            machine_id: self.machine_id,
            op,
        }
    }

    ////////////////////////////////////// phase 1:  recovery //////////////////////////////////////

    // leader
    fn collect<M: Monitor>(&mut self, m: &mut M, old_pn: u64) -> Result<(), Error> {
        COLLECT.click();
        assert!(m.is_leader());
        self.state = PaxosState::Recovering;
        let lower_bound = std::cmp::max(self.accepted_pn, old_pn);
        self.accepted_pn = self.log.next_proposal_number(m.whoami(), lower_bound)?;
        self.accepted_pn_from = self.last_committed;
        self.num_last = 1;
        self.old_accepted_v = 0;
        self.old_accepted_pn = 0;
        self.old_accepted_value.clear();
        clue!(COLLECTOR, INFO, {
            collect: {
                pn: self.accepted_pn,
                last_committed: self.last_committed,
            },
        });
        for p in m.quorum() {
            if p == m.whoami() {
                continue;
            }
            let msg = self.message(
                m,
                Op::Collect {
                    pn: self.accepted_pn,
                    pn_from: self.accepted_pn_from,
                    last_committed: self.last_committed,
                },
            );
            m.send(p, msg);
        }
        Ok(())
    }

    // peon
    fn handle_collect<M: Monitor>(
        &mut self,
        m: &mut M,
        from: u64,
        pn: u64,
        pn_from: u64,
        last_committed: u64,
    ) -> Result<(), Error> {
        HANDLE_COLLECT.click();
        assert!(m.is_peon());
        self.state = PaxosState::Recovering;
        let mut values = ValueMap::default();
        let mut old_accepted_pn = 0;
        // do we have an accepted but uncommitted value?  (it'll be at last_committed+1)
        if let Some(value) = self.log.read(self.last_committed + 1)? {
            assert!(!value.is_empty());
            clue!(COLLECTOR, INFO, {
                sharing_uncommitted: {
                    version: self.last_committed + 1,
                    pn: self.accepted_pn,
                },
            });
            values.insert(self.last_committed + 1, value);
            old_accepted_pn = self.accepted_pn;
        }
        if pn > self.accepted_pn {
            self.accepted_pn = pn;
            self.accepted_pn_from = pn_from;
            clue!(COLLECTOR, INFO, {
                accepting_pn: { pn: pn, from: from },
            });
        } else {
            REJECTED_PN.click();
            clue!(COLLECTOR, WARNING, {
                rejecting_pn: {
                    pn: pn,
                    from: from,
                    accepted_pn: self.accepted_pn,
                },
            });
        }
        // share whatever committed values the collector may be missing
        for v in last_committed..=self.last_committed {
            if let Some(value) = self.log.read(v)? {
                values.insert(v, value);
            }
        }
        let msg = self.message(
            m,
            Op::Last {
                pn: self.accepted_pn,
                pn_from: self.accepted_pn_from,
                old_accepted_pn,
                last_committed: self.last_committed,
                values,
            },
        );
        m.send(from, msg);
        Ok(())
    }

    // leader
    fn handle_last<M: Monitor>(
        &mut self,
        m: &mut M,
        from: u64,
        old_accepted_pn: u64,
        last_committed: u64,
        values: ValueMap,
    ) -> Result<(), Error> {
        HANDLE_LAST.click();
        if !m.is_leader() {
            DROP_NOT_LEADER.click();
            return Ok(());
        }
        if last_committed < self.last_committed {
            // the peon is behind; push what it's missing
            CATCH_UP_PUSH.click();
            let mut shared = ValueMap::default();
            for v in last_committed + 1..=self.last_committed {
                if let Some(value) = self.log.read(v)? {
                    shared.insert(v, value);
                }
            }
            clue!(COLLECTOR, INFO, {
                catch_up_push: {
                    to: from,
                    from_version: last_committed + 1,
                    to_version: self.last_committed,
                },
            });
            let msg = self.message(
                m,
                Op::Commit {
                    pn: self.accepted_pn,
                    last_committed: self.last_committed,
                    values: shared,
                },
            );
            m.send(from, msg);
        }
        if last_committed > self.last_committed {
            // the peon is ahead; learn the committed values we missed
            CATCH_UP_PULL.click();
            for v in self.last_committed + 1..=last_committed {
                let Some(value) = values.get(v) else {
                    panic!("peer {from} shared a noncontiguous committed range");
                };
                self.log.write(v, value)?;
            }
            self.last_committed = last_committed;
            self.log.set_last_committed(self.last_committed)?;
            clue!(COLLECTOR, INFO, {
                catch_up_pull: {
                    from: from,
                    last_committed: self.last_committed,
                },
            });
        }
        if old_accepted_pn > self.accepted_pn {
            // they promised a higher number than ours; supersede it
            COLLECT_RESTART.click();
            clue!(COLLECTOR, INFO, {
                collect_restart: {
                    from: from,
                    old_accepted_pn: old_accepted_pn,
                    accepted_pn: self.accepted_pn,
                },
            });
            return self.collect(m, old_accepted_pn);
        }
        self.num_last += 1;
        if old_accepted_pn != 0 && old_accepted_pn > self.old_accepted_pn {
            self.old_accepted_v = last_committed + 1;
            self.old_accepted_pn = old_accepted_pn;
            self.old_accepted_value = values.get(self.old_accepted_v).unwrap_or(&[]).to_vec();
            clue!(COLLECTOR, INFO, {
                learned_uncommitted: {
                    version: self.old_accepted_v,
                    pn: self.old_accepted_pn,
                },
            });
        }
        if self.num_last == m.quorum().len() as u64 {
            if self.old_accepted_v == self.last_committed + 1 && !self.old_accepted_value.is_empty()
            {
                // classic Paxos:  propose the highest-numbered previously-accepted value
                let value = self.old_accepted_value.clone();
                self.begin(m, value)?;
            } else {
                clue!(COLLECTOR, INFO, {
                    recovered: { last_committed: self.last_committed },
                });
                self.state = PaxosState::Active;
                self.waiting_for_active.complete_all();
                self.extend_lease(m);
            }
        }
        Ok(())
    }

    ////////////////////////////////////// phase 2:  proposal //////////////////////////////////////

    // leader
    fn begin<M: Monitor>(&mut self, m: &mut M, value: Vec<u8>) -> Result<(), Error> {
        BEGIN.click();
        assert!(m.is_leader());
        assert!(!self.is_updating());
        let quorum = m.quorum();
        // we must already have a majority for this to work
        assert!(quorum.len() == 1 || self.num_last > m.num_monitors() / 2);
        assert!(self.new_value.is_empty());
        clue!(COLLECTOR, INFO, {
            begin: {
                version: self.last_committed + 1,
                pn: self.accepted_pn,
                bytes: value.len(),
            },
        });
        self.state = PaxosState::Updating;
        self.num_accepted = 1;
        self.new_value = value;
        self.log.write(self.last_committed + 1, &self.new_value)?;
        if quorum.len() == 1 {
            // we're alone; take it easy
            self.commit(m)?;
            self.state = PaxosState::Active;
            self.num_accepted = 0;
            self.waiting_for_commit.complete_all();
            self.waiting_for_active.complete_all();
            return Ok(());
        }
        for p in quorum {
            if p == m.whoami() {
                continue;
            }
            let mut values = ValueMap::default();
            values.insert(self.last_committed + 1, self.new_value.clone());
            let msg = self.message(
                m,
                Op::Begin {
                    pn: self.accepted_pn,
                    last_committed: self.last_committed,
                    values,
                },
            );
            m.send(p, msg);
        }
        m.defer(Timeout::Accept, self.options.accept_timeout);
        self.accept_timeout_pending = true;
        Ok(())
    }

    // peon
    fn handle_begin<M: Monitor>(
        &mut self,
        m: &mut M,
        from: u64,
        pn: u64,
        last_committed: u64,
        values: ValueMap,
    ) -> Result<(), Error> {
        HANDLE_BEGIN.click();
        if pn < self.accepted_pn {
            DROP_STALE_BEGIN.click();
            clue!(COLLECTOR, WARNING, {
                stale_begin: { pn: pn, accepted_pn: self.accepted_pn },
            });
            return Ok(());
        }
        assert_eq!(pn, self.accepted_pn);
        assert_eq!(last_committed, self.last_committed);
        self.state = PaxosState::Updating;
        // cancel any outstanding lease; reads must not see past the value in flight
        self.lease_expire = 0;
        let v = self.last_committed + 1;
        let Some(value) = values.get(v) else {
            panic!("begin from {from} carried no value for version {v}");
        };
        self.log.write(v, value)?;
        let msg = self.message(
            m,
            Op::Accept {
                pn: self.accepted_pn,
                last_committed: self.last_committed,
            },
        );
        m.send(from, msg);
        Ok(())
    }

    // leader
    fn handle_accept<M: Monitor>(
        &mut self,
        m: &mut M,
        from: u64,
        pn: u64,
        last_committed: u64,
    ) -> Result<(), Error> {
        HANDLE_ACCEPT.click();
        if pn != self.accepted_pn {
            DROP_STALE_ACCEPT.click();
            clue!(COLLECTOR, WARNING, {
                stale_accept: { from: from, pn: pn, accepted_pn: self.accepted_pn },
            });
            return Ok(());
        }
        if self.last_committed > 0 && last_committed < self.last_committed - 1 {
            DROP_STALE_ACCEPT.click();
            clue!(COLLECTOR, WARNING, {
                old_round_accept: { from: from, last_committed: last_committed },
            });
            return Ok(());
        }
        // not committed, or committed at the majority mark below
        assert!(last_committed == self.last_committed || last_committed + 1 == self.last_committed);
        assert!(self.is_updating());
        self.num_accepted += 1;
        // a strict majority of all monitors, quorate or not, makes the value durable
        if self.num_accepted == m.num_monitors() / 2 + 1 {
            self.commit(m)?;
        }
        if self.num_accepted == m.quorum().len() as u64 {
            clue!(COLLECTOR, INFO, {
                accepted_by_all: { last_committed: self.last_committed },
            });
            self.state = PaxosState::Active;
            self.num_accepted = 0;
            self.waiting_for_commit.complete_all();
            self.waiting_for_active.complete_all();
            self.extend_lease(m);
            if self.accept_timeout_pending {
                m.cancel(Timeout::Accept);
                self.accept_timeout_pending = false;
            }
        }
        Ok(())
    }

    // leader
    fn commit<M: Monitor>(&mut self, m: &mut M) -> Result<(), Error> {
        COMMIT.click();
        self.last_committed += 1;
        self.log.set_last_committed(self.last_committed)?;
        clue!(COLLECTOR, INFO, {
            commit: { last_committed: self.last_committed },
        });
        for p in m.quorum() {
            if p == m.whoami() {
                continue;
            }
            let mut values = ValueMap::default();
            values.insert(self.last_committed, self.new_value.clone());
            let msg = self.message(
                m,
                Op::Commit {
                    pn: self.accepted_pn,
                    last_committed: self.last_committed,
                    values,
                },
            );
            m.send(p, msg);
        }
        // get ready for a new round
        self.new_value.clear();
        Ok(())
    }

    // peon
    fn handle_commit<M: Monitor>(
        &mut self,
        m: &mut M,
        _from: u64,
        values: ValueMap,
    ) -> Result<(), Error> {
        HANDLE_COMMIT.click();
        assert!(m.is_peon());
        for (v, value) in values.iter() {
            assert_eq!(self.last_committed + 1, v);
            self.log.write(v, value)?;
            self.last_committed = v;
        }
        self.log.set_last_committed(self.last_committed)?;
        clue!(COLLECTOR, INFO, {
            committed: { last_committed: self.last_committed },
        });
        Ok(())
    }

    /// The full quorum did not accept within the configured window; hand liveness to the
    /// election module.
    pub fn accept_timeout<M: Monitor>(&mut self, m: &mut M) {
        ACCEPT_TIMEOUT.click();
        self.accept_timeout_pending = false;
        assert!(m.is_leader());
        assert!(self.is_updating());
        clue!(COLLECTOR, ERROR, {
            accept_timeout: { version: self.last_committed + 1 },
        });
        m.call_election();
    }

    //////////////////////////////////////////// lease /////////////////////////////////////////////

    // leader
    fn extend_lease<M: Monitor>(&mut self, m: &mut M) {
        EXTEND_LEASE.click();
        assert!(m.is_leader());
        assert!(self.is_active());
        self.lease_expire = m.now() + self.options.lease;
        self.acked_lease.clear();
        self.acked_lease.insert(m.whoami());
        clue!(COLLECTOR, INFO, {
            extend_lease: { lease_expire: self.lease_expire },
        });
        for p in m.quorum() {
            if p == m.whoami() {
                continue;
            }
            let msg = self.message(
                m,
                Op::Lease {
                    last_committed: self.last_committed,
                    lease_expire: self.lease_expire,
                },
            );
            m.send(p, msg);
        }
        self.waiting_for_readable.complete_all();
        self.waiting_for_writeable.complete_all();
        m.defer(Timeout::LeaseRenew, self.options.lease_renew_interval);
        self.lease_renew_pending = true;
        // if an old ack timeout is still in place, leave it
        if !self.lease_ack_timeout_pending {
            m.defer(Timeout::LeaseAck, self.options.lease_ack_timeout);
            self.lease_ack_timeout_pending = true;
        }
    }

    // peon
    fn handle_lease<M: Monitor>(
        &mut self,
        m: &mut M,
        from: u64,
        last_committed: u64,
        lease_expire: u64,
    ) {
        HANDLE_LEASE.click();
        if !m.is_peon() || last_committed != self.last_committed {
            DROP_STALE_LEASE.click();
            clue!(COLLECTOR, WARNING, {
                stale_lease: {
                    from: from,
                    last_committed: last_committed,
                    our_last_committed: self.last_committed,
                },
            });
            return;
        }
        // the lease may only extend
        if self.lease_expire < lease_expire {
            self.lease_expire = lease_expire;
        }
        // a lease is proof of the leader's active state, even mid-recovery here
        self.state = PaxosState::Active;
        self.waiting_for_active.complete_all();
        let msg = self.message(
            m,
            Op::LeaseAck {
                last_committed: self.last_committed,
                lease_expire: self.lease_expire,
            },
        );
        m.send(from, msg);
        if self.is_readable(m) {
            self.waiting_for_readable.complete_all();
        }
    }

    // leader
    fn handle_lease_ack<M: Monitor>(&mut self, m: &mut M, from: u64) {
        HANDLE_LEASE_ACK.click();
        if self.acked_lease.insert(from) {
            let quorum: BTreeSet<u64> = m.quorum().into_iter().collect();
            if self.acked_lease == quorum && self.lease_ack_timeout_pending {
                m.cancel(Timeout::LeaseAck);
                self.lease_ack_timeout_pending = false;
            }
        } else {
            // lagging peer; the duplicate is harmless
            DUP_LEASE_ACK.click();
        }
    }

    /// The renew window opened; extend the lease again.
    pub fn lease_renew<M: Monitor>(&mut self, m: &mut M) {
        LEASE_RENEW.click();
        self.lease_renew_pending = false;
        self.extend_lease(m);
    }

    /// Some peon never acked the lease; hand liveness to the election module.
    pub fn lease_ack_timeout<M: Monitor>(&mut self, m: &mut M) {
        LEASE_ACK_TIMEOUT.click();
        self.lease_ack_timeout_pending = false;
        assert!(m.is_leader());
        assert!(self.is_active());
        clue!(COLLECTOR, ERROR, {
            lease_ack_timeout: { lease_expire: self.lease_expire },
        });
        m.call_election();
    }

    //////////////////////////////////////////// reads /////////////////////////////////////////////

    /// True iff reads may be served locally:  a singleton quorum, or an in-sync member holding a
    /// live lease.
    pub fn is_readable<M: Monitor>(&self, m: &M) -> bool {
        if m.quorum().len() == 1 {
            return true;
        }
        (m.is_peon() || m.is_leader()) && self.is_active() && m.now() < self.lease_expire
    }

    /// The value at version `v`, if this monitor is readable and the slot exists.
    pub fn read<M: Monitor>(&self, m: &M, v: u64) -> Result<Option<Vec<u8>>, Error> {
        if !self.is_readable(m) {
            return Ok(None);
        }
        self.log.read(v)
    }

    /// The newest committed version and its value.
    pub fn read_current<M: Monitor>(&self, m: &M) -> Result<Option<(u64, Vec<u8>)>, Error> {
        if !self.is_readable(m) {
            return Ok(None);
        }
        Ok(self
            .log
            .read(self.last_committed)?
            .map(|value| (self.last_committed, value)))
    }

    /// Defer a completion until reads may be served locally.
    pub fn wait_for_readable(&mut self, completion: Completion) {
        self.waiting_for_readable.push(completion);
    }

    //////////////////////////////////////////// writes ////////////////////////////////////////////

    /// True iff this monitor may start a proposal:  a singleton quorum, or the active leader
    /// holding a live lease.
    pub fn is_writeable<M: Monitor>(&self, m: &M) -> bool {
        if m.quorum().len() == 1 {
            return true;
        }
        m.is_leader() && self.is_active() && m.now() < self.lease_expire
    }

    /// Defer a completion until proposals may be started here.
    pub fn wait_for_writeable(&mut self, completion: Completion) {
        self.waiting_for_writeable.push(completion);
    }

    /// Defer a completion until the machine leaves recovery.
    pub fn wait_for_active(&mut self, completion: Completion) {
        self.waiting_for_active.push(completion);
    }

    /// Propose `value` for the slot after last_committed.  The caller must hold
    /// [Paxos::is_writeable]; `on_commit`, if given, is signalled when the value commits locally,
    /// or fails if leadership is lost first.
    pub fn propose_new_value<M: Monitor>(
        &mut self,
        m: &mut M,
        value: Vec<u8>,
        on_commit: Option<Completion>,
    ) -> Result<(), Error> {
        PROPOSE.click();
        assert!(self.is_writeable(m));
        self.cancel_events(m);
        clue!(COLLECTOR, INFO, {
            propose: {
                version: self.last_committed + 1,
                bytes: value.len(),
            },
        });
        if let Some(on_commit) = on_commit {
            self.waiting_for_commit.push(on_commit);
        }
        self.begin(m, value)
    }

    ////////////////////////////////// initialization and dispatch /////////////////////////////////

    fn cancel_events<M: Monitor>(&mut self, m: &mut M) {
        if self.accept_timeout_pending {
            m.cancel(Timeout::Accept);
            self.accept_timeout_pending = false;
        }
        if self.lease_renew_pending {
            m.cancel(Timeout::LeaseRenew);
            self.lease_renew_pending = false;
        }
        if self.lease_ack_timeout_pending {
            m.cancel(Timeout::LeaseAck);
            self.lease_ack_timeout_pending = false;
        }
    }

    /// The election module put this monitor in charge.  Recover the quorum's state, unless we
    /// have the quorum to ourselves.
    pub fn leader_init<M: Monitor>(&mut self, m: &mut M) -> Result<(), Error> {
        LEADER_INIT.click();
        if m.quorum().len() == 1 {
            self.state = PaxosState::Active;
            return Ok(());
        }
        self.cancel_events(m);
        self.state = PaxosState::Recovering;
        self.lease_expire = 0;
        clue!(COLLECTOR, INFO, {
            leader_init: { last_committed: self.last_committed },
        });
        self.collect(m, 0)
    }

    /// The election module made this monitor a peon.  Only a leader can finish writes, so every
    /// queued writer and committer fails now.
    pub fn peon_init<M: Monitor>(&mut self, m: &mut M) {
        PEON_INIT.click();
        self.cancel_events(m);
        self.state = PaxosState::Recovering;
        self.lease_expire = 0;
        clue!(COLLECTOR, INFO, {
            peon_init: { last_committed: self.last_committed },
        });
        self.waiting_for_writeable.fail_all(Error::NotLeader {
            core: ErrorCore::default(),
        });
        self.waiting_for_commit.fail_all(Error::NotLeader {
            core: ErrorCore::default(),
        });
    }

    /// Route a message from `from` onto its handler.  Messages that arrive mid-election are
    /// dropped; the transport's epoch filter is expected to have discarded strays from other
    /// rounds already.
    pub fn dispatch<M: Monitor>(
        &mut self,
        m: &mut M,
        from: u64,
        msg: PaxosMessage,
    ) -> Result<(), Error> {
        if m.is_starting() {
            DROP_STARTING.click();
            clue!(COLLECTOR, WARNING, {
                election_in_progress: { from: from, op: msg.op.name() },
            });
            return Ok(());
        }
        assert_eq!(self.machine_id, msg.machine_id);
        assert!(m.is_leader() || (m.is_peon() && from == m.leader()));
        match msg.op {
            Op::Collect {
                pn,
                pn_from,
                last_committed,
            } => self.handle_collect(m, from, pn, pn_from, last_committed),
            Op::Last {
                pn: _,
                pn_from: _,
                old_accepted_pn,
                last_committed,
                values,
            } => self.handle_last(m, from, old_accepted_pn, last_committed, values),
            Op::Begin {
                pn,
                last_committed,
                values,
            } => self.handle_begin(m, from, pn, last_committed, values),
            Op::Accept { pn, last_committed } => self.handle_accept(m, from, pn, last_committed),
            Op::Commit {
                pn: _,
                last_committed: _,
                values,
            } => self.handle_commit(m, from, values),
            Op::Lease {
                last_committed,
                lease_expire,
            } => {
                self.handle_lease(m, from, last_committed, lease_expire);
                Ok(())
            }
            Op::LeaseAck { .. } => {
                self.handle_lease_ack(m, from);
                Ok(())
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
