//! A discrete-event harness for driving clusters of [Paxos] machines:  an event heap over
//! message deliveries and timer firings, a shared microsecond clock, severable links, and
//! crash/revive with durable state surviving and volatile state lost.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::rc::Rc;

use synod::reference::MemoryStore;
use synod::{Completion, LogView, Monitor, Paxos, PaxosOptions, Role, Store, Timeout, MILLIS};
use synod_pb::PaxosMessage;

pub const MACHINE_NAME: &str = "osdmap";
pub const MACHINE_ID: u64 = 1;
pub const LATENCY: u64 = MILLIS;

pub type SharedStore = Rc<RefCell<MemoryStore>>;

//////////////////////////////////////////// SimMonitor ////////////////////////////////////////////

/// The [Monitor] capability as the harness provides it.  Sends, timer requests, and election
/// calls accumulate here; the cluster integrates them into the event heap after every call into
/// the core.
pub struct SimMonitor {
    pub whoami: u64,
    clock: Rc<Cell<u64>>,
    pub epoch: u64,
    pub role: Role,
    pub leader: u64,
    pub quorum: Vec<u64>,
    pub num_monitors: u64,
    outbox: Vec<(u64, PaxosMessage)>,
    defers: Vec<(Timeout, u64)>,
    cancels: Vec<Timeout>,
    pub election_called: bool,
}

impl Monitor for SimMonitor {
    fn whoami(&self) -> u64 {
        self.whoami
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn role(&self) -> Role {
        self.role
    }

    fn leader(&self) -> u64 {
        self.leader
    }

    fn quorum(&self) -> Vec<u64> {
        self.quorum.clone()
    }

    fn num_monitors(&self) -> u64 {
        self.num_monitors
    }

    fn now(&self) -> u64 {
        self.clock.get()
    }

    fn send(&mut self, to: u64, msg: PaxosMessage) {
        self.outbox.push((to, msg));
    }

    fn defer(&mut self, timeout: Timeout, after: u64) {
        self.defers.push((timeout, after));
    }

    fn cancel(&mut self, timeout: Timeout) {
        self.cancels.push(timeout);
    }

    fn call_election(&mut self) {
        self.election_called = true;
    }
}

//////////////////////////////////////////////// Node //////////////////////////////////////////////

pub struct Node {
    pub paxos: Paxos<SharedStore>,
    pub store: SharedStore,
    pub mon: SimMonitor,
    pub up: bool,
    timer_gen: [u64; 3],
}

fn timer_idx(timeout: Timeout) -> usize {
    match timeout {
        Timeout::Accept => 0,
        Timeout::LeaseRenew => 1,
        Timeout::LeaseAck => 2,
    }
}

/////////////////////////////////////////////// Event //////////////////////////////////////////////

#[derive(Clone, Debug)]
enum What {
    Deliver {
        from: u64,
        to: u64,
        msg: PaxosMessage,
    },
    Timer {
        who: u64,
        kind: Timeout,
        gen: u64,
    },
}

#[derive(Clone, Debug)]
struct Event {
    when: u64,
    seq: u64,
    what: What,
}

impl Eq for Event {}

impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        (self.when, self.seq) == (other.when, other.seq)
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Event) -> std::cmp::Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Event) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

////////////////////////////////////////////// Cluster /////////////////////////////////////////////

/// A cluster of monitors, each hosting one machine instance over its own store.  Everything is
/// deterministic:  same calls, same schedule.
pub struct Cluster {
    pub clock: Rc<Cell<u64>>,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
    pub nodes: Vec<Node>,
    /// Severed (from, to) links.  Deliveries across a severed link vanish.
    pub cut: BTreeSet<(u64, u64)>,
    pub epoch: u64,
    /// Every (leader, pn) observed on the wire in a COLLECT.
    pub collect_pns: Vec<(u64, u64)>,
    options: PaxosOptions,
}

impl Cluster {
    pub fn new(n: u64, options: PaxosOptions) -> Self {
        let clock = Rc::new(Cell::new(0));
        let mut nodes = Vec::new();
        for whoami in 0..n {
            let store = Rc::new(RefCell::new(MemoryStore::new()));
            let log = LogView::new(MACHINE_NAME, Rc::clone(&store));
            let paxos = Paxos::new(options.clone(), MACHINE_ID, log).unwrap();
            let mon = SimMonitor {
                whoami,
                clock: Rc::clone(&clock),
                epoch: 0,
                role: Role::Starting,
                leader: 0,
                quorum: Vec::new(),
                num_monitors: n,
                outbox: Vec::new(),
                defers: Vec::new(),
                cancels: Vec::new(),
                election_called: false,
            };
            nodes.push(Node {
                paxos,
                store,
                mon,
                up: true,
                timer_gen: [0; 3],
            });
        }
        Self {
            clock,
            events: BinaryHeap::new(),
            seq: 0,
            nodes,
            cut: BTreeSet::new(),
            epoch: 0,
            collect_pns: Vec::new(),
            options,
        }
    }

    fn push(&mut self, after: u64, what: What) {
        let when = self.clock.get() + after;
        let seq = self.seq;
        self.seq += 1;
        self.events.push(Reverse(Event { when, seq, what }));
    }

    /// Move the effects the core requested into the event heap.
    fn integrate(&mut self, who: u64) {
        let outbox = std::mem::take(&mut self.nodes[who as usize].mon.outbox);
        let cancels = std::mem::take(&mut self.nodes[who as usize].mon.cancels);
        let defers = std::mem::take(&mut self.nodes[who as usize].mon.defers);
        for (to, msg) in outbox {
            self.push(LATENCY, What::Deliver { from: who, to, msg });
        }
        for timeout in cancels {
            self.nodes[who as usize].timer_gen[timer_idx(timeout)] += 1;
        }
        for (timeout, after) in defers {
            let gen = {
                let gen = &mut self.nodes[who as usize].timer_gen[timer_idx(timeout)];
                *gen += 1;
                *gen
            };
            self.push(
                after,
                What::Timer {
                    who,
                    kind: timeout,
                    gen,
                },
            );
        }
    }

    /// Run an election:  the up nodes form the quorum, `leader` leads, everyone else peons.
    pub fn elect(&mut self, leader: u64) {
        assert!(self.nodes[leader as usize].up);
        self.epoch += 1;
        let quorum: Vec<u64> = self
            .nodes
            .iter()
            .filter(|n| n.up)
            .map(|n| n.mon.whoami)
            .collect();
        for node in self.nodes.iter_mut() {
            if !node.up {
                continue;
            }
            node.mon.epoch = self.epoch;
            node.mon.leader = leader;
            node.mon.quorum = quorum.clone();
            node.mon.role = if node.mon.whoami == leader {
                Role::Leader
            } else {
                Role::Peon
            };
            node.mon.election_called = false;
        }
        for who in quorum {
            let node = &mut self.nodes[who as usize];
            if node.mon.whoami == leader {
                node.paxos.leader_init(&mut node.mon).unwrap();
            } else {
                node.paxos.peon_init(&mut node.mon);
            }
            self.integrate(who);
        }
    }

    fn deliver(&mut self, from: u64, to: u64, msg: PaxosMessage) {
        if let synod_pb::Op::Collect { pn, .. } = &msg.op {
            self.collect_pns.push((from, *pn));
        }
        if self.cut.contains(&(from, to)) {
            return;
        }
        let node = &mut self.nodes[to as usize];
        if !node.up {
            return;
        }
        // the monitor's epoch filter catches strays from other election rounds
        if msg.epoch != node.mon.epoch {
            return;
        }
        node.paxos.dispatch(&mut node.mon, from, msg).unwrap();
        self.integrate(to);
    }

    fn fire(&mut self, who: u64, kind: Timeout, gen: u64) {
        let node = &mut self.nodes[who as usize];
        if !node.up || node.timer_gen[timer_idx(kind)] != gen {
            return;
        }
        match kind {
            Timeout::Accept => node.paxos.accept_timeout(&mut node.mon),
            Timeout::LeaseRenew => node.paxos.lease_renew(&mut node.mon),
            Timeout::LeaseAck => node.paxos.lease_ack_timeout(&mut node.mon),
        }
        self.integrate(who);
    }

    /// Process every event scheduled at or before `deadline`, then advance the clock to it.
    pub fn run_until(&mut self, deadline: u64) {
        while let Some(Reverse(ev)) = self.events.peek().cloned() {
            if ev.when > deadline {
                break;
            }
            self.events.pop();
            assert!(ev.when >= self.clock.get());
            self.clock.set(ev.when);
            match ev.what {
                What::Deliver { from, to, msg } => self.deliver(from, to, msg),
                What::Timer { who, kind, gen } => self.fire(who, kind, gen),
            }
        }
        self.clock.set(deadline);
    }

    /// Process everything scheduled within the next `micros`.
    pub fn run_for(&mut self, micros: u64) {
        self.run_until(self.clock.get() + micros);
    }

    /// Propose a value on `who`, capturing the commit completion.  The flag holds None until the
    /// completion signals, then Some(success).
    pub fn propose(&mut self, who: u64, value: &[u8]) -> Rc<Cell<Option<bool>>> {
        let flag = Rc::new(Cell::new(None));
        let f = Rc::clone(&flag);
        let completion = Completion::new(move |result| f.set(Some(result.is_ok())));
        let node = &mut self.nodes[who as usize];
        node.paxos
            .propose_new_value(&mut node.mon, value.to_vec(), Some(completion))
            .unwrap();
        self.integrate(who);
        flag
    }

    /// Take the node down, losing its volatile state and every message and timer it had in
    /// flight.  The store survives.
    pub fn crash(&mut self, who: u64) {
        self.nodes[who as usize].up = false;
        let events = std::mem::take(&mut self.events);
        for Reverse(ev) in events {
            let stale = match &ev.what {
                What::Deliver { from, .. } => *from == who,
                What::Timer { who: w, .. } => *w == who,
            };
            if !stale {
                self.events.push(Reverse(ev));
            }
        }
    }

    /// Bring the node back with a fresh machine recovered from its store.  It stays Starting
    /// until the next election.
    pub fn revive(&mut self, who: u64) {
        let options = self.options.clone();
        let node = &mut self.nodes[who as usize];
        assert!(!node.up);
        let log = LogView::new(MACHINE_NAME, Rc::clone(&node.store));
        node.paxos = Paxos::new(options, MACHINE_ID, log).unwrap();
        node.mon.role = Role::Starting;
        node.mon.epoch = 0;
        node.mon.outbox.clear();
        node.mon.defers.clear();
        node.mon.cancels.clear();
        node.mon.election_called = false;
        node.timer_gen = [0; 3];
        node.up = true;
    }

    /// Sever both directions between `a` and `b`.
    pub fn sever(&mut self, a: u64, b: u64) {
        self.cut.insert((a, b));
        self.cut.insert((b, a));
    }

    /// Restore every severed link.
    pub fn heal(&mut self) {
        self.cut.clear();
    }

    /// The number of deliveries and timer firings still scheduled.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// The rank of any node whose core asked for an election, if one did.
    pub fn election_requested(&self) -> Option<u64> {
        self.nodes
            .iter()
            .filter(|n| n.mon.election_called)
            .map(|n| n.mon.whoami)
            .next()
    }

    /// The committed value at `v` on `who`, straight from the store.
    pub fn slot(&self, who: u64, v: u64) -> Option<Vec<u8>> {
        self.nodes[who as usize]
            .store
            .borrow()
            .get(MACHINE_NAME, v)
            .unwrap()
    }

    pub fn last_committed(&self, who: u64) -> u64 {
        self.nodes[who as usize].paxos.last_committed()
    }

    /// Committed prefixes must agree everywhere, up or down.
    pub fn check_agreement(&self) {
        for a in 0..self.nodes.len() as u64 {
            for b in a + 1..self.nodes.len() as u64 {
                let common = std::cmp::min(self.last_committed(a), self.last_committed(b));
                for v in 1..=common {
                    assert_eq!(
                        self.slot(a, v),
                        self.slot(b, v),
                        "monitors {a} and {b} disagree at version {v}"
                    );
                }
            }
        }
    }
}
