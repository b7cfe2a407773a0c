#![doc = include_str!("../README.md")]

use std::fmt::{Display, Formatter};

use arrrg_derive::CommandLine;

use prototk_derive::Message;

use zerror::{iotoz, Z};
use zerror_core::ErrorCore;
use zerror_derive::Z as ZDerive;

use synod_pb::PaxosMessage;

mod log;
mod paxos;
mod waiters;

/// A reference in-memory store.
#[cfg(feature = "reference")]
pub mod reference;

pub use log::LogView;
pub use paxos::Paxos;
pub use waiters::{Completion, WaitQueue};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

pub const MILLIS: u64 = 1_000;
pub const SECONDS: u64 = 1_000_000;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Registers this crate's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    paxos::register_biometrics(collector);
}

/// Registers this crate's monitors with the provided HeyListen.
pub fn register_monitors(hey_listen: &mut tatl::HeyListen) {
    paxos::register_monitors(hey_listen);
}

///////////////////////////////////////////// indicio //////////////////////////////////////////////

/// The collector to which this crate's clues go.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// Error for the coordination core.  Protocol violations are not errors; they halt the monitor.
#[derive(Clone, Message, ZDerive)]
pub enum Error {
    #[prototk(593920, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(593921, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: prototk::Error,
    },
    #[prototk(593922, message)]
    SystemError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(593923, message)]
    Corruption {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(593924, message)]
    NotLeader {
        #[prototk(1, message)]
        core: ErrorCore,
    },
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

iotoz! {Error}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

/////////////////////////////////////////// PaxosOptions ///////////////////////////////////////////

/// [PaxosOptions] carries the four timing knobs of the core.  All values are microseconds.
#[derive(Clone, CommandLine, Debug, Eq, PartialEq)]
pub struct PaxosOptions {
    #[arrrg(optional, "Length of a read lease, in microseconds.")]
    pub lease: u64,
    #[arrrg(
        optional,
        "Time after lease issuance at which the leader renews it, in microseconds."
    )]
    pub lease_renew_interval: u64,
    #[arrrg(
        optional,
        "How long the leader waits for every peon to ack a lease before calling an election, in microseconds."
    )]
    pub lease_ack_timeout: u64,
    #[arrrg(
        optional,
        "How long the leader waits for every peon to accept a proposal before calling an election, in microseconds."
    )]
    pub accept_timeout: u64,
}

impl Default for PaxosOptions {
    fn default() -> Self {
        Self {
            lease: 5 * SECONDS,
            lease_renew_interval: 3 * SECONDS,
            lease_ack_timeout: 10 * SECONDS,
            accept_timeout: 10 * SECONDS,
        }
    }
}

/////////////////////////////////////////////// Role ///////////////////////////////////////////////

/// The role the external election module last assigned this monitor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Role {
    /// An election is in progress.
    #[default]
    Starting,
    /// This monitor leads the quorum.
    Leader,
    /// This monitor follows the current leader.
    Peon,
}

//////////////////////////////////////////// PaxosState ////////////////////////////////////////////

/// The phase of the consensus cycle.  Recovering covers phase 1, Updating covers phase 2, and
/// Active sits between proposals with the lease live.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PaxosState {
    #[default]
    Recovering,
    Active,
    Updating,
}

impl PaxosState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaxosState::Recovering => "recovering",
            PaxosState::Active => "active",
            PaxosState::Updating => "updating",
        }
    }
}

impl Display for PaxosState {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

////////////////////////////////////////////// Timeout /////////////////////////////////////////////

/// The three one-shot timers the core arms.  At most one of each kind is ever pending; arming a
/// kind replaces any timer of that kind still outstanding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Waiting for the full quorum to accept a proposal.
    Accept,
    /// Renew the lease before it expires.
    LeaseRenew,
    /// Waiting for the full quorum to ack a lease.
    LeaseAck,
}

/////////////////////////////////////////////// Store //////////////////////////////////////////////

/// The durable key/value store a monitor provides.  Slots are numbered per machine name; scalar
/// integers are keyed by string.  Writes are assumed atomic and crash-safe.
pub trait Store {
    /// True iff the numbered slot exists under `name`.
    fn exists(&self, name: &str, v: u64) -> bool;
    /// The value at the numbered slot under `name`.
    fn get(&self, name: &str, v: u64) -> Result<Option<Vec<u8>>, Error>;
    /// Durably write the value at the numbered slot under `name`.
    fn put(&mut self, name: &str, v: u64, value: &[u8]) -> Result<(), Error>;
    /// The scalar at `key`, or 0 if it was never written.
    fn get_int(&self, key: &str) -> Result<u64, Error>;
    /// Durably write the scalar at `key`.
    fn put_int(&mut self, key: &str, value: u64) -> Result<(), Error>;
}

////////////////////////////////////////////// Monitor /////////////////////////////////////////////

/// The capabilities the core consumes from the monitor that hosts it:  quorum identity from the
/// external election module, best-effort in-order point-to-point sends, one-shot timers, and a
/// clock used only for lease-expiry comparisons.  Handlers borrow the monitor per call; the core
/// never owns it.
pub trait Monitor {
    /// This monitor's rank.  Ranks must fall in [0, 99] so proposal numbers can encode them.
    fn whoami(&self) -> u64;
    /// The current election epoch, stamped on every outbound message.
    fn epoch(&self) -> u64;
    /// The role the election module last assigned.
    fn role(&self) -> Role;
    /// The rank of the current leader.  Meaningless while Starting.
    fn leader(&self) -> u64;
    /// The ranks the election module currently considers live and participating.
    fn quorum(&self) -> Vec<u64>;
    /// The total number of monitors in the cluster, quorate or not.
    fn num_monitors(&self) -> u64;
    /// A monotonic-ish timestamp in microseconds.
    fn now(&self) -> u64;
    /// Send to the named peer.  Best-effort; the transport may drop on failure.
    fn send(&mut self, to: u64, msg: PaxosMessage);
    /// Arm a one-shot timer of the given kind, replacing any pending timer of that kind.
    fn defer(&mut self, timeout: Timeout, after: u64);
    /// Cancel the pending timer of the given kind, if any.
    fn cancel(&mut self, timeout: Timeout);
    /// Ask the election module for a fresh election.
    fn call_election(&mut self);

    /// True iff an election is in progress.
    fn is_starting(&self) -> bool {
        self.role() == Role::Starting
    }

    /// True iff this monitor leads the quorum.
    fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// True iff this monitor follows the current leader.
    fn is_peon(&self) -> bool {
        self.role() == Role::Peon
    }
}
