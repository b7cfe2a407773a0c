#![doc = include_str!("../README.md")]

use prototk_derive::Message;

///////////////////////////////////////////// ValueEntry ///////////////////////////////////////////

/// A single slot of the replicated log:  an opaque value at a numbered version.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ValueEntry {
    #[prototk(1, uint64)]
    pub version: u64,
    #[prototk(2, bytes)]
    pub value: Vec<u8>,
}

////////////////////////////////////////////// ValueMap ////////////////////////////////////////////

/// The versioned values carried by LAST, BEGIN, and COMMIT messages.  Entries are kept sorted
/// ascending by version so that receivers may apply them in log order.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ValueMap {
    #[prototk(1, message)]
    entries: Vec<ValueEntry>,
}

impl ValueMap {
    /// Insert `value` at `version`, replacing any value already there.
    pub fn insert(&mut self, version: u64, value: Vec<u8>) {
        match self.entries.binary_search_by_key(&version, |e| e.version) {
            Ok(idx) => {
                self.entries[idx].value = value;
            }
            Err(idx) => {
                self.entries.insert(idx, ValueEntry { version, value });
            }
        }
    }

    /// The value at `version`, if present.
    pub fn get(&self, version: u64) -> Option<&[u8]> {
        self.entries
            .binary_search_by_key(&version, |e| e.version)
            .ok()
            .map(|idx| self.entries[idx].value.as_slice())
    }

    /// True iff no versions are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of versions held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate (version, value) pairs in ascending version order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.entries.iter().map(|e| (e.version, e.value.as_slice()))
    }
}

impl FromIterator<(u64, Vec<u8>)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (u64, Vec<u8>)>>(entries: T) -> Self {
        let mut map = ValueMap::default();
        for (version, value) in entries {
            map.insert(version, value);
        }
        map
    }
}

//////////////////////////////////////////////// Op ////////////////////////////////////////////////

/// The seven operations of the protocol.  Each variant carries only the fields that operation
/// uses.  COLLECT/LAST drive recovery (phase 1), BEGIN/ACCEPT/COMMIT drive proposals (phase 2),
/// and LEASE/LEASE_ACK maintain the read lease between proposals.
#[derive(Clone, Debug, Eq, Message, PartialEq)]
pub enum Op {
    /// Collect messages rally the quorum behind the leader's proposal number.  They are answered
    /// with Last messages.
    #[prototk(1, message)]
    Collect {
        #[prototk(1, uint64)]
        pn: u64,
        #[prototk(2, uint64)]
        pn_from: u64,
        #[prototk(3, uint64)]
        last_committed: u64,
    },
    /// Last messages return whether a peon supports a proposal number, share every committed
    /// value the sender holds at or above the collector's last_committed, and surface any
    /// accepted-but-uncommitted value together with the number it was accepted under.
    #[prototk(2, message)]
    Last {
        #[prototk(1, uint64)]
        pn: u64,
        #[prototk(2, uint64)]
        pn_from: u64,
        #[prototk(3, uint64)]
        old_accepted_pn: u64,
        #[prototk(4, uint64)]
        last_committed: u64,
        #[prototk(5, message)]
        values: ValueMap,
    },
    /// Begin messages propose a value for the slot after last_committed under a previously
    /// collected proposal number.
    #[prototk(3, message)]
    Begin {
        #[prototk(1, uint64)]
        pn: u64,
        #[prototk(2, uint64)]
        last_committed: u64,
        #[prototk(3, message)]
        values: ValueMap,
    },
    /// Accept messages acknowledge a Begin.
    #[prototk(4, message)]
    Accept {
        #[prototk(1, uint64)]
        pn: u64,
        #[prototk(2, uint64)]
        last_committed: u64,
    },
    /// Commit messages disseminate committed values, one slot at a time in ascending order.
    #[prototk(5, message)]
    Commit {
        #[prototk(1, uint64)]
        pn: u64,
        #[prototk(2, uint64)]
        last_committed: u64,
        #[prototk(3, message)]
        values: ValueMap,
    },
    /// Lease messages extend the time before which any in-sync quorum member may serve reads
    /// locally.
    #[prototk(6, message)]
    Lease {
        #[prototk(1, uint64)]
        last_committed: u64,
        #[prototk(2, uint64)]
        lease_expire: u64,
    },
    /// LeaseAck messages acknowledge a Lease.
    #[prototk(7, message)]
    LeaseAck {
        #[prototk(1, uint64)]
        last_committed: u64,
        #[prototk(2, uint64)]
        lease_expire: u64,
    },
}

impl Op {
    /// A short name for the operation, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Collect { .. } => "collect",
            Op::Last { .. } => "last",
            Op::Begin { .. } => "begin",
            Op::Accept { .. } => "accept",
            Op::Commit { .. } => "commit",
            Op::Lease { .. } => "lease",
            Op::LeaseAck { .. } => "lease_ack",
        }
    }
}

impl Default for Op {
    fn default() -> Self {
        Op::Collect {
            pn: 0,
            pn_from: 0,
            last_committed: 0,
        }
    }
}

/////////////////////////////////////////// PaxosMessage ///////////////////////////////////////////

/// The envelope for every operation.  The epoch tags the election round the sender believed
/// current and the machine_id demultiplexes among the state machines sharing one monitor pair.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PaxosMessage {
    #[prototk(1, uint64)]
    pub epoch: u64,
    #[prototk(2, uint64)]
    pub machine_id: u64,
    #[prototk(3, message)]
    pub op: Op,
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
