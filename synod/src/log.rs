//! A thin semantic over the [Store]:  numbered slots scoped by machine name, the last_committed
//! scalar, and the proposal-number allocator.

use crate::{Error, Store};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

// One allocator per monitor, shared by every machine instance, so issued numbers stay unique
// across machines too.
const LAST_PROPOSAL: &str = "last_paxos_proposal";

////////////////////////////////////////////// LogView /////////////////////////////////////////////

/// [LogView] scopes a [Store] to one machine name.  Slot `v` holds the value committed at version
/// `v`, except possibly `last_committed() + 1`, which may hold an accepted-but-uncommitted value
/// left behind by a crash.
pub struct LogView<S: Store> {
    store: S,
    name: String,
    last_committed_key: String,
}

impl<S: Store> LogView<S> {
    /// Create a view of `store` scoped to `name`.
    pub fn new(name: &str, store: S) -> Self {
        Self {
            store,
            name: name.to_string(),
            last_committed_key: format!("{}/last_committed", name),
        }
    }

    /// The machine name this view is scoped to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff slot `v` holds a value.
    pub fn exists(&self, v: u64) -> bool {
        self.store.exists(&self.name, v)
    }

    /// The value at slot `v`, if any.
    pub fn read(&self, v: u64) -> Result<Option<Vec<u8>>, Error> {
        self.store.get(&self.name, v)
    }

    /// Durably write `value` at slot `v`.
    pub fn write(&mut self, v: u64, value: &[u8]) -> Result<(), Error> {
        self.store.put(&self.name, v, value)
    }

    /// The highest version known committed, or 0 for a fresh log.
    pub fn last_committed(&self) -> Result<u64, Error> {
        self.store.get_int(&self.last_committed_key)
    }

    /// Durably advance the highest version known committed.  The slot's value must already be
    /// down before this is.
    pub fn set_last_committed(&mut self, v: u64) -> Result<(), Error> {
        self.store.put_int(&self.last_committed_key, v)
    }

    /// Return a globally unique, monotonically increasing proposal number no less than
    /// `lower_bound`, persisted before it is returned.  The low two decimal digits encode
    /// `whoami`, which keeps numbers unique across monitors.
    pub fn next_proposal_number(&mut self, whoami: u64, lower_bound: u64) -> Result<u64, Error> {
        assert!(whoami < 100);
        let mut last = self.store.get_int(LAST_PROPOSAL)?;
        if last < lower_bound {
            last = lower_bound;
        }
        let pn = (last / 100 + 1) * 100 + whoami;
        self.store.put_int(LAST_PROPOSAL, pn)?;
        Ok(pn)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
