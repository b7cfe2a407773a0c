//! An in-memory [Store], suitable for tests and for comparing real stores against.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::{Error, Store};

//////////////////////////////////////////// MemoryStore ///////////////////////////////////////////

/// [MemoryStore] keeps every slot and scalar in memory.  It never fails.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    slots: HashMap<String, BTreeMap<u64, Vec<u8>>>,
    ints: HashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn exists(&self, name: &str, v: u64) -> bool {
        self.slots.get(name).is_some_and(|slots| slots.contains_key(&v))
    }

    fn get(&self, name: &str, v: u64) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.slots.get(name).and_then(|slots| slots.get(&v)).cloned())
    }

    fn put(&mut self, name: &str, v: u64, value: &[u8]) -> Result<(), Error> {
        self.slots
            .entry(name.to_string())
            .or_default()
            .insert(v, value.to_vec());
        Ok(())
    }

    fn get_int(&self, key: &str) -> Result<u64, Error> {
        Ok(self.ints.get(key).copied().unwrap_or(0))
    }

    fn put_int(&mut self, key: &str, value: u64) -> Result<(), Error> {
        self.ints.insert(key.to_string(), value);
        Ok(())
    }
}

// A monitor shares one store among every machine instance it hosts.
impl Store for Rc<RefCell<MemoryStore>> {
    fn exists(&self, name: &str, v: u64) -> bool {
        self.borrow().exists(name, v)
    }

    fn get(&self, name: &str, v: u64) -> Result<Option<Vec<u8>>, Error> {
        self.borrow().get(name, v)
    }

    fn put(&mut self, name: &str, v: u64, value: &[u8]) -> Result<(), Error> {
        self.borrow_mut().put(name, v, value)
    }

    fn get_int(&self, key: &str) -> Result<u64, Error> {
        self.borrow().get_int(key)
    }

    fn put_int(&mut self, key: &str, value: u64) -> Result<(), Error> {
        self.borrow_mut().put_int(key, value)
    }
}
