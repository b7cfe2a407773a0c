//! Deferred completions for callers blocked on the state machine:  readable, writeable, active,
//! and commit conditions each get a queue, and each completion is signalled at most once.

use std::collections::VecDeque;

use crate::Error;

//////////////////////////////////////////// Completion ////////////////////////////////////////////

/// A one-shot completion handle.  Created by the caller, consumed by the core when the awaited
/// condition is satisfied or becomes unsatisfiable.  Signalling consumes the handle, so a second
/// signal is unrepresentable; dropping an unsignalled handle is permitted.
pub struct Completion {
    notify: Box<dyn FnOnce(Result<(), Error>)>,
}

impl Completion {
    /// Wrap `notify` so the core can signal it later.
    pub fn new<F: FnOnce(Result<(), Error>) + 'static>(notify: F) -> Self {
        Self {
            notify: Box::new(notify),
        }
    }

    /// Deliver the result.
    pub fn signal(self, result: Result<(), Error>) {
        (self.notify)(result);
    }
}

///////////////////////////////////////////// WaitQueue ////////////////////////////////////////////

/// A FIFO of [Completion]s awaiting one condition.
#[derive(Default)]
pub struct WaitQueue {
    waiters: VecDeque<Completion>,
}

impl WaitQueue {
    /// Enqueue a completion.
    pub fn push(&mut self, completion: Completion) {
        self.waiters.push_back(completion);
    }

    /// Signal every queued completion with success, in FIFO order.
    pub fn complete_all(&mut self) {
        while let Some(completion) = self.waiters.pop_front() {
            completion.signal(Ok(()));
        }
    }

    /// Signal every queued completion with `err`, in FIFO order.
    pub fn fail_all(&mut self, err: Error) {
        while let Some(completion) = self.waiters.pop_front() {
            completion.signal(Err(err.clone()));
        }
    }

    /// The number of queued completions.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// True iff no completions are queued.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
