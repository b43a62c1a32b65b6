//! Locally originated edits awaiting acknowledgement.
//!
//! At most one edit is in flight at a time: the head of the queue. Edits
//! queued behind it carry a speculative state number, `state + index`, which
//! is validated against the real counter when they reach the head.

use std::collections::VecDeque;

use crate::operation::Operation;
use crate::transform::{transform, TransformGap};

/// A local edit not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    /// Random ID used to recognise the server's echo of this edit.
    pub id: String,
    pub state: u64,
    pub operation: Operation,
}

impl PendingEdit {
    pub fn new(state: u64, operation: Operation) -> Self {
        Self {
            id: new_edit_id(),
            state,
            operation,
        }
    }
}

/// Random 10-character edit ID.
pub fn new_edit_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(10);
    id
}

/// Thread `incoming` through a sequence of operations that apply one after
/// the other, rewriting each to apply after `incoming`.
///
/// Returns `incoming` rewritten to apply after the whole sequence. A pair the
/// transform table does not cover is left as it was and reported.
pub fn rebase_through<'a>(
    incoming: Operation,
    ops: impl IntoIterator<Item = &'a mut Operation>,
) -> (Operation, Vec<TransformGap>) {
    let mut running = incoming;
    let mut gaps = Vec::new();
    for op in ops {
        match transform(&running, op) {
            Ok((next, rebased)) => {
                running = next;
                *op = rebased;
            }
            Err(gap) => gaps.push(gap),
        }
    }
    (running, gaps)
}

/// What to do after an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// The ID is not the edit in flight.
    NotAwaited,
    /// Queue is empty again; the client is synchronized.
    Drained,
    /// Send this edit next.
    SendNext(PendingEdit),
    /// The next edit's speculative state does not match the real counter.
    OutOfSync { expected: u64, found: u64 },
}

/// FIFO of unacknowledged local edits.
#[derive(Debug, Clone)]
pub struct EditBuffer {
    edits: VecDeque<PendingEdit>,
    /// No edit of ours is waiting for an acknowledgement.
    synchronized: bool,
}

impl Default for EditBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EditBuffer {
    pub fn new() -> Self {
        Self {
            edits: VecDeque::new(),
            synchronized: true,
        }
    }

    /// Queue an edit made against state `state`.
    ///
    /// Returns the edit when it should be sent right away; otherwise it is
    /// held with a speculative state number.
    pub fn enqueue(&mut self, state: u64, operation: Operation) -> Option<PendingEdit> {
        let mut edit = PendingEdit::new(state, operation);
        if self.synchronized {
            self.synchronized = false;
            self.edits.push_back(edit.clone());
            Some(edit)
        } else {
            edit.state += self.edits.len() as u64;
            self.edits.push_back(edit);
            None
        }
    }

    /// Handle the server's echo of an edit. `state` is the local counter
    /// after counting the acknowledged edit.
    pub fn acknowledge(&mut self, id: &str, state: u64) -> Ack {
        if self.awaiting() != Some(id) {
            return Ack::NotAwaited;
        }
        self.edits.pop_front();

        match self.edits.front() {
            None => {
                self.synchronized = true;
                Ack::Drained
            }
            Some(next) if next.state != state => {
                let found = next.state;
                // nothing is in flight: the next edit was never sent
                self.synchronized = true;
                Ack::OutOfSync {
                    expected: state,
                    found,
                }
            }
            Some(next) => Ack::SendNext(next.clone()),
        }
    }

    /// Transform an incoming server operation against every queued edit.
    ///
    /// Each queued edit is rewritten to apply after the server operation and
    /// its speculative state moves up by one. Returns the server operation
    /// rewritten to apply after all queued edits, plus any gaps hit on the
    /// way (the affected pair is left untransformed).
    pub fn rebase(&mut self, incoming: Operation) -> (Operation, Vec<TransformGap>) {
        let result = rebase_through(incoming, self.edits.iter_mut().map(|e| &mut e.operation));
        for edit in self.edits.iter_mut() {
            edit.state += 1;
        }
        result
    }

    /// The edit in flight, if any.
    pub fn in_flight(&self) -> Option<&PendingEdit> {
        if self.synchronized {
            None
        } else {
            self.edits.front()
        }
    }

    pub fn awaiting(&self) -> Option<&str> {
        self.in_flight().map(|edit| edit.id.as_str())
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEdit> {
        self.edits.iter()
    }

    /// Put an edit that was already sent back at the head of the queue, as
    /// the one awaiting its acknowledgement.
    pub fn restore_in_flight(&mut self, edit: PendingEdit) {
        self.synchronized = false;
        self.edits.push_front(edit);
    }

    /// Remove every edit and return to the synchronized state.
    pub fn take_all(&mut self) -> Vec<PendingEdit> {
        self.synchronized = true;
        self.edits.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.take_all();
    }
}
