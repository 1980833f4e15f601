//! Per-flow deferred packet processing
//!
//! Each flow's events are strictly serialized: whoever finds the flow free
//! processes inline, and anything arriving while the flow is held is queued
//! on a backlog that the holder drains when releasing. Suspension is never a
//! blocking wait; an item is either processed now or queued for the current
//! owner to process before it lets go.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A per-flow mailbox implementing the owner-drains-on-release discipline
///
/// `dispatch` either processes an item immediately (when the flow is free)
/// or enqueues it for the current owner. Items are processed in arrival
/// order; two items of one flow are never processed concurrently.
#[derive(Debug)]
pub struct FlowMailbox<T> {
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    owned: bool,
    backlog: VecDeque<T>,
}

impl<T> Default for FlowMailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlowMailbox<T> {
    /// Create an unowned, empty mailbox
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                owned: false,
                backlog: VecDeque::new(),
            }),
        }
    }

    /// Deliver `item`, processing it through `process` now if the flow is
    /// free and queueing it otherwise
    ///
    /// When processing inline, the backlog accumulated meanwhile is drained
    /// through the same closure before the flow is released.
    pub fn dispatch(&self, item: T, mut process: impl FnMut(T)) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.owned {
                inner.backlog.push_back(item);
                return;
            }
            inner.owned = true;
        }
        process(item);
        self.release(process);
    }

    /// Take exclusive ownership of the flow without an item to process
    ///
    /// Returns false if someone else holds it. A successful acquire must be
    /// paired with [`FlowMailbox::release`].
    pub fn acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.owned {
            return false;
        }
        inner.owned = true;
        true
    }

    /// Queue `item` unconditionally for the current or next owner
    pub fn defer(&self, item: T) {
        self.inner.lock().unwrap().backlog.push_back(item);
    }

    /// Release ownership, draining the backlog through `process` in arrival
    /// order first
    ///
    /// Items queued while draining are drained too; the flow only becomes
    /// free once the backlog is observed empty.
    pub fn release(&self, mut process: impl FnMut(T)) {
        loop {
            let item = {
                let mut inner = self.inner.lock().unwrap();
                match inner.backlog.pop_front() {
                    Some(item) => item,
                    None => {
                        inner.owned = false;
                        return;
                    }
                }
            };
            process(item);
        }
    }

    /// Number of items waiting for the owner
    pub fn backlog_len(&self) -> usize {
        self.inner.lock().unwrap().backlog.len()
    }
}
