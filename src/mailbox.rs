use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::common::Event;

#[derive(Debug, Default)]
struct Slot {
    event: Option<Event>,
    closed: bool,
}

/**
 * Single-slot, lossy event channel between input callbacks and the
 * dispatcher thread.
 *
 * At most one unconsumed event is ever held. A producer that finds the lock
 * busy or the slot full drops its event: encoder callbacks must never block,
 * and a queue would let stale detents pile up behind a slow dispatcher.
 */
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    slot: Mutex<Slot>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /**
     * Non-blocking. Returns true if the event was stored, false if it was
     * dropped (lock contended, slot full, or mailbox closed).
     */
    pub(crate) fn post(&self, event: Event) -> bool {
        let mut slot = match self.slot.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::WouldBlock) => return false,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        if slot.closed || slot.event.is_some() {
            return false;
        }

        slot.event = Some(event);
        self.not_empty.notify_one();
        true
    }

    /**
     * Blocking post for worker threads. Waits until the slot is empty.
     * Returns false only if the mailbox was closed first.
     * Never call this from an input callback.
     */
    pub(crate) fn post_blocking(&self, event: Event) -> bool {
        let mut slot = self._lock();
        while slot.event.is_some() && !slot.closed {
            slot = self
                .not_full
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if slot.closed {
            return false;
        }

        slot.event = Some(event);
        self.not_empty.notify_one();
        true
    }

    /**
     * Blocks until an event is available. Returns None once the mailbox is
     * closed and drained.
     */
    pub(crate) fn take(&self) -> Option<Event> {
        let mut slot = self._lock();
        while slot.event.is_none() && !slot.closed {
            slot = self
                .not_empty
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let event = slot.event.take();
        if event.is_some() {
            self.not_full.notify_one();
        }
        event
    }

    /**
     * Wakes the dispatcher and any blocked worker. Pending events are still
     * handed out by take(); new ones are refused.
     */
    pub(crate) fn close(&self) {
        let mut slot = self._lock();
        slot.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self._lock().closed
    }

    fn _lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn peek(&self) -> Option<Event> {
        self._lock().event
    }
}
