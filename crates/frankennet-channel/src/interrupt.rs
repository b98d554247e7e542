//! Cooperative thread interruption.
//!
//! A thread entering a blocking channel operation registers the channel as
//! its *blocker*. Interrupting that thread closes the blocker, which in turn
//! knocks the thread out of its syscall. A thread that is interrupted
//! outside a blocking region keeps a pending flag; the next `begin` closes
//! the channel immediately.
//!
//! Per-thread state lives in a process-wide table keyed by [`ThreadId`].
//! Only a thread itself creates its entry, and it removes the entry when it
//! exits. Interrupting a thread that has no entry (it never used this module,
//! or it has exited) only unparks it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread, ThreadId};

use parking_lot::Mutex;

/// Something a thread can be blocked on.
pub trait Interruptible: Send + Sync {
    /// Runs on the interrupting thread. `target` is the blocked thread.
    fn interrupt(&self, target: ThreadId);
}

#[derive(Default)]
struct ThreadSlot {
    interrupted: AtomicBool,
    blocker: Mutex<Option<Arc<dyn Interruptible>>>,
}

type SlotTable = Mutex<HashMap<ThreadId, Arc<ThreadSlot>>>;

static SLOTS: OnceLock<SlotTable> = OnceLock::new();

fn slots() -> &'static SlotTable {
    SLOTS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn slot_for(id: ThreadId) -> Arc<ThreadSlot> {
    Arc::clone(slots().lock().entry(id).or_default())
}

/// Removes the calling thread's slot when the thread exits.
struct SlotGuard {
    id: ThreadId,
    slot: Arc<ThreadSlot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(table) = SLOTS.get() {
            table.lock().remove(&self.id);
        }
    }
}

thread_local! {
    static CURRENT: SlotGuard = {
        let id = thread::current().id();
        SlotGuard { id, slot: slot_for(id) }
    };
}

fn current_slot() -> Arc<ThreadSlot> {
    // During thread-local teardown the entry is already gone; hand out a
    // detached slot rather than re-inserting one nobody will remove.
    CURRENT
        .try_with(|guard| Arc::clone(&guard.slot))
        .unwrap_or_default()
}

fn existing_slot(id: ThreadId) -> Option<Arc<ThreadSlot>> {
    slots().lock().get(&id).cloned()
}

/// Interrupt `thread`: set its flag and close whatever it is blocked on.
pub fn interrupt(thread: &Thread) {
    let slot = if thread.id() == thread::current().id() {
        Some(current_slot())
    } else {
        existing_slot(thread.id())
    };
    if let Some(slot) = slot {
        let blocker = slot.blocker.lock();
        slot.interrupted.store(true, Ordering::Release);
        if let Some(b) = blocker.as_ref() {
            b.interrupt(thread.id());
        }
    }
    thread.unpark();
}

/// Test and clear the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    current_slot().interrupted.swap(false, Ordering::AcqRel)
}

/// Read `thread`'s interrupt flag without clearing it.
#[must_use]
pub fn is_interrupted(thread: &Thread) -> bool {
    slots()
        .lock()
        .get(&thread.id())
        .is_some_and(|slot| slot.interrupted.load(Ordering::Acquire))
}

/// Enter a blocking region on `blocker`.
///
/// If the calling thread is already interrupted the blocker is closed
/// before this returns.
pub fn begin(blocker: Arc<dyn Interruptible>) -> BlockingRegion {
    let slot = current_slot();
    let pending = {
        let mut guard = slot.blocker.lock();
        *guard = Some(Arc::clone(&blocker));
        slot.interrupted.load(Ordering::Acquire)
    };
    if pending {
        blocker.interrupt(thread::current().id());
    }
    BlockingRegion { slot }
}

/// Active blocking region. Dropping it clears the thread's blocker.
#[must_use = "dropping the region ends it immediately"]
pub struct BlockingRegion {
    slot: Arc<ThreadSlot>,
}

impl Drop for BlockingRegion {
    fn drop(&mut self) {
        *self.slot.blocker.lock() = None;
    }
}
