//! Notification dispatch and the listener/caller mutual-exclusion guard.
//!
//! The Connector is the only synchronous actor on the wire; a background
//! notification listener (built by a higher layer, e.g. a LISTEN/NOTIFY
//! subscription manager) is the only other one. [`NotificationBlock`] is the
//! reentrant critical section that keeps the two from touching the
//! transport at the same time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::ThreadId;

use std_semaphore::Semaphore;

use crate::protocol::backend::{NoticeResponse, NotificationResponse};

/// Callback invoked for every NotificationResponse (and, optionally,
/// NoticeResponse) the Connector's dispatcher sees.
///
/// A handler that panics is isolated: the panic is caught and logged, never
/// propagated into the message pump. This resolves the source's
/// `NotificationBlock.Dispose` ambiguity (spec.md §9, Open Questions) in
/// favor of "the listener loop only ever dispatches side-effect messages,
/// and a misbehaving handler cannot take the connection down with it."
pub trait NotificationHandler: Send {
    fn on_notification(&mut self, notification: &NotificationResponse<'_>);

    fn on_notice(&mut self, notice: &NoticeResponse) {
        let _ = notice;
    }
}

impl<F: FnMut(&NotificationResponse<'_>) + Send> NotificationHandler for F {
    fn on_notification(&mut self, notification: &NotificationResponse<'_>) {
        self(notification);
    }
}

pub(crate) fn dispatch_notification(
    handler: &mut dyn NotificationHandler,
    notification: &NotificationResponse<'_>,
) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler.on_notification(notification))).is_err() {
        tracing::warn!("notification handler panicked; isolating and continuing");
    }
}

pub(crate) fn dispatch_notice(handler: &mut dyn NotificationHandler, notice: &NoticeResponse) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler.on_notice(notice))).is_err() {
        tracing::warn!("notice handler panicked; isolating and continuing");
    }
}

/// A reentrant critical section excluding a background notification
/// listener from the wire while a synchronous caller is mid-request (spec.md
/// §5). The cross-thread rendezvous is a counting semaphore, same as the
/// teacher's connection pool reaches for (`sync::pool::Pool`'s
/// `std_semaphore` use) — here gating wire access between two actors instead
/// of a pool's checked-out connection count. Reentrancy (a caller entering
/// the block again from inside a request it already holds the block for) is
/// layered on top with an owner-thread-id-plus-depth counter, since the
/// semaphore itself has no notion of which thread holds it.
pub struct NotificationBlock {
    gate: Semaphore,
    state: Mutex<BlockState>,
}

#[derive(Default)]
struct BlockState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl Default for NotificationBlock {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(1),
            state: Mutex::new(BlockState::default()),
        }
    }
}

impl NotificationBlock {
    /// Create a new, unheld block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the critical section, blocking until any other holder (the
    /// synchronous caller or the listener) has left, unless the current
    /// thread already holds it — in which case the call nests for free. The
    /// section is released automatically when the outermost guard for this
    /// thread drops.
    pub fn enter(&self) -> NotificationBlockGuard<'_> {
        let this_thread = std::thread::current().id();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.owner == Some(this_thread) {
            state.depth += 1;
            return NotificationBlockGuard { block: self };
        }
        drop(state);

        self.gate.acquire();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.owner = Some(this_thread);
        state.depth = 1;
        drop(state);

        NotificationBlockGuard { block: self }
    }
}

/// RAII guard for [`NotificationBlock::enter`].
pub struct NotificationBlockGuard<'a> {
    block: &'a NotificationBlock,
}

impl Drop for NotificationBlockGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.block.state.lock().unwrap_or_else(|e| e.into_inner());
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.block.gate.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn block_is_mutually_exclusive() {
        let block = Arc::new(NotificationBlock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let block = Arc::clone(&block);
                let counter = Arc::clone(&counter);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    let _guard = block.enter();
                    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_thread_can_reenter_without_deadlocking() {
        let block = NotificationBlock::new();
        let outer = block.enter();
        let inner = block.enter();
        drop(inner);
        drop(outer);

        // The block must be fully released now, not still held by a leftover
        // depth count, so a fresh entry from elsewhere doesn't hang.
        drop(block.enter());
    }

    #[test]
    fn panicking_handler_is_isolated() {
        struct Boom;
        impl NotificationHandler for Boom {
            fn on_notification(&mut self, _notification: &NotificationResponse<'_>) {
                panic!("boom");
            }
        }

        let mut handler = Boom;
        let notification = NotificationResponse {
            pid: 1,
            channel: "ch",
            payload: "",
        };
        // Must not propagate the panic out of dispatch.
        dispatch_notification(&mut handler, &notification);
    }
}
