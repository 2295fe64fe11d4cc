//! Two-tier send scheduling.
//!
//! Exactly one packet is on the wire at a time. Waiting senders queue in one
//! of two FIFO queues; the control queue is always drained before the data
//! queue. A waiter that is cancelled leaves its queue and wakes the others so
//! the next sender is not stalled behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{MuxError, Result};

/// How often a cancellable waiter re-checks its token.
pub(crate) const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Queue a sender waits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendPriority {
    /// Control channel packets.
    Control,
    /// Data channel packets.
    Data,
}

/// Cooperative cancellation for blocking waits.
///
/// Clones share one flag. A [`CancelToken::child`] is cancelled with its
/// parent but can also be cancelled on its own.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also reports cancellation of `self`.
    pub fn child(&self) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Cancel every wait observing this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`CancelToken::cancel`] was called on this token or a parent.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

#[derive(Default)]
struct SchedulerState {
    control: VecDeque<u64>,
    data: VecDeque<u64>,
    next_ticket: u64,
    busy: bool,
    closed: bool,
}

impl SchedulerState {
    fn queue(&mut self, priority: SendPriority) -> &mut VecDeque<u64> {
        match priority {
            SendPriority::Control => &mut self.control,
            SendPriority::Data => &mut self.data,
        }
    }

    fn is_next(&self, ticket: u64) -> bool {
        match self.control.front() {
            Some(&head) => head == ticket,
            None => self.data.front() == Some(&ticket),
        }
    }

    fn withdraw(&mut self, priority: SendPriority, ticket: u64) {
        self.queue(priority).retain(|&t| t != ticket);
    }
}

/// Grants the single send slot in priority order.
#[derive(Default)]
pub struct SendScheduler {
    state: Mutex<SchedulerState>,
    turn: Condvar,
}

/// Exclusive right to write one packet; released on drop.
pub struct SendSlot<'a> {
    scheduler: &'a SendScheduler,
}

impl Drop for SendSlot<'_> {
    fn drop(&mut self) {
        self.scheduler.state.lock().busy = false;
        self.scheduler.turn.notify_all();
    }
}

impl SendScheduler {
    /// Create an open scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the send slot.
    ///
    /// Fails with [`MuxError::Interrupted`] if `cancel` fires while waiting
    /// and with [`MuxError::MultiplexerClosed`] once the scheduler is closed.
    pub fn acquire(&self, priority: SendPriority, cancel: Option<&CancelToken>) -> Result<SendSlot<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MuxError::MultiplexerClosed);
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue(priority).push_back(ticket);

        loop {
            if state.closed {
                state.withdraw(priority, ticket);
                return Err(MuxError::MultiplexerClosed);
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                state.withdraw(priority, ticket);
                drop(state);
                self.turn.notify_all();
                return Err(MuxError::Interrupted);
            }
            if !state.busy && state.is_next(ticket) {
                state.queue(priority).pop_front();
                state.busy = true;
                return Ok(SendSlot { scheduler: self });
            }
            match cancel {
                Some(_) => {
                    self.turn.wait_for(&mut state, CANCEL_POLL_INTERVAL);
                }
                None => self.turn.wait(&mut state),
            }
        }
    }

    /// Fail all current and future waiters.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.turn.notify_all();
    }

    /// Whether [`SendScheduler::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of waiters per queue: `(control, data)`.
    pub fn queued(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.control.len(), state.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_control_drains_before_data_fifo_within_queue() {
        let scheduler = Arc::new(SendScheduler::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let slot = scheduler.acquire(SendPriority::Data, None).expect("slot");

        let mut handles = Vec::new();
        let waiters = [
            ("d1", SendPriority::Data),
            ("d2", SendPriority::Data),
            ("c1", SendPriority::Control),
            ("c2", SendPriority::Control),
        ];
        for (index, (name, priority)) in waiters.into_iter().enumerate() {
            let worker = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _slot = worker.acquire(priority, None).expect("slot");
                order.lock().push(name);
            }));
            // Enqueue strictly one after another.
            wait_until(|| {
                let (c, d) = scheduler.queued();
                c + d == index + 1
            });
        }

        drop(slot);
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(*order.lock(), vec!["c1", "c2", "d1", "d2"]);
    }

    #[test]
    fn test_cancelled_waiter_does_not_block_successor() {
        let scheduler = Arc::new(SendScheduler::new());
        let slot = scheduler.acquire(SendPriority::Control, None).expect("slot");

        let token = CancelToken::new();
        let cancelled = {
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            thread::spawn(move || scheduler.acquire(SendPriority::Data, Some(&token)).map(|_| ()))
        };
        wait_until(|| scheduler.queued() == (0, 1));

        let successor = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.acquire(SendPriority::Data, None).map(|_| ()))
        };
        wait_until(|| scheduler.queued() == (0, 2));

        token.cancel();
        let result = cancelled.join().expect("join");
        assert!(matches!(result, Err(MuxError::Interrupted)));
        assert_eq!(scheduler.queued(), (0, 1));

        drop(slot);
        successor.join().expect("join").expect("successor gets the slot");
    }

    #[test]
    fn test_child_token_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
        assert!(sibling.clone().is_cancelled());
    }

    #[test]
    fn test_close_fails_waiters() {
        let scheduler = Arc::new(SendScheduler::new());
        let slot = scheduler.acquire(SendPriority::Data, None).expect("slot");
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.acquire(SendPriority::Control, None).map(|_| ()))
        };
        wait_until(|| scheduler.queued() == (1, 0));

        scheduler.close();
        assert!(matches!(waiter.join().expect("join"), Err(MuxError::MultiplexerClosed)));
        drop(slot);
        assert!(scheduler.is_closed());
        assert!(matches!(
            scheduler.acquire(SendPriority::Data, None),
            Err(MuxError::MultiplexerClosed)
        ));
    }
}
