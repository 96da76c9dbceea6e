//! Channels between fibers
//!
//! Two flavors share one type:
//!
//! - **Rendezvous** (`Channel::rendezvous()` or capacity 0): `send` returns
//!   only once a receiver has taken the value. Senders and receivers each
//!   line up on a fair [`Lock`]; the two fibers at the front meet on a
//!   single exchange slot.
//! - **Buffered** (`Channel::buffered(capacity, asynchronous)`): a ring of
//!   `capacity` values under a fiber [`Mutex`] with condition variables.
//!   `send` waits only while the ring is full; a synchronous channel also
//!   makes the sender wait until its value has been received.
//!
//! Closing is `Open -> Closing -> Closed`. A rendezvous channel is closed at
//! once; a buffered one stays `Closing` until the values already accepted
//! are drained. Sends fail as soon as closing starts. Every fiber blocked on
//! the channel is woken by `close` and fails instead of hanging.

use crate::error::{fatal, ChannelError, LockError, SendError};
use crate::scheduler::{current_fiber, park, wake, Runnable};
use crate::sync::{Condvar, Lock, Mutex, MutexGuard, SpinLock};
use crossbeam::utils::Backoff;
use std::collections::VecDeque;
use std::fmt;

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting values
    Open,
    /// Close requested; buffered values are still being received
    Closing,
    /// Closed and drained
    Closed,
}

/// Channel carrying values of type `T` between fibers
///
/// Share it through an `Arc`. Blocking operations must run inside a fiber.
pub struct Channel<T> {
    flavor: Flavor<T>,
}

enum Flavor<T> {
    Rendezvous(Rendezvous<T>),
    Buffered(Buffered<T>),
}

impl<T: Send> Channel<T> {
    /// Channel without a buffer: every send waits for its receiver
    pub fn rendezvous() -> Self {
        Self {
            flavor: Flavor::Rendezvous(Rendezvous::new()),
        }
    }

    /// Channel buffering up to `capacity` values.
    ///
    /// With `asynchronous` false a send also waits until its value has been
    /// received. A capacity of 0 gives a rendezvous channel.
    pub fn buffered(capacity: usize, asynchronous: bool) -> Self {
        if capacity == 0 {
            return Self::rendezvous();
        }
        Self {
            flavor: Flavor::Buffered(Buffered::new(capacity, asynchronous)),
        }
    }

    /// Send a value, suspending while the channel cannot take it.
    ///
    /// On failure the value is handed back inside the error.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        match &self.flavor {
            Flavor::Rendezvous(chan) => chan.send(value),
            Flavor::Buffered(chan) => chan.send(value),
        }
    }

    /// Receive a value, suspending until one is available.
    ///
    /// Fails with [`ChannelError::Closed`] once the channel is closed and
    /// drained.
    pub fn receive(&self) -> Result<T, ChannelError> {
        match &self.flavor {
            Flavor::Rendezvous(chan) => chan.receive(),
            Flavor::Buffered(chan) => chan.receive(),
        }
    }

    /// Close the channel and wake every blocked sender and receiver.
    ///
    /// Idempotent; callable from any thread.
    pub fn close(&self) {
        match &self.flavor {
            Flavor::Rendezvous(chan) => chan.close(),
            Flavor::Buffered(chan) => chan.close(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        match &self.flavor {
            Flavor::Rendezvous(chan) => chan.state(),
            Flavor::Buffered(chan) => chan.state(),
        }
    }

    /// Whether the channel no longer accepts values
    pub fn is_closed(&self) -> bool {
        self.state() != ChannelState::Open
    }

    /// Buffer capacity; 0 for a rendezvous channel
    pub fn capacity(&self) -> usize {
        match &self.flavor {
            Flavor::Rendezvous(_) => 0,
            Flavor::Buffered(chan) => chan.capacity,
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (flavor, capacity) = match &self.flavor {
            Flavor::Rendezvous(_) => ("rendezvous", 0),
            Flavor::Buffered(chan) => ("buffered", chan.capacity),
        };
        f.debug_struct("Channel")
            .field("flavor", &flavor)
            .field("capacity", &capacity)
            .finish_non_exhaustive()
    }
}

/// Turn at the front of one direction of a rendezvous channel
struct Turn<'a> {
    lock: &'a Lock,
}

impl<'a> Turn<'a> {
    fn take(lock: &'a Lock) -> Result<Self, ChannelError> {
        match lock.lock() {
            Ok(()) => Ok(Self { lock }),
            Err(LockError::Runtime(err)) => Err(ChannelError::Runtime(err)),
            // A fiber holds at most one turn per direction.
            Err(err) => fatal("channel turn", &err),
        }
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            tracing::error!(error = %err, "failed to release channel turn");
        }
    }
}

/// Exchange slot shared by the sender and receiver at the front
struct Slot<T> {
    value: Option<T>,
    /// Set by the receiver that took `value`
    taken: bool,
    sender: Option<Runnable>,
    receiver: Option<Runnable>,
    closed: bool,
}

struct Rendezvous<T> {
    senders: Lock,
    receivers: Lock,
    slot: SpinLock<Slot<T>>,
}

impl<T: Send> Rendezvous<T> {
    fn new() -> Self {
        Self {
            senders: Lock::new(),
            receivers: Lock::new(),
            slot: SpinLock::new(Slot {
                value: None,
                taken: false,
                sender: None,
                receiver: None,
                closed: false,
            }),
        }
    }

    fn send(&self, value: T) -> Result<(), SendError<T>> {
        if self.slot.lock().closed {
            return Err(SendError::closed(value));
        }
        let me = match current_fiber() {
            Ok(fiber) => fiber,
            Err(err) => return Err(SendError { value, error: err.into() }),
        };
        let _turn = match Turn::take(&self.senders) {
            Ok(turn) => turn,
            Err(error) => return Err(SendError { value, error }),
        };

        let receiver = {
            let mut slot = self.slot.lock();
            if slot.closed {
                return Err(SendError::closed(value));
            }
            slot.value = Some(value);
            slot.taken = false;
            slot.sender = Some(me);
            slot.receiver.take()
        };
        if let Some(receiver) = receiver {
            wake(receiver);
        }

        loop {
            {
                let mut slot = self.slot.lock();
                if slot.taken {
                    slot.taken = false;
                    slot.sender = None;
                    return Ok(());
                }
                if slot.closed {
                    slot.sender = None;
                    return match slot.value.take() {
                        Some(value) => Err(SendError::closed(value)),
                        None => Ok(()),
                    };
                }
                slot.sender = Some(me);
            }
            if let Err(err) = park() {
                let mut slot = self.slot.lock();
                slot.sender = None;
                return match slot.value.take() {
                    Some(value) => Err(SendError { value, error: err.into() }),
                    None => Ok(()),
                };
            }
        }
    }

    fn receive(&self) -> Result<T, ChannelError> {
        let me = current_fiber()?;
        let _turn = Turn::take(&self.receivers)?;

        loop {
            {
                let mut slot = self.slot.lock();
                if let Some(value) = slot.value.take() {
                    slot.taken = true;
                    slot.receiver = None;
                    let sender = slot.sender.take();
                    drop(slot);
                    if let Some(sender) = sender {
                        wake(sender);
                    }
                    return Ok(value);
                }
                if slot.closed {
                    slot.receiver = None;
                    return Err(ChannelError::Closed);
                }
                slot.receiver = Some(me);
            }
            park()?;
        }
    }

    fn close(&self) {
        let (sender, receiver) = {
            let mut slot = self.slot.lock();
            if slot.closed {
                return;
            }
            slot.closed = true;
            (slot.sender.take(), slot.receiver.take())
        };
        tracing::debug!("rendezvous channel closed");

        // Fibers queued behind these two find the channel closed as soon as
        // their turn comes.
        for fiber in [sender, receiver].into_iter().flatten() {
            wake(fiber);
        }
    }

    fn state(&self) -> ChannelState {
        if self.slot.lock().closed {
            ChannelState::Closed
        } else {
            ChannelState::Open
        }
    }
}

struct BufState<T> {
    ring: VecDeque<T>,
    closing: bool,
    /// Values accepted so far; a sender's ticket is the count after its push
    sent: u64,
    /// Values taken by receivers so far
    received: u64,
}

struct Buffered<T> {
    capacity: usize,
    asynchronous: bool,
    state: Mutex<BufState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    /// Signalled on every receive of a synchronous channel
    consumed: Condvar,
}

impl<T: Send> Buffered<T> {
    fn new(capacity: usize, asynchronous: bool) -> Self {
        Self {
            capacity,
            asynchronous,
            state: Mutex::new(BufState {
                ring: VecDeque::with_capacity(capacity),
                closing: false,
                sent: 0,
                received: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            consumed: Condvar::new(),
        }
    }

    /// Take the state mutex. Fibers suspend; other threads spin, which is
    /// short since no fiber suspends while holding it.
    fn lock_state(&self) -> MutexGuard<'_, BufState<T>> {
        let backoff = Backoff::new();
        loop {
            if let Ok(guard) = self.state.lock() {
                return guard;
            }
            backoff.snooze();
        }
    }

    fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.lock_state();
        if state.closing {
            return Err(SendError::closed(value));
        }
        if let Err(err) = current_fiber() {
            return Err(SendError { value, error: err.into() });
        }

        loop {
            if state.closing {
                return Err(SendError::closed(value));
            }
            if state.ring.len() < self.capacity {
                break;
            }
            state = match self.not_full.wait(state) {
                Ok(state) => state,
                Err(err) => return Err(SendError { value, error: err.into() }),
            };
        }

        state.ring.push_back(value);
        state.sent += 1;
        let ticket = state.sent;
        self.not_empty.notify_one();

        if self.asynchronous {
            return Ok(());
        }

        // Accepted values are delivered even after close, so closing only
        // ends the wait.
        while state.received < ticket && !state.closing {
            state = match self.consumed.wait(state) {
                Ok(state) => state,
                Err(_) => break,
            };
        }
        Ok(())
    }

    fn receive(&self) -> Result<T, ChannelError> {
        current_fiber()?;

        let mut state = self.lock_state();
        loop {
            if let Some(value) = state.ring.pop_front() {
                state.received += 1;
                if state.closing && state.ring.is_empty() {
                    tracing::debug!(received = state.received, "buffered channel drained");
                }
                self.not_full.notify_one();
                if !self.asynchronous {
                    self.consumed.notify_all();
                }
                return Ok(value);
            }
            if state.closing {
                return Err(ChannelError::Closed);
            }
            state = self.not_empty.wait(state)?;
        }
    }

    fn close(&self) {
        let mut state = self.lock_state();
        if state.closing {
            return;
        }
        state.closing = true;
        tracing::debug!(
            capacity = self.capacity,
            buffered = state.ring.len(),
            "buffered channel closing"
        );

        let woken = self.not_empty.notify_all()
            + self.not_full.notify_all()
            + self.consumed.notify_all();
        drop(state);
        tracing::trace!(woken, "close woke blocked fibers");
    }

    fn state(&self) -> ChannelState {
        let state = self.lock_state();
        match (state.closing, state.ring.is_empty()) {
            (false, _) => ChannelState::Open,
            (true, false) => ChannelState::Closing,
            (true, true) => ChannelState::Closed,
        }
    }
}
