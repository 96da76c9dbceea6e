//! Fiber headers, identifiers and handles

use crate::context::{Context, EntryFn};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{Handle, Shared};
use crate::stack::Stack;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier of one fiber incarnation
///
/// A recycled fiber header gets a fresh id, so a handle to a fiber that
/// has exited never observes its successor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    pub(crate) fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        FiberId(raw)
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Built but never queued
    Created = 0,
    /// Sitting on a run queue
    Queued = 1,
    /// Executing on a scheduler
    Running = 2,
    /// Off every run queue and not running (parked in a primitive)
    Suspended = 3,
    /// Entry procedure returned (or panicked)
    Exited = 4,
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Incarnation id in the high bits, state in the low byte
fn pack_status(id: FiberId, state: FiberState) -> u64 {
    (id.0 << STATE_BITS) | state as u64
}

fn unpack_status(raw: u64) -> (FiberId, FiberState) {
    (
        FiberId(raw >> STATE_BITS),
        FiberState::from_u8((raw & STATE_MASK) as u8),
    )
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FiberState::Created,
            1 => FiberState::Queued,
            2 => FiberState::Running,
            3 => FiberState::Suspended,
            _ => FiberState::Exited,
        }
    }
}

pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Fiber header
///
/// Headers live in the runtime's fiber pool for the whole life of the
/// runtime; only their stacks come and go.
pub(crate) struct Fiber {
    context: Context,
    /// Id and state, updated together so a transition can be tied to one
    /// incarnation
    status: AtomicU64,
    stack: UnsafeCell<Option<Stack>>,
    entry: UnsafeCell<Option<Entry>>,
    name: Mutex<Option<String>>,
    /// Runtime this fiber belongs to
    shared: *const Shared,
    root: bool,
}

// Stack and entry are only touched by the thread that owns the fiber at
// that moment (spawner, the scheduler running it, or the reclaimer).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// A header with no stack, waiting to be prepared
    pub(crate) fn new(shared: *const Shared) -> Self {
        Self {
            context: Context::new(),
            status: AtomicU64::new(pack_status(FiberId(0), FiberState::Exited)),
            stack: UnsafeCell::new(None),
            entry: UnsafeCell::new(None),
            name: Mutex::new(None),
            shared,
            root: false,
        }
    }

    /// The fiber standing for a scheduler thread's own stack
    pub(crate) fn root(shared: *const Shared) -> Self {
        Self {
            status: AtomicU64::new(pack_status(FiberId::next(), FiberState::Running)),
            root: true,
            ..Self::new(shared)
        }
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    fn status(&self) -> (FiberId, FiberState) {
        unpack_status(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn id(&self) -> FiberId {
        self.status().0
    }

    pub(crate) fn state(&self) -> FiberState {
        self.status().1
    }

    /// Whether incarnation `id` is still this header's and has not exited
    pub(crate) fn is_live(&self, id: FiberId) -> bool {
        let (current, state) = self.status();
        current == id && state != FiberState::Exited
    }

    /// Set the state of the current incarnation. Only the thread running
    /// the fiber (or about to) calls this.
    pub(crate) fn set_state(&self, state: FiberState) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some((raw & !STATE_MASK) | state as u64)
            });
    }

    /// Move incarnation `id` to `to` if its state passes `from`
    fn transition(&self, id: FiberId, to: FiberState, from: impl Fn(FiberState) -> bool) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let (current, state) = unpack_status(raw);
                (current == id && from(state)).then_some(pack_status(id, to))
            })
            .is_ok()
    }

    /// Running -> Suspended, unless someone already queued the fiber
    pub(crate) fn mark_suspended(&self) {
        let id = self.id();
        self.transition(id, FiberState::Suspended, |state| state == FiberState::Running);
    }

    /// Marks incarnation `id` queued after a wakeup. Returns `false` when
    /// it is already queued, has exited, was never started, or the header
    /// belongs to another incarnation by now; the caller must not push an
    /// entry then.
    pub(crate) fn mark_woken(&self, id: FiberId) -> bool {
        self.transition(id, FiberState::Queued, |state| {
            matches!(state, FiberState::Running | FiberState::Suspended)
        })
    }

    /// As [`mark_woken`](Fiber::mark_woken), but also starts a fiber that
    /// was created without being queued.
    pub(crate) fn mark_queued(&self, id: FiberId) -> bool {
        self.transition(id, FiberState::Queued, |state| {
            matches!(
                state,
                FiberState::Created | FiberState::Running | FiberState::Suspended
            )
        })
    }

    pub(crate) fn is_root(&self) -> bool {
        self.root
    }

    pub(crate) fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub(crate) fn shared(&self) -> &Shared {
        unsafe { &*self.shared }
    }

    /// Map a stack unless the header still owns one.
    ///
    /// # Safety
    /// The caller must own the fiber exclusively.
    pub(crate) unsafe fn ensure_stack(&self, size: usize) -> RuntimeResult<()> {
        let slot = unsafe { &mut *self.stack.get() };
        if slot.is_none() {
            *slot = Some(Stack::new(size)?);
        }
        Ok(())
    }

    /// Unmap the stack.
    ///
    /// # Safety
    /// The fiber must have exited and be owned exclusively by the caller.
    pub(crate) unsafe fn release_stack(&self) {
        unsafe { *self.stack.get() = None };
        *self.name.lock() = None;
    }

    pub(crate) fn has_stack(&self) -> bool {
        unsafe { (*self.stack.get()).is_some() }
    }

    /// Give the fiber a new identity and prime it to run `entry`.
    ///
    /// # Safety
    /// The caller must own the fiber exclusively and it must have a stack.
    pub(crate) unsafe fn prepare(
        &self,
        entry: Entry,
        name: Option<String>,
        main: EntryFn,
    ) -> FiberId {
        let id = FiberId::next();
        unsafe { *self.entry.get() = Some(entry) };
        *self.name.lock() = name;
        self.status
            .store(pack_status(id, FiberState::Created), Ordering::Release);

        let top = unsafe { (*self.stack.get()).as_ref() }.map_or(0, Stack::top);
        debug_assert_ne!(top, 0, "prepared fiber without a stack");
        unsafe {
            self.context
                .prime(top, main, self as *const Fiber as usize)
        };
        id
    }

    /// Take the entry procedure.
    ///
    /// # Safety
    /// Only the fiber itself may call this, once per incarnation.
    pub(crate) unsafe fn take_entry(&self) -> Option<Entry> {
        unsafe { (*self.entry.get()).take() }
    }
}

/// Copyable pointer to a fiber header
///
/// Valid as long as the runtime that owns the header is alive.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct FiberRef(NonNull<Fiber>);

unsafe impl Send for FiberRef {}
unsafe impl Sync for FiberRef {}

impl FiberRef {
    pub(crate) fn new(fiber: &Fiber) -> Self {
        FiberRef(NonNull::from(fiber))
    }

    /// # Safety
    /// `raw` must be the address of a live fiber header.
    pub(crate) unsafe fn from_raw(raw: usize) -> Self {
        FiberRef(unsafe { NonNull::new_unchecked(raw as *mut Fiber) })
    }

    /// Entry for the fiber's current incarnation
    pub(crate) fn runnable(self) -> Runnable {
        Runnable::new(self, self.id())
    }
}

impl Deref for FiberRef {
    type Target = Fiber;

    fn deref(&self) -> &Fiber {
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FiberRef").field(&self.id()).finish()
    }
}

/// Queue entry: a fiber header plus the incarnation it was queued for
///
/// Run queues, injector and wait lists hold these. An entry whose
/// incarnation has exited, or whose header was reused since, is dropped
/// without running anything.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Runnable {
    fiber: FiberRef,
    id: FiberId,
}

impl Runnable {
    pub(crate) fn new(fiber: FiberRef, id: FiberId) -> Self {
        Self { fiber, id }
    }

    pub(crate) fn fiber(self) -> FiberRef {
        self.fiber
    }

    pub(crate) fn id(self) -> FiberId {
        self.id
    }

    pub(crate) fn is_live(self) -> bool {
        self.fiber.is_live(self.id)
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Runnable").field(&self.id).finish()
    }
}

/// Handle to a spawned fiber
///
/// Keeps the owning runtime's shared state alive. Operations on a handle
/// whose fiber has exited fail with [`RuntimeError::StaleHandle`].
#[derive(Clone)]
pub struct FiberHandle {
    fiber: FiberRef,
    id: FiberId,
    shared: Arc<Shared>,
}

impl FiberHandle {
    pub(crate) fn new(fiber: FiberRef, id: FiberId, shared: Arc<Shared>) -> Self {
        Self { fiber, id, shared }
    }

    /// Identifier of the fiber this handle was created for
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Debug name, if the fiber is still alive and has one
    pub fn name(&self) -> Option<String> {
        self.live().ok().and_then(|fiber| fiber.name())
    }

    /// Current state; `Exited` once the fiber is gone
    pub fn state(&self) -> FiberState {
        match self.live() {
            Ok(fiber) => fiber.state(),
            Err(_) => FiberState::Exited,
        }
    }

    /// Whether the fiber has exited
    pub fn is_finished(&self) -> bool {
        self.state() == FiberState::Exited
    }

    /// The header, if it still belongs to this incarnation
    pub(crate) fn live(&self) -> RuntimeResult<FiberRef> {
        self.runnable().map(Runnable::fiber)
    }

    /// Queue entry for this incarnation, unless it has exited
    pub(crate) fn runnable(&self) -> RuntimeResult<Runnable> {
        let entry = Runnable::new(self.fiber, self.id);
        if !entry.is_live() {
            return Err(RuntimeError::StaleHandle(self.id));
        }
        Ok(entry)
    }

    /// Handle to the runtime the fiber belongs to
    pub fn runtime(&self) -> Handle {
        Handle::new(self.shared.clone())
    }
}

impl PartialEq for FiberHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FiberHandle {}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
