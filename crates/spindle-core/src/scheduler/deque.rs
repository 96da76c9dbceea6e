//! Work-stealing deque (Arora, Blumofe and Plaxton)
//!
//! The owner pushes and pops at the bottom; any thread may steal from the
//! top. The top index shares one atomic word with a tag that changes on
//! every reset, so a thief holding a stale `{tag, top}` always loses its
//! compare-and-swap.
//!
//! Unlike the fixed reservation of the classic algorithm, the backing ring
//! grows when full. Superseded rings are retired, not freed, until the deque
//! itself is dropped, so a thief that loaded an old ring still reads valid
//! memory.

use crate::error::fatal;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Initial ring capacity
const MIN_CAPACITY: usize = 64;

/// Result of a steal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steal<T> {
    /// The deque was empty
    Empty,
    /// Lost a race with the owner or another thief
    Retry,
    /// Took the oldest item
    Success(T),
}

impl<T> Steal<T> {
    /// The stolen item, if any
    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(item) => Some(item),
            _ => None,
        }
    }
}

/// `{tag, top}` packed into one word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Age {
    tag: u32,
    top: u32,
}

impl Age {
    fn unpack(raw: u64) -> Self {
        Age {
            tag: (raw >> 32) as u32,
            top: raw as u32,
        }
    }

    fn pack(self) -> u64 {
        ((self.tag as u64) << 32) | self.top as u64
    }
}

struct Buffer<T> {
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T: Copy> Buffer<T> {
    fn new(capacity: usize) -> Box<Self> {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Box::new(Buffer {
            mask: capacity - 1,
            slots,
        })
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    unsafe fn write(&self, index: u32, item: T) {
        let slot = &self.slots[index as usize & self.mask];
        unsafe { slot.get().write(MaybeUninit::new(item)) };
    }

    /// Volatile read; the result is only meaningful once the caller's
    /// CAS on `age` confirms the slot was live.
    unsafe fn read(&self, index: u32) -> MaybeUninit<T> {
        let slot = &self.slots[index as usize & self.mask];
        unsafe { std::ptr::read_volatile(slot.get()) }
    }
}

struct Inner<T> {
    age: CachePadded<AtomicU64>,
    bottom: CachePadded<AtomicU32>,
    buffer: AtomicPtr<Buffer<T>>,
    /// Rings replaced by a grow; freed with the deque
    retired: Mutex<Vec<Box<Buffer<T>>>>,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let buffer = *self.buffer.get_mut();
        // Items are Copy; only the ring itself is released.
        drop(unsafe { Box::from_raw(buffer) });
    }
}

/// Owner end of a deque
pub struct Worker<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

/// Thief end of a deque
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Stealer {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Copy + Send> Worker<T> {
    /// Create an empty deque
    pub fn new() -> Self {
        let buffer = Box::into_raw(Buffer::new(MIN_CAPACITY));
        Worker {
            inner: Arc::new(Inner {
                age: CachePadded::new(AtomicU64::new(0)),
                bottom: CachePadded::new(AtomicU32::new(0)),
                buffer: AtomicPtr::new(buffer),
                retired: Mutex::new(Vec::new()),
            }),
            _not_sync: PhantomData,
        }
    }

    /// Create a thief handle
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Push an item at the bottom (owner only)
    pub fn push_bottom(&self, item: T) {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed);
        let top = Age::unpack(inner.age.load(Ordering::Acquire)).top;

        if bottom == u32::MAX {
            fatal("work-stealing deque", &"index space exhausted without draining");
        }

        let mut buffer = inner.buffer.load(Ordering::Relaxed);
        let live = bottom.wrapping_sub(top) as usize;
        if live >= unsafe { (*buffer).capacity() } {
            buffer = self.grow(buffer, top, bottom);
        }

        unsafe { (*buffer).write(bottom, item) };
        inner.bottom.store(bottom + 1, Ordering::Release);
    }

    /// Pop the most recently pushed item (owner only)
    pub fn pop_bottom(&self) -> Option<T> {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed);
        if bottom == 0 {
            return None;
        }

        let bottom = bottom - 1;
        inner.bottom.store(bottom, Ordering::SeqCst);

        let buffer = inner.buffer.load(Ordering::Relaxed);
        let item = unsafe { (*buffer).read(bottom) };
        let old = Age::unpack(inner.age.load(Ordering::SeqCst));
        if bottom > old.top {
            return Some(unsafe { item.assume_init() });
        }

        // At most one item left: reset the indices and race the thieves for it.
        inner.bottom.store(0, Ordering::SeqCst);
        let new = Age {
            tag: old.tag.wrapping_add(1),
            top: 0,
        };
        if bottom == old.top
            && inner
                .age
                .compare_exchange(old.pack(), new.pack(), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
        {
            return Some(unsafe { item.assume_init() });
        }

        inner.age.store(new.pack(), Ordering::SeqCst);
        None
    }

    /// Approximate number of queued items
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the deque looks empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current ring capacity
    pub fn capacity(&self) -> usize {
        unsafe { (*self.inner.buffer.load(Ordering::Relaxed)).capacity() }
    }

    #[cold]
    fn grow(&self, old: *mut Buffer<T>, top: u32, bottom: u32) -> *mut Buffer<T> {
        let old_ref = unsafe { &*old };
        let new = Buffer::new(old_ref.capacity() * 2);
        let mut index = top;
        while index != bottom {
            unsafe { new.write(index, old_ref.read(index).assume_init()) };
            index = index.wrapping_add(1);
        }

        let new = Box::into_raw(new);
        self.inner.buffer.store(new, Ordering::Release);
        self.inner.retired.lock().push(unsafe { Box::from_raw(old) });
        tracing::trace!(capacity = unsafe { (*new).capacity() }, "deque grown");
        new
    }
}

impl<T: Copy + Send> Default for Worker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Send> Stealer<T> {
    /// Try once to take the oldest item
    pub fn pop_top(&self) -> Steal<T> {
        let inner = &*self.inner;
        let old = Age::unpack(inner.age.load(Ordering::SeqCst));
        let bottom = inner.bottom.load(Ordering::SeqCst);
        if bottom <= old.top {
            return Steal::Empty;
        }

        let buffer = inner.buffer.load(Ordering::Acquire);
        let item = unsafe { (*buffer).read(old.top) };
        let new = Age {
            tag: old.tag,
            top: old.top + 1,
        };
        match inner
            .age
            .compare_exchange(old.pack(), new.pack(), Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => Steal::Success(unsafe { item.assume_init() }),
            Err(_) => Steal::Retry,
        }
    }

    /// Approximate number of queued items
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the deque looks empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Inner<T> {
    fn len(&self) -> usize {
        let top = Age::unpack(self.age.load(Ordering::Acquire)).top;
        let bottom = self.bottom.load(Ordering::Acquire);
        bottom.saturating_sub(top) as usize
    }
}
