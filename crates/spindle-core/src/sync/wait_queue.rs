//! Lock-free FIFO of waiting fibers (Michael and Scott)
//!
//! The queue always holds a dummy node, so an empty queue and a queue with
//! one element need no special cases. Every link is a tagged pointer: a
//! 48-bit address and a 16-bit counter in one `AtomicU64`, incremented on
//! each successful CAS so a recycled node cannot satisfy a stale compare.
//!
//! Nodes are type-stable. A dequeued node goes to a per-queue free list and
//! is only deallocated when the queue is dropped, so a thread still holding
//! a pointer to it after losing a race reads valid memory.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, Ordering};

const ADDR_BITS: u32 = 48;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

struct Node<T> {
    next: AtomicU64,
    /// Link in the free list; unrelated to `next`
    free_next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

#[inline]
fn pack<T>(node: *mut Node<T>, tag: u16) -> u64 {
    let addr = node as u64;
    debug_assert_eq!(addr & !ADDR_MASK, 0, "pointer does not fit in 48 bits");
    ((tag as u64) << ADDR_BITS) | (addr & ADDR_MASK)
}

#[inline]
fn node_of<T>(raw: u64) -> *mut Node<T> {
    (raw & ADDR_MASK) as *mut Node<T>
}

#[inline]
fn tag_of(raw: u64) -> u16 {
    (raw >> ADDR_BITS) as u16
}

/// Lock-free multi-producer multi-consumer FIFO
pub struct WaitQueue<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    /// Treiber stack of recycled nodes (tagged head)
    free: CachePadded<AtomicU64>,
    _marker: PhantomData<*mut Node<T>>,
}

unsafe impl<T: Send> Send for WaitQueue<T> {}
unsafe impl<T: Send> Sync for WaitQueue<T> {}

impl<T: Copy + Send> WaitQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        let dummy = Box::into_raw(Box::new(Node {
            next: AtomicU64::new(0),
            free_next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::<T>::uninit()),
        }));
        WaitQueue {
            head: CachePadded::new(AtomicU64::new(pack(dummy, 0))),
            tail: CachePadded::new(AtomicU64::new(pack(dummy, 0))),
            free: CachePadded::new(AtomicU64::new(0)),
            _marker: PhantomData,
        }
    }

    /// Append `value` at the tail
    pub fn enqueue(&self, value: T) {
        let node = self.alloc(value);

        let tail = loop {
            let tail = self.tail.load(Ordering::Acquire);
            let tail_node = node_of::<T>(tail);
            let next = unsafe { (*tail_node).next.load(Ordering::Acquire) };

            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            if node_of::<T>(next).is_null() {
                let link = pack(node, tag_of(next).wrapping_add(1));
                if unsafe {
                    (*tail_node)
                        .next
                        .compare_exchange(next, link, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                } {
                    break tail;
                }
            } else {
                // tail is lagging; help it along
                self.advance_tail(tail, node_of(next));
            }
        };

        self.advance_tail(tail, node);
    }

    /// Remove and return the value at the head
    pub fn dequeue(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let head_node = node_of::<T>(head);
            let next = unsafe { (*head_node).next.load(Ordering::Acquire) };

            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            let next_node = node_of::<T>(next);
            if head_node == node_of(tail) {
                if next_node.is_null() {
                    return None;
                }
                self.advance_tail(tail, next_node);
                continue;
            }

            let value = unsafe { ptr::read_volatile((*next_node).value.get()) };
            let new_head = pack(next_node, tag_of(head).wrapping_add(1));
            if self
                .head
                .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // next_node is the new dummy; the old dummy is ours.
                self.release(head_node);
                return Some(unsafe { value.assume_init() });
            }
        }
    }

    /// Return the value at the head without removing it
    pub fn head(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let head_node = node_of::<T>(head);
            let next = unsafe { (*head_node).next.load(Ordering::Acquire) };

            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            let next_node = node_of::<T>(next);
            if head_node == node_of(tail) {
                if next_node.is_null() {
                    return None;
                }
                self.advance_tail(tail, next_node);
                continue;
            }

            let value = unsafe { ptr::read_volatile((*next_node).value.get()) };
            // The read is only valid if the head did not move meanwhile.
            fence(Ordering::Acquire);
            if head == self.head.load(Ordering::Relaxed) {
                return Some(unsafe { value.assume_init() });
            }
        }
    }

    /// Whether the queue currently has no elements
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let next = unsafe { (*node_of::<T>(head)).next.load(Ordering::Acquire) };
        node_of::<T>(next).is_null()
    }

    fn advance_tail(&self, tail: u64, to: *mut Node<T>) {
        let _ = self.tail.compare_exchange(
            tail,
            pack(to, tag_of(tail).wrapping_add(1)),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn alloc(&self, value: T) -> *mut Node<T> {
        match self.pop_free() {
            Some(node) => unsafe {
                (*node).value.get().write(MaybeUninit::new(value));
                let old = (*node).next.load(Ordering::Relaxed);
                (*node)
                    .next
                    .store(pack::<T>(ptr::null_mut(), tag_of(old).wrapping_add(1)), Ordering::Relaxed);
                node
            },
            None => Box::into_raw(Box::new(Node {
                next: AtomicU64::new(0),
                free_next: AtomicPtr::new(ptr::null_mut()),
                value: UnsafeCell::new(MaybeUninit::new(value)),
            })),
        }
    }

    fn release(&self, node: *mut Node<T>) {
        loop {
            let top = self.free.load(Ordering::Acquire);
            unsafe { (*node).free_next.store(node_of(top), Ordering::Relaxed) };
            let new_top = pack(node, tag_of(top).wrapping_add(1));
            if self
                .free
                .compare_exchange(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop_free(&self) -> Option<*mut Node<T>> {
        loop {
            let top = self.free.load(Ordering::Acquire);
            let node = node_of::<T>(top);
            if node.is_null() {
                return None;
            }
            let next = unsafe { (*node).free_next.load(Ordering::Relaxed) };
            let new_top = pack(next, tag_of(top).wrapping_add(1));
            if self
                .free
                .compare_exchange(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(node);
            }
        }
    }
}

impl<T: Copy + Send> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for WaitQueue<T> {
    fn drop(&mut self) {
        // Every node is either linked from head (dummy included) or on the free list.
        let mut node = node_of::<T>(*self.head.get_mut());
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = node_of(boxed.next.load(Ordering::Relaxed));
        }

        let mut node = node_of::<T>(*self.free.get_mut());
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.free_next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = WaitQueue::new();
        assert!(queue.is_empty());
        for i in 0..5u32 {
            queue.enqueue(i);
        }
        assert!(!queue.is_empty());
        for i in 0..5u32 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_head_does_not_remove() {
        let queue = WaitQueue::new();
        assert_eq!(queue.head(), None);
        queue.enqueue(10u64);
        queue.enqueue(20u64);
        assert_eq!(queue.head(), Some(10));
        assert_eq!(queue.head(), Some(10));
        assert_eq!(queue.dequeue(), Some(10));
        assert_eq!(queue.head(), Some(20));
    }

    #[test]
    fn test_nodes_are_recycled() {
        let queue = WaitQueue::new();
        queue.enqueue(1u32);
        assert_eq!(queue.dequeue(), Some(1));
        // the old dummy now sits on the free list
        let recycled = node_of::<u32>(queue.free.load(Ordering::Relaxed));
        assert!(!recycled.is_null());

        queue.enqueue(2u32);
        assert!(node_of::<u32>(queue.free.load(Ordering::Relaxed)).is_null());
        assert_eq!(queue.dequeue(), Some(2));
    }

    #[test]
    fn test_tagged_pointer_packing() {
        let node = 0x7fff_1234_5678usize as *mut Node<u8>;
        let raw = pack(node, 0xabcd);
        assert_eq!(node_of::<u8>(raw), node);
        assert_eq!(tag_of(raw), 0xabcd);
    }
}
