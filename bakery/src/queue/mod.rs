//! Fixed-capacity circular queue of fixed-size records laid out in a caller
//! provided memory region (normally a shared memory segment).
//!
//! The queue does no locking of its own. Every process that mutates it must
//! hold the queue guard (see [`crate::guard`]) for the whole operation.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::core::ShmemCast;

mod shared;
pub use shared::SharedQueue;

const QUEUE_MAGIC: u32 = 0x4271_5545; // "BqUE"

#[derive(Debug, Clone, PartialEq)]
pub enum QueueError {
    Full,
    Empty,
    IndexOutOfRange { index: usize, len: usize },
    NotFound,
    Allocation(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => write!(f, "queue is full"),
            QueueError::Empty => write!(f, "queue is empty"),
            QueueError::IndexOutOfRange { index, len } => {
                write!(f, "index {} out of range for queue of length {}", index, len)
            }
            QueueError::NotFound => write!(f, "no matching element"),
            QueueError::Allocation(s) => write!(f, "cannot place queue: {}", s),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Default, Copy, Clone, Debug)]
#[repr(C)]
struct Header {
    magic: u32,
    capacity: u32,
    element_size: u32,
    head: u32,
    count: u32,
}

pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Bytes needed to hold a queue of `capacity` elements of `element_size` bytes,
/// or `None` when the queue cannot be described by its header or addressed.
pub const fn size_for(element_size: usize, capacity: usize) -> Option<usize> {
    if capacity > u32::MAX as usize || element_size > u32::MAX as usize {
        return None;
    }
    match capacity.checked_mul(element_size) {
        Some(slots) => slots.checked_add(HEADER_SIZE),
        None => None,
    }
}

pub struct BoundedQueue<'a, T: ShmemCast> {
    base: NonNull<u8>,
    capacity: usize,
    _marker: PhantomData<(&'a mut [u8], T)>,
}

impl<'a, T: ShmemCast> BoundedQueue<'a, T> {
    pub const fn required_size(capacity: usize) -> Option<usize> {
        size_for(mem::size_of::<T>(), capacity)
    }

    /// Places a queue on `region`. A region that already carries a queue of
    /// the same geometry is attached as is; anything else is initialised empty.
    pub fn attach(region: &'a mut [u8], capacity: usize) -> Result<Self, QueueError> {
        unsafe { Self::attach_raw(region.as_mut_ptr(), region.len(), capacity) }
    }

    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for `'a`, and
    /// every other user of the region must serialise access with this one.
    pub unsafe fn attach_raw(ptr: *mut u8, len: usize, capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::Allocation("capacity must be positive".to_string()));
        }
        let needed = Self::required_size(capacity).ok_or_else(|| {
            QueueError::Allocation(format!("capacity {} is too large", capacity))
        })?;
        if len < needed {
            return Err(QueueError::Allocation(format!(
                "region has {} bytes, {} required",
                len, needed
            )));
        }
        let base = NonNull::new(ptr)
            .ok_or_else(|| QueueError::Allocation("null region".to_string()))?;
        let queue = BoundedQueue { base, capacity, _marker: PhantomData };

        let header = queue.header();
        if header.magic == QUEUE_MAGIC {
            if header.capacity as usize != capacity || header.element_size as usize != mem::size_of::<T>() {
                return Err(QueueError::Allocation(format!(
                    "region holds a queue of {} x {} bytes",
                    header.capacity, header.element_size
                )));
            }
        } else {
            queue.store_header(Header {
                magic: QUEUE_MAGIC,
                capacity: capacity as u32,
                element_size: mem::size_of::<T>() as u32,
                head: 0,
                count: 0,
            });
        }
        Ok(queue)
    }

    #[inline]
    fn header(&self) -> Header {
        unsafe { ptr::read_unaligned(self.base.as_ptr() as *const Header) }
    }

    #[inline]
    fn store_header(&self, header: Header) {
        unsafe { ptr::write_unaligned(self.base.as_ptr() as *mut Header, header) }
    }

    #[inline]
    fn slot_ptr(&self, physical: usize) -> *mut T {
        debug_assert!(physical < self.capacity);
        unsafe { self.base.as_ptr().add(HEADER_SIZE + physical * mem::size_of::<T>()) as *mut T }
    }

    #[inline]
    fn physical(&self, head: u32, logical: usize) -> usize {
        (head as usize + logical) % self.capacity
    }

    #[inline]
    fn read_slot(&self, physical: usize) -> T {
        unsafe { ptr::read_unaligned(self.slot_ptr(physical)) }
    }

    #[inline]
    fn write_slot(&mut self, physical: usize, value: T) {
        unsafe { ptr::write_unaligned(self.slot_ptr(physical), value) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.header().count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header().count == 0
    }

    pub fn is_full(&self) -> bool {
        self.header().count as usize == self.capacity
    }

    pub fn enqueue(&mut self, value: T) -> Result<(), QueueError> {
        let mut header = self.header();
        if header.count as usize == self.capacity {
            return Err(QueueError::Full);
        }
        let tail = self.physical(header.head, header.count as usize);
        self.write_slot(tail, value);
        header.count += 1;
        self.store_header(header);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Result<T, QueueError> {
        let mut header = self.header();
        if header.count == 0 {
            return Err(QueueError::Empty);
        }
        let value = self.read_slot(header.head as usize);
        header.head = ((header.head as usize + 1) % self.capacity) as u32;
        header.count -= 1;
        self.store_header(header);
        Ok(value)
    }

    pub fn front(&self) -> Result<T, QueueError> {
        let header = self.header();
        if header.count == 0 {
            return Err(QueueError::Empty);
        }
        Ok(self.read_slot(header.head as usize))
    }

    /// Element at logical position `index`, 0 being the head.
    pub fn get(&self, index: usize) -> Result<T, QueueError> {
        let header = self.header();
        let len = header.count as usize;
        if index >= len {
            return Err(QueueError::IndexOutOfRange { index, len });
        }
        Ok(self.read_slot(self.physical(header.head, index)))
    }

    pub fn set(&mut self, index: usize, value: T) -> Result<(), QueueError> {
        let header = self.header();
        let len = header.count as usize;
        if index >= len {
            return Err(QueueError::IndexOutOfRange { index, len });
        }
        let physical = self.physical(header.head, index);
        self.write_slot(physical, value);
        Ok(())
    }

    /// Removes logical position `index`, closing the gap from whichever end is
    /// nearer. Surviving elements keep their relative order.
    pub fn remove_at(&mut self, index: usize) -> Result<T, QueueError> {
        let mut header = self.header();
        let len = header.count as usize;
        if index >= len {
            return Err(QueueError::IndexOutOfRange { index, len });
        }
        let removed = self.read_slot(self.physical(header.head, index));
        if index < len / 2 {
            // Shift the head side one step towards the tail.
            for k in (0..index).rev() {
                let v = self.read_slot(self.physical(header.head, k));
                let dst = self.physical(header.head, k + 1);
                self.write_slot(dst, v);
            }
            header.head = ((header.head as usize + 1) % self.capacity) as u32;
        } else {
            for k in index..len - 1 {
                let v = self.read_slot(self.physical(header.head, k + 1));
                let dst = self.physical(header.head, k);
                self.write_slot(dst, v);
            }
        }
        header.count -= 1;
        self.store_header(header);
        Ok(removed)
    }

    pub fn position<F>(&self, mut pred: F) -> Option<usize>
        where F: FnMut(&T) -> bool,
    {
        let header = self.header();
        (0..header.count as usize).find(|&i| pred(&self.read_slot(self.physical(header.head, i))))
    }

    /// Removes the first element (from the head) for which `pred` holds.
    pub fn remove_matching<F>(&mut self, pred: F) -> Result<T, QueueError>
        where F: FnMut(&T) -> bool,
    {
        match self.position(pred) {
            Some(index) => self.remove_at(index),
            None => Err(QueueError::NotFound),
        }
    }

    /// Logical clear. Element bytes are left as they are.
    pub fn clear(&mut self) {
        let mut header = self.header();
        header.head = 0;
        header.count = 0;
        self.store_header(header);
    }

    pub fn iter(&self) -> Iter<'_, 'a, T> {
        Iter { queue: self, next: 0, len: self.len() }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

pub struct Iter<'q, 'a, T: ShmemCast> {
    queue: &'q BoundedQueue<'a, T>,
    next: usize,
    len: usize,
}

impl<'q, 'a, T: ShmemCast> Iterator for Iter<'q, 'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.next >= self.len {
            return None;
        }
        let item = self.queue.get(self.next).ok();
        self.next += 1;
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(capacity: usize) -> Vec<u8> {
        vec![0u8; BoundedQueue::<u32>::required_size(capacity).unwrap()]
    }

    fn filled<'a>(buf: &'a mut Vec<u8>, capacity: usize, values: &[u32]) -> BoundedQueue<'a, u32> {
        let mut q = BoundedQueue::attach(buf, capacity).unwrap();
        for v in values {
            q.enqueue(*v).unwrap();
        }
        q
    }

    #[test]
    fn size_for_counts_header_and_slots() {
        assert_eq!(size_for(8, 4), Some(HEADER_SIZE + 32));
        assert_eq!(BoundedQueue::<u64>::required_size(3), Some(HEADER_SIZE + 24));
    }

    #[test]
    fn oversized_capacity_is_an_allocation_error() {
        assert_eq!(size_for(4, usize::MAX / 4 + 1), None);
        assert_eq!(size_for(1, u32::MAX as usize + 1), None);
        let mut buf = vec![0u8; 64];
        for capacity in [usize::MAX / 4 + 1, usize::MAX, u32::MAX as usize + 1] {
            assert!(matches!(BoundedQueue::<u32>::attach(&mut buf, capacity), Err(QueueError::Allocation(_))));
        }
        // Nothing was written over the rejected region.
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn attach_rejects_small_region_and_zero_capacity() {
        let mut small = vec![0u8; HEADER_SIZE + 3];
        assert!(matches!(BoundedQueue::<u32>::attach(&mut small, 1), Err(QueueError::Allocation(_))));
        let mut buf = region(2);
        assert!(matches!(BoundedQueue::<u32>::attach(&mut buf, 0), Err(QueueError::Allocation(_))));
    }

    #[test]
    fn reattach_keeps_contents() {
        let mut buf = region(4);
        {
            let mut q = filled(&mut buf, 4, &[1, 2, 3]);
            q.dequeue().unwrap();
        }
        let q = BoundedQueue::<u32>::attach(&mut buf, 4).unwrap();
        assert_eq!(q.to_vec(), vec![2, 3]);
    }

    #[test]
    fn reattach_with_other_geometry_fails() {
        let mut buf = region(4);
        filled(&mut buf, 4, &[1]);
        assert!(matches!(BoundedQueue::<u32>::attach(&mut buf, 3), Err(QueueError::Allocation(_))));
    }

    #[test]
    fn fifo_order() {
        let mut buf = region(5);
        let mut q = filled(&mut buf, 5, &[10, 20, 30, 40]);
        assert_eq!(q.front(), Ok(10));
        assert_eq!(q.dequeue(), Ok(10));
        assert_eq!(q.dequeue(), Ok(20));
        assert_eq!(q.dequeue(), Ok(30));
        assert_eq!(q.dequeue(), Ok(40));
        assert_eq!(q.dequeue(), Err(QueueError::Empty));
        assert_eq!(q.front(), Err(QueueError::Empty));
    }

    #[test]
    fn full_queue_rejects_without_mutation() {
        let mut buf = region(3);
        let mut q = filled(&mut buf, 3, &[1, 2, 3]);
        assert!(q.is_full());
        assert_eq!(q.enqueue(4), Err(QueueError::Full));
        assert_eq!(q.len(), 3);
        assert_eq!(q.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn count_stays_in_bounds_across_wraparound() {
        let mut buf = region(3);
        let mut q = BoundedQueue::<u32>::attach(&mut buf, 3).unwrap();
        let mut expected = std::collections::VecDeque::new();
        for round in 0..20u32 {
            match round % 4 {
                0 | 1 => {
                    let r = q.enqueue(round);
                    if expected.len() < 3 {
                        assert!(r.is_ok());
                        expected.push_back(round);
                    } else {
                        assert_eq!(r, Err(QueueError::Full));
                    }
                }
                2 => {
                    let r = q.dequeue().ok();
                    assert_eq!(r, expected.pop_front());
                }
                _ => {
                    if !expected.is_empty() {
                        let last = expected.len() - 1;
                        assert_eq!(q.remove_at(last).ok(), expected.pop_back());
                    }
                }
            }
            assert!(q.len() <= q.capacity());
            assert_eq!(q.to_vec(), expected.iter().copied().collect::<Vec<_>>());
        }
    }

    #[test]
    fn remove_at_preserves_order() {
        // A..E
        let mut buf = region(5);
        let mut q = filled(&mut buf, 5, &[0xA, 0xB, 0xC, 0xD, 0xE]);
        assert_eq!(q.remove_at(2), Ok(0xC));
        assert_eq!(q.to_vec(), vec![0xA, 0xB, 0xD, 0xE]);
        assert_eq!(q.remove_at(0), Ok(0xA));
        assert_eq!(q.to_vec(), vec![0xB, 0xD, 0xE]);
        let last = q.len() - 1;
        assert_eq!(q.remove_at(last), Ok(0xE));
        assert_eq!(q.to_vec(), vec![0xB, 0xD]);
        assert_eq!(q.remove_at(2), Err(QueueError::IndexOutOfRange { index: 2, len: 2 }));
    }

    #[test]
    fn remove_at_across_the_wrap_point() {
        let mut buf = region(4);
        let mut q = filled(&mut buf, 4, &[1, 2, 3]);
        q.dequeue().unwrap();
        q.dequeue().unwrap();
        q.enqueue(4).unwrap();
        q.enqueue(5).unwrap();
        q.enqueue(6).unwrap();
        // physical layout now wraps: [5, 6, 3, 4] with head at 2
        assert_eq!(q.to_vec(), vec![3, 4, 5, 6]);
        assert_eq!(q.remove_at(1), Ok(4));
        assert_eq!(q.to_vec(), vec![3, 5, 6]);
        assert_eq!(q.remove_at(1), Ok(5));
        assert_eq!(q.to_vec(), vec![3, 6]);
        q.enqueue(7).unwrap();
        q.enqueue(8).unwrap();
        assert_eq!(q.to_vec(), vec![3, 6, 7, 8]);
    }

    #[test]
    fn remove_matching_and_not_found() {
        let mut buf = region(4);
        let mut q = filled(&mut buf, 4, &[7, 8, 9]);
        assert_eq!(q.remove_matching(|v| *v == 8), Ok(8));
        assert_eq!(q.to_vec(), vec![7, 9]);
        assert_eq!(q.remove_matching(|v| *v == 8), Err(QueueError::NotFound));
        assert_eq!(q.position(|v| *v == 9), Some(1));
    }

    #[test]
    fn clear_and_set() {
        let mut buf = region(3);
        let mut q = filled(&mut buf, 3, &[1, 2]);
        q.set(1, 20).unwrap();
        assert_eq!(q.get(1), Ok(20));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
        q.enqueue(5).unwrap();
        assert_eq!(q.front(), Ok(5));
    }
}
