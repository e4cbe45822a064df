//! A lock free freelist of small indices.
//!
//! This is a Treiber stack, with the head tagged by a version counter to prevent ABA races.
//! The head is packed into a `u32`: bits `[15:0]` hold the index, bits `[31:16]` the version.

use alloc::{boxed::Box, vec::Vec};

use portable_atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

use crate::error::{TxRxError, TxRxResult};

const FREELIST_EMPTY: u16 = u16::MAX;

pub(crate) struct IndexFreeList {
    head: AtomicU32,
    next: Box<[AtomicU16]>,
    count: AtomicUsize,
}
impl IndexFreeList {
    /// The largest number of entries, that can be represented.
    pub const MAX_ENTRIES: usize = FREELIST_EMPTY as usize;

    /// Create a freelist with all of `0..size` free.
    pub fn new(size: usize) -> TxRxResult<Self> {
        if size > Self::MAX_ENTRIES {
            return Err(TxRxError::OutOfMemory);
        }
        let mut next = Vec::new();
        next.try_reserve_exact(size)
            .map_err(|_| TxRxError::OutOfMemory)?;
        next.extend((0..size).map(|i| {
            AtomicU16::new(if i + 1 < size {
                (i + 1) as u16
            } else {
                FREELIST_EMPTY
            })
        }));
        Ok(Self {
            head: AtomicU32::new(if size == 0 { FREELIST_EMPTY as u32 } else { 0 }),
            next: next.into_boxed_slice(),
            count: AtomicUsize::new(size),
        })
    }
    pub fn alloc(&self) -> Option<u16> {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let idx = (old & 0xffff) as u16;
            if idx == FREELIST_EMPTY {
                return None;
            }
            let ver = old >> 16;
            let next_idx = self.next[idx as usize].load(Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | next_idx as u32;
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.count.fetch_sub(1, Ordering::Relaxed);
                return Some(idx);
            }
            core::hint::spin_loop();
        }
    }
    /// Return an index. It must have been allocated from this list.
    pub fn release(&self, idx: u16) {
        debug_assert!((idx as usize) < self.next.len());
        loop {
            let old = self.head.load(Ordering::Acquire);
            let ver = old >> 16;
            self.next[idx as usize].store((old & 0xffff) as u16, Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | idx as u32;
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            core::hint::spin_loop();
        }
    }
    /// Number of free indices. This is racy under concurrent access.
    pub fn available(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
    pub fn capacity(&self) -> usize {
        self.next.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread, vec::Vec};

    use super::IndexFreeList;

    #[test]
    fn exhaust_and_refill() {
        let list = IndexFreeList::new(3).unwrap();
        let taken: Vec<u16> = (0..3).map(|_| list.alloc().unwrap()).collect();
        assert_eq!(list.alloc(), None);
        assert_eq!(list.available(), 0);
        for idx in taken {
            list.release(idx);
        }
        assert_eq!(list.available(), 3);
    }

    #[test]
    fn empty_list() {
        let list = IndexFreeList::new(0).unwrap();
        assert_eq!(list.alloc(), None);
    }

    #[test]
    fn concurrent_alloc_is_unique() {
        let list = Arc::new(IndexFreeList::new(64).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let list = list.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    for _ in 0..1000 {
                        if let Some(idx) = list.alloc() {
                            taken.push(idx);
                        }
                        if taken.len() > 8 {
                            list.release(taken.remove(0));
                        }
                    }
                    taken
                })
            })
            .collect();
        let mut held = HashSet::new();
        for handle in handles {
            for idx in handle.join().unwrap() {
                assert!(held.insert(idx));
            }
        }
        assert_eq!(list.available() + held.len(), 64);
    }
}
