//! A linked list that can only be prepended to or iterated over.
//! `prepend()` takes `&self` and may be called from multiple threads at once,
//! which lets graph construction register out-edges without exclusive access.

use std::{
    marker::PhantomData,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, Ordering},
};

pub struct ConcurrentList<T> {
    head: AtomicPtr<ListNode<T>>,
}

struct ListNode<T> {
    val: T,
    next: *mut ListNode<T>,
}

impl<T> ConcurrentList<T> {
    pub fn new() -> Self {
        ConcurrentList {
            head: AtomicPtr::new(null_mut()),
        }
    }

    pub fn prepend(&self, val: T) {
        let new_head = Box::into_raw(Box::new(ListNode {
            val,
            next: null_mut(),
        }));
        loop {
            let old_head = self.head.load(Ordering::SeqCst);
            // Safety: new_head is owned by us until the exchange succeeds.
            unsafe {
                (*new_head).next = old_head;
            }
            if self
                .head
                .compare_exchange_weak(old_head, new_head, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Iterates newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        ListIter {
            cur: self.head.load(Ordering::Relaxed),
            lifetime: PhantomData,
        }
    }
}

impl<T> Default for ConcurrentList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ConcurrentList<T> {
    fn drop(&mut self) {
        let mut cur = self.head.swap(null_mut(), Ordering::Relaxed);
        while !cur.is_null() {
            // Safety: re-box the node so its allocation is released.
            let boxed = unsafe { Box::from_raw(cur) };
            cur = boxed.next;
        }
    }
}

struct ListIter<'a, T> {
    cur: *const ListNode<T>,
    lifetime: PhantomData<&'a ()>,
}

impl<'a, T: 'a> Iterator for ListIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        // Safety: nodes are never freed while the list is borrowed.
        unsafe {
            let result = &(*self.cur).val;
            self.cur = (*self.cur).next;
            Some(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_and_iter() {
        let list = ConcurrentList::new();
        list.prepend(1);
        list.prepend(2);
        list.prepend(3);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn concurrent_prepend() {
        let list = ConcurrentList::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let list = &list;
                s.spawn(move || {
                    for i in 0..100 {
                        list.prepend(t * 100 + i);
                    }
                });
            }
        });
        let mut vals: Vec<i32> = list.iter().copied().collect();
        vals.sort_unstable();
        assert_eq!(vals.len(), 400);
        assert_eq!(vals, (0..400).collect::<Vec<_>>());
    }
}
