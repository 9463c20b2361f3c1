//! Chase and Lev's work-stealing deque, with the fences from Le et al.'s
//! weak-memory-model treatment. The owning marker pushes and pops at the
//! bottom (LIFO), thieves take from the top (FIFO).
//!
//! * Chase D., Lev Y. Dynamic Circular Work-Stealing Deque
//! * Le N. M. et al. Correct and Efficient Work-Stealing for Weak Memory
//!   Models

use std::sync::atomic::{fence, AtomicI64, AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::value::Value;

struct WsArray {
    buffer: Box<[AtomicPtr<Value>]>,
}

impl WsArray {
    fn new(capacity: usize) -> Box<WsArray> {
        debug_assert!(capacity.is_power_of_two());
        Box::new(WsArray {
            buffer: (0..capacity).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
        })
    }

    #[inline(always)]
    fn capacity(&self) -> i64 {
        self.buffer.len() as i64
    }

    #[inline(always)]
    fn slot(&self, i: i64) -> &AtomicPtr<Value> {
        &self.buffer[(i & (self.capacity() - 1)) as usize]
    }
}

pub struct WsDeque {
    top: AtomicI64,
    bottom: AtomicI64,
    array: AtomicPtr<WsArray>,
    /// Arrays replaced by a grow. A thief may still be reading a stale
    /// array pointer, so retired buffers live until the deque dies.
    retired: Mutex<Vec<Box<WsArray>>>,
}

unsafe impl Send for WsDeque {}
unsafe impl Sync for WsDeque {}

impl WsDeque {
    pub const INIT_SIZE: usize = 1 << 10;

    pub fn new() -> Self {
        Self {
            top: AtomicI64::new(0),
            bottom: AtomicI64::new(0),
            array: AtomicPtr::new(Box::into_raw(WsArray::new(Self::INIT_SIZE))),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Owner only.
    pub fn push(&self, v: *mut Value) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut a = self.array.load(Ordering::Relaxed);
        unsafe {
            if b - t > (*a).capacity() - 1 {
                a = self.grow(t, b);
            }
            (*a).slot(b).store(v, Ordering::Relaxed);
        }
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Owner only. The double check on `top` resolves the race against a
    /// thief going for the same last element.
    pub fn pop(&self) -> Option<*mut Value> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let a = self.array.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);
        if t <= b {
            let v = unsafe { (*a).slot(b).load(Ordering::Relaxed) };
            if t == b {
                // single element left: race the thieves for it
                let won = self
                    .top
                    .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();
                self.bottom.store(b + 1, Ordering::Relaxed);
                if !won {
                    return None;
                }
            }
            Some(v)
        } else {
            // deque was empty, restore bottom
            self.bottom.store(b + 1, Ordering::Relaxed);
            None
        }
    }

    /// Any thread.
    pub fn steal(&self) -> Option<*mut Value> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t < b {
            let a = self.array.load(Ordering::Acquire);
            let v = unsafe { (*a).slot(t).load(Ordering::Relaxed) };
            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            Some(v)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        b <= t
    }

    /// Out of the hot path: double the buffer and publish the new array.
    /// Only the owner grows, so copying `t..b` cannot race a push.
    #[cold]
    fn grow(&self, t: i64, b: i64) -> *mut WsArray {
        let old = self.array.load(Ordering::Relaxed);
        unsafe {
            let new = Box::into_raw(WsArray::new(((*old).capacity() * 2) as usize));
            for i in t..b {
                (*new)
                    .slot(i)
                    .store((*old).slot(i).load(Ordering::Relaxed), Ordering::Relaxed);
            }
            self.array.store(new, Ordering::Release);
            self.retired.lock().push(Box::from_raw(old));
            new
        }
    }
}

impl Drop for WsDeque {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.array.load(Ordering::Relaxed)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fake(i: usize) -> *mut Value {
        ((i + 1) * 16) as *mut Value
    }

    #[test]
    fn lifo_owner_fifo_thief() {
        let q = WsDeque::new();
        q.push(fake(0));
        q.push(fake(1));
        q.push(fake(2));
        assert_eq!(q.steal(), Some(fake(0)));
        assert_eq!(q.pop(), Some(fake(2)));
        assert_eq!(q.pop(), Some(fake(1)));
        assert_eq!(q.pop(), None);
        assert_eq!(q.steal(), None);
    }

    #[test]
    fn grow_preserves_elements() {
        let q = WsDeque::new();
        let n = WsDeque::INIT_SIZE * 4;
        for i in 0..n {
            q.push(fake(i));
        }
        let mut seen = HashSet::new();
        while let Some(v) = q.pop() {
            assert!(seen.insert(v as usize));
        }
        assert_eq!(seen.len(), n);
    }

    #[test]
    fn push_pop_steal_exactly_once() {
        const N: usize = 1_000_000;
        let q = WsDeque::new();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let thief = scope.spawn(|| {
                let mut stolen = Vec::new();
                while !done.load(Ordering::Acquire) {
                    if let Some(v) = q.steal() {
                        stolen.push(v as usize);
                    }
                }
                while let Some(v) = q.steal() {
                    stolen.push(v as usize);
                }
                stolen
            });

            let mut popped = Vec::new();
            for i in 0..N {
                q.push(fake(i));
                if i % 3 == 0 {
                    if let Some(v) = q.pop() {
                        popped.push(v as usize);
                    }
                }
            }
            while let Some(v) = q.pop() {
                popped.push(v as usize);
            }
            done.store(true, Ordering::Release);

            let stolen = thief.join().unwrap();
            let mut all: Vec<usize> = popped;
            all.extend(stolen);
            assert_eq!(all.len(), N, "every element returned exactly once");
            let unique: HashSet<usize> = all.iter().copied().collect();
            assert_eq!(unique.len(), N, "no duplicates across pop and steal");
        });
    }
}
