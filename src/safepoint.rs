//! The stop-the-world rendezvous.
//!
//! Several mutators can trip their allocation budget in the same instant,
//! so entering a collection is a race for the single `gc_running` slot:
//! the compare-and-swap winner becomes the collector thread, the losers
//! spin in [`GlobalSafepoint::wait_gc`] and return to managed code once
//! the winner's cycle has finished on their behalf. With a single attached
//! mutator there is nobody to race and the slot is taken with a plain
//! store.
//!
//! Stopping the world is the second half: the winner walks the mutator
//! list and waits for each `gc_state` word to leave `Running`. Mutators
//! publish their state with release stores, so the acquire loads here make
//! every store a mutator issued before parking visible to the collector.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::mutator::Mutator;

pub struct GlobalSafepoint {
    /// The collection slot; nonzero while a collection is in flight.
    gc_running: AtomicU32,
    /// Mutators currently attached to the collector.
    n_mutators: AtomicU32,
}

impl GlobalSafepoint {
    pub(crate) fn new() -> Self {
        Self {
            gc_running: AtomicU32::new(0),
            n_mutators: AtomicU32::new(0),
        }
    }

    pub(crate) fn mutator_attached(&self) {
        self.n_mutators.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mutator_detached(&self) {
        self.n_mutators.fetch_sub(1, Ordering::Relaxed);
    }

    /// Try to claim the collection slot. A loser only returns (false)
    /// after the winner's collection has completed, so its caller can
    /// simply resume allocating.
    pub fn start_gc(&self) -> bool {
        if self.n_mutators.load(Ordering::Relaxed) == 1 {
            self.gc_running.store(1, Ordering::Relaxed);
            return true;
        }
        if self
            .gc_running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.wait_gc();
            return false;
        }
        true
    }

    /// Release the slot. The release store publishes the collector's
    /// writes to every mutator spinning in `wait_gc`.
    pub fn end_gc(&self) {
        self.gc_running.store(0, Ordering::Release);
    }

    /// Whether a mutator should park at its next poll.
    #[inline(always)]
    pub fn gc_requested(&self) -> bool {
        self.gc_running.load(Ordering::Relaxed) != 0
    }

    /// Spin until the in-flight collection finishes.
    #[inline]
    pub fn wait_gc(&self) {
        while self.gc_running.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
    }

    /// Spin until every mutator on the list has acknowledged the stop.
    /// The relaxed load keeps the hot spin cheap; the acquire re-check
    /// establishes the ordering edge once the state looks parked.
    ///
    /// # Safety
    /// `mutators` must point at live mutators and the caller must hold the
    /// collection slot, so no new thread can start running mid-walk.
    pub(crate) unsafe fn wait_for_the_world(&self, mutators: &[*mut Mutator]) {
        debug_assert!(self.gc_requested());
        for &m in mutators {
            while !(*m).state.load(Ordering::Relaxed).parked_ok()
                || !(*m).state.load(Ordering::Acquire).parked_ok()
            {
                std::hint::spin_loop();
            }
        }
    }
}
