//! Extension callback lists, invoked by the collector at fixed phases.
//! Registration is idempotent; deregistration is O(n).

use crate::mark::Marker;
use crate::value::{BigVal, Value};

/// Root scanners run at the start of marking and queue extra roots through
/// the marker's `mark_queue_obj`/`mark_queue_objarray` hooks.
pub type RootScannerCb = fn(marker: &mut Marker, full: bool);
pub type TaskScannerCb = fn(marker: &mut Marker, task: *mut Value, is_root_task: bool);
pub type PreGcCb = fn(full: bool);
pub type PostGcCb = fn(full: bool);
pub type NotifyExternalAllocCb = fn(hdr: *mut BigVal, size: usize);
pub type NotifyExternalFreeCb = fn(hdr: *mut BigVal);

pub struct Callbacks {
    pub root_scanner: CallbackList<RootScannerCb>,
    pub task_scanner: CallbackList<TaskScannerCb>,
    pub pre_gc: CallbackList<PreGcCb>,
    pub post_gc: CallbackList<PostGcCb>,
    pub notify_external_alloc: CallbackList<NotifyExternalAllocCb>,
    pub notify_external_free: CallbackList<NotifyExternalFreeCb>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self {
            root_scanner: CallbackList::new(),
            task_scanner: CallbackList::new(),
            pre_gc: CallbackList::new(),
            post_gc: CallbackList::new(),
            notify_external_alloc: CallbackList::new(),
            notify_external_free: CallbackList::new(),
        }
    }
}

pub struct CallbackList<F: PartialEq + Copy> {
    list: Vec<F>,
}

impl<F: PartialEq + Copy> CallbackList<F> {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn register(&mut self, cb: F) {
        if !self.list.contains(&cb) {
            self.list.push(cb);
        }
    }

    pub fn deregister(&mut self, cb: F) {
        self.list.retain(|f| *f != cb);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub fn invoke(&self, mut call: impl FnMut(F)) {
        for cb in self.list.iter() {
            call(*cb);
        }
    }
}
