//! # Dispatch Jobs
//!
//! Lock-free multi-producer, single-consumer list of contexts with
//! pending work. Submitters push without blocking; the dispatch worker
//! takes the whole list at once and walks it oldest first.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::context::Context;

struct JobNode {
    context: Arc<Context>,
    next: *mut JobNode,
}

/// Intrusive stack of jobs, drained and reversed by the single consumer
pub(crate) struct JobList {
    head: AtomicPtr<JobNode>,
}

// SAFETY: nodes are only reachable through `head`; ownership moves into the
// list on push and out of it on take_all, so no node is shared.
unsafe impl Send for JobList {}
unsafe impl Sync for JobList {}

impl JobList {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish a job for `context`
    pub(crate) fn push(&self, context: Arc<Context>) {
        let node = Box::into_raw(Box::new(JobNode {
            context,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` was just allocated and is not yet visible to
            // any other thread.
            unsafe { (*node).next = head };

            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Take every published job, oldest first
    pub(crate) fn take_all(&self) -> Vec<Arc<Context>> {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut out = Vec::new();

        while !node.is_null() {
            // SAFETY: the swap above detached the chain, so this thread owns
            // every node in it and each was created by Box::into_raw.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            out.push(boxed.context);
        }

        out.reverse();
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Drop for JobList {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}
