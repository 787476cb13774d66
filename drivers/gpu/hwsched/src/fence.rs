//! # Hardware Fences
//!
//! Bookkeeping for fences that firmware signals directly. Each context
//! keeps its outstanding entries in timestamp order under the context
//! lock; a device-wide counter tracks how many are pending in total.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use arrayvec::ArrayVec;

use crate::config::PENDING_FENCE_LOG_LIMIT;
use crate::context::{Context, ContextId, ContextQueue};
use crate::error::Result;
use crate::scheduler::{Hwsched, SchedFlags};
use crate::timestamp::timestamp_reached;

/// An outstanding hardware fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwFenceEntry {
    /// Context the fence belongs to
    pub context: ContextId,
    /// Timestamp that signals the fence
    pub timestamp: u32,
}

impl Hwsched {
    /// Enable hardware fences
    pub fn register_hw_fence(&self) {
        if !self.flags.test_and_set(SchedFlags::HW_FENCE) {
            log::info!("hw fences enabled");
        }
    }

    /// Disable hardware fences, dropping any that are still pending
    pub fn deregister_hw_fence(&self) {
        if !self.flags.test_and_clear(SchedFlags::HW_FENCE) {
            return;
        }

        self.log_remove_pending_hw_fences();
        log::info!("hw fences disabled");
    }

    /// Whether hardware fences are enabled
    pub fn hw_fence_enabled(&self) -> bool {
        self.flags.contains(SchedFlags::HW_FENCE)
    }

    /// Hardware fences pending across all contexts
    pub fn hw_fence_pending(&self) -> u32 {
        self.hw_fence_pending.load(Ordering::Acquire)
    }

    /// Back a software fence on `context` at `timestamp` with a hardware one
    ///
    /// Does nothing when hardware fences are disabled or the context is
    /// going away.
    pub fn create_hw_fence(&self, context: &Arc<Context>, timestamp: u32) -> Result<()> {
        if !self.hw_fence_enabled() || context.is_bad() {
            return Ok(());
        }

        let mut queue = context.queue.lock();
        self.fw.create_hw_fence(context.id(), timestamp)?;

        queue.hw_fences.push(HwFenceEntry {
            context: context.id(),
            timestamp,
        });
        self.hw_fence_pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop entries firmware has signaled up to `signaled`
    ///
    /// Entries are in timestamp order, so the scan stops at the first one
    /// still outstanding.
    pub fn retire_hw_fences(&self, context: &Context, signaled: u32) -> usize {
        if !self.hw_fence_enabled() {
            return 0;
        }

        let mut queue = context.queue.lock();
        let done = queue
            .hw_fences
            .iter()
            .take_while(|entry| timestamp_reached(entry.timestamp, signaled))
            .count();

        queue.hw_fences.drain(..done);
        self.hw_fence_pending.fetch_sub(done as u32, Ordering::AcqRel);
        done
    }

    /// Remove every pending entry on every context, logging the first few
    ///
    /// Returns how many were removed.
    pub fn log_remove_pending_hw_fences(&self) -> usize {
        let mut first: ArrayVec<HwFenceEntry, PENDING_FENCE_LOG_LIMIT> = ArrayVec::new();
        let mut count = 0;

        let contexts: Vec<Arc<Context>> = self.contexts.read().values().cloned().collect();
        for context in &contexts {
            let mut queue = context.queue.lock();
            for entry in queue.hw_fences.drain(..) {
                let _ = first.try_push(entry);
                count += 1;
            }
        }

        if count == 0 {
            return 0;
        }
        self.hw_fence_pending.fetch_sub(count as u32, Ordering::AcqRel);

        log::error!(
            "{} hw fences may not be signaled. {} are:",
            count,
            if count > PENDING_FENCE_LOG_LIMIT { "First 5" } else { "They" }
        );
        for (i, entry) in first.iter().enumerate() {
            log::error!("{}: ctx={} seqno={}", i, entry.context, entry.timestamp);
        }
        count
    }

    /// Cancel and drop the hardware fences of a context being invalidated
    ///
    /// Caller holds the context lock.
    pub(crate) fn cancel_context_hw_fences(&self, queue: &mut ContextQueue) {
        for entry in queue.hw_fences.drain(..) {
            self.fw.cancel_hw_fence(entry.context, entry.timestamp);
            self.hw_fence_pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
