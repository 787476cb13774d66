//! # Draw Contexts
//!
//! A context is one user submission channel: its own timestamp space, a
//! priority level and a bounded ring of queued draw objects.
//!
//! ```text
//!            head                         tail
//!             │                            │
//!   ┌───┬───┬─▼─┬───┬───┬───┬───┬───┬───┬──▼┬───┐
//!   │   │   │ S │ C │ M │ C │ B │   │   │   │   │   DRAWQUEUE_SLOTS
//!   └───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//!             ◀──────── queued ────────▶
//! ```
//!
//! Producers only append at the tail. The dispatch worker pops at the
//! head and may push a single object back when firmware has no room for
//! it, which is why admission leaves one slot of headroom.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::config::{DRAWQUEUE_SLOTS, PRIORITY_LEVELS};
use crate::drawobj::{CmdPriv, DrawObjKind, DrawObject};
use crate::error::{Error, Result};
use crate::fence::HwFenceEntry;
use crate::flags::AtomicBits;
use crate::ops::{poll_until, Platform};
use crate::timestamp::timestamp_cmp;

// =============================================================================
// IDENTITY AND FLAGS
// =============================================================================

/// Context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Creation flags chosen by the owning process
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags: u32 {
        /// Caller supplies timestamps
        const USER_TS = 1 << 0;
        /// Any fault invalidates the context
        const NO_FAULT_TOLERANCE = 1 << 1;
        /// Invalidate on fault instead of replaying
        const INVALIDATE_ON_FAULT = 1 << 2;
        /// Runs on the low-priority async compute pipe
        const LPAC = 1 << 3;
    }
}

bitflags! {
    /// Scheduler-private context state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextPriv: u32 {
        /// Faulted since the last submission; reported as EPROTO once
        const FAULT = 1 << 0;
        /// Invalidated, accepts no more work
        const INVALID = 1 << 1;
        /// Owner went away
        const DETACHED = 1 << 2;
        /// Blamed for a GPU fault
        const GUILTY = 1 << 3;
    }
}

/// Validity of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Accepting submissions
    Active,
    /// Invalidated after a fault or by request
    Invalidated,
    /// Detached by its owner
    Detached,
}

// =============================================================================
// CONTEXT QUEUE
// =============================================================================

/// Ring of queued draw objects plus the timestamp bookkeeping guarded by
/// the same lock
pub(crate) struct ContextQueue {
    ring: Vec<Option<Arc<DrawObject>>>,
    head: usize,
    tail: usize,
    queued: usize,
    /// Last timestamp handed out
    pub(crate) timestamp: u32,
    /// Last timestamp of a queued command, marker or bind
    pub(crate) queued_timestamp: u32,
    /// Last timestamp handed to firmware
    pub(crate) submitted_timestamp: u32,
    /// Pending hardware fences, oldest first
    pub(crate) hw_fences: Vec<HwFenceEntry>,
}

#[inline]
fn next_slot(i: usize) -> usize {
    (i + 1) % DRAWQUEUE_SLOTS
}

#[inline]
fn prev_slot(i: usize) -> usize {
    (i + DRAWQUEUE_SLOTS - 1) % DRAWQUEUE_SLOTS
}

impl ContextQueue {
    fn new() -> Self {
        Self {
            ring: (0..DRAWQUEUE_SLOTS).map(|_| None).collect(),
            head: 0,
            tail: 0,
            queued: 0,
            timestamp: 0,
            queued_timestamp: 0,
            submitted_timestamp: 0,
            hw_fences: Vec::new(),
        }
    }

    /// Number of queued objects
    pub(crate) fn queued(&self) -> usize {
        self.queued
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Append at the tail
    pub(crate) fn push(&mut self, obj: Arc<DrawObject>) -> Result<()> {
        if self.queued >= DRAWQUEUE_SLOTS - 1 {
            return Err(Error::NoSpace);
        }

        self.ring[self.tail] = Some(obj);
        self.tail = next_slot(self.tail);
        self.queued += 1;
        Ok(())
    }

    /// Oldest queued object
    pub(crate) fn front(&self) -> Option<&Arc<DrawObject>> {
        if self.queued == 0 {
            return None;
        }
        self.ring[self.head].as_ref()
    }

    /// Remove the oldest queued object
    pub(crate) fn pop(&mut self) -> Option<Arc<DrawObject>> {
        if self.queued == 0 {
            return None;
        }

        let obj = self.ring[self.head].take();
        self.head = next_slot(self.head);
        self.queued -= 1;
        obj
    }

    /// Put an object back at the head
    pub(crate) fn push_front(&mut self, obj: Arc<DrawObject>) -> Result<()> {
        if self.queued >= DRAWQUEUE_SLOTS {
            return Err(Error::NoSpace);
        }

        let prev = prev_slot(self.head);
        self.ring[prev] = Some(obj);
        self.head = prev;
        self.queued += 1;
        Ok(())
    }

    /// Queued objects, oldest first
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<DrawObject>> + '_ {
        (0..self.queued).filter_map(move |i| self.ring[(self.head + i) % DRAWQUEUE_SLOTS].as_ref())
    }

    /// Remove everything, oldest first
    pub(crate) fn drain(&mut self) -> Vec<Arc<DrawObject>> {
        let mut out = Vec::with_capacity(self.queued);
        while let Some(obj) = self.pop() {
            out.push(obj);
        }
        out
    }

    /// Allocate the next timestamp, honoring a caller-supplied value
    pub(crate) fn next_timestamp(&mut self, user_ts: Option<u32>) -> Result<u32> {
        match user_ts {
            Some(ts) => {
                if timestamp_cmp(self.timestamp, ts).is_ge() {
                    return Err(Error::TimestampRange);
                }
                self.timestamp = ts;
            }
            None => self.timestamp = self.timestamp.wrapping_add(1),
        }
        Ok(self.timestamp)
    }

    /// Force every queued marker through dispatch so time stays linear
    pub(crate) fn mark_markers_skip(&self) {
        for obj in self.iter() {
            if let DrawObjKind::Marker(marker) = obj.kind() {
                marker.set(CmdPriv::SKIP);
            }
        }
    }
}

// =============================================================================
// FAULT THROTTLE
// =============================================================================

#[derive(Debug, Default)]
struct FaultThrottle {
    window_start: Option<u64>,
    count: u32,
}

// =============================================================================
// CONTEXT
// =============================================================================

/// A user submission channel
pub struct Context {
    id: ContextId,
    priority: u8,
    flags: ContextFlags,
    state: AtomicBits<ContextPriv>,
    pub(crate) queue: Mutex<ContextQueue>,
    throttle: Mutex<FaultThrottle>,
    wake_seq: AtomicU32,
    sync_seqno: AtomicU32,
    total_fault_count: AtomicU32,
    last_faulted_ts: AtomicU32,
    frames: AtomicU64,
}

impl Context {
    pub(crate) fn new(id: ContextId, priority: u8, flags: ContextFlags) -> Self {
        let priority = priority.min((PRIORITY_LEVELS - 1) as u8);

        Self {
            id,
            priority,
            flags,
            state: AtomicBits::new(),
            queue: Mutex::new(ContextQueue::new()),
            throttle: Mutex::new(FaultThrottle::default()),
            wake_seq: AtomicU32::new(0),
            sync_seqno: AtomicU32::new(0),
            total_fault_count: AtomicU32::new(0),
            last_faulted_ts: AtomicU32::new(0),
            frames: AtomicU64::new(0),
        }
    }

    /// Context identifier
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Priority level, 0 is the highest
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Creation flags
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// Private state bits
    pub fn private_state(&self) -> ContextPriv {
        self.state.get()
    }

    /// Validity of the context
    pub fn state(&self) -> ContextState {
        let bits = self.state.get();
        if bits.contains(ContextPriv::INVALID) {
            ContextState::Invalidated
        } else if bits.contains(ContextPriv::DETACHED) {
            ContextState::Detached
        } else {
            ContextState::Active
        }
    }

    /// Whether the context was invalidated
    pub fn is_invalid(&self) -> bool {
        self.state.contains(ContextPriv::INVALID)
    }

    /// Whether the context was detached
    pub fn is_detached(&self) -> bool {
        self.state.contains(ContextPriv::DETACHED)
    }

    /// Invalid or detached
    pub fn is_bad(&self) -> bool {
        self.state.get().intersects(ContextPriv::INVALID | ContextPriv::DETACHED)
    }

    /// Whether the context was blamed for a fault
    pub fn is_guilty(&self) -> bool {
        self.state.contains(ContextPriv::GUILTY)
    }

    /// Objects waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.lock().queued()
    }

    /// Last timestamp handed out
    pub fn timestamp(&self) -> u32 {
        self.queue.lock().timestamp
    }

    /// Last timestamp handed to firmware
    pub fn submitted_timestamp(&self) -> u32 {
        self.queue.lock().submitted_timestamp
    }

    /// Faults this context was involved in
    pub fn total_fault_count(&self) -> u32 {
        self.total_fault_count.load(Ordering::Relaxed)
    }

    /// Timestamp of the last command found at fault time
    pub fn last_faulted_ts(&self) -> u32 {
        self.last_faulted_ts.load(Ordering::Relaxed)
    }

    /// Retired end-of-frame submissions
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Fail if the context can no longer take submissions
    pub fn check_state(&self) -> Result<()> {
        match self.state() {
            ContextState::Invalidated => Err(Error::ContextInvalid),
            ContextState::Detached => Err(Error::ContextDetached),
            ContextState::Active => Ok(()),
        }
    }

    pub(crate) fn set_state(&self, bits: ContextPriv) -> ContextPriv {
        self.state.insert(bits)
    }

    pub(crate) fn test_and_clear_state(&self, bits: ContextPriv) -> bool {
        self.state.test_and_clear(bits)
    }

    pub(crate) fn next_sync_seqno(&self) -> u32 {
        let seqno = self.sync_seqno.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if seqno == 0 {
            self.sync_seqno.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
        } else {
            seqno
        }
    }

    pub(crate) fn count_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self, timestamp: u32) {
        self.last_faulted_ts.store(timestamp, Ordering::Relaxed);
        self.total_fault_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Wake producers blocked on admission
    pub(crate) fn wake_waiters(&self) {
        self.wake_seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Take the queue lock once `count` more objects fit under `size`
    ///
    /// Sleeps (by polling the platform clock) for at most `timeout_ms`,
    /// and fails early if the context goes bad while waiting.
    pub(crate) fn lock_with_room(
        &self,
        count: usize,
        size: usize,
        timeout_ms: u64,
        platform: &dyn Platform,
    ) -> Result<MutexGuard<'_, ContextQueue>> {
        let mut queue = self.queue.lock();
        // The context may have been drained while the caller was held off
        self.check_state()?;
        if queue.queued() + count < size {
            return Ok(queue);
        }

        let deadline = platform.now_ms().saturating_add(timeout_ms);

        loop {
            let seen = self.wake_seq.load(Ordering::Acquire);
            drop(queue);

            log::debug!("ctx {} sleeping for {} queue slots", self.id, count);
            let remaining = deadline.saturating_sub(platform.now_ms());
            let woken = poll_until(platform, remaining, || {
                self.wake_seq.load(Ordering::Acquire) != seen || self.is_bad()
            });

            queue = self.queue.lock();
            self.check_state()?;

            if queue.queued() + count < size {
                return Ok(queue);
            }
            if !woken {
                return Err(Error::Timeout);
            }
        }
    }

    /// Count a fault against the storm window
    ///
    /// Returns true once more than `burst` faults land within `window_ms`.
    pub(crate) fn throttle_fault(&self, now: u64, window_ms: u64, burst: u32) -> bool {
        let mut throttle = self.throttle.lock();

        match throttle.window_start {
            Some(start) if now.saturating_sub(start) <= window_ms => {
                throttle.count += 1;
            }
            _ => {
                throttle.window_start = Some(now);
                throttle.count = 1;
                return false;
            }
        }

        if throttle.count > burst {
            log::warn!(
                "ctx {} gpu fault threshold exceeded {} faults in {} msecs",
                self.id,
                burst,
                window_ms
            );
            return true;
        }
        false
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
