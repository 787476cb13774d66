//! # Draw Objects
//!
//! Units of work submitted to a context queue.
//!
//! | Type     | Timestamp        | Resolved by                         |
//! |----------|------------------|-------------------------------------|
//! | Command  | assigned         | firmware retired timestamp          |
//! | Marker   | assigned         | retirement of the preceding work    |
//! | Sync     | 0                | wait conditions (or firmware if HW) |
//! | Bind     | assigned         | asynchronous bind completion        |
//! | Timeline | 0                | nothing, only orders later markers  |
//!
//! Objects are shared between the submitting context's queue, the dispatch
//! worker and the in-flight list, so they are handed around as
//! `Arc<DrawObject>`. Logical destruction (releasing dependencies, counting
//! the retirement) happens exactly once through [`DrawObject::destroy`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::config::MAX_SYNC_EVENTS;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::flags::AtomicBits;
use crate::ops::{Firmware, TimestampKind};
use crate::timestamp::timestamp_reached;

// =============================================================================
// FLAGS
// =============================================================================

bitflags! {
    /// Submission flags supplied with the object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrawObjFlags: u32 {
        /// Last submission of a frame
        const END_OF_FRAME = 1 << 0;
    }
}

bitflags! {
    /// Scheduler-private state of a command or marker object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdPriv: u32 {
        /// Marker must flow through dispatch because real work follows it
        const SKIP = 1 << 0;
        /// Marker's wait point has already retired
        const MARKER_EXPIRED = 1 << 1;
        /// Implicated in a fault; IBs are captured on snapshot
        const FAULT = 1 << 2;
        /// Recurring workload is running
        const RECURRING_START = 1 << 3;
        /// Recurring workload must be stopped
        const RECURRING_STOP = 1 << 4;
        /// Firmware retires this submission without executing it
        const NOP_SUBMISSION = 1 << 5;
    }
}

bitflags! {
    /// Progress of an asynchronous bind
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BindState: u32 {
        /// Bind has been kicked off
        const START = 1 << 0;
        /// Bind has completed
        const DONE = 1 << 1;
    }
}

// =============================================================================
// COMMAND OBJECTS
// =============================================================================

/// GPU command buffer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IbDesc {
    /// GPU virtual address
    pub gpuaddr: u64,
    /// Size in bytes
    pub size: u64,
}

/// Payload of command and marker objects
#[derive(Debug)]
pub struct CommandObj {
    ibs: Vec<IbDesc>,
    state: AtomicBits<CmdPriv>,
    requeue_count: AtomicU32,
    marker_timestamp: AtomicU32,
    fault_policy: AtomicU32,
}

impl CommandObj {
    fn new(ibs: Vec<IbDesc>) -> Self {
        Self {
            ibs,
            state: AtomicBits::new(),
            requeue_count: AtomicU32::new(0),
            marker_timestamp: AtomicU32::new(0),
            fault_policy: AtomicU32::new(0),
        }
    }

    /// Command buffers in submission order
    pub fn ibs(&self) -> &[IbDesc] {
        &self.ibs
    }

    /// Number of command buffers
    pub fn numibs(&self) -> usize {
        self.ibs.len()
    }

    /// Scheduler-private state bits
    pub fn state(&self) -> CmdPriv {
        self.state.get()
    }

    /// Times this object was pushed back onto its context queue
    pub fn requeue_count(&self) -> u32 {
        self.requeue_count.load(Ordering::Relaxed)
    }

    /// Timestamp a marker waits on before it can retire
    pub fn marker_timestamp(&self) -> u32 {
        self.marker_timestamp.load(Ordering::Acquire)
    }

    /// Recovery policy reported by firmware for the last fault
    pub fn fault_policy(&self) -> u32 {
        self.fault_policy.load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, bits: CmdPriv) {
        self.state.insert(bits);
    }

    pub(crate) fn clear(&self, bits: CmdPriv) -> bool {
        self.state.test_and_clear(bits)
    }

    pub(crate) fn set_marker_timestamp(&self, ts: u32) {
        self.marker_timestamp.store(ts, Ordering::Release);
    }

    pub(crate) fn set_fault_policy(&self, policy: u32) {
        self.fault_policy.store(policy, Ordering::Relaxed);
    }

    pub(crate) fn count_requeue(&self) {
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// SYNC OBJECTS
// =============================================================================

/// External fence a sync object can wait on
pub trait SyncFence: Send + Sync {
    /// Whether the fence has signaled
    fn is_signaled(&self) -> bool;

    /// Remove any callback registered on the fence
    fn cancel_callback(&self);

    /// Whether the fence is backed by the hardware fence controller
    fn is_hw_backed(&self) -> bool {
        false
    }

    /// Fence sequence number, for diagnostics
    fn seqno(&self) -> u64 {
        0
    }
}

/// One wait condition of a sync object
pub enum SyncEvent {
    /// Wait for another context to retire a timestamp
    Timestamp {
        /// Context owning the timestamp
        context: Arc<Context>,
        /// Timestamp to wait for
        timestamp: u32,
    },
    /// Wait for an external fence
    Fence(Arc<dyn SyncFence>),
}

impl fmt::Debug for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timestamp { context, timestamp } => f
                .debug_struct("Timestamp")
                .field("context", &context.id())
                .field("timestamp", timestamp)
                .finish(),
            Self::Fence(fence) => f
                .debug_struct("Fence")
                .field("seqno", &fence.seqno())
                .field("signaled", &fence.is_signaled())
                .finish(),
        }
    }
}

/// Payload of sync objects
#[derive(Debug)]
pub struct SyncObj {
    events: Vec<SyncEvent>,
    pending: AtomicU64,
    hw_backed: bool,
    seqno: AtomicU32,
    canary_deadline: AtomicU64,
    canary_fired: AtomicBool,
}

impl SyncObj {
    fn new(events: Vec<SyncEvent>) -> Result<Self> {
        if events.len() > MAX_SYNC_EVENTS {
            return Err(Error::InvalidArgument);
        }

        let pending = match events.len() {
            0 => 0,
            MAX_SYNC_EVENTS => u64::MAX,
            n => (1u64 << n) - 1,
        };
        let hw_backed = !events.is_empty()
            && events
                .iter()
                .all(|e| matches!(e, SyncEvent::Fence(fence) if fence.is_hw_backed()));

        Ok(Self {
            events,
            pending: AtomicU64::new(pending),
            hw_backed,
            seqno: AtomicU32::new(0),
            canary_deadline: AtomicU64::new(0),
            canary_fired: AtomicBool::new(false),
        })
    }

    /// Wait conditions
    pub fn events(&self) -> &[SyncEvent] {
        &self.events
    }

    /// Bitmap of unsatisfied wait conditions
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether any wait condition is unsatisfied
    pub fn events_pending(&self) -> bool {
        self.pending() != 0
    }

    /// Whether every wait condition is a hardware fence
    pub fn is_hw_backed(&self) -> bool {
        self.hw_backed
    }

    /// Sequence number assigned when sent to firmware (0 if never sent)
    pub fn seqno(&self) -> u32 {
        self.seqno.load(Ordering::Acquire)
    }

    /// Clear the bit for `index`; true if that satisfied the last condition
    pub(crate) fn signal(&self, index: usize) -> bool {
        if index >= self.events.len() {
            return false;
        }
        let bit = 1u64 << index;
        let prev = self.pending.fetch_and(!bit, Ordering::AcqRel);
        prev == bit
    }

    /// Resolve conditions that can be checked without a callback
    pub(crate) fn poll(&self, fw: &dyn Firmware) {
        let pending = self.pending();

        for (i, event) in self.events.iter().enumerate() {
            if pending & (1u64 << i) == 0 {
                continue;
            }

            let satisfied = match event {
                SyncEvent::Timestamp { context, timestamp } => timestamp_reached(
                    *timestamp,
                    fw.read_timestamp(context.id(), TimestampKind::Retired),
                ),
                SyncEvent::Fence(fence) => fence.is_signaled(),
            };

            if satisfied {
                self.signal(i);
            }
        }
    }

    /// Cancel fence callbacks and drop every pending condition
    pub(crate) fn cancel_callbacks(&self) {
        for event in &self.events {
            if let SyncEvent::Fence(fence) = event {
                fence.cancel_callback();
            }
        }
        self.pending.store(0, Ordering::Release);
    }

    pub(crate) fn assign_seqno(&self, seqno: u32) {
        let _ = self
            .seqno
            .compare_exchange(0, seqno, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Arm the canary deadline the first time the object blocks dispatch
    pub(crate) fn arm_canary(&self, deadline: u64) {
        let _ = self.canary_deadline.compare_exchange(
            0,
            deadline.max(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// True exactly once, when the armed canary has expired
    pub(crate) fn canary_expired(&self, now: u64) -> bool {
        let deadline = self.canary_deadline.load(Ordering::Acquire);
        deadline != 0 && now >= deadline && !self.canary_fired.swap(true, Ordering::AcqRel)
    }
}

// =============================================================================
// BIND OBJECTS
// =============================================================================

/// A virtual range to bind into the context's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRange {
    /// Target GPU virtual address
    pub gpuaddr: u64,
    /// Length in bytes
    pub size: u64,
    /// Backing object offset
    pub target: u64,
}

/// Payload of bind objects
#[derive(Debug)]
pub struct BindObj {
    ranges: Vec<BindRange>,
    state: AtomicBits<BindState>,
}

impl BindObj {
    /// Ranges to bind
    pub fn ranges(&self) -> &[BindRange] {
        &self.ranges
    }

    /// Bind progress
    pub fn state(&self) -> BindState {
        self.state.get()
    }

    /// Whether the bind completed
    pub fn is_done(&self) -> bool {
        self.state.contains(BindState::DONE)
    }

    /// Mark started; true if this call started it
    pub(crate) fn start(&self) -> bool {
        !self.state.test_and_set(BindState::START)
    }

    pub(crate) fn complete(&self) {
        self.state.insert(BindState::DONE);
    }
}

// =============================================================================
// DRAW OBJECT
// =============================================================================

/// Draw object type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawObjType {
    /// GPU command buffers
    Command,
    /// Timestamp-only marker
    Marker,
    /// Dependency wait
    Sync,
    /// Memory bind
    Bind,
    /// Timeline ordering point
    Timeline,
}

/// Type-specific payload
#[derive(Debug)]
pub enum DrawObjKind {
    /// GPU command buffers
    Command(CommandObj),
    /// Timestamp-only marker
    Marker(CommandObj),
    /// Dependency wait
    Sync(SyncObj),
    /// Memory bind
    Bind(BindObj),
    /// Timeline ordering point
    Timeline,
}

/// How an in-flight object is recognized as retired
pub(crate) enum Tracking<'a> {
    /// Against the context's firmware sync watermark
    Sync(&'a SyncObj),
    /// Against the context's retired timestamp
    Timestamp,
}

/// One unit of queued work
pub struct DrawObject {
    context: Arc<Context>,
    timestamp: AtomicU32,
    flags: DrawObjFlags,
    kind: DrawObjKind,
    destroyed: AtomicBool,
}

impl DrawObject {
    fn new(context: &Arc<Context>, flags: DrawObjFlags, kind: DrawObjKind) -> Arc<Self> {
        Arc::new(Self {
            context: Arc::clone(context),
            timestamp: AtomicU32::new(0),
            flags,
            kind,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Create a command object
    pub fn command(context: &Arc<Context>, ibs: Vec<IbDesc>, flags: DrawObjFlags) -> Arc<Self> {
        Self::new(context, flags, DrawObjKind::Command(CommandObj::new(ibs)))
    }

    /// Create a marker object
    pub fn marker(context: &Arc<Context>, flags: DrawObjFlags) -> Arc<Self> {
        Self::new(context, flags, DrawObjKind::Marker(CommandObj::new(Vec::new())))
    }

    /// Create a sync object waiting on `events`
    pub fn sync(context: &Arc<Context>, events: Vec<SyncEvent>) -> Result<Arc<Self>> {
        let sync = SyncObj::new(events)?;
        Ok(Self::new(context, DrawObjFlags::empty(), DrawObjKind::Sync(sync)))
    }

    /// Create a bind object
    pub fn bind(context: &Arc<Context>, ranges: Vec<BindRange>) -> Arc<Self> {
        let bind = BindObj {
            ranges,
            state: AtomicBits::new(),
        };
        Self::new(context, DrawObjFlags::empty(), DrawObjKind::Bind(bind))
    }

    /// Create a timeline object
    pub fn timeline(context: &Arc<Context>) -> Arc<Self> {
        Self::new(context, DrawObjFlags::empty(), DrawObjKind::Timeline)
    }

    /// Owning context
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Assigned timestamp
    pub fn timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Submission flags
    pub fn flags(&self) -> DrawObjFlags {
        self.flags
    }

    /// Type-specific payload
    pub fn kind(&self) -> &DrawObjKind {
        &self.kind
    }

    /// Type tag
    pub fn obj_type(&self) -> DrawObjType {
        match self.kind {
            DrawObjKind::Command(_) => DrawObjType::Command,
            DrawObjKind::Marker(_) => DrawObjType::Marker,
            DrawObjKind::Sync(_) => DrawObjType::Sync,
            DrawObjKind::Bind(_) => DrawObjType::Bind,
            DrawObjKind::Timeline => DrawObjType::Timeline,
        }
    }

    /// Command payload (commands only)
    pub fn as_command(&self) -> Option<&CommandObj> {
        match &self.kind {
            DrawObjKind::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// Command payload of a command or marker
    pub fn as_cmdobj(&self) -> Option<&CommandObj> {
        match &self.kind {
            DrawObjKind::Command(cmd) | DrawObjKind::Marker(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// Sync payload
    pub fn as_sync(&self) -> Option<&SyncObj> {
        match &self.kind {
            DrawObjKind::Sync(sync) => Some(sync),
            _ => None,
        }
    }

    /// Bind payload
    pub fn as_bind(&self) -> Option<&BindObj> {
        match &self.kind {
            DrawObjKind::Bind(bind) => Some(bind),
            _ => None,
        }
    }

    /// Number of command buffers (0 for non-commands)
    pub fn numibs(&self) -> usize {
        self.as_command().map_or(0, CommandObj::numibs)
    }

    /// A marker that must be dispatched because real work follows it
    pub fn is_marker_skip(&self) -> bool {
        matches!(&self.kind, DrawObjKind::Marker(m) if m.state().contains(CmdPriv::SKIP))
    }

    /// Whether [`destroy`](Self::destroy) has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Mark one wait condition of a sync object satisfied
    ///
    /// Returns true when this satisfied the last pending condition; the
    /// caller should then re-queue the context.
    pub fn signal_sync_event(&self, index: usize) -> bool {
        self.as_sync().is_some_and(|sync| sync.signal(index))
    }

    pub(crate) fn set_timestamp(&self, ts: u32) {
        self.timestamp.store(ts, Ordering::Release);
    }

    pub(crate) fn tracking(&self) -> Tracking<'_> {
        match &self.kind {
            DrawObjKind::Sync(sync) => Tracking::Sync(sync),
            DrawObjKind::Command(_)
            | DrawObjKind::Marker(_)
            | DrawObjKind::Bind(_)
            | DrawObjKind::Timeline => Tracking::Timestamp,
        }
    }

    /// Release the object's dependencies; true only on the first call
    pub(crate) fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let DrawObjKind::Sync(sync) = &self.kind {
            sync.cancel_callbacks();
        }

        log::debug!(
            "ctx {} ts {} {:?} destroyed",
            self.context.id(),
            self.timestamp(),
            self.obj_type()
        );
        true
    }
}

impl fmt::Debug for DrawObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrawObject")
            .field("context", &self.context.id())
            .field("type", &self.obj_type())
            .field("timestamp", &self.timestamp())
            .field("flags", &self.flags)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
