//! # Test Doubles
//!
//! Scripted firmware and platform back ends for unit tests. The mock
//! clock only moves when a test advances it or a polling loop relaxes, so
//! timeouts are deterministic.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::context::ContextId;
use crate::drawobj::{DrawObjType, DrawObject, IbDesc, SyncFence};
use crate::error::{Error, Result};
use crate::ops::{Firmware, Platform, Snapshot, SsrEvent, TimestampKind};
use crate::scheduler::Hwsched;

/// `n` distinct command buffers
pub(crate) fn ibs(n: usize) -> Vec<IbDesc> {
    (0..n as u64)
        .map(|i| IbDesc {
            gpuaddr: 0x10_0000 + i * 0x1000,
            size: 0x100,
        })
        .collect()
}

/// Firmware, platform and a scheduler wired to both
pub(crate) fn setup() -> (Arc<MockFirmware>, Arc<MockPlatform>, Hwsched) {
    let fw = Arc::new(MockFirmware::new());
    let platform = Arc::new(MockPlatform::new());
    let sched = Hwsched::new(fw.clone(), platform.clone());
    (fw, platform, sched)
}

// =============================================================================
// FENCE
// =============================================================================

#[derive(Debug)]
pub(crate) struct MockFence {
    signaled: AtomicBool,
    hw: bool,
    cancelled: AtomicBool,
}

impl MockFence {
    pub(crate) fn new(signaled: bool) -> Arc<Self> {
        Arc::new(Self {
            signaled: AtomicBool::new(signaled),
            hw: false,
            cancelled: AtomicBool::new(false),
        })
    }

    pub(crate) fn hw(signaled: bool) -> Arc<Self> {
        Arc::new(Self {
            signaled: AtomicBool::new(signaled),
            hw: true,
            cancelled: AtomicBool::new(false),
        })
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl SyncFence for MockFence {
    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn cancel_callback(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_hw_backed(&self) -> bool {
        self.hw
    }

    fn seqno(&self) -> u64 {
        7
    }
}

// =============================================================================
// FIRMWARE
// =============================================================================

/// One object handed to the mock firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Submission {
    pub(crate) context: ContextId,
    pub(crate) timestamp: u32,
    pub(crate) kind: DrawObjType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetCall {
    Soft(Option<ContextId>, bool),
    Hard,
}

#[derive(Debug, Default)]
struct FirmwareState {
    retired: HashMap<ContextId, u32>,
    consumed: HashMap<ContextId, u32>,
    sync_retired: HashMap<ContextId, u32>,
    submissions: Vec<Submission>,
    resets: Vec<ResetCall>,
    snapshots: Vec<Snapshot>,
    preemption: Vec<bool>,
    hw_fences_created: Vec<(ContextId, u32)>,
    hw_fences_cancelled: Vec<(ContextId, u32)>,
    unregistered: Vec<ContextId>,
}

pub(crate) struct MockFirmware {
    state: Mutex<FirmwareState>,
    fail_submits: AtomicU32,
    soft_reset_result: Mutex<Result<()>>,
    hard_reset_result: Mutex<Result<()>>,
    binds: AtomicUsize,
    recurring_sends: AtomicUsize,
    hw_idle: AtomicBool,
}

impl MockFirmware {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FirmwareState::default()),
            fail_submits: AtomicU32::new(0),
            soft_reset_result: Mutex::new(Ok(())),
            hard_reset_result: Mutex::new(Ok(())),
            binds: AtomicUsize::new(0),
            recurring_sends: AtomicUsize::new(0),
            hw_idle: AtomicBool::new(true),
        }
    }

    /// GPU finished everything up to `ts` on `context`
    pub(crate) fn retire(&self, context: ContextId, ts: u32) {
        let mut state = self.state.lock();
        state.retired.insert(context, ts);
        state.consumed.insert(context, ts);
    }

    /// GPU started executing `ts` on `context`
    pub(crate) fn consume(&self, context: ContextId, ts: u32) {
        self.state.lock().consumed.insert(context, ts);
    }

    pub(crate) fn sync_retire(&self, context: ContextId, seqno: u32) {
        self.state.lock().sync_retired.insert(context, seqno);
    }

    pub(crate) fn retired(&self, context: ContextId) -> u32 {
        self.state.lock().retired.get(&context).copied().unwrap_or(0)
    }

    pub(crate) fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Make the next `n` submissions fail with a full queue
    pub(crate) fn fail_next_submits(&self, n: u32) {
        self.fail_submits.store(n, Ordering::Release);
    }

    pub(crate) fn set_soft_reset_result(&self, result: Result<()>) {
        *self.soft_reset_result.lock() = result;
    }

    pub(crate) fn set_hard_reset_result(&self, result: Result<()>) {
        *self.hard_reset_result.lock() = result;
    }

    pub(crate) fn resets(&self) -> Vec<ResetCall> {
        self.state.lock().resets.clone()
    }

    pub(crate) fn snapshots(&self) -> Vec<Snapshot> {
        self.state.lock().snapshots.clone()
    }

    pub(crate) fn preemption_log(&self) -> Vec<bool> {
        self.state.lock().preemption.clone()
    }

    pub(crate) fn hw_fences_created(&self) -> Vec<(ContextId, u32)> {
        self.state.lock().hw_fences_created.clone()
    }

    pub(crate) fn hw_fences_cancelled(&self) -> Vec<(ContextId, u32)> {
        self.state.lock().hw_fences_cancelled.clone()
    }

    pub(crate) fn unregistered(&self) -> Vec<ContextId> {
        self.state.lock().unregistered.clone()
    }

    pub(crate) fn binds(&self) -> usize {
        self.binds.load(Ordering::Acquire)
    }

    pub(crate) fn recurring_sends(&self) -> usize {
        self.recurring_sends.load(Ordering::Acquire)
    }

    pub(crate) fn set_hw_idle(&self, idle: bool) {
        self.hw_idle.store(idle, Ordering::Release);
    }
}

impl Firmware for MockFirmware {
    fn submit_drawobj(&self, obj: &DrawObject) -> Result<()> {
        let failed = self
            .fail_submits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::NoSpace);
        }

        self.state.lock().submissions.push(Submission {
            context: obj.context().id(),
            timestamp: obj.timestamp(),
            kind: obj.obj_type(),
        });
        Ok(())
    }

    fn read_timestamp(&self, context: ContextId, kind: TimestampKind) -> u32 {
        let state = self.state.lock();
        let map = match kind {
            TimestampKind::Consumed => &state.consumed,
            TimestampKind::Queued | TimestampKind::Retired => &state.retired,
        };
        map.get(&context).copied().unwrap_or(0)
    }

    fn sync_retired_timestamp(&self, context: ContextId) -> u32 {
        self.state.lock().sync_retired.get(&context).copied().unwrap_or(0)
    }

    fn write_timestamp(&self, context: ContextId, timestamp: u32) {
        self.retire(context, timestamp);
    }

    fn soft_reset(&self, context: Option<ContextId>, guilty: bool) -> Result<()> {
        self.state.lock().resets.push(ResetCall::Soft(context, guilty));
        *self.soft_reset_result.lock()
    }

    fn hard_reset(&self) -> Result<()> {
        self.state.lock().resets.push(ResetCall::Hard);
        *self.hard_reset_result.lock()
    }

    fn bind_ranges(&self, _obj: Arc<DrawObject>) {
        self.binds.fetch_add(1, Ordering::AcqRel);
    }

    fn create_hw_fence(&self, context: ContextId, timestamp: u32) -> Result<()> {
        self.state.lock().hw_fences_created.push((context, timestamp));
        Ok(())
    }

    fn cancel_hw_fence(&self, context: ContextId, timestamp: u32) {
        self.state.lock().hw_fences_cancelled.push((context, timestamp));
    }

    fn snapshot(&self, snapshot: &Snapshot) {
        self.state.lock().snapshots.push(snapshot.clone());
    }

    fn send_recurring(&self, _obj: &DrawObject) -> Result<()> {
        self.recurring_sends.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn set_preemption(&self, enable: bool) {
        self.state.lock().preemption.push(enable);
    }

    fn unregister_context(&self, context: ContextId) {
        self.state.lock().unregistered.push(context);
    }

    fn hw_is_idle(&self) -> bool {
        self.hw_idle.load(Ordering::Acquire)
    }
}

// =============================================================================
// PLATFORM
// =============================================================================

pub(crate) struct MockPlatform {
    clock: AtomicU64,
    votes: AtomicI32,
    fail_votes: AtomicBool,
    worker_scheduled: AtomicUsize,
    events: AtomicUsize,
    notifications: Mutex<Vec<SsrEvent>>,
    suspending: AtomicBool,
    awake: AtomicBool,
}

impl MockPlatform {
    pub(crate) fn new() -> Self {
        Self {
            clock: AtomicU64::new(1000),
            votes: AtomicI32::new(0),
            fail_votes: AtomicBool::new(false),
            worker_scheduled: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
            notifications: Mutex::new(Vec::new()),
            suspending: AtomicBool::new(false),
            awake: AtomicBool::new(true),
        }
    }

    pub(crate) fn advance(&self, ms: u64) {
        self.clock.fetch_add(ms, Ordering::AcqRel);
    }

    /// Power votes currently held
    pub(crate) fn votes(&self) -> i32 {
        self.votes.load(Ordering::Acquire)
    }

    pub(crate) fn fail_votes(&self, fail: bool) {
        self.fail_votes.store(fail, Ordering::Release);
    }

    pub(crate) fn worker_scheduled(&self) -> usize {
        self.worker_scheduled.load(Ordering::Acquire)
    }

    pub(crate) fn events(&self) -> usize {
        self.events.load(Ordering::Acquire)
    }

    pub(crate) fn notifications(&self) -> Vec<SsrEvent> {
        self.notifications.lock().clone()
    }

    pub(crate) fn set_suspending(&self, suspending: bool) {
        self.suspending.store(suspending, Ordering::Release);
    }

    pub(crate) fn set_awake(&self, awake: bool) {
        self.awake.store(awake, Ordering::Release);
    }
}

impl Platform for MockPlatform {
    fn now_ms(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    fn active_count_get(&self) -> Result<()> {
        if self.fail_votes.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }
        self.votes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn active_count_put(&self) {
        self.votes.fetch_sub(1, Ordering::AcqRel);
    }

    fn schedule_worker(&self) {
        self.worker_scheduled.fetch_add(1, Ordering::AcqRel);
    }

    fn process_events(&self) {
        self.events.fetch_add(1, Ordering::AcqRel);
    }

    fn notify(&self, event: SsrEvent) {
        self.notifications.lock().push(event);
    }

    fn suspend_in_progress(&self) -> bool {
        self.suspending.load(Ordering::Acquire)
    }

    fn is_awake(&self) -> bool {
        self.awake.load(Ordering::Acquire)
    }

    fn relax(&self) {
        self.clock.fetch_add(1, Ordering::AcqRel);
        std::thread::yield_now();
    }
}
