//! # Fault Recovery
//!
//! ```text
//!  Healthy ──report_fault──▶ FaultDetected ──▶ Quiescing ──▶ Snapshotting
//!     ▲                                                          │
//!     └──────────── Replaying ◀──────────── Resetting ◀──────────┘
//!                                              │ reset failed
//!                                              ▼
//!                                            Failed (next fault: hard reset)
//! ```
//!
//! Fault reporters (interrupt handlers, firmware message handlers,
//! timers) only set the fault bits and kick the worker. The worker runs
//! the state machine with the dispatcher lock held, so normal dispatch
//! is suspended until the device is confirmed healthy again.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::config::SUSPEND_RECOVERY_GATE_TIMEOUT_MS;
use crate::context::{Context, ContextFlags, ContextId, ContextPriv};
use crate::drawobj::{CmdPriv, DrawObject, IbDesc, SyncEvent, Tracking};
use crate::error::{Error, Result};
use crate::ops::{poll_until, FaultedCommand, Snapshot, SsrEvent, TimestampKind};
use crate::scheduler::{Hwsched, SchedCounters, SchedFlags};
use crate::sender::DeviceState;

// =============================================================================
// FAULT DESCRIPTION
// =============================================================================

bitflags! {
    /// Fault classes reported to the scheduler
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultCode: u32 {
        /// Recoverable GPU fault
        const SOFT = 1 << 0;
        /// Fault that requires a full reset
        const HARD = 1 << 1;
        /// Firmware or GPU timeout
        const TIMEOUT = 1 << 2;
        /// Stall-on-fault page fault; the SMMU must be reset too
        const PAGE_FAULT = 1 << 3;
        /// Preemption did not complete
        const PREEMPT = 1 << 4;
        /// Firmware co-processor fault
        const FIRMWARE = 1 << 5;
    }
}

/// Error class in a firmware context-bad report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BadCmdError {
    /// Firmware detected a software hang
    SwHang,
    /// Security fuse violation
    FuseViolation,
    /// A sync object timed out in firmware
    SyncObjTimeout,
    /// Any other firmware error code
    #[default]
    Unknown,
    /// Raw firmware error code
    Other(u32),
}

/// One faulting submission named by firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSite {
    /// Faulting context
    pub context: ContextId,
    /// Faulting timestamp (sync objects: sequence number)
    pub timestamp: u32,
    /// Recovery policy chosen by firmware
    pub policy: u32,
}

/// Firmware context-bad report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextBad {
    /// Graphics pipe fault, if any
    pub gc: Option<FaultSite>,
    /// LPAC pipe fault, if any
    pub lpac: Option<FaultSite>,
    /// Error class
    pub error: BadCmdError,
}

/// Recovery progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecoveryState {
    /// Normal dispatch
    Healthy = 0,
    /// Fault bits set, worker not yet run
    FaultDetected = 1,
    /// Waiting for an overlapping suspend
    Quiescing = 2,
    /// Capturing state and locating the faulting submission
    Snapshotting = 3,
    /// Resetting the GPU
    Resetting = 4,
    /// Resubmitting surviving work
    Replaying = 5,
    /// Reset failed; the device is unusable until the next fault
    Failed = 6,
}

impl RecoveryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::FaultDetected,
            2 => Self::Quiescing,
            3 => Self::Snapshotting,
            4 => Self::Resetting,
            5 => Self::Replaying,
            6 => Self::Failed,
            _ => Self::Healthy,
        }
    }
}

/// Reset flavor chosen for the current recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetKind {
    Soft,
    Hard,
}

// =============================================================================
// RECOVERY CONTROL
// =============================================================================

pub(crate) struct RecoveryControl {
    fault: AtomicU32,
    bad: Mutex<Option<ContextBad>>,
    hard_reset: AtomicBool,
    state: AtomicU8,
    escalate: AtomicBool,
    /// Excludes concurrent recovery and suspend
    pub(crate) mutex: Mutex<()>,
}

impl RecoveryControl {
    pub(crate) fn new() -> Self {
        Self {
            fault: AtomicU32::new(0),
            bad: Mutex::new(None),
            hard_reset: AtomicBool::new(false),
            state: AtomicU8::new(RecoveryState::Healthy as u8),
            escalate: AtomicBool::new(false),
            mutex: Mutex::new(()),
        }
    }

    pub(crate) fn fault(&self) -> FaultCode {
        FaultCode::from_bits_retain(self.fault.load(Ordering::Acquire))
    }

    pub(crate) fn fault_pending(&self) -> bool {
        self.fault.load(Ordering::Acquire) != 0
    }

    /// Fault pending, or the last reset failed
    pub(crate) fn unusable(&self) -> bool {
        self.fault_pending() || self.state() == RecoveryState::Failed
    }

    pub(crate) fn state(&self) -> RecoveryState {
        RecoveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RecoveryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn reset_kind(&self) -> ResetKind {
        if self.hard_reset.load(Ordering::Acquire) {
            ResetKind::Hard
        } else {
            ResetKind::Soft
        }
    }

    fn force_hard_reset(&self) {
        self.hard_reset.store(true, Ordering::Release);
    }
}

impl core::fmt::Debug for RecoveryControl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecoveryControl")
            .field("fault", &self.fault())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// RECOVERY
// =============================================================================

impl Hwsched {
    /// Report a fault; safe from interrupt and timer context
    pub fn report_fault(&self, fault: FaultCode, bad: Option<ContextBad>) {
        if let Some(bad) = bad {
            *self.recovery.bad.lock() = Some(bad);
        }

        self.recovery.fault.fetch_or(fault.bits(), Ordering::AcqRel);
        self.recovery.set_state(RecoveryState::FaultDetected);
        SchedCounters::bump(&self.stats.faults);

        self.platform.schedule_worker();
    }

    /// Recovery progress
    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    /// Visit the command buffers of every in-flight command marked as
    /// faulted, clearing the mark
    pub fn parse_fault_cmdobjs(&self, mut visit: impl FnMut(&DrawObject, &IbDesc)) {
        let device = self.device.lock();

        for record in &device.cmd_list {
            let obj = record.drawobj();
            let Some(cmd) = obj.as_command() else {
                continue;
            };

            if cmd.state().contains(CmdPriv::FAULT) {
                for ib in cmd.ibs() {
                    visit(obj, ib);
                }
                cmd.clear(CmdPriv::FAULT);
            }
        }
    }

    /// Run recovery if a fault is pending
    ///
    /// Returns true when the worker must not continue with normal dispatch.
    /// Caller holds the dispatcher lock.
    pub(crate) fn do_fault(&self) -> bool {
        let fault = self.recovery.fault();
        if fault.is_empty() {
            return false;
        }

        // Held by a suspend; run again once it lets go
        let Some(_recovery) = self.recovery.mutex.try_lock() else {
            self.platform.schedule_worker();
            return true;
        };

        self.recovery.set_state(RecoveryState::Quiescing);
        let settled = poll_until(
            self.platform.as_ref(),
            SUSPEND_RECOVERY_GATE_TIMEOUT_MS,
            || !self.platform.suspend_in_progress(),
        );
        if !settled {
            log::warn!("suspend recovery gate timeout");
        }

        let mut device = self.device.lock();
        SchedCounters::bump(&self.stats.recoveries);

        if self.recovery.escalate.swap(false, Ordering::AcqRel) {
            self.recovery.force_hard_reset();
        }

        let result = if self.platform.is_awake() {
            self.recovery.set_state(RecoveryState::Snapshotting);
            match self.snapshot_and_soft_reset(&mut device, fault) {
                Ok(()) => Ok(()),
                Err(err) => {
                    log::error!("soft reset failed: {}", err);
                    self.recovery.set_state(RecoveryState::Resetting);
                    self.fw.hard_reset()
                }
            }
        } else {
            Ok(())
        };
        self.recovery.hard_reset.store(false, Ordering::Release);

        // Clear only what was handled; faults raised meanwhile run next
        self.recovery.fault.fetch_and(!fault.bits(), Ordering::AcqRel);

        let result = result.and_then(|()| {
            self.recovery.set_state(RecoveryState::Replaying);
            self.replay(&mut device)
        });

        match result {
            Ok(()) => {
                let next = if self.recovery.fault_pending() {
                    RecoveryState::FaultDetected
                } else {
                    RecoveryState::Healthy
                };
                self.recovery.set_state(next);
                log::info!("recovered from fault {:?}, {} in flight", fault, device.inflight);
            }
            Err(err) => {
                log::error!("gpu recovery failed: {}", err);
                self.recovery.set_state(RecoveryState::Failed);
                self.recovery.escalate.store(true, Ordering::Release);
            }
        }

        drop(device);
        self.platform.process_events();
        self.platform.schedule_worker();
        true
    }

    /// Locate the faulting work, capture state, blame and reset
    fn snapshot_and_soft_reset(&self, device: &mut DeviceState, fault: FaultCode) -> Result<()> {
        let bad = self.recovery.bad.lock().take().unwrap_or_default();

        if device.recurring.is_some() {
            self.platform.notify(SsrEvent::Begin);
        }

        // The SMMU needs a reset as well
        if fault.contains(FaultCode::PAGE_FAULT) {
            self.recovery.force_hard_reset();
        }

        if bad.error == BadCmdError::SyncObjTimeout {
            if let Some(site) = bad.gc {
                self.print_fault_syncobj(device, site.context, site.timestamp);
            }
            self.fw.snapshot(&Snapshot {
                fault,
                ..Snapshot::default()
            });
            return Err(Error::Timeout);
        }

        let page_fault = fault.contains(FaultCode::PAGE_FAULT);

        let mut gc = bad
            .gc
            .and_then(|site| self.get_fault_cmdobj(device, site.context, site.timestamp));
        let mut lpac = bad
            .lpac
            .and_then(|site| self.get_fault_cmdobj(device, site.context, site.timestamp));

        if gc.is_none() && page_fault {
            gc = self.get_active_cmdobj(device, false);
        }

        if gc.is_none() {
            gc = device
                .recurring
                .as_ref()
                .filter(|r| bad.gc.is_some_and(|site| site.context == r.context().id()))
                .cloned();
        }

        if let (Some(obj), Some(site)) = (&gc, bad.gc) {
            if let Some(cmd) = obj.as_command() {
                cmd.set_fault_policy(site.policy);
            }
        }
        if let Some(obj) = &gc {
            obj.context().set_state(ContextPriv::FAULT);
        }

        self.fault_header(gc.as_deref(), fault);

        if lpac.is_none() && page_fault {
            lpac = self.get_active_cmdobj(device, true);
        }

        if gc.is_none() && lpac.is_none() {
            self.fw.snapshot(&Snapshot {
                fault,
                ..Snapshot::default()
            });

            // Nothing to blame; only a full reset is safe
            self.recovery.force_hard_reset();
            return self.reset_device(None, false);
        }

        if let Some(obj) = &lpac {
            if let (Some(cmd), Some(site)) = (obj.as_command(), bad.lpac) {
                cmd.set_fault_policy(site.policy);
            }
            obj.context().set_state(ContextPriv::FAULT);
            log::error!("lpac ctx {} ts {} faulted", obj.context().id(), obj.timestamp());
        }

        self.fw.snapshot(&Snapshot {
            fault,
            context: gc.as_ref().map(|o| o.context().id()),
            lpac_context: lpac.as_ref().map(|o| o.context().id()),
            faulted: self.collect_faulted(device),
        });

        let mut ret = Ok(());
        for obj in gc.iter().chain(lpac.iter()) {
            let context = obj.context();
            self.recovery.set_state(RecoveryState::Resetting);
            self.force_retire_timestamp(obj);

            let guilty = self.context_guilty(context, bad.error);
            let reset = self.reset_device(Some(context.id()), guilty);
            ret = ret.and(reset);

            if guilty {
                self.set_guilty(context);
            }
        }
        ret
    }

    fn reset_device(&self, context: Option<ContextId>, guilty: bool) -> Result<()> {
        self.recovery.set_state(RecoveryState::Resetting);
        match self.recovery.reset_kind() {
            ResetKind::Hard => self.fw.hard_reset(),
            ResetKind::Soft => self.fw.soft_reset(context, guilty),
        }
    }

    /// The in-flight command firmware named, marked for IB parsing
    fn get_fault_cmdobj(
        &self,
        device: &DeviceState,
        context: ContextId,
        timestamp: u32,
    ) -> Option<Arc<DrawObject>> {
        let obj = device.cmd_list.iter().map(|r| r.drawobj()).find(|obj| {
            obj.as_command().is_some()
                && obj.context().id() == context
                && obj.timestamp() == timestamp
        })?;

        obj.as_command()?.set(CmdPriv::FAULT);
        Some(Arc::clone(obj))
    }

    /// The command that was executing when the fault hit
    ///
    /// For the graphics pipe this is the started-but-unfinished command on
    /// the highest priority level; LPAC has a single ring so the first
    /// unfinished one is taken.
    fn get_active_cmdobj(&self, device: &DeviceState, lpac: bool) -> Option<Arc<DrawObject>> {
        let mut active: Option<&Arc<DrawObject>> = None;

        for record in &device.cmd_list {
            let obj = record.drawobj();
            let context = obj.context();

            if obj.as_command().is_none() || context.flags().contains(ContextFlags::LPAC) != lpac {
                continue;
            }

            let consumed = self.fw.read_timestamp(context.id(), TimestampKind::Consumed);
            let retired = self.fw.read_timestamp(context.id(), TimestampKind::Retired);
            if consumed == 0 || consumed == retired {
                continue;
            }

            match active {
                None => active = Some(obj),
                Some(_) if lpac => {}
                Some(current) => {
                    if context.priority() < current.context().priority() {
                        active = Some(obj);
                    }
                }
            }
        }

        let obj = active?;
        obj.as_command()?.set(CmdPriv::FAULT);
        Some(Arc::clone(obj))
    }

    fn fault_header(&self, obj: Option<&DrawObject>, fault: FaultCode) {
        log::error!("fault {:?}, gpu {}", fault, if self.platform.is_awake() { "on" } else { "off" });

        let Some(obj) = obj else {
            return;
        };
        let context = obj.context();
        context.record_fault(obj.timestamp());

        log::error!(
            "ctx {} prio {} ts {} policy {:#x} faults {}",
            context.id(),
            context.priority(),
            obj.timestamp(),
            obj.as_cmdobj().map_or(0, |c| c.fault_policy()),
            context.total_fault_count()
        );
    }

    fn collect_faulted(&self, device: &DeviceState) -> Vec<FaultedCommand> {
        device
            .cmd_list
            .iter()
            .map(|r| r.drawobj())
            .filter_map(|obj| {
                let cmd = obj.as_command()?;
                cmd.state().contains(CmdPriv::FAULT).then(|| FaultedCommand {
                    context: obj.context().id(),
                    timestamp: obj.timestamp(),
                    ibs: cmd.ibs().to_vec(),
                })
            })
            .collect()
    }

    fn print_fault_syncobj(&self, device: &DeviceState, context: ContextId, seqno: u32) {
        for record in &device.cmd_list {
            let obj = record.drawobj();
            let Some(sync) = obj.as_sync() else {
                continue;
            };
            if obj.context().id() != context || sync.seqno() != seqno {
                continue;
            }

            for (i, event) in sync.events().iter().enumerate() {
                match event {
                    SyncEvent::Fence(fence) => log::error!(
                        "ctx {} sync {} fence[{}] signaled:{} hw:{} seqno:{}",
                        context,
                        seqno,
                        i,
                        fence.is_signaled(),
                        fence.is_hw_backed(),
                        fence.seqno()
                    ),
                    SyncEvent::Timestamp { context: dep, timestamp } => log::error!(
                        "ctx {} sync {} timestamp[{}] ctx {} ts {}",
                        context,
                        seqno,
                        i,
                        dep.id(),
                        timestamp
                    ),
                }
            }
        }
    }

    /// Make the faulting submission count as retired so replay skips it
    fn force_retire_timestamp(&self, obj: &DrawObject) {
        if self.flags.contains(SchedFlags::FORCE_RETIRE_FW) {
            if let Some(cmd) = obj.as_cmdobj() {
                cmd.set(CmdPriv::NOP_SUBMISSION);
            }
            return;
        }

        self.fw.write_timestamp(obj.context().id(), obj.timestamp());
    }

    /// Guilty contexts are never replayed
    fn context_guilty(&self, context: &Context, error: BadCmdError) -> bool {
        let flags = context.flags();

        let guilty = flags.contains(ContextFlags::INVALIDATE_ON_FAULT)
            || flags.contains(ContextFlags::NO_FAULT_TOLERANCE)
            || matches!(error, BadCmdError::SwHang | BadCmdError::FuseViolation);
        if guilty {
            return true;
        }

        let throttled = context.throttle_fault(
            self.platform.now_ms(),
            self.tunables.fault_throttle_time_ms(),
            self.tunables.fault_throttle_burst(),
        );
        if throttled {
            SchedCounters::bump(&self.stats.throttled);
        }
        throttled
    }

    /// Whether an in-flight object is finished or belongs to a dead context
    fn replay_drawobj(&self, device: &mut DeviceState, obj: &Arc<DrawObject>) -> bool {
        match obj.tracking() {
            Tracking::Sync(sync) => {
                if obj.context().is_bad() || self.syncobj_retired(obj, sync) {
                    self.destroy_hw_syncobj(obj);
                    return false;
                }
                true
            }
            Tracking::Timestamp => {
                if self.timestamp_retired(obj) || obj.context().is_bad() {
                    self.retire_cmdobj(device, obj);
                    return false;
                }
                true
            }
        }
    }

    /// Resubmit surviving in-flight work after a reset
    ///
    /// Stops resubmitting at the first firmware refusal so ordering holds;
    /// the rest stay in flight for the next recovery.
    fn replay(&self, device: &mut DeviceState) -> Result<()> {
        let records = core::mem::take(&mut device.cmd_list);
        let mut retired = 0;
        let mut ret = Ok(());

        for record in records {
            if self.replay_drawobj(device, record.drawobj()) {
                if ret.is_ok() {
                    ret = self.fw.submit_drawobj(record.drawobj());
                    if let Err(err) = ret {
                        log::error!(
                            "ctx {} ts {} replay failed: {}",
                            record.drawobj().context().id(),
                            record.drawobj().timestamp(),
                            err
                        );
                    }
                }
                device.cmd_list.push(record);
                continue;
            }

            retired += 1;
            device.inflight -= 1;
        }

        if let Some(recurring) = device.recurring.clone() {
            let event = if recurring.context().is_invalid() {
                if let Some(cmd) = recurring.as_command() {
                    cmd.clear(CmdPriv::RECURRING_START);
                    cmd.set(CmdPriv::RECURRING_STOP);
                }
                device.recurring = None;
                SsrEvent::Fatal
            } else {
                SsrEvent::End
            };

            if let Err(err) = self.fw.send_recurring(&recurring) {
                log::warn!("recurring workload resend failed: {}", err);
            }
            if event == SsrEvent::Fatal {
                self.destroy_drawobj(&recurring);
            }
            self.platform.notify(event);
        }

        if retired > 0 {
            self.platform.process_events();
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawobj::DrawObjFlags;
    use crate::ops::Platform;
    use crate::testing::{ibs, setup, ResetCall};

    fn site(context: u32, timestamp: u32) -> Option<FaultSite> {
        Some(FaultSite {
            context: ContextId(context),
            timestamp,
            policy: 0x2,
        })
    }

    fn cmd(ctx: &Arc<Context>) -> Arc<DrawObject> {
        DrawObject::command(ctx, ibs(2), DrawObjFlags::empty())
    }

    #[test]
    fn test_scenario_guilty_and_innocent() {
        let (fw, _platform, sched) = setup();
        let c1 = sched
            .create_context(ContextId(1), 2, ContextFlags::INVALIDATE_ON_FAULT)
            .unwrap();
        let c2 = sched.create_context(ContextId(2), 2, ContextFlags::empty()).unwrap();

        let c1_objs: Vec<_> = (0..3).map(|_| cmd(&c1)).collect();
        let c2_objs: Vec<_> = (0..2).map(|_| cmd(&c2)).collect();
        sched.queue_cmds(&c1, &c1_objs, 0).unwrap();
        sched.queue_cmds(&c2, &c2_objs, 0).unwrap();
        assert_eq!(sched.inflight(), 5);

        sched.set_inline_submit(false);
        let c1_queued = cmd(&c1);
        sched.queue_cmds(&c1, &[c1_queued.clone()], 0).unwrap();

        fw.consume(ContextId(1), 1);
        sched.report_fault(
            FaultCode::SOFT,
            Some(ContextBad {
                gc: site(1, 1),
                lpac: None,
                error: BadCmdError::Unknown,
            }),
        );
        sched.run_worker();

        assert_eq!(sched.recovery_state(), RecoveryState::Healthy);
        assert!(c1.is_guilty() && c1.is_invalid());
        assert!(c1_objs.iter().all(|o| o.is_destroyed()));
        assert!(c1_queued.is_destroyed());
        assert!(c2_objs.iter().all(|o| !o.is_destroyed()));
        assert_eq!(fw.resets(), [ResetCall::Soft(Some(ContextId(1)), true)]);

        // innocent work was handed back to firmware
        let replayed = fw.submissions().iter().filter(|s| s.context == ContextId(2)).count();
        assert_eq!(replayed, 4);
        assert_eq!(sched.inflight(), 2);

        fw.retire(ContextId(2), 2);
        sched.run_worker();
        assert!(c2_objs.iter().all(|o| o.is_destroyed()));
        assert_eq!(sched.inflight(), 0);
        assert_eq!(c1.total_fault_count(), 1);
        assert_eq!(c1.last_faulted_ts(), 1);
    }

    #[test]
    fn test_submit_reports_eproto_after_fault() {
        let (_fw, _platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();

        sched.report_fault(
            FaultCode::SOFT,
            Some(ContextBad {
                gc: site(1, 1),
                ..ContextBad::default()
            }),
        );
        sched.run_worker();
        assert!(ctx.private_state().contains(ContextPriv::FAULT));
        assert!(!ctx.is_invalid());

        let err = sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap_err();
        assert_eq!(err, Error::ContextFaulted);
        assert_eq!(err.errno(), -71);
        assert_eq!(ctx.queued() + sched.inflight() as usize, 1);
        assert_eq!(sched.queue_cmds(&ctx, &[cmd(&ctx)], 0), Ok(3));
    }

    #[test]
    fn test_fault_storm_invalidates() {
        let (fw, platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();

        for round in 1..=4u32 {
            sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap_or(0);
            platform.advance(100);
            sched.report_fault(
                FaultCode::SOFT,
                Some(ContextBad {
                    gc: site(1, round),
                    ..ContextBad::default()
                }),
            );
            sched.run_worker();
            assert_eq!(ctx.is_invalid(), round == 4, "round {}", round);
        }

        let before = fw.submissions().len();
        assert_eq!(
            sched.queue_cmds(&ctx, &[cmd(&ctx)], 0),
            Err(Error::ContextInvalid)
        );
        sched.run_worker();
        assert_eq!(fw.submissions().len(), before);
        assert_eq!(sched.stats().throttled, 1);
    }

    #[test]
    fn test_spaced_faults_do_not_throttle() {
        let (_fw, platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();

        for round in 1..=6u32 {
            sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap_or(0);
            platform.advance(2500);
            sched.report_fault(
                FaultCode::SOFT,
                Some(ContextBad {
                    gc: site(1, round),
                    ..ContextBad::default()
                }),
            );
            sched.run_worker();
        }

        assert!(!ctx.is_invalid());
    }

    #[test]
    fn test_unrecoverable_error_blames_context() {
        let (fw, _platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();

        sched.report_fault(
            FaultCode::SOFT,
            Some(ContextBad {
                gc: site(1, 1),
                lpac: None,
                error: BadCmdError::SwHang,
            }),
        );
        sched.run_worker();

        assert!(ctx.is_guilty());
        assert_eq!(fw.resets(), [ResetCall::Soft(Some(ContextId(1)), true)]);
    }

    #[test]
    fn test_page_fault_finds_active_command() {
        let (fw, _platform, sched) = setup();
        let low = sched.create_context(ContextId(1), 5, ContextFlags::empty()).unwrap();
        let high = sched.create_context(ContextId(2), 1, ContextFlags::empty()).unwrap();
        sched.queue_cmds(&low, &[cmd(&low)], 0).unwrap();
        sched.queue_cmds(&high, &[cmd(&high)], 0).unwrap();

        fw.consume(ContextId(1), 1);
        fw.consume(ContextId(2), 1);
        sched.report_fault(FaultCode::PAGE_FAULT, None);
        sched.run_worker();

        let snapshot = fw.snapshots().pop().unwrap();
        assert_eq!(snapshot.context, Some(ContextId(2)));
        assert_eq!(snapshot.faulted.len(), 1);
        assert_eq!(fw.resets(), [ResetCall::Hard]);
        assert_eq!(high.last_faulted_ts(), 1);
    }

    #[test]
    fn test_lpac_tracked_separately() {
        let (fw, _platform, sched) = setup();
        let gfx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        let lpac = sched.create_context(ContextId(2), 2, ContextFlags::LPAC).unwrap();
        sched.queue_cmds(&gfx, &[cmd(&gfx)], 0).unwrap();
        sched.queue_cmds(&lpac, &[cmd(&lpac)], 0).unwrap();

        fw.consume(ContextId(2), 1);
        sched.report_fault(FaultCode::PAGE_FAULT, None);
        sched.run_worker();

        let snapshot = fw.snapshots().pop().unwrap();
        assert_eq!(snapshot.context, None);
        assert_eq!(snapshot.lpac_context, Some(ContextId(2)));
        assert!(lpac.private_state().contains(ContextPriv::FAULT));
    }

    #[test]
    fn test_unknown_fault_forces_hard_reset() {
        let (fw, _platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        let obj = cmd(&ctx);
        sched.queue_cmds(&ctx, &[obj.clone()], 0).unwrap();

        sched.report_fault(FaultCode::TIMEOUT, None);
        sched.run_worker();

        assert_eq!(fw.resets(), [ResetCall::Hard]);
        assert!(!obj.is_destroyed());
        assert_eq!(sched.inflight(), 1);
        assert_eq!(fw.submissions().len(), 2);
    }

    #[test]
    fn test_failed_reset_escalates() {
        let (fw, _platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();

        fw.set_soft_reset_result(Err(Error::Timeout));
        fw.set_hard_reset_result(Err(Error::Timeout));
        sched.report_fault(
            FaultCode::SOFT,
            Some(ContextBad {
                gc: site(1, 1),
                ..ContextBad::default()
            }),
        );
        sched.run_worker();
        assert_eq!(sched.recovery_state(), RecoveryState::Failed);
        assert_eq!(sched.idle(), Err(Error::Deadlock));

        // nothing reaches firmware while the device is unusable
        let before = fw.submissions().len();
        assert_eq!(
            sched.queue_cmds(&ctx, &[cmd(&ctx)], 0),
            Err(Error::ContextFaulted)
        );
        assert_eq!(fw.submissions().len(), before);

        fw.set_hard_reset_result(Ok(()));
        sched.report_fault(FaultCode::SOFT, None);
        sched.run_worker();
        assert_eq!(sched.recovery_state(), RecoveryState::Healthy);
        assert_eq!(fw.resets().last(), Some(&ResetCall::Hard));
    }

    #[test]
    fn test_recovery_deferred_while_suspend_holds_lock() {
        let (fw, platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();

        let held = sched.recovery.mutex.lock();
        sched.report_fault(FaultCode::SOFT, None);
        let before = platform.worker_scheduled();

        sched.run_worker();
        assert_eq!(platform.worker_scheduled(), before + 1);
        assert_eq!(sched.recovery_state(), RecoveryState::FaultDetected);

        // submitters hand over to the worker instead of dispatching
        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        assert_eq!(platform.worker_scheduled(), before + 2);
        assert!(fw.submissions().is_empty());

        drop(held);
        sched.run_worker();
        assert_eq!(sched.recovery_state(), RecoveryState::Healthy);
        sched.run_worker();
        assert_eq!(fw.submissions().len(), 1);
    }

    #[test]
    fn test_failed_replay_escalates() {
        let (fw, _platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        let objs: Vec<_> = (0..2).map(|_| cmd(&ctx)).collect();
        sched.queue_cmds(&ctx, &objs, 0).unwrap();
        assert_eq!(fw.submissions().len(), 2);

        fw.fail_next_submits(1);
        sched.report_fault(FaultCode::SOFT, None);
        sched.run_worker();

        assert_eq!(sched.recovery_state(), RecoveryState::Failed);
        assert_eq!(sched.inflight(), 2);
        assert!(objs.iter().all(|o| !o.is_destroyed()));
        // nothing after the refused object was resubmitted
        assert_eq!(fw.submissions().len(), 2);

        sched.report_fault(FaultCode::SOFT, None);
        sched.run_worker();
        assert_eq!(sched.recovery_state(), RecoveryState::Healthy);
        assert_eq!(fw.resets(), [ResetCall::Hard, ResetCall::Hard]);
        assert_eq!(fw.submissions().len(), 4);

        fw.retire(ContextId(1), 2);
        sched.run_worker();
        assert!(objs.iter().all(|o| o.is_destroyed()));
        assert_eq!(sched.inflight(), 0);
    }

    #[test]
    fn test_recovery_proceeds_past_stuck_suspend() {
        let (fw, platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();

        platform.set_suspending(true);
        let start = platform.now_ms();
        let events = platform.events();
        sched.report_fault(FaultCode::SOFT, None);
        sched.run_worker();

        assert!(platform.now_ms() - start >= SUSPEND_RECOVERY_GATE_TIMEOUT_MS);
        assert_eq!(sched.recovery_state(), RecoveryState::Healthy);
        assert_eq!(fw.resets(), [ResetCall::Hard]);
        assert!(platform.events() > events);
    }

    #[test]
    fn test_syncobj_timeout_hard_resets() {
        let (fw, _platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();

        sched.report_fault(
            FaultCode::FIRMWARE,
            Some(ContextBad {
                gc: site(1, 1),
                lpac: None,
                error: BadCmdError::SyncObjTimeout,
            }),
        );
        sched.run_worker();

        assert_eq!(fw.resets(), [ResetCall::Hard]);
        assert_eq!(fw.snapshots().len(), 1);
        assert_eq!(sched.recovery_state(), RecoveryState::Healthy);
    }

    #[test]
    fn test_recurring_notifications() {
        let (fw, platform, sched) = setup();
        let ctx = sched
            .create_context(ContextId(1), 2, ContextFlags::NO_FAULT_TOLERANCE)
            .unwrap();
        let recurring = cmd(&ctx);
        sched.set_recurring(recurring.clone()).unwrap();

        sched.report_fault(
            FaultCode::SOFT,
            Some(ContextBad {
                gc: site(1, 0),
                ..ContextBad::default()
            }),
        );
        sched.run_worker();

        assert_eq!(platform.notifications(), [SsrEvent::Begin, SsrEvent::Fatal]);
        assert!(recurring
            .as_command()
            .unwrap()
            .state()
            .contains(CmdPriv::RECURRING_STOP));
        assert!(sched.recurring().is_none());
        assert_eq!(fw.recurring_sends(), 2);
    }

    #[test]
    fn test_recurring_restarted_for_innocent_context() {
        let (_fw, platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        sched.set_recurring(cmd(&ctx)).unwrap();

        sched.report_fault(FaultCode::SOFT, None);
        sched.run_worker();

        assert_eq!(platform.notifications(), [SsrEvent::Begin, SsrEvent::End]);
        assert!(sched.recurring().is_some());
    }

    #[test]
    fn test_parse_fault_cmdobjs_clears_mark() {
        let (fw, _platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        let a = cmd(&ctx);
        let b = cmd(&ctx);
        sched.queue_cmds(&ctx, &[a.clone(), b.clone()], 0).unwrap();

        b.as_command().unwrap().set(CmdPriv::FAULT);

        let mut seen = Vec::new();
        sched.parse_fault_cmdobjs(|obj, ib| seen.push((obj.timestamp(), ib.gpuaddr)));
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(ts, _)| *ts == 2));

        seen.clear();
        sched.parse_fault_cmdobjs(|obj, ib| seen.push((obj.timestamp(), ib.gpuaddr)));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_force_retire_by_firmware() {
        let (fw, _platform, sched) = setup();
        sched.set_force_retire_fw(true);
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        let obj = cmd(&ctx);
        sched.queue_cmds(&ctx, &[obj.clone()], 0).unwrap();

        sched.report_fault(
            FaultCode::SOFT,
            Some(ContextBad {
                gc: site(1, 1),
                ..ContextBad::default()
            }),
        );
        sched.run_worker();

        assert!(obj
            .as_command()
            .unwrap()
            .state()
            .contains(CmdPriv::NOP_SUBMISSION));
        assert_eq!(fw.retired(ContextId(1)), 0);
        assert_eq!(sched.inflight(), 1);
    }

    #[test]
    fn test_no_double_destroy_across_replay_and_retire() {
        let (fw, _platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 2, ContextFlags::empty()).unwrap();
        let objs: Vec<_> = (0..3).map(|_| cmd(&ctx)).collect();
        sched.queue_cmds(&ctx, &objs, 0).unwrap();

        fw.retire(ContextId(1), 2);
        sched.report_fault(FaultCode::SOFT, None);
        sched.run_worker();
        fw.retire(ContextId(1), 3);
        sched.run_worker();
        sched.run_worker();

        assert!(objs.iter().all(|o| o.is_destroyed()));
        assert_eq!(sched.stats().destroyed, 3);
        assert_eq!(sched.inflight(), 0);
    }
}
