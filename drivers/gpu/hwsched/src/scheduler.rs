//! # Scheduler State
//!
//! The device-wide scheduler object: context registry, per-priority job
//! lists, the in-flight device state and recovery control.
//!
//! Lock order is `dispatcher` → `recovery` → `device` → per-context queue.
//! Interrupt-side entry points ([`Hwsched::report_fault`],
//! [`Hwsched::queue_context`]) touch only atomics and the lock-free job
//! lists.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;
use spin::{Mutex, RwLock};
use static_assertions::assert_impl_all;

use crate::config::{Tunables, PRIORITY_LEVELS};
use crate::context::{Context, ContextFlags, ContextId, ContextPriv};
use crate::drawobj::{CmdPriv, DrawObject};
use crate::error::{Error, Result};
use crate::flags::AtomicBits;
use crate::job::JobList;
use crate::ops::{Firmware, Platform};
use crate::power::IdleGate;
use crate::recovery::RecoveryControl;
use crate::sender::DeviceState;

// =============================================================================
// FLAGS
// =============================================================================

bitflags! {
    /// Device-wide scheduler state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SchedFlags: u32 {
        /// Holding an active power vote
        const POWER = 1 << 0;
        /// At least one submission in flight; idle gate armed
        const ACTIVE = 1 << 1;
        /// Hardware fences are registered
        const HW_FENCE = 1 << 2;
        /// Firmware retires faulted submissions itself
        const FORCE_RETIRE_FW = 1 << 3;
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Draw objects accepted into context queues
    pub queued: u64,
    /// Submissions handed to firmware
    pub submitted: u64,
    /// Timestamps retired
    pub retired: u64,
    /// Objects pushed back to a context queue
    pub requeued: u64,
    /// Objects destroyed
    pub destroyed: u64,
    /// Faults reported
    pub faults: u64,
    /// Recovery passes run
    pub recoveries: u64,
    /// Contexts invalidated by the fault throttle
    pub throttled: u64,
    /// Dispatch passes run from the submitting thread
    pub inline_passes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SchedCounters {
    pub(crate) queued: AtomicU64,
    pub(crate) submitted: AtomicU64,
    pub(crate) retired: AtomicU64,
    pub(crate) requeued: AtomicU64,
    pub(crate) destroyed: AtomicU64,
    pub(crate) faults: AtomicU64,
    pub(crate) recoveries: AtomicU64,
    pub(crate) throttled: AtomicU64,
    pub(crate) inline_passes: AtomicU64,
}

impl SchedCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedStats {
        SchedStats {
            queued: self.queued.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            inline_passes: self.inline_passes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// HWSCHED
// =============================================================================

/// Hardware command scheduler for one GPU device
pub struct Hwsched {
    pub(crate) fw: Arc<dyn Firmware>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) tunables: Tunables,
    pub(crate) contexts: RwLock<HashMap<ContextId, Arc<Context>>>,
    pub(crate) jobs: [JobList; PRIORITY_LEVELS],
    pub(crate) requeue: [JobList; PRIORITY_LEVELS],
    /// Serializes dispatch passes and excludes them from recovery
    pub(crate) dispatcher: Mutex<()>,
    pub(crate) device: Mutex<DeviceState>,
    pub(crate) flags: AtomicBits<SchedFlags>,
    /// Mirrors `DeviceState::big_cmdobj` for lock-free reads under a
    /// context lock
    pub(crate) big_busy: AtomicBool,
    pub(crate) idle_gate: IdleGate,
    pub(crate) halt: AtomicU32,
    pub(crate) skip_inline_submit: AtomicBool,
    pub(crate) recovery: RecoveryControl,
    pub(crate) hw_fence_pending: AtomicU32,
    pub(crate) stats: SchedCounters,
}

assert_impl_all!(Hwsched: Send, Sync);

impl Hwsched {
    /// Create a scheduler on top of a firmware back end and host platform
    pub fn new(fw: Arc<dyn Firmware>, platform: Arc<dyn Platform>) -> Self {
        Self {
            fw,
            platform,
            tunables: Tunables::new(),
            contexts: RwLock::new(HashMap::new()),
            jobs: core::array::from_fn(|_| JobList::new()),
            requeue: core::array::from_fn(|_| JobList::new()),
            dispatcher: Mutex::new(()),
            device: Mutex::new(DeviceState::new()),
            flags: AtomicBits::new(),
            big_busy: AtomicBool::new(false),
            idle_gate: IdleGate::new(),
            halt: AtomicU32::new(0),
            skip_inline_submit: AtomicBool::new(false),
            recovery: RecoveryControl::new(),
            hw_fence_pending: AtomicU32::new(0),
            stats: SchedCounters::default(),
        }
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// Register a new context
    pub fn create_context(
        &self,
        id: ContextId,
        priority: u8,
        flags: ContextFlags,
    ) -> Result<Arc<Context>> {
        let mut contexts = self.contexts.write();
        if contexts.contains_key(&id) {
            return Err(Error::InvalidArgument);
        }

        let context = Arc::new(Context::new(id, priority, flags));
        contexts.insert(id, Arc::clone(&context));

        log::debug!("ctx {} created prio {} flags {:?}", id, context.priority(), flags);
        Ok(context)
    }

    /// Look up a registered context
    pub fn get_context(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.read().get(&id).cloned()
    }

    /// Owner went away: drop queued work and unregister the context
    ///
    /// In-flight submissions are left to retire normally.
    pub fn detach_context(&self, context: &Arc<Context>) {
        if context.set_state(ContextPriv::DETACHED).contains(ContextPriv::DETACHED) {
            return;
        }

        let queued = context.queue.lock().drain();
        for obj in &queued {
            self.destroy_drawobj(obj);
        }
        context.wake_waiters();

        self.contexts.write().remove(&context.id());
        self.fw.unregister_context(context.id());

        log::debug!("ctx {} detached, dropped {} queued", context.id(), queued.len());
    }

    /// Mark a context invalid: drop queued work and its hardware fences
    pub fn invalidate_context(&self, context: &Arc<Context>) {
        if context.set_state(ContextPriv::INVALID).contains(ContextPriv::INVALID) {
            return;
        }

        let queued = {
            let mut queue = context.queue.lock();
            self.cancel_context_hw_fences(&mut queue);
            queue.drain()
        };
        for obj in &queued {
            self.destroy_drawobj(obj);
        }
        context.wake_waiters();

        log::info!("ctx {} invalidated, dropped {} queued", context.id(), queued.len());
    }

    /// Blame a context for a fault and invalidate it
    pub(crate) fn set_guilty(&self, context: &Arc<Context>) {
        context.set_state(ContextPriv::GUILTY);
        self.invalidate_context(context);
    }

    /// Forget firmware registration of every context (power collapse)
    pub fn unregister_contexts(&self) {
        for context in self.contexts.read().values() {
            self.fw.unregister_context(context.id());
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Device came up: let the worker pick up anything pending
    pub fn start(&self) {
        log::info!("hwsched started");
        self.platform.schedule_worker();
    }

    /// Device is closing: drop every queued and in-flight object
    pub fn close(&self) {
        let _dispatcher = self.dispatcher.lock();

        self.deregister_hw_fence();

        let contexts: Vec<Arc<Context>> = self.contexts.read().values().cloned().collect();
        for context in &contexts {
            let queued = context.queue.lock().drain();
            for obj in &queued {
                self.destroy_drawobj(obj);
            }
            context.wake_waiters();
        }

        let dropped = {
            let mut device = self.device.lock();
            let records = core::mem::take(&mut device.cmd_list);
            for record in &records {
                self.destroy_drawobj(record.drawobj());
            }
            device.inflight = 0;
            device.big_cmdobj = None;
            if let Some(recurring) = device.recurring.take() {
                self.destroy_drawobj(&recurring);
            }
            self.big_busy.store(false, Ordering::Release);
            records.len()
        };

        for list in self.jobs.iter().chain(self.requeue.iter()) {
            drop(list.take_all());
        }

        self.power_down();
        log::info!("hwsched closed, dropped {} in flight", dropped);
    }

    // =========================================================================
    // Recurring workload
    // =========================================================================

    /// Start a recurring (persistent background) command object
    pub fn set_recurring(&self, obj: Arc<DrawObject>) -> Result<()> {
        let cmd = obj.as_command().ok_or(Error::InvalidArgument)?;
        obj.context().check_state()?;

        let mut device = self.device.lock();
        if device.recurring.is_some() {
            return Err(Error::Busy);
        }

        cmd.clear(CmdPriv::RECURRING_STOP);
        cmd.set(CmdPriv::RECURRING_START);
        self.fw.send_recurring(&obj)?;
        device.recurring = Some(obj);
        Ok(())
    }

    /// Stop the recurring command object, if any
    pub fn clear_recurring(&self) -> Result<()> {
        let mut device = self.device.lock();
        let Some(obj) = device.recurring.take() else {
            return Ok(());
        };

        if let Some(cmd) = obj.as_command() {
            cmd.clear(CmdPriv::RECURRING_START);
            cmd.set(CmdPriv::RECURRING_STOP);
        }
        let ret = self.fw.send_recurring(&obj);
        self.destroy_drawobj(&obj);
        ret
    }

    /// Current recurring command object
    pub fn recurring(&self) -> Option<Arc<DrawObject>> {
        self.device.lock().recurring.clone()
    }

    // =========================================================================
    // Tunables
    // =========================================================================

    /// Runtime knobs
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Enable or disable preemption, telling firmware on change
    pub fn set_preemption(&self, enable: bool) {
        if self.tunables.store_preemption(enable) != enable {
            let _device = self.device.lock();
            self.fw.set_preemption(enable);
        }
    }

    /// Preemptions performed by firmware
    pub fn preempt_count(&self) -> u32 {
        let _device = self.device.lock();
        self.fw.preempt_count()
    }

    /// Allow or forbid dispatch passes on the submitting thread
    pub fn set_inline_submit(&self, enable: bool) {
        self.skip_inline_submit.store(!enable, Ordering::Release);
    }

    /// Let firmware retire faulted submissions instead of the host
    pub fn set_force_retire_fw(&self, enable: bool) {
        if enable {
            self.flags.insert(SchedFlags::FORCE_RETIRE_FW);
        } else {
            self.flags.remove(SchedFlags::FORCE_RETIRE_FW);
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Scheduler state bits
    pub fn sched_flags(&self) -> SchedFlags {
        self.flags.get()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SchedStats {
        self.stats.snapshot()
    }

    /// Submissions currently in flight
    pub fn inflight(&self) -> u32 {
        self.device.lock().inflight
    }

    /// In-flight objects in submission order
    pub fn inflight_records(&self) -> Vec<Arc<DrawObject>> {
        self.device
            .lock()
            .cmd_list
            .iter()
            .map(|r| Arc::clone(r.drawobj()))
            .collect()
    }

    /// Release an object's resources exactly once
    pub(crate) fn destroy_drawobj(&self, obj: &DrawObject) {
        if obj.destroy() {
            SchedCounters::bump(&self.stats.destroyed);
        }
    }
}
