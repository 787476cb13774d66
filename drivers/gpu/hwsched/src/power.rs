//! # Power and Idle
//!
//! The scheduler holds one active power vote while anything is in flight.
//! The idle gate is armed by the first submission and completed when the
//! last one retires, so suspend paths can wait for the GPU to drain.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{DRAIN_TIMEOUT_MS, IDLE_TIMEOUT_MS};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::poll_until;
use crate::scheduler::{Hwsched, SchedFlags};

// =============================================================================
// IDLE GATE
// =============================================================================

/// One-shot completion signaled when in-flight work drains to zero
#[derive(Debug)]
pub(crate) struct IdleGate {
    done: AtomicBool,
}

impl IdleGate {
    /// Starts completed: nothing is in flight
    pub(crate) const fn new() -> Self {
        Self {
            done: AtomicBool::new(true),
        }
    }

    pub(crate) fn reinit(&self) {
        self.done.store(false, Ordering::Release);
    }

    pub(crate) fn complete_all(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

// =============================================================================
// POWER
// =============================================================================

impl Hwsched {
    /// Nothing in flight: complete the idle gate and drop the power vote
    pub(crate) fn power_down(&self) {
        if self.flags.test_and_clear(SchedFlags::ACTIVE) {
            self.idle_gate.complete_all();
        }

        if self.flags.test_and_clear(SchedFlags::POWER) {
            self.platform.active_count_put();
        }
    }

    /// Halt submissions and wait for in-flight work to retire
    fn wait_idle_gate(&self) -> Result<()> {
        self.run_worker();
        if self.recovery.unusable() {
            return Err(Error::Deadlock);
        }

        let done = poll_until(self.platform.as_ref(), IDLE_TIMEOUT_MS, || {
            self.run_worker();
            self.idle_gate.is_complete()
        });

        if self.recovery.unusable() {
            return Err(Error::Deadlock);
        }
        if !done {
            log::warn!("hwsched halt timeout, {} in flight", self.inflight());
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Wait for the scheduler and the GPU to go idle
    ///
    /// Fails with [`Error::Deadlock`] if a fault is pending or the last
    /// reset failed.
    pub fn idle(&self) -> Result<()> {
        if !self.platform.is_awake() {
            return Ok(());
        }

        self.halt.fetch_add(1, Ordering::AcqRel);
        let ret = self.wait_idle_gate();
        self.halt.fetch_sub(1, Ordering::AcqRel);
        ret?;

        let idle = poll_until(self.platform.as_ref(), IDLE_TIMEOUT_MS, || {
            self.recovery.unusable() || self.fw.hw_is_idle()
        });

        if self.recovery.unusable() {
            return Err(Error::Deadlock);
        }
        if !idle {
            log::warn!("gpu did not go idle");
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Let every context queue empty, then idle
    pub fn drain_and_idle(&self) -> Result<()> {
        let contexts: Vec<Arc<Context>> = self.contexts.read().values().cloned().collect();

        let drained = poll_until(self.platform.as_ref(), DRAIN_TIMEOUT_MS, || {
            self.run_worker();
            contexts.iter().all(|c| c.is_bad() || c.queued() == 0)
        });
        if !drained {
            return Err(Error::Timeout);
        }

        self.idle()
    }

    /// Quiesce the scheduler ahead of power collapse
    ///
    /// Backs off with [`Error::Busy`] if recovery is pending; the worker
    /// is kicked so it runs first.
    pub fn suspend(&self) -> Result<()> {
        let _recovery = self.recovery.mutex.lock();

        if self.recovery.fault_pending() {
            self.platform.schedule_worker();
            return Err(Error::Busy);
        }

        if let Err(err) = self.drain_and_idle() {
            // A fault raised while draining still needs the worker
            if self.recovery.fault_pending() {
                self.platform.schedule_worker();
            }
            return Err(err);
        }
        self.unregister_contexts();

        log::info!("hwsched suspended");
        Ok(())
    }
}
