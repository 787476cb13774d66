//! # Back-end Operations
//!
//! Seams between the scheduler core and the world around it.
//!
//! ```text
//!            queue_cmds / queue_context
//!                       │
//!               ┌───────▼────────┐      Platform
//!               │    Hwsched     │────▶ (power vote, clock,
//!               └───────┬────────┘       worker wakeup, notifier)
//!                       │ Firmware
//!                       ▼
//!          target back end (context queues, resets, fences)
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::context::ContextId;
use crate::drawobj::{DrawObject, IbDesc};
use crate::error::Result;
use crate::recovery::FaultCode;

// =============================================================================
// TIMESTAMP KINDS
// =============================================================================

/// Which per-context timestamp to read back from firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampKind {
    /// Last timestamp written to the firmware queue
    Queued,
    /// Last timestamp the GPU started executing
    Consumed,
    /// Last timestamp the GPU finished
    Retired,
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// A command object implicated in a fault, captured for IB parsing
#[derive(Debug, Clone)]
pub struct FaultedCommand {
    /// Owning context
    pub context: ContextId,
    /// Timestamp of the command
    pub timestamp: u32,
    /// Command buffers to parse
    pub ibs: Vec<IbDesc>,
}

/// State handed to the back end for a postmortem capture
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Fault bits that triggered the capture
    pub fault: FaultCode,
    /// Faulting graphics context, if identified
    pub context: Option<ContextId>,
    /// Faulting LPAC context, if identified
    pub lpac_context: Option<ContextId>,
    /// In-flight commands marked as faulted
    pub faulted: Vec<FaultedCommand>,
}

// =============================================================================
// SSR EVENTS
// =============================================================================

/// Subsystem-restart notifications for recurring workloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsrEvent {
    /// Recovery started while a recurring workload was active
    Begin,
    /// Recovery finished and the recurring workload was restarted
    End,
    /// The recurring workload's context died and it was stopped
    Fatal,
}

// =============================================================================
// FIRMWARE
// =============================================================================

/// Target-specific firmware front end
pub trait Firmware: Send + Sync {
    /// Hand one draw object to the firmware queue
    ///
    /// Fails with [`Error::NoSpace`](crate::Error::NoSpace) when the queue
    /// is full.
    fn submit_drawobj(&self, obj: &DrawObject) -> Result<()>;

    /// Read back a context timestamp
    fn read_timestamp(&self, context: ContextId, kind: TimestampKind) -> u32;

    /// Last sync-object sequence number the firmware has retired
    fn sync_retired_timestamp(&self, context: ContextId) -> u32;

    /// Write start and end timestamps for a context
    fn write_timestamp(&self, context: ContextId, timestamp: u32);

    /// Soft-reset the GPU, blaming `context` if `guilty`
    fn soft_reset(&self, context: Option<ContextId>, guilty: bool) -> Result<()>;

    /// Full device reset
    fn hard_reset(&self) -> Result<()>;

    /// Start an asynchronous memory bind; completion is reported through
    /// [`Hwsched::bind_complete`](crate::Hwsched::bind_complete)
    fn bind_ranges(&self, obj: Arc<DrawObject>);

    /// Create a hardware-backed fence for `timestamp`
    fn create_hw_fence(&self, _context: ContextId, _timestamp: u32) -> Result<()> {
        Ok(())
    }

    /// Drop a hardware fence and cancel any pending callbacks on it
    fn cancel_hw_fence(&self, _context: ContextId, _timestamp: u32) {}

    /// Capture device state for postmortem analysis
    fn snapshot(&self, _snapshot: &Snapshot) {}

    /// Send the recurring command object (start or stop per its flags)
    fn send_recurring(&self, _obj: &DrawObject) -> Result<()> {
        Ok(())
    }

    /// Number of preemptions performed by firmware
    fn preempt_count(&self) -> u32 {
        0
    }

    /// Enable or disable preemption
    fn set_preemption(&self, _enable: bool) {}

    /// Forget firmware-side registration of a context
    fn unregister_context(&self, _context: ContextId) {}

    /// Whether the GPU hardware is idle
    fn hw_is_idle(&self) -> bool {
        true
    }
}

// =============================================================================
// PLATFORM
// =============================================================================

/// Host kernel services
pub trait Platform: Send + Sync {
    /// Monotonic time in milliseconds
    fn now_ms(&self) -> u64;

    /// Take an active power vote on the device
    fn active_count_get(&self) -> Result<()>;

    /// Release an active power vote
    fn active_count_put(&self);

    /// Queue the dispatch worker to run [`Hwsched::run_worker`](crate::Hwsched::run_worker)
    fn schedule_worker(&self);

    /// Signal process-level event groups waiting on timestamps
    fn process_events(&self) {}

    /// Deliver a subsystem-restart notification
    fn notify(&self, _event: SsrEvent) {}

    /// Whether a suspend or resume is in progress
    fn suspend_in_progress(&self) -> bool {
        false
    }

    /// Whether the device is powered up
    fn is_awake(&self) -> bool {
        true
    }

    /// Back off inside a polling loop
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Poll `cond` until it holds or `timeout_ms` elapses on the platform clock
pub(crate) fn poll_until(
    platform: &dyn Platform,
    timeout_ms: u64,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = platform.now_ms().saturating_add(timeout_ms);

    loop {
        if cond() {
            return true;
        }
        if platform.now_ms() >= deadline {
            return cond();
        }
        platform.relax();
    }
}
