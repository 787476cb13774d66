//! # Scheduler Configuration
//!
//! Compile-time limits and the runtime tunables exposed as device knobs.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use static_assertions::const_assert;

// =============================================================================
// LIMITS
// =============================================================================

/// Slots in each context ring. One slot is always kept free so a popped
/// object can be pushed back to the head.
pub const DRAWQUEUE_SLOTS: usize = 128;

/// Default number of objects a context may hold before producers sleep
pub const DEFAULT_DRAWQUEUE_SIZE: usize = DRAWQUEUE_SLOTS - 1;

/// Maximum command buffers in a single command object
pub const MAX_IBS: usize = 2000;

/// Command objects above this many IBs are "big": only one may be in flight
pub const MAX_DISPATCH_IBS: usize = 200;

/// Number of priority levels (0 is the highest)
pub const PRIORITY_LEVELS: usize = 16;

/// Upper bound on wait conditions carried by one sync object
pub const MAX_SYNC_EVENTS: usize = 64;

/// Sync objects blocking dispatch for longer than this are reported
pub const SYNC_CANARY_TIMEOUT_MS: u64 = 5000;

/// How long recovery waits for an overlapping suspend/resume
pub const SUSPEND_RECOVERY_GATE_TIMEOUT_MS: u64 = 5000;

/// Bound on waiting for the idle gate and for hardware idle
pub const IDLE_TIMEOUT_MS: u64 = 80;

/// Bound on waiting for context queues to drain before idling
pub const DRAIN_TIMEOUT_MS: u64 = 100;

/// Pending hardware fences printed when they are torn down
pub const PENDING_FENCE_LOG_LIMIT: usize = 5;

const_assert!(DEFAULT_DRAWQUEUE_SIZE < DRAWQUEUE_SLOTS);
const_assert!(MAX_DISPATCH_IBS < MAX_IBS);
const_assert!(MAX_SYNC_EVENTS <= u64::BITS as usize);
const_assert!(PRIORITY_LEVELS <= u8::MAX as usize);

// =============================================================================
// TUNABLES
// =============================================================================

/// Runtime-adjustable scheduler knobs
///
/// Reads are lock-free; writers clamp values to sane ranges.
#[derive(Debug)]
pub struct Tunables {
    drawqueue_size: AtomicUsize,
    context_queue_wait_ms: AtomicU32,
    fault_throttle_time_ms: AtomicU32,
    fault_throttle_burst: AtomicU32,
    preemption: AtomicBool,
    ft_long_ib_detect: AtomicBool,
}

impl Tunables {
    /// Create tunables with default values
    pub const fn new() -> Self {
        Self {
            drawqueue_size: AtomicUsize::new(DEFAULT_DRAWQUEUE_SIZE),
            context_queue_wait_ms: AtomicU32::new(10000),
            fault_throttle_time_ms: AtomicU32::new(2000),
            fault_throttle_burst: AtomicU32::new(3),
            preemption: AtomicBool::new(true),
            ft_long_ib_detect: AtomicBool::new(true),
        }
    }

    /// Context queue size
    pub fn drawqueue_size(&self) -> usize {
        self.drawqueue_size.load(Ordering::Relaxed)
    }

    /// Set the context queue size, clamped to `[2, DRAWQUEUE_SLOTS - 1]`
    pub fn set_drawqueue_size(&self, size: usize) {
        let size = size.clamp(2, DRAWQUEUE_SLOTS - 1);
        self.drawqueue_size.store(size, Ordering::Relaxed);
    }

    /// Milliseconds a producer may wait for room in its context queue
    pub fn context_queue_wait_ms(&self) -> u64 {
        u64::from(self.context_queue_wait_ms.load(Ordering::Relaxed))
    }

    /// Set the context queue wait
    pub fn set_context_queue_wait_ms(&self, ms: u32) {
        self.context_queue_wait_ms.store(ms, Ordering::Relaxed);
    }

    /// Fault throttle window in milliseconds
    pub fn fault_throttle_time_ms(&self) -> u64 {
        u64::from(self.fault_throttle_time_ms.load(Ordering::Relaxed))
    }

    /// Set the fault throttle window
    pub fn set_fault_throttle_time_ms(&self, ms: u32) {
        self.fault_throttle_time_ms.store(ms, Ordering::Relaxed);
    }

    /// Faults tolerated within the throttle window
    pub fn fault_throttle_burst(&self) -> u32 {
        self.fault_throttle_burst.load(Ordering::Relaxed)
    }

    /// Set the fault throttle burst
    pub fn set_fault_throttle_burst(&self, burst: u32) {
        self.fault_throttle_burst.store(burst, Ordering::Relaxed);
    }

    /// Whether preemption is enabled
    pub fn preemption(&self) -> bool {
        self.preemption.load(Ordering::Relaxed)
    }

    pub(crate) fn store_preemption(&self, enable: bool) -> bool {
        self.preemption.swap(enable, Ordering::Relaxed)
    }

    /// Whether long-IB fault detection is enabled
    pub fn ft_long_ib_detect(&self) -> bool {
        self.ft_long_ib_detect.load(Ordering::Relaxed)
    }

    /// Toggle long-IB fault detection
    pub fn set_ft_long_ib_detect(&self, enable: bool) {
        self.ft_long_ib_detect.store(enable, Ordering::Relaxed);
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new()
    }
}
