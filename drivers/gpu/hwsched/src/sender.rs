//! # Command Sender
//!
//! Hands one draw object to firmware under the device-state lock and
//! records it on the in-flight list.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::config::MAX_DISPATCH_IBS;
use crate::drawobj::{DrawObject, Tracking};
use crate::error::{Error, Result};
use crate::scheduler::{Hwsched, SchedCounters, SchedFlags};

// =============================================================================
// DEVICE STATE
// =============================================================================

/// One submission handed to firmware and not yet retired
#[derive(Debug)]
pub(crate) struct InflightRecord {
    drawobj: Arc<DrawObject>,
}

impl InflightRecord {
    pub(crate) fn new(drawobj: Arc<DrawObject>) -> Self {
        Self { drawobj }
    }

    pub(crate) fn drawobj(&self) -> &Arc<DrawObject> {
        &self.drawobj
    }
}

/// State owned by the device lock
#[derive(Debug)]
pub(crate) struct DeviceState {
    /// Submissions in flight; always equals `cmd_list.len()` once the lock
    /// is released
    pub(crate) inflight: u32,
    /// In-flight records in submission order
    pub(crate) cmd_list: Vec<InflightRecord>,
    /// The one oversized command object allowed in flight
    pub(crate) big_cmdobj: Option<Arc<DrawObject>>,
    /// Persistent background workload
    pub(crate) recurring: Option<Arc<DrawObject>>,
}

impl DeviceState {
    pub(crate) fn new() -> Self {
        Self {
            inflight: 0,
            cmd_list: Vec::new(),
            big_cmdobj: None,
            recurring: None,
        }
    }
}

// =============================================================================
// SUBMISSION
// =============================================================================

impl Hwsched {
    /// Whether submissions must be refused right now
    pub(crate) fn abort_submission(&self) -> bool {
        self.halt.load(Ordering::Acquire) != 0 || self.recovery.unusable()
    }

    /// Send one draw object to firmware
    pub(crate) fn sendcmd(&self, obj: &Arc<DrawObject>) -> Result<()> {
        let mut device = self.device.lock();

        if self.abort_submission() {
            return Err(Error::Busy);
        }

        if obj.context().is_detached() {
            return Err(Error::ContextDetached);
        }

        device.inflight += 1;

        if device.inflight == 1 && !self.flags.contains(SchedFlags::POWER) {
            if let Err(err) = self.platform.active_count_get() {
                device.inflight -= 1;
                return Err(err);
            }
            self.flags.insert(SchedFlags::POWER);
        }

        if let Tracking::Sync(sync) = obj.tracking() {
            if sync.seqno() == 0 {
                sync.assign_seqno(obj.context().next_sync_seqno());
            }
        }

        if let Err(err) = self.fw.submit_drawobj(obj) {
            // Drop the vote taken for a first submission
            if device.inflight == 1 {
                self.platform.active_count_put();
                self.flags.remove(SchedFlags::POWER);
            }
            device.inflight -= 1;
            return Err(err);
        }

        if device.inflight == 1 && !self.flags.test_and_set(SchedFlags::ACTIVE) {
            self.idle_gate.reinit();
        }

        if obj.numibs() > MAX_DISPATCH_IBS {
            device.big_cmdobj = Some(Arc::clone(obj));
            self.big_busy.store(true, Ordering::Release);
        }

        device.cmd_list.push(InflightRecord::new(Arc::clone(obj)));
        SchedCounters::bump(&self.stats.submitted);

        log::debug!(
            "ctx {} ts {} {:?} submitted, inflight {}",
            obj.context().id(),
            obj.timestamp(),
            obj.obj_type(),
            device.inflight
        );
        Ok(())
    }
}
