//! # Retirement
//!
//! Finalizes work the firmware has finished: in-flight records are checked
//! against the per-context retired timestamp (or the sync watermark for
//! sync objects) and destroyed in submission order.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::drawobj::{CmdPriv, DrawObjFlags, DrawObject, SyncObj, Tracking};
use crate::ops::TimestampKind;
use crate::scheduler::{Hwsched, SchedCounters};
use crate::sender::DeviceState;
use crate::timestamp::timestamp_reached;

impl Hwsched {
    /// Whether firmware has retired the object's timestamp
    pub(crate) fn timestamp_retired(&self, obj: &DrawObject) -> bool {
        let retired = self
            .fw
            .read_timestamp(obj.context().id(), TimestampKind::Retired);
        timestamp_reached(obj.timestamp(), retired)
    }

    /// Whether firmware has consumed a hardware-backed sync object
    pub(crate) fn syncobj_retired(&self, obj: &DrawObject, sync: &SyncObj) -> bool {
        let watermark = self.fw.sync_retired_timestamp(obj.context().id());
        sync.seqno() != 0 && timestamp_reached(sync.seqno(), watermark)
    }

    /// Write the object's timestamp as retired without destroying it
    pub(crate) fn retire_timestamp_only(&self, obj: &DrawObject) {
        let context = obj.context();

        self.fw.write_timestamp(context.id(), obj.timestamp());
        if obj.flags().contains(DrawObjFlags::END_OF_FRAME) {
            context.count_frame();
        }

        self.platform.process_events();
    }

    /// Retire an object that never reaches firmware
    pub(crate) fn retire_timestamp(&self, obj: &DrawObject) {
        self.retire_timestamp_only(obj);
        SchedCounters::bump(&self.stats.retired);
        self.destroy_drawobj(obj);

        log::debug!("ctx {} ts {} retired on host", obj.context().id(), obj.timestamp());
    }

    /// Finalize an in-flight object tracked by timestamp
    pub(crate) fn retire_cmdobj(&self, device: &mut DeviceState, obj: &Arc<DrawObject>) {
        // Expired markers counted their frame when the timestamp was written
        let expired = obj
            .as_cmdobj()
            .is_some_and(|cmd| cmd.state().contains(CmdPriv::MARKER_EXPIRED));
        if obj.flags().contains(DrawObjFlags::END_OF_FRAME) && !expired {
            obj.context().count_frame();
        }

        if device
            .big_cmdobj
            .as_ref()
            .is_some_and(|big| Arc::ptr_eq(big, obj))
        {
            device.big_cmdobj = None;
            self.big_busy.store(false, Ordering::Release);
        }

        SchedCounters::bump(&self.stats.retired);
        self.destroy_drawobj(obj);

        log::debug!(
            "ctx {} ts {} {:?} retired",
            obj.context().id(),
            obj.timestamp(),
            obj.obj_type()
        );
    }

    /// Finalize a hardware-backed sync object
    pub(crate) fn destroy_hw_syncobj(&self, obj: &DrawObject) {
        SchedCounters::bump(&self.stats.retired);
        self.destroy_drawobj(obj);
    }

    /// Retire the object if firmware is done with it
    fn drawobj_retired(&self, device: &mut DeviceState, obj: &Arc<DrawObject>) -> bool {
        match obj.tracking() {
            Tracking::Sync(sync) => {
                if !self.syncobj_retired(obj, sync) {
                    return false;
                }
                self.destroy_hw_syncobj(obj);
                true
            }
            Tracking::Timestamp => {
                if !self.timestamp_retired(obj) {
                    return false;
                }
                self.retire_cmdobj(device, obj);
                true
            }
        }
    }

    /// Scan the in-flight list and drop everything firmware has retired
    ///
    /// Returns the number of records removed.
    pub(crate) fn retire_inflight(&self) -> usize {
        let mut device = self.device.lock();
        let records = core::mem::take(&mut device.cmd_list);
        let mut retired = 0;

        for record in records {
            if self.drawobj_retired(&mut device, record.drawobj()) {
                device.inflight -= 1;
                retired += 1;
            } else {
                device.cmd_list.push(record);
            }
        }

        retired
    }
}
