//! # Submission
//!
//! Producer-side entry points: validate a batch of draw objects, admit it
//! into the context queue, assign timestamps and publish a job for the
//! dispatch worker.
//!
//! Admission may block the caller until the context queue has room. All
//! other entry points here are safe from callback context.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::config::MAX_IBS;
use crate::context::{Context, ContextFlags, ContextPriv, ContextQueue};
use crate::drawobj::{DrawObjKind, DrawObjType, DrawObject, SyncEvent};
use crate::error::{Error, Result};
use crate::ops::{poll_until, TimestampKind};
use crate::scheduler::{Hwsched, SchedCounters};
use crate::timestamp::{timestamp_cmp, timestamp_reached};

impl Hwsched {
    // =========================================================================
    // Validation
    // =========================================================================

    fn verify_drawobjs(&self, context: &Arc<Context>, drawobjs: &[Arc<DrawObject>]) -> Result<()> {
        let count = drawobjs.len();

        // One slot stays free so the worker can always push back the head
        if count == 0 || count > self.tunables.drawqueue_size() - 1 {
            return Err(Error::InvalidArgument);
        }

        if drawobjs.iter().any(|obj| obj.numibs() > MAX_IBS) {
            return Err(Error::InvalidArgument);
        }

        context.check_state()?;

        if drawobjs
            .iter()
            .any(|obj| !Arc::ptr_eq(obj.context(), context))
        {
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }

    /// Reject a non-increasing caller timestamp before touching the queue
    fn check_user_timestamp(
        &self,
        context: &Context,
        queue: &ContextQueue,
        drawobjs: &[Arc<DrawObject>],
        user_ts: u32,
    ) -> Result<()> {
        if !context.flags().contains(ContextFlags::USER_TS) {
            return Ok(());
        }

        // A lone sync object carries no timestamp; user_ts may be 0
        if drawobjs.len() == 1 && drawobjs[0].obj_type() == DrawObjType::Sync {
            return Ok(());
        }

        if timestamp_cmp(queue.timestamp, user_ts).is_ge() {
            return Err(Error::TimestampRange);
        }

        let timestamped = drawobjs
            .iter()
            .filter(|obj| {
                matches!(
                    obj.kind(),
                    DrawObjKind::Command(_) | DrawObjKind::Marker(_) | DrawObjKind::Bind(_)
                )
            })
            .count();
        if timestamped > 1 {
            return Err(Error::TimestampRange);
        }

        Ok(())
    }

    // =========================================================================
    // Queuing
    // =========================================================================

    /// Push one object according to its type
    ///
    /// Returns the timestamp reported back to the caller and whether the
    /// object landed in the queue.
    fn queue_drawobj(
        &self,
        context: &Context,
        queue: &mut ContextQueue,
        obj: &Arc<DrawObject>,
        timestamp: u32,
        user_ts: Option<u32>,
    ) -> Result<(u32, bool)> {
        match obj.kind() {
            DrawObjKind::Command(_) => {
                let ts = queue.next_timestamp(user_ts)?;
                obj.set_timestamp(ts);

                // Markers queued ahead must flow through dispatch to keep
                // time linear
                queue.mark_markers_skip();
                queue.queued_timestamp = ts;
                queue.push(Arc::clone(obj))?;
                Ok((ts, true))
            }
            DrawObjKind::Marker(marker) => {
                let ts = queue.next_timestamp(user_ts)?;
                obj.set_timestamp(ts);

                let retired = self.fw.read_timestamp(context.id(), TimestampKind::Retired);
                if queue.is_empty() && timestamp_reached(queue.queued_timestamp, retired) {
                    self.retire_timestamp(obj);
                    return Ok((ts, false));
                }

                marker.set_marker_timestamp(queue.queued_timestamp);
                queue.queued_timestamp = ts;
                queue.push(Arc::clone(obj))?;
                Ok((ts, true))
            }
            DrawObjKind::Sync(_) => {
                obj.set_timestamp(0);
                queue.push(Arc::clone(obj))?;
                Ok((0, true))
            }
            DrawObjKind::Bind(_) => {
                let ts = queue.next_timestamp(user_ts)?;
                obj.set_timestamp(ts);
                queue.queued_timestamp = ts;
                queue.push(Arc::clone(obj))?;
                Ok((ts, true))
            }
            DrawObjKind::Timeline => {
                // Never reaches firmware; a later marker reports time
                obj.set_timestamp(0);
                queue.push(Arc::clone(obj))?;
                Ok((timestamp, true))
            }
        }
    }

    /// Queue a batch of draw objects on `context`
    ///
    /// `timestamp` is the caller-supplied timestamp for `USER_TS` contexts
    /// and is ignored otherwise. Returns the timestamp of the last queued
    /// object (0 for a sync object).
    ///
    /// Fails with [`Error::ContextFaulted`] if the batch was queued but the
    /// context faulted since the previous submission.
    pub fn queue_cmds(
        &self,
        context: &Arc<Context>,
        drawobjs: &[Arc<DrawObject>],
        timestamp: u32,
    ) -> Result<u32> {
        self.verify_drawobjs(context, drawobjs)?;

        // Idling holds producers back
        let wait_ms = self.tunables.context_queue_wait_ms();
        if !poll_until(self.platform.as_ref(), wait_ms, || {
            self.halt.load(Ordering::Acquire) == 0
        }) {
            return Err(Error::Timeout);
        }

        let mut queue = context.lock_with_room(
            drawobjs.len(),
            self.tunables.drawqueue_size(),
            wait_ms,
            self.platform.as_ref(),
        )?;

        self.check_user_timestamp(context, &queue, drawobjs, timestamp)?;
        let user_ts = context
            .flags()
            .contains(ContextFlags::USER_TS)
            .then_some(timestamp);

        let mut ret = Ok(timestamp);
        let mut pushed = 0;
        for obj in drawobjs {
            match self.queue_drawobj(context, &mut queue, obj, timestamp, user_ts) {
                Ok((ts, queued)) => {
                    ret = Ok(ts);
                    if queued {
                        pushed += 1;
                        SchedCounters::bump(&self.stats.queued);
                        log::debug!(
                            "ctx {} ts {} {:?} queued, {} in queue",
                            context.id(),
                            obj.timestamp(),
                            obj.obj_type(),
                            queue.queued()
                        );
                    }
                }
                Err(err) => {
                    ret = Err(err);
                    break;
                }
            }
        }
        drop(queue);

        if pushed > 0 {
            self.publish(context);
            self.issuecmds_inline();
        }

        let ts = ret?;
        if context.test_and_clear_state(ContextPriv::FAULT) {
            return Err(Error::ContextFaulted);
        }
        Ok(ts)
    }

    /// Tell the scheduler `context` has work again (dependency resolved)
    ///
    /// Safe from callback context.
    pub fn queue_context(&self, context: &Arc<Context>) {
        if context.is_detached() {
            return;
        }

        self.publish(context);
        self.platform.schedule_worker();
    }

    // =========================================================================
    // Asynchronous completions
    // =========================================================================

    /// Memory bind finished; the bind object may now retire
    pub fn bind_complete(&self, obj: &Arc<DrawObject>) {
        let Some(bind) = obj.as_bind() else {
            return;
        };

        bind.complete();
        log::debug!("ctx {} ts {} bind done", obj.context().id(), obj.timestamp());
        self.queue_context(obj.context());
    }

    /// External fence `index` of a sync object signaled
    ///
    /// Requeues the context once the last pending event clears.
    pub fn signal_sync_event(&self, obj: &Arc<DrawObject>, index: usize) {
        if obj.signal_sync_event(index) {
            self.queue_context(obj.context());
        }
    }

    /// Report sync objects that have blocked dispatch for too long
    ///
    /// Each object is reported once. Returns how many were reported.
    pub fn check_sync_canaries(&self) -> usize {
        let now = self.platform.now_ms();
        let contexts: alloc::vec::Vec<Arc<Context>> =
            self.contexts.read().values().cloned().collect();
        let mut expired = 0;

        for context in &contexts {
            let queue = context.queue.lock();
            for obj in queue.iter() {
                let Some(sync) = obj.as_sync() else {
                    continue;
                };
                if !sync.canary_expired(now) {
                    continue;
                }

                expired += 1;
                log::warn!(
                    "ctx {} sync object blocked, pending {:#x}",
                    context.id(),
                    sync.pending()
                );
                for (i, event) in sync.events().iter().enumerate() {
                    if sync.pending() & (1 << i) == 0 {
                        continue;
                    }
                    match event {
                        SyncEvent::Timestamp { context: dep, timestamp } => log::warn!(
                            "  [{}] ctx {} ts {} retired {}",
                            i,
                            dep.id(),
                            timestamp,
                            self.fw.read_timestamp(dep.id(), TimestampKind::Retired)
                        ),
                        SyncEvent::Fence(fence) => log::warn!(
                            "  [{}] fence signaled:{} seqno:{}",
                            i,
                            fence.is_signaled(),
                            fence.seqno()
                        ),
                    }
                }
            }
        }

        expired
    }
}
