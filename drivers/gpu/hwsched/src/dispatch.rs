//! # Dispatch Worker
//!
//! Walks contexts with published jobs, highest priority first, and feeds
//! their ready draw objects to the command sender.
//!
//! For each priority level a pass handles the requeue list (contexts that
//! stalled on a transient resource limit) before the fresh job list, and
//! considers each context at most once.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use hashbrown::HashSet;

use crate::config::{MAX_DISPATCH_IBS, PRIORITY_LEVELS, SYNC_CANARY_TIMEOUT_MS};
use crate::context::{Context, ContextId, ContextQueue};
use crate::drawobj::{CmdPriv, CommandObj, DrawObjKind, DrawObject};
use crate::error::{Error, Result};
use crate::ops::TimestampKind;
use crate::scheduler::{Hwsched, SchedCounters, SchedFlags};
use crate::timestamp::timestamp_reached;

impl Hwsched {
    // =========================================================================
    // Context queue
    // =========================================================================

    fn marker_expired(&self, marker: &DrawObject, cmd: &CommandObj) -> bool {
        let retired = self
            .fw
            .read_timestamp(marker.context().id(), TimestampKind::Retired);
        timestamp_reached(cmd.marker_timestamp(), retired)
    }

    /// Retire expired markers and satisfied sync objects from the head of
    /// the queue and return the next object to send
    ///
    /// `Err(Again)` means the head is waiting on a dependency,
    /// `Err(NoSpace)` that a big command must wait for the big slot.
    fn next_drawobj(&self, queue: &mut ContextQueue) -> Result<Option<Arc<DrawObject>>> {
        while let Some(obj) = queue.front().cloned() {
            match obj.kind() {
                DrawObjKind::Command(cmd) => {
                    if cmd.numibs() > MAX_DISPATCH_IBS && self.big_busy.load(Ordering::Acquire) {
                        return Err(Error::NoSpace);
                    }
                    return Ok(Some(obj));
                }
                DrawObjKind::Sync(sync) => {
                    sync.poll(self.fw.as_ref());
                    if !sync.events_pending() {
                        queue.pop();
                        self.destroy_drawobj(&obj);
                        continue;
                    }

                    if self.flags.contains(SchedFlags::HW_FENCE) && sync.is_hw_backed() {
                        return Ok(Some(obj));
                    }

                    sync.arm_canary(self.platform.now_ms() + SYNC_CANARY_TIMEOUT_MS);
                    return Err(Error::Again);
                }
                DrawObjKind::Marker(marker) => {
                    if self.marker_expired(&obj, marker) {
                        let requeued = marker.state().contains(CmdPriv::MARKER_EXPIRED);
                        marker.set(CmdPriv::MARKER_EXPIRED);

                        // Hardware fences waiting on this marker are only
                        // signaled by firmware
                        if self.flags.contains(SchedFlags::HW_FENCE) {
                            if !requeued {
                                self.retire_timestamp_only(&obj);
                            }
                            return Ok(Some(obj));
                        }

                        queue.pop();
                        SchedCounters::bump(&self.stats.retired);
                        self.retire_timestamp_only(&obj);
                        self.destroy_drawobj(&obj);
                        continue;
                    }

                    if marker.state().contains(CmdPriv::SKIP) {
                        return Ok(Some(obj));
                    }
                    return Err(Error::Again);
                }
                DrawObjKind::Bind(bind) => {
                    if bind.is_done() {
                        queue.pop();
                        self.retire_timestamp(&obj);
                        continue;
                    }

                    if bind.start() {
                        self.fw.bind_ranges(Arc::clone(&obj));
                    }
                    return Err(Error::Again);
                }
                DrawObjKind::Timeline => {
                    queue.pop();
                    self.destroy_drawobj(&obj);
                }
            }
        }

        Ok(None)
    }

    /// Put an object that firmware could not take back at the queue head
    fn requeue_drawobj(&self, context: &Context, obj: Arc<DrawObject>) -> Result<()> {
        let mut queue = context.queue.lock();

        if context.is_bad() {
            drop(queue);
            self.destroy_drawobj(&obj);
            return Err(Error::ContextDetached);
        }

        if let Some(cmd) = obj.as_command() {
            cmd.count_requeue();
        }
        SchedCounters::bump(&self.stats.requeued);

        log::debug!("ctx {} ts {} requeued", context.id(), obj.timestamp());
        queue.push_front(obj)
    }

    /// Send a burst of objects from one context
    ///
    /// Returns how many were sent, or the reason the context stopped.
    fn sendcmds(&self, context: &Arc<Context>) -> Result<usize> {
        let mut count = 0;
        let mut ret = Ok(());

        loop {
            let obj = {
                let mut queue = context.queue.lock();
                match self.next_drawobj(&mut queue) {
                    Ok(Some(obj)) => {
                        queue.pop();
                        obj
                    }
                    Ok(None) => break,
                    Err(err) => {
                        ret = Err(err);
                        break;
                    }
                }
            };

            let tracked = obj.as_command().is_some() || obj.is_marker_skip();
            if let Some(cmd) = obj.as_cmdobj().filter(|_| tracked) {
                log::debug!(
                    "ctx {} prio {} ts {} ready, requeued {}",
                    context.id(),
                    context.priority(),
                    obj.timestamp(),
                    cmd.requeue_count()
                );
            }

            if let Err(err) = self.sendcmd(&obj) {
                ret = Err(err);
                if err == Error::ContextDetached {
                    self.destroy_drawobj(&obj);
                } else if let Err(requeue_err) = self.requeue_drawobj(context, obj) {
                    ret = Err(requeue_err);
                }
                break;
            }

            if tracked {
                context.queue.lock().submitted_timestamp = obj.timestamp();
            }
            count += 1;
        }

        if context.queued() < self.tunables.drawqueue_size() {
            context.wake_waiters();
        }

        ret.map(|()| count)
    }

    // =========================================================================
    // Job lists
    // =========================================================================

    fn handle_jobs_list(&self, id: usize, seen: &mut HashSet<ContextId>, list: Vec<Arc<Context>>) {
        for context in list {
            if context.is_bad() {
                continue;
            }

            // A context may be published many times; consider it once
            if !seen.insert(context.id()) {
                continue;
            }

            match self.sendcmds(&context) {
                Ok(0) | Err(Error::ContextDetached) => {}
                Err(Error::NoSpace) => self.requeue[id].push(context),
                _ => self.jobs[id].push(context),
            }
        }
    }

    fn handle_jobs(&self, id: usize) {
        let mut seen = HashSet::new();

        let requeue = self.requeue[id].take_all();
        let jobs = self.jobs[id].take_all();

        self.handle_jobs_list(id, &mut seen, requeue);
        self.handle_jobs_list(id, &mut seen, jobs);
    }

    /// One dispatch pass over every priority level
    ///
    /// Caller holds the dispatcher lock.
    pub(crate) fn issuecmds(&self) {
        for id in 0..PRIORITY_LEVELS {
            self.handle_jobs(id);
        }
    }

    /// Dispatch from the submitting thread if the worker is not busy
    pub(crate) fn issuecmds_inline(&self) {
        if !self.skip_inline_submit.load(Ordering::Acquire) {
            if let Some(_dispatcher) = self.dispatcher.try_lock() {
                if !self.recovery.fault_pending() {
                    SchedCounters::bump(&self.stats.inline_passes);
                    self.issuecmds();
                    return;
                }
            }
        }

        self.platform.schedule_worker();
    }

    /// Publish a job for `context` from any context, including interrupts
    pub(crate) fn publish(&self, context: &Arc<Context>) {
        self.jobs[usize::from(context.priority())].push(Arc::clone(context));
    }

    // =========================================================================
    // Worker
    // =========================================================================

    /// Body of the dispatch worker
    ///
    /// Handles a pending fault first; otherwise retires finished work,
    /// signals events, runs a dispatch pass and drops the power vote once
    /// nothing is in flight.
    pub fn run_worker(&self) {
        let _dispatcher = self.dispatcher.lock();

        if self.do_fault() {
            return;
        }

        self.retire_inflight();
        self.platform.process_events();
        self.issuecmds();

        if self.device.lock().inflight == 0 {
            self.power_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;
    use crate::drawobj::{BindRange, DrawObjFlags, DrawObjType, SyncEvent};
    use crate::testing::{ibs, setup, MockFence};

    fn cmd(ctx: &Arc<Context>) -> Arc<DrawObject> {
        DrawObject::command(ctx, ibs(1), DrawObjFlags::empty())
    }

    #[test]
    fn test_priority_order() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let low = sched.create_context(ContextId(1), 9, ContextFlags::empty()).unwrap();
        let high = sched.create_context(ContextId(2), 0, ContextFlags::empty()).unwrap();

        sched.queue_cmds(&low, &[cmd(&low)], 0).unwrap();
        sched.queue_cmds(&high, &[cmd(&high)], 0).unwrap();
        sched.run_worker();

        let order: Vec<u32> = fw.submissions().iter().map(|s| s.context.0).collect();
        assert_eq!(order, [2, 1]);
    }

    #[test]
    fn test_fifo_within_context() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        for _ in 0..4 {
            sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        }
        sched.run_worker();

        let ts: Vec<u32> = fw.submissions().iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, [1, 2, 3, 4]);
        assert_eq!(ctx.submitted_timestamp(), 4);
    }

    #[test]
    fn test_duplicate_jobs_coalesced() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        sched.queue_context(&ctx);
        sched.queue_context(&ctx);
        sched.run_worker();

        assert_eq!(fw.submissions().len(), 1);
    }

    #[test]
    fn test_requeue_on_no_space() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        let objs = [cmd(&ctx), cmd(&ctx)];
        sched.queue_cmds(&ctx, &objs, 0).unwrap();

        fw.fail_next_submits(1);
        sched.run_worker();
        assert!(fw.submissions().is_empty());
        assert_eq!(ctx.queued(), 2);
        assert_eq!(objs[0].as_command().unwrap().requeue_count(), 1);
        assert!(!sched.requeue[3].is_empty());

        sched.run_worker();
        let ts: Vec<u32> = fw.submissions().iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, [1, 2]);
        assert_eq!(sched.stats().requeued, 1);
    }

    #[test]
    fn test_big_command_stalls() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        let big = || DrawObject::command(&ctx, ibs(MAX_DISPATCH_IBS + 1), DrawObjFlags::empty());
        sched.queue_cmds(&ctx, &[big(), big()], 0).unwrap();

        sched.run_worker();
        assert_eq!(fw.submissions().len(), 1);
        assert!(!sched.requeue[3].is_empty());

        fw.retire(ContextId(1), 1);
        sched.run_worker();
        assert_eq!(fw.submissions().len(), 2);
    }

    #[test]
    fn test_sync_blocks_until_dependency_retires() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let producer = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();
        let consumer = sched.create_context(ContextId(2), 3, ContextFlags::empty()).unwrap();

        sched.queue_cmds(&producer, &[cmd(&producer)], 0).unwrap();
        let wait = DrawObject::sync(
            &consumer,
            alloc::vec![SyncEvent::Timestamp {
                context: producer.clone(),
                timestamp: 1,
            }],
        )
        .unwrap();
        let after = cmd(&consumer);
        sched.queue_cmds(&consumer, &[wait.clone(), after.clone()], 0).unwrap();

        sched.run_worker();
        assert_eq!(fw.submissions().len(), 1);
        assert_eq!(consumer.queued(), 2);

        fw.retire(ContextId(1), 1);
        sched.run_worker();
        assert!(wait.is_destroyed());
        let last = fw.submissions().last().cloned().unwrap();
        assert_eq!(last.context, ContextId(2));
        assert_eq!(last.kind, DrawObjType::Command);
    }

    #[test]
    fn test_hw_backed_sync_sent_to_firmware() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        sched.register_hw_fence();
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        let sync = DrawObject::sync(&ctx, alloc::vec![SyncEvent::Fence(MockFence::hw(false))]).unwrap();
        sched.queue_cmds(&ctx, &[sync.clone(), cmd(&ctx)], 0).unwrap();
        sched.run_worker();

        let kinds: Vec<DrawObjType> = fw.submissions().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, [DrawObjType::Sync, DrawObjType::Command]);

        fw.sync_retire(ContextId(1), 1);
        sched.run_worker();
        assert!(sync.is_destroyed());
    }

    #[test]
    fn test_marker_waits_then_retires_on_host() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        sched.run_worker();

        let marker = DrawObject::marker(&ctx, DrawObjFlags::empty());
        assert_eq!(sched.queue_cmds(&ctx, &[marker.clone()], 0), Ok(2));
        sched.run_worker();
        assert_eq!(ctx.queued(), 1);

        fw.retire(ContextId(1), 1);
        sched.run_worker();
        assert!(marker.is_destroyed());
        assert_eq!(fw.retired(ContextId(1)), 2);
        assert_eq!(fw.submissions().len(), 1);
        assert_eq!(sched.inflight(), 0);
    }

    #[test]
    fn test_skip_marker_flows_through_dispatch() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        sched.run_worker();

        let marker = DrawObject::marker(&ctx, DrawObjFlags::empty());
        sched.queue_cmds(&ctx, &[marker.clone()], 0).unwrap();
        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        assert!(marker.is_marker_skip());

        sched.run_worker();
        let kinds: Vec<DrawObjType> = fw.submissions().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, [DrawObjType::Command, DrawObjType::Marker, DrawObjType::Command]);
        assert_eq!(ctx.submitted_timestamp(), 3);
    }

    #[test]
    fn test_expired_marker_with_hw_fence_is_tracked() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        sched.register_hw_fence();
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        sched.run_worker();
        let marker = DrawObject::marker(&ctx, DrawObjFlags::END_OF_FRAME);
        sched.queue_cmds(&ctx, &[marker.clone()], 0).unwrap();

        fw.retire(ContextId(1), 1);
        sched.run_worker();
        assert!(marker
            .as_cmdobj()
            .unwrap()
            .state()
            .contains(CmdPriv::MARKER_EXPIRED));
        assert_eq!(fw.submissions().last().unwrap().kind, DrawObjType::Marker);
        assert_eq!(sched.inflight() as usize, sched.inflight_records().len());

        sched.run_worker();
        assert!(marker.is_destroyed());
        assert_eq!(sched.inflight(), 0);
        assert_eq!(ctx.frames(), 1);
    }

    #[test]
    fn test_bind_completes_asynchronously() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        let bind = DrawObject::bind(
            &ctx,
            alloc::vec![BindRange {
                gpuaddr: 0x1000,
                size: 0x1000,
                target: 0,
            }],
        );
        let after = cmd(&ctx);
        sched.queue_cmds(&ctx, &[bind.clone(), after.clone()], 0).unwrap();

        sched.run_worker();
        sched.run_worker();
        assert_eq!(fw.binds(), 1);
        assert!(fw.submissions().is_empty());

        sched.bind_complete(&bind);
        sched.run_worker();
        assert!(bind.is_destroyed());
        assert_eq!(fw.submissions().len(), 1);
        assert_eq!(fw.submissions()[0].timestamp, 2);
    }

    #[test]
    fn test_timeline_is_dropped() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        let timeline = DrawObject::timeline(&ctx);
        sched.queue_cmds(&ctx, &[timeline.clone(), cmd(&ctx)], 0).unwrap();
        sched.run_worker();

        assert!(timeline.is_destroyed());
        assert_eq!(timeline.timestamp(), 0);
        assert_eq!(fw.submissions().len(), 1);
    }

    #[test]
    fn test_detached_context_drops_job() {
        let (fw, _platform, sched) = setup();
        sched.set_inline_submit(false);
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        sched.detach_context(&ctx);
        sched.run_worker();

        assert!(fw.submissions().is_empty());
        assert!(sched.jobs[3].is_empty());
    }

    #[test]
    fn test_worker_powers_down_when_idle() {
        let (fw, platform, sched) = setup();
        let ctx = sched.create_context(ContextId(1), 3, ContextFlags::empty()).unwrap();

        sched.queue_cmds(&ctx, &[cmd(&ctx)], 0).unwrap();
        assert_eq!(platform.votes(), 1);

        fw.retire(ContextId(1), 1);
        sched.run_worker();
        assert_eq!(platform.votes(), 0);
        assert!(sched.idle_gate.is_complete());
        assert!(sched.sched_flags().is_empty());
    }
}
