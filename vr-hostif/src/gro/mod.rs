//! GRO input queue and poll context.
//!
//! Each virtual interface owns one [`GroContext`]: a bounded multi-producer
//! queue of frames waiting to be coalesced, plus a poll state machine
//! (`Idle -> Scheduled -> Draining -> Idle`) that guarantees a single
//! drainer. Producers on any core call [`GroContext::enqueue`]; whoever gets
//! `schedule == true` back must arrange for exactly one [`GroContext::poll`].

mod coalesce;

pub use coalesce::TcpCoalescer;

use std::sync::atomic::{self, AtomicBool, AtomicU8, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::config::OverflowPolicy;
use crate::error::DropReason;
use crate::frame::Frame;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const DRAINING: u8 = 2;

/// Poll state of a GRO context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Scheduled,
    Draining,
}

/// Receives frames from the poller and emits (possibly merged) frames.
pub trait GroMerger {
    /// Take one frame. Frames may be held back for merging.
    fn receive(&mut self, frame: Frame, out: &mut Vec<Frame>);

    /// Emit everything held back.
    fn flush(&mut self, out: &mut Vec<Frame>);
}

/// Merger that never merges.
#[derive(Debug, Default)]
pub struct Passthrough;

impl GroMerger for Passthrough {
    fn receive(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        out.push(frame);
    }

    fn flush(&mut self, _out: &mut Vec<Frame>) {}
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// The caller must schedule a poll.
    pub schedule: bool,
    /// An older frame was evicted to make room.
    pub evicted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollStatus {
    /// Queue drained; context is idle.
    Complete,
    /// Budget exhausted with work left; context stays scheduled and the
    /// caller must poll again.
    Yielded,
    /// Queue drained, but a racing enqueue left work behind and the context
    /// was scheduled again. The caller must poll again.
    Rescheduled,
    /// The context was not scheduled; nothing was done.
    #[default]
    NotScheduled,
}

impl PollStatus {
    /// Another poll must follow.
    pub fn needs_repoll(self) -> bool {
        matches!(self, PollStatus::Yielded | PollStatus::Rescheduled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollOutcome {
    pub processed: usize,
    /// Frames left behind in a disabled queue and dropped by the drainer.
    pub purged: usize,
    pub status: PollStatus,
}

/// Per-interface GRO queue and poll state.
pub struct GroContext {
    queue: ArrayQueue<Frame>,
    state: AtomicU8,
    enabled: AtomicBool,
    overflow: OverflowPolicy,
}

impl GroContext {
    pub fn new(limit: usize, overflow: OverflowPolicy) -> Self {
        Self {
            queue: ArrayQueue::new(limit.max(1)),
            state: AtomicU8::new(IDLE),
            enabled: AtomicBool::new(true),
            overflow,
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PollState {
        match self.state.load(Ordering::Acquire) {
            SCHEDULED => PollState::Scheduled,
            DRAINING => PollState::Draining,
            _ => PollState::Idle,
        }
    }

    /// Queue a frame. On overflow the victim is dropped with `QueueFull`:
    /// the arriving frame under `DropNewest` (returned as the error), the
    /// oldest queued frame under `DropOldest` (reported via `evicted`).
    ///
    /// A frame that races with [`GroContext::disable`] is either purged and
    /// counted by it, or taken back out and refused with `InterfaceDown`.
    pub fn enqueue(&self, frame: Frame) -> Result<Enqueued, DropReason> {
        if !self.is_enabled() {
            return Err(DropReason::InterfaceDown);
        }
        let evicted = match self.overflow {
            OverflowPolicy::DropNewest => {
                if self.queue.push(frame).is_err() {
                    return Err(DropReason::QueueFull);
                }
                false
            }
            OverflowPolicy::DropOldest => self.queue.force_push(frame).is_some(),
        };
        atomic::fence(Ordering::SeqCst);
        if !self.is_enabled() {
            return match self.queue.pop() {
                Some(_) => Err(DropReason::InterfaceDown),
                None => Ok(Enqueued {
                    schedule: false,
                    evicted,
                }),
            };
        }
        Ok(Enqueued {
            schedule: self.try_schedule(),
            evicted,
        })
    }

    fn try_schedule(&self) -> bool {
        self.state
            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drain up to `budget` frames through `merger` into `out`.
    ///
    /// Completes when the queue empties within the budget, including the
    /// case where exactly `budget` frames drained it. The merger is flushed
    /// at the end of every poll, so nothing is held across polls.
    pub fn poll(&self, budget: usize, merger: &mut dyn GroMerger, out: &mut Vec<Frame>) -> PollOutcome {
        if self
            .state
            .compare_exchange(SCHEDULED, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PollOutcome::default();
        }

        let mut processed = 0;
        while processed < budget {
            let Some(mut frame) = self.queue.pop() else {
                break;
            };
            frame.last_core = None;
            merger.receive(frame, out);
            processed += 1;
        }
        merger.flush(out);

        if !self.is_enabled() {
            // Disabled mid-drain: whatever is left goes, and no poll follows.
            let purged = self.purge();
            self.state.store(IDLE, Ordering::Release);
            return PollOutcome {
                processed,
                purged,
                status: PollStatus::Complete,
            };
        }

        if !self.queue.is_empty() && processed == budget {
            self.state.store(SCHEDULED, Ordering::Release);
            return PollOutcome {
                processed,
                purged: 0,
                status: PollStatus::Yielded,
            };
        }

        self.state.store(IDLE, Ordering::Release);
        // An enqueue that raced with the state change saw DRAINING and did
        // not schedule; pick its work up here.
        let status = if !self.queue.is_empty() && self.try_schedule() {
            PollStatus::Rescheduled
        } else {
            PollStatus::Complete
        };
        PollOutcome {
            processed,
            purged: 0,
            status,
        }
    }

    /// Stop accepting frames and purge the queue. Returns the number purged.
    ///
    /// A pending poll is cancelled. A poll already draining keeps ownership
    /// of the context and returns it to idle itself, so re-enabling never
    /// lets a second drainer in.
    pub fn disable(&self) -> usize {
        self.enabled.store(false, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
        let purged = self.purge();
        let _ = self
            .state
            .compare_exchange(SCHEDULED, IDLE, Ordering::AcqRel, Ordering::Acquire);
        purged
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn purge(&self) -> usize {
        let mut purged = 0;
        while self.queue.pop().is_some() {
            purged += 1;
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame::with_headroom(0, &[tag])
    }

    #[test]
    fn test_enqueue_schedules_once() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        assert!(ctx.enqueue(frame(1)).unwrap().schedule);
        assert!(!ctx.enqueue(frame(2)).unwrap().schedule);
        assert_eq!(ctx.state(), PollState::Scheduled);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_poll_budget_yield_then_complete() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        for i in 0..5 {
            ctx.enqueue(frame(i)).unwrap();
        }
        let mut out = Vec::new();
        let outcome = ctx.poll(3, &mut Passthrough, &mut out);
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.status, PollStatus::Yielded);
        assert_eq!(ctx.state(), PollState::Scheduled);

        let outcome = ctx.poll(3, &mut Passthrough, &mut out);
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.status, PollStatus::Complete);
        assert_eq!(ctx.state(), PollState::Idle);

        let tags: Vec<u8> = out.iter().map(|f| f.data()[0]).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_poll_exact_budget_completes() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        for i in 0..4 {
            ctx.enqueue(frame(i)).unwrap();
        }
        let mut out = Vec::new();
        let outcome = ctx.poll(4, &mut Passthrough, &mut out);
        assert_eq!(outcome.processed, 4);
        assert_eq!(outcome.status, PollStatus::Complete);
        assert!(ctx.enqueue(frame(9)).unwrap().schedule);
    }

    #[test]
    fn test_poll_without_schedule() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        let mut out = Vec::new();
        let outcome = ctx.poll(64, &mut Passthrough, &mut out);
        assert_eq!(outcome.status, PollStatus::NotScheduled);
    }

    #[test]
    fn test_poll_clears_last_core() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        let mut f = frame(1);
        f.last_core = Some(3);
        ctx.enqueue(f).unwrap();
        let mut out = Vec::new();
        ctx.poll(64, &mut Passthrough, &mut out);
        assert_eq!(out[0].last_core, None);
    }

    #[test]
    fn test_overflow_drop_newest() {
        let ctx = GroContext::new(2, OverflowPolicy::DropNewest);
        ctx.enqueue(frame(1)).unwrap();
        ctx.enqueue(frame(2)).unwrap();
        assert_eq!(ctx.enqueue(frame(3)).unwrap_err(), DropReason::QueueFull);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_overflow_drop_oldest() {
        let ctx = GroContext::new(2, OverflowPolicy::DropOldest);
        ctx.enqueue(frame(1)).unwrap();
        ctx.enqueue(frame(2)).unwrap();
        let enq = ctx.enqueue(frame(3)).unwrap();
        assert!(enq.evicted);

        let mut out = Vec::new();
        ctx.poll(64, &mut Passthrough, &mut out);
        let tags: Vec<u8> = out.iter().map(|f| f.data()[0]).collect();
        assert_eq!(tags, vec![2, 3]);
    }

    /// Disables, re-enables and enqueues from inside a running poll.
    struct ReenableOnReceive<'a> {
        ctx: &'a GroContext,
        purged: Option<usize>,
        schedule: Option<bool>,
        state: Option<PollState>,
    }

    impl GroMerger for ReenableOnReceive<'_> {
        fn receive(&mut self, f: Frame, out: &mut Vec<Frame>) {
            if self.purged.is_none() {
                self.purged = Some(self.ctx.disable());
                self.state = Some(self.ctx.state());
                self.ctx.enable();
                self.schedule = Some(self.ctx.enqueue(frame(9)).unwrap().schedule);
            }
            out.push(f);
        }

        fn flush(&mut self, _out: &mut Vec<Frame>) {}
    }

    #[test]
    fn test_disable_during_drain_keeps_single_drainer() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        for i in 0..3 {
            ctx.enqueue(frame(i)).unwrap();
        }
        let mut merger = ReenableOnReceive {
            ctx: &ctx,
            purged: None,
            schedule: None,
            state: None,
        };
        let mut out = Vec::new();
        let outcome = ctx.poll(64, &mut merger, &mut out);

        assert_eq!(merger.purged, Some(2));
        assert_eq!(merger.state, Some(PollState::Draining));
        // The running poll still owns the context.
        assert_eq!(merger.schedule, Some(false));
        assert_eq!(outcome.status, PollStatus::Complete);
        let tags: Vec<u8> = out.iter().map(|f| f.data()[0]).collect();
        assert_eq!(tags, vec![0, 9]);
        assert_eq!(ctx.state(), PollState::Idle);
    }

    /// Disables the context on the first frame and leaves it disabled.
    struct DisableOnReceive<'a> {
        ctx: &'a GroContext,
    }

    impl GroMerger for DisableOnReceive<'_> {
        fn receive(&mut self, frame: Frame, out: &mut Vec<Frame>) {
            self.ctx.disable();
            out.push(frame);
        }

        fn flush(&mut self, _out: &mut Vec<Frame>) {}
    }

    #[test]
    fn test_poll_disabled_mid_drain_goes_idle() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        for i in 0..4 {
            ctx.enqueue(frame(i)).unwrap();
        }
        let mut out = Vec::new();
        let outcome = ctx.poll(2, &mut DisableOnReceive { ctx: &ctx }, &mut out);
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.status, PollStatus::Complete);
        assert!(!outcome.status.needs_repoll());
        assert_eq!(ctx.state(), PollState::Idle);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_disable_cancels_pending_poll() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        ctx.enqueue(frame(1)).unwrap();
        assert_eq!(ctx.state(), PollState::Scheduled);
        assert_eq!(ctx.disable(), 1);
        assert_eq!(ctx.state(), PollState::Idle);

        let mut out = Vec::new();
        assert_eq!(ctx.poll(64, &mut Passthrough, &mut out).status, PollStatus::NotScheduled);

        ctx.enable();
        assert!(ctx.enqueue(frame(2)).unwrap().schedule);
        let outcome = ctx.poll(64, &mut Passthrough, &mut out);
        assert_eq!(outcome.processed, 1);
        assert_eq!(out[0].data()[0], 2);
    }

    #[test]
    fn test_disable_purges_and_rejects() {
        let ctx = GroContext::new(8, OverflowPolicy::DropNewest);
        ctx.enqueue(frame(1)).unwrap();
        ctx.enqueue(frame(2)).unwrap();
        assert_eq!(ctx.disable(), 2);
        assert_eq!(ctx.state(), PollState::Idle);
        assert_eq!(
            ctx.enqueue(frame(3)).unwrap_err(),
            DropReason::InterfaceDown
        );
        ctx.enable();
        assert!(ctx.enqueue(frame(4)).is_ok());
    }
}
