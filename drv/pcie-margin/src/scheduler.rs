// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step margining.
//!
//! A step-margin request is accepted in interrupt context by
//! [`Margining::arm_step`], which marks the lane as owed a result and, if
//! nothing else is in flight, hands a [`StepWork`] to the worker. The worker
//! runs one lane per work item:
//!
//! ```text
//!   arm_step        begin_step          finish_step
//!  ----------> Armed ---------> Measuring ---------> Reporting --> (next lane
//!                                                                  or Idle)
//! ```
//!
//! The measurement itself happens between the two worker calls; `begin_step`
//! may poll hardware for settling and `finish_step` may wait for queue room,
//! so neither is ever called with a critical section held.
//!
//! Cancellation (abort, error limit, Go-To-Normal) is never signalled to the
//! worker directly. Those paths clear the lane's scheduled bit, forget what
//! the lane was armed with and move its epoch on; the worker notices when it
//! next looks at shared state and throws its result away, even if the host
//! has asked for the same step again in the meantime.

use crate::command::{classify, Command, MarginRequest, StepSetting};
use crate::hw::MarginHw;
use crate::lane::{Lane, LaneMask, LanePhase, SchedState};
use crate::queue::{StepWork, WorkQueue};
use crate::status::StatusReport;
use crate::time::wait_for;
use crate::Margining;
use counters::count;
use drv_pcie_margin_api::{ExecStatus, MarginError, MAX_ERROR_COUNT};
use ringbuf::*;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Nak(Lane),
    Queued(Lane),
    Deferred(Lane),
    Arming { lane: Lane, offset: u8 },
    AlreadyArmed(Lane),
    SettleTimeout(Lane),
    Committed { lane: Lane, error_count: u8 },
    Stale(Lane),
    Superseded(Lane),
    Cancelled(Lane),
    Requeued(Lane),
    Idle,
    EnqueueFailed(Lane),
    Stopped { mask: u16, reset: bool },
    TooManyErrors { lane: Lane, error_count: u8 },
    Failed(MarginError),
}

ringbuf!(Trace, 32, Trace::None);

/// What [`Margining::arm_step`] did with a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Armed {
    /// The lane took the in-flight slot and its work item is queued.
    Queued(Lane),
    /// Another lane holds the slot. This one is marked as owed a result and
    /// will be picked up by round robin.
    Deferred(Lane),
    /// The receiver can't run the requested offset; a NAK went out and
    /// nothing was scheduled.
    Nak(Lane),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Verdict {
    Commit,
    /// No longer owed a result, or cancelled and asked for again since the
    /// measurement started.
    Cancelled,
    /// The control word moved while we were measuring.
    Changed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Plan {
    Measure(StepSetting),
    /// The control word no longer asks for a step we can run.
    Superseded,
    /// The lane was no longer owed a result when the worker got to it.
    Cancelled,
}

/// A lane in the Measuring phase, between [`Margining::begin_step`] and
/// [`Margining::finish_step`].
#[must_use]
#[derive(Debug)]
pub struct Measurement {
    request: MarginRequest,
    plan: Plan,
    epoch: u8,
    armed: bool,
    settled: Result<(), MarginError>,
}

impl Measurement {
    pub fn lane(&self) -> Lane {
        self.request.lane
    }

    /// True if this iteration wrote the offset to hardware, false if the
    /// lane was already armed with it (or nothing was measured at all).
    pub fn armed(&self) -> bool {
        self.armed
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Iteration {
    /// "Margining in progress" was reported with this count, and the lane
    /// is no longer owed anything.
    Committed { error_count: u8 },
    /// The lane was cancelled, failed to settle, or had its command
    /// changed underneath us. The result was thrown away and the lane will
    /// be re-armed from scratch if it is measured again. A lane that failed
    /// to settle was disarmed and NAKed.
    Discarded,
    /// The lane's command is no longer a step, so it isn't owed a result
    /// any more.
    Superseded,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Next {
    /// A work item for this lane is queued and it holds the slot.
    Requeued(Lane),
    /// Nothing is owed; the slot is free.
    Idle,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    pub iteration: Iteration,
    pub next: Next,
}

impl<H: MarginHw, Q: WorkQueue> Margining<H, Q> {
    /// Accepts a validated step-margin request for `req.lane`.
    ///
    /// The host is told "setup in progress" before anything is queued. If
    /// another lane is in flight this only sets the lane's scheduled bit.
    pub fn arm_step(
        &self,
        req: &MarginRequest,
        setting: StepSetting,
    ) -> Result<Armed, MarginError> {
        let lane = req.lane;

        if !setting.supported(&self.hw().capabilities()) {
            ringbuf_entry!(Trace::Nak(lane));
            self.report(&StatusReport::step(req, ExecStatus::Nak, 0))?;
            self.with_state(|s| s.scheduled.remove(lane));
            return Ok(Armed::Nak(lane));
        }

        let setup = StatusReport::step(req, ExecStatus::SetupInProgress, 0);
        self.report(&setup)?;

        let claimed = self.with_state(|s| {
            s.scheduled.insert(lane);
            s.claim(lane)
        });
        if !claimed {
            ringbuf_entry!(Trace::Deferred(lane));
            return Ok(Armed::Deferred(lane));
        }

        // Interrupt context can't wait for room.
        if let Err(e) = self.queue().enqueue(StepWork::new(lane), 0, self.hw())
        {
            ringbuf_entry!(Trace::EnqueueFailed(lane));
            self.with_state(|s| s.release());
            return Err(e);
        }
        ringbuf_entry!(Trace::Queued(lane));
        Ok(Armed::Queued(lane))
    }

    /// Armed -> Measuring.
    ///
    /// Re-reads the lane's control word, since the host may have rewritten
    /// it since the interrupt. If it still asks for a step we can run and
    /// the lane isn't already armed with that offset, arms the front end
    /// and waits for it to settle.
    pub fn begin_step(
        &self,
        work: StepWork,
    ) -> Result<Measurement, MarginError> {
        let lane = work.lane();
        let (owed, epoch) = self.with_state(|s| match s.phase(lane) {
            LanePhase::Armed => {
                Ok((s.scheduled.contains(lane), s.lane(lane).epoch))
            }
            _ => Err(MarginError::InvalidArgument),
        })?;

        let request = classify(lane, self.hw().read_control(lane));
        let plan = if !owed {
            Plan::Cancelled
        } else {
            match (request.validate_receiver(), request.command()) {
                (Ok(()), Command::Step(setting))
                    if setting.supported(&self.hw().capabilities()) =>
                {
                    Plan::Measure(setting)
                }
                _ => Plan::Superseded,
            }
        };

        let mut armed = false;
        let mut settled = Ok(());
        if let Plan::Measure(setting) = plan {
            let last = self.with_state(|s| s.lane(lane).last);
            if last == Some(setting) {
                ringbuf_entry!(Trace::AlreadyArmed(lane));
            } else {
                ringbuf_entry!(Trace::Arming {
                    lane,
                    offset: setting.offset
                });
                self.with_lanes_selected(lane.mask(), |hw| {
                    hw.arm_measurement(setting)
                });
                armed = true;
                settled =
                    wait_for(self.hw(), self.config().settle_timeout_ns, || {
                        self.hw().margin_settled(lane)
                    });
            }
            if settled.is_ok()
                && !self.with_state(|s| s.lane(lane).error_counting)
            {
                self.set_error_counting(lane, true);
            }
        }

        self.with_state(|s| s.advance(lane, LanePhase::Measuring));
        Ok(Measurement {
            request,
            plan,
            epoch,
            armed,
            settled,
        })
    }

    /// Measuring -> Reporting -> next lane or Idle.
    ///
    /// The slot is always passed on (or freed) before any error from this
    /// iteration is returned.
    pub fn finish_step(
        &self,
        m: Measurement,
    ) -> Result<StepOutcome, MarginError> {
        let lane = m.lane();
        let (iteration, result) = self.conclude(&m);
        let next = self.reschedule(lane);
        result?;
        Ok(StepOutcome {
            iteration,
            next: next?,
        })
    }

    /// One worker iteration for `work`.
    pub fn service_step(
        &self,
        work: StepWork,
    ) -> Result<StepOutcome, MarginError> {
        let m = self.begin_step(work)?;
        self.finish_step(m)
    }

    /// Worker entry point.
    ///
    /// Errors are traced and counted; fatal ones take the task down, the
    /// same as on the interrupt side.
    pub fn run_step(&self, work: StepWork) -> Option<StepOutcome> {
        match self.service_step(work) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                ringbuf_entry!(Trace::Failed(e));
                count!(crate::__COUNTERS, e);
                if e.is_fatal() {
                    panic!("margining worker: {e:?}");
                }
                None
            }
        }
    }

    /// Whether `m` may still speak for its lane. Called with `s` locked.
    fn verdict(&self, s: &SchedState, m: &Measurement) -> Verdict {
        let lane = m.lane();
        if s.lane(lane).epoch != m.epoch || !s.scheduled.contains(lane) {
            Verdict::Cancelled
        } else if self.hw().read_control(lane) != m.request.control {
            Verdict::Changed
        } else {
            Verdict::Commit
        }
    }

    fn conclude(
        &self,
        m: &Measurement,
    ) -> (Iteration, Result<(), MarginError>) {
        let lane = m.lane();
        match (m.plan, m.settled) {
            (Plan::Measure(setting), Ok(())) => {
                let count = self.hw().read_error_count(lane.mask());
                let verdict = critical_section::with(|cs| {
                    let mut s = self.state.borrow_ref_mut(cs);
                    s.advance(lane, LanePhase::Reporting);
                    let verdict = self.verdict(&s, m);
                    if verdict != Verdict::Commit {
                        s.lane_mut(lane).last = None;
                        return Ok(verdict);
                    }
                    s.scheduled.remove(lane);
                    s.lane_mut(lane).last = Some(setting);
                    self.report(&StatusReport::step(
                        &m.request,
                        ExecStatus::MarginingInProgress,
                        count,
                    ))
                    .map(|()| Verdict::Commit)
                });
                match verdict {
                    Ok(Verdict::Commit) => {
                        let error_count = count.min(MAX_ERROR_COUNT);
                        ringbuf_entry!(Trace::Committed { lane, error_count });
                        (Iteration::Committed { error_count }, Ok(()))
                    }
                    Ok(Verdict::Cancelled) => {
                        ringbuf_entry!(Trace::Stale(lane));
                        if m.armed {
                            // We may have armed after whoever cancelled us
                            // disarmed the lane.
                            self.with_lanes_selected(lane.mask(), |hw| {
                                hw.disarm_measurement()
                            });
                        }
                        (Iteration::Discarded, Ok(()))
                    }
                    Ok(Verdict::Changed) => {
                        ringbuf_entry!(Trace::Stale(lane));
                        (Iteration::Discarded, Ok(()))
                    }
                    Err(e) => {
                        self.with_state(|s| s.lane_mut(lane).last = None);
                        (Iteration::Discarded, Err(e))
                    }
                }
            }
            (Plan::Measure(_), Err(e)) => {
                // Only reached after arming. Not retried: the front end is
                // put back and the host is NAKed, and can ask again.
                ringbuf_entry!(Trace::SettleTimeout(lane));
                self.with_lanes_selected(lane.mask(), |hw| {
                    hw.disarm_measurement()
                });
                self.set_error_counting(lane, false);
                let verdict = critical_section::with(|cs| {
                    let mut s = self.state.borrow_ref_mut(cs);
                    s.advance(lane, LanePhase::Reporting);
                    s.lane_mut(lane).last = None;
                    let verdict = self.verdict(&s, m);
                    if verdict != Verdict::Commit {
                        return Ok(verdict);
                    }
                    s.scheduled.remove(lane);
                    self.report(&StatusReport::step(
                        &m.request,
                        ExecStatus::Nak,
                        0,
                    ))
                    .map(|()| verdict)
                });
                match verdict {
                    Ok(Verdict::Commit) => (Iteration::Discarded, Err(e)),
                    // Cancelled or rewritten while settling; whatever the
                    // lane is owed now is somebody else's business.
                    Ok(_) => {
                        ringbuf_entry!(Trace::Stale(lane));
                        (Iteration::Discarded, Ok(()))
                    }
                    Err(written) => (Iteration::Discarded, Err(written)),
                }
            }
            (Plan::Superseded, _) => {
                let dropped = critical_section::with(|cs| {
                    let mut s = self.state.borrow_ref_mut(cs);
                    s.advance(lane, LanePhase::Reporting);
                    // If the control word moved again, it may be a fresh
                    // step request the interrupt path has already accepted.
                    let unchanged =
                        self.hw().read_control(lane) == m.request.control;
                    if unchanged {
                        s.scheduled.remove(lane);
                    }
                    unchanged
                });
                if dropped {
                    ringbuf_entry!(Trace::Superseded(lane));
                    (Iteration::Superseded, Ok(()))
                } else {
                    ringbuf_entry!(Trace::Stale(lane));
                    (Iteration::Discarded, Ok(()))
                }
            }
            (Plan::Cancelled, _) => {
                ringbuf_entry!(Trace::Cancelled(lane));
                self.with_state(|s| {
                    s.advance(lane, LanePhase::Reporting);
                    s.lane_mut(lane).last = None;
                });
                (Iteration::Discarded, Ok(()))
            }
        }
    }

    /// Passes the slot from `last` to the next lane owed a result, in round
    /// robin order, or frees it.
    ///
    /// Choosing the successor and committing to it happen in one critical
    /// section. A lane scheduled after that either was seen, or finds the
    /// slot free and queues itself.
    fn reschedule(&self, last: Lane) -> Result<Next, MarginError> {
        let lanes = self.config().lanes;
        let next = self.with_state(|s| {
            let next = s.scheduled.next_after(last, lanes);
            match next {
                Some(lane) => s.hand_off(lane),
                None => s.release(),
            }
            next
        });

        let Some(next) = next else {
            ringbuf_entry!(Trace::Idle);
            return Ok(Next::Idle);
        };

        let timeout = self.config().step_timeout_ns;
        if let Err(e) =
            self.queue().enqueue(StepWork::new(next), timeout, self.hw())
        {
            ringbuf_entry!(Trace::EnqueueFailed(next));
            self.with_state(|s| s.release());
            return Err(e);
        }
        ringbuf_entry!(Trace::Requeued(next));
        Ok(Next::Requeued(next))
    }

    /// Disarms the lanes in `mask` and forgets what they were armed with,
    /// optionally clearing their error counters too.
    pub fn stop_margining(
        &self,
        mask: LaneMask,
        reset_error_count: bool,
    ) -> Result<(), MarginError> {
        if mask.is_empty() || !mask.within(self.config().lanes) {
            return Err(MarginError::OutOfRange);
        }

        self.with_lanes_selected(mask, |hw| hw.disarm_measurement());
        if reset_error_count {
            for lane in mask.iter() {
                self.hw().clear_error_count(lane);
            }
        }
        self.with_state(|s| s.forget(mask));

        ringbuf_entry!(Trace::Stopped {
            mask: mask.bits(),
            reset: reset_error_count
        });
        Ok(())
    }

    /// The error-count limit tripped on `lane`.
    ///
    /// The lane is disarmed before anything else happens, including before
    /// the host is told: a link left margining past its limit can fall over.
    pub fn error_limit_exceeded(
        &self,
        lane: Lane,
    ) -> Result<StatusReport, MarginError> {
        self.stop_margining(lane.mask(), false)?;

        let error_count = self.hw().read_error_count(lane.mask());
        ringbuf_entry!(Trace::TooManyErrors { lane, error_count });
        let req = classify(lane, self.hw().read_control(lane));
        let report =
            StatusReport::step(&req, ExecStatus::TooManyErrors, error_count);
        let written = self.report(&report);

        self.with_state(|s| s.cancel(lane));
        written.map(|()| report)
    }

    /// Sets error counting on `lane` and the mirror of it together, so an
    /// abort can't land between the two.
    pub(crate) fn set_error_counting(&self, lane: Lane, enable: bool) {
        critical_section::with(|cs| {
            self.hw().enable_error_counting(lane, enable);
            self.state.borrow_ref_mut(cs).lane_mut(lane).error_counting =
                enable;
        });
    }

    /// Runs `f` with the lane-select register pointed at `mask`. Anything
    /// else selecting lanes in the meantime would misdirect `f`'s writes.
    fn with_lanes_selected(&self, mask: LaneMask, f: impl FnOnce(&H)) {
        critical_section::with(|_| {
            self.hw().select_lanes(mask);
            f(self.hw());
        });
    }
}
