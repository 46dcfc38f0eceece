// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The margining interrupt.
//!
//! Each call handles exactly one pending condition and acknowledges exactly
//! that one. Anything else still pending keeps the interrupt asserted and
//! gets its own call.

use crate::command::{classify, Command};
use crate::hw::{IntrAck, IntrSource, IntrStatus, MarginHw};
use crate::lane::{Lane, LaneMask};
use crate::queue::WorkQueue;
use crate::scheduler::Armed;
use crate::status::StatusReport;
use crate::Margining;
use counters::count;
use drv_pcie_margin_api::MarginError;
use ringbuf::*;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Pending(IntrStatus),
    Handling(IntrSource),
    Rejected { lane: Lane, err: MarginError },
    Failed(MarginError),
}

ringbuf!(Trace, 32, Trace::None);

/// What became of one margining interrupt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    SessionReady,
    Aborted,
    /// The lane was stopped and told it had too many errors.
    TooManyErrors(StatusReport),
    /// An immediate command ran and was answered.
    Completed(StatusReport),
    /// A step-margin request was accepted (or NAKed).
    Step(Armed),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Serviced {
    pub source: IntrSource,
    pub disposition: Disposition,
}

/// Picks the condition to handle from a status snapshot, highest priority
/// first: ready, abort, then per-lane error limit, command and status, each
/// lowest lane first.
///
/// An error-limit condition on any lane outranks a command on any lane.
/// A per-lane bit past the configured lane count is `OutOfRange`.
pub fn pending_source(
    status: IntrStatus,
    lanes: u8,
) -> Result<Option<IntrSource>, MarginError> {
    if status.ready() {
        return Ok(Some(IntrSource::Ready));
    }
    if status.abort() {
        return Ok(Some(IntrSource::Abort));
    }

    let per_lane: [(u16, fn(Lane) -> IntrSource); 3] = [
        (status.error_limit(), IntrSource::ErrorLimit),
        (status.command(), IntrSource::Command),
        (status.status(), IntrSource::Status),
    ];
    for (bits, source) in per_lane {
        let mask = LaneMask::from_bits(bits);
        if !mask.within(lanes) {
            return Err(MarginError::OutOfRange);
        }
        if let Some(lane) = mask.lowest() {
            return Ok(Some(source(lane)));
        }
    }
    Ok(None)
}

impl<H: MarginHw, Q: WorkQueue> Margining<H, Q> {
    /// Handles the highest-priority pending margining condition.
    ///
    /// Returns `NoPendingInterrupt` if nothing we recognize is pending.
    pub fn on_margining_interrupt(&self) -> Result<Serviced, MarginError> {
        let status = self.hw().read_intr_status();
        ringbuf_entry!(Trace::Pending(status));

        let source = pending_source(status, self.config().lanes)?
            .ok_or(MarginError::NoPendingInterrupt)?;

        // Ack first, so a condition raised again while we handle this one
        // isn't lost.
        self.hw().ack_intr(IntrAck::only(source));
        ringbuf_entry!(Trace::Handling(source));

        let disposition = match source {
            IntrSource::Ready => {
                self.session_ready();
                Disposition::SessionReady
            }
            IntrSource::Abort => {
                self.abort()?;
                Disposition::Aborted
            }
            IntrSource::ErrorLimit(lane) => {
                Disposition::TooManyErrors(self.error_limit_exceeded(lane)?)
            }
            IntrSource::Command(lane) | IntrSource::Status(lane) => {
                self.handle_command(lane)?
            }
        };
        Ok(Serviced {
            source,
            disposition,
        })
    }

    /// Interrupt entry point.
    ///
    /// Errors are traced and counted. Fatal ones mean the host or this
    /// firmware is broken, and we take the task down rather than keep
    /// margining a link in an unknown state.
    pub fn service_interrupt(&self) -> Option<Serviced> {
        match self.on_margining_interrupt() {
            Ok(serviced) => Some(serviced),
            Err(e) => {
                ringbuf_entry!(Trace::Failed(e));
                count!(crate::__COUNTERS, e);
                if e.is_fatal() {
                    panic!("margining: {e:?}");
                }
                None
            }
        }
    }

    /// Reads, validates and acts on the control word for `lane`.
    ///
    /// Commands addressed to a receiver they can't be are answered with
    /// silence, as are reserved encodings: the shadow status register is
    /// left as it was, and the returned error (`InvalidReceiverNumber`,
    /// `InvalidArgument` or `ReservedCommand`) is the only report of it.
    pub fn handle_command(
        &self,
        lane: Lane,
    ) -> Result<Disposition, MarginError> {
        let req = classify(lane, self.hw().read_control(lane));
        if let Err(err) = req.validate_receiver() {
            ringbuf_entry!(Trace::Rejected { lane, err });
            return Err(err);
        }

        match req.command() {
            Command::Immediate(cmd) => {
                self.execute_immediate(&req, cmd).map(Disposition::Completed)
            }
            Command::Step(setting) => {
                self.arm_step(&req, setting).map(Disposition::Step)
            }
            Command::Reserved => Err(MarginError::ReservedCommand),
        }
    }

    /// Start of a margining session.
    pub fn session_ready(&self) {
        self.with_state(|s| s.reset_session());
        self.hw().set_margining_ready(true);
    }

    /// The host abandoned margining: every lane is stopped with its error
    /// count cleared, and we stop advertising readiness.
    ///
    /// A lane in flight keeps the slot; the worker sees it is no longer
    /// owed anything and drops its result.
    pub fn abort(&self) -> Result<(), MarginError> {
        self.with_state(|s| s.reset_session());

        let all = LaneMask::all(self.config().lanes);
        self.stop_margining(all, true)?;
        for lane in all.iter() {
            self.set_error_counting(lane, false);
        }
        self.hw().set_margining_ready(false);
        Ok(())
    }
}
