// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Commands that complete where they are received.

use crate::command::{Immediate, MarginRequest};
use crate::hw::MarginHw;
use crate::lane::Lane;
use crate::queue::WorkQueue;
use crate::status::StatusReport;
use crate::Margining;
use drv_pcie_margin_api::{payload, MarginError, ReportKind};
use ringbuf::*;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Report { lane: Lane, kind: ReportKind, value: u8 },
    GoToNormal(Lane),
    ClearErrorLog(Lane),
    SetErrorLimit { lane: Lane, limit: u8 },
    NoCommand(Lane),
}

ringbuf!(Trace, 16, Trace::None);

impl<H: MarginHw, Q: WorkQueue> Margining<H, Q> {
    /// Runs `cmd` for `req.lane` and reports the result.
    ///
    /// `req` must already have passed
    /// [`MarginRequest::validate_receiver`].
    pub fn execute_immediate(
        &self,
        req: &MarginRequest,
        cmd: Immediate,
    ) -> Result<StatusReport, MarginError> {
        let lane = req.lane;
        let reply = match cmd {
            Immediate::Report(kind) => {
                let value = self.hw().capabilities().report(kind);
                ringbuf_entry!(Trace::Report { lane, kind, value });
                value
            }
            Immediate::GoToNormal => {
                ringbuf_entry!(Trace::GoToNormal(lane));
                self.go_to_normal(lane)?;
                payload::GO_TO_NORMAL
            }
            Immediate::ClearErrorLog => {
                ringbuf_entry!(Trace::ClearErrorLog(lane));
                self.hw().clear_error_count(lane);
                payload::CLEAR_ERROR_LOG
            }
            Immediate::SetErrorLimit(limit) => {
                let limit = limit & payload::ERROR_LIMIT_MASK;
                ringbuf_entry!(Trace::SetErrorLimit { lane, limit });
                self.hw().set_error_limit(lane, limit);
                payload::SET_ERROR_LIMIT | limit
            }
            Immediate::NoCommand => {
                ringbuf_entry!(Trace::NoCommand(lane));
                req.payload
            }
        };

        let report = StatusReport::echo(req, reply);
        self.report(&report)?;
        Ok(report)
    }

    /// Takes `lane` out of step margining: disarmed, error counting off, and
    /// no longer owed a result. The error count itself is left alone.
    pub fn go_to_normal(&self, lane: Lane) -> Result<(), MarginError> {
        self.stop_margining(lane.mask(), false)?;
        self.set_error_counting(lane, false);
        self.with_state(|s| s.cancel(lane));
        Ok(())
    }
}
