// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replies to the host, via the shadow status register.

use crate::command::MarginRequest;
use crate::hw::MarginHw;
use crate::lane::Lane;
use crate::queue::WorkQueue;
use crate::Margining;
use drv_pcie_margin_api::{step_payload, ExecStatus, MarginError, StatusWord};

/// What goes in the payload byte of a reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Report, control and no-command replies: a byte, verbatim.
    Echo(u8),
    /// Step-margin replies: execution status and error count.
    Step { status: ExecStatus, error_count: u8 },
}

impl Reply {
    pub fn payload(self) -> u8 {
        match self {
            Reply::Echo(p) => p,
            Reply::Step {
                status,
                error_count,
            } => step_payload(status, error_count),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub lane: Lane,
    /// The raw 3-bit margin type being answered.
    pub margin_type: u8,
    pub receiver: u8,
    pub usage_model: bool,
    pub reply: Reply,
}

impl StatusReport {
    /// A reply to `req` that carries `payload` as-is.
    pub fn echo(req: &MarginRequest, payload: u8) -> Self {
        Self::with_reply(req, Reply::Echo(payload))
    }

    /// A step-margin reply to `req`.
    pub fn step(
        req: &MarginRequest,
        status: ExecStatus,
        error_count: u8,
    ) -> Self {
        Self::with_reply(
            req,
            Reply::Step {
                status,
                error_count,
            },
        )
    }

    fn with_reply(req: &MarginRequest, reply: Reply) -> Self {
        StatusReport {
            lane: req.lane,
            margin_type: req.control.margin_type(),
            receiver: req.receiver,
            usage_model: req.usage_model,
            reply,
        }
    }

    pub fn word(&self) -> StatusWord {
        let mut w = StatusWord::zeroed();
        w.set_lane(self.lane.number());
        w.set_receiver(self.receiver);
        w.set_margin_type(self.margin_type);
        w.set_usage_model(self.usage_model);
        w.set_payload(self.reply.payload());
        w
    }
}

impl<H: MarginHw, Q: WorkQueue> Margining<H, Q> {
    /// Publishes `report` to the host. A failed write is fatal; callers
    /// pass the error up to [`Margining::service_interrupt`] or the worker
    /// loop to deal with.
    pub fn report(&self, report: &StatusReport) -> Result<(), MarginError> {
        self.hw().write_shadow_status(report.word())
    }
}
