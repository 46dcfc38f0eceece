// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCIe Lane Margining at the Receiver, upstream-port side.
//!
//! The host's Root Port drives margining by writing a per-lane control
//! register; we get an interrupt, work out what it wants, do it, and answer
//! through a shadow status register the host polls.
//!
//! Work is split across two contexts:
//!
//! - The interrupt path ([`Margining::service_interrupt`]) handles one
//!   pending condition per call. Report and control commands complete
//!   there. Step-margin requests are acknowledged with "setup in progress"
//!   and handed off.
//!
//! - The worker ([`Margining::run_step`], or [`Margining::begin_step`] and
//!   [`Margining::finish_step`] separately) runs step-margin measurements
//!   one lane at a time, then picks the next lane owed a result in
//!   round-robin order.
//!
//! Both entry points trace and count what goes wrong, and panic on errors
//! that mean the host or this firmware is broken.
//!
//! At most one lane is ever in flight between the two. The `Margining`
//! value is shared by reference between both contexts; everything they both
//! mutate sits behind one critical-section mutex.
//!
//! Hardware is reached through [`MarginHw`] and the hand-off through
//! [`WorkQueue`]; [`StepQueue`] is a ready-made queue for the latter.

#![cfg_attr(not(test), no_std)]

mod command;
mod config;
mod dispatch;
mod hw;
mod immediate;
mod lane;
mod queue;
mod scheduler;
mod status;
mod time;

pub use crate::command::{
    classify, Command, Immediate, MarginRequest, StepKind, StepSetting,
};
pub use crate::config::MarginConfig;
pub use crate::dispatch::{pending_source, Disposition, Serviced};
pub use crate::hw::{IntrAck, IntrSource, IntrStatus, MarginHw};
pub use crate::lane::{Lane, LaneMask, LanePhase};
pub use crate::queue::{StepQueue, StepWork, WorkQueue};
pub use crate::scheduler::{Armed, Iteration, Measurement, Next, StepOutcome};
pub use crate::status::{Reply, StatusReport};
pub use crate::time::{wait_for, Timebase};

use crate::lane::SchedState;
use core::cell::RefCell;
use counters::counters;
use critical_section::Mutex;
use drv_pcie_margin_api::MarginError;

// Failures from both the interrupt and the worker entry points.
counters!(MarginError);

pub struct Margining<H, Q> {
    hw: H,
    queue: Q,
    config: MarginConfig,
    state: Mutex<RefCell<SchedState>>,
}

impl<H: MarginHw, Q: WorkQueue> Margining<H, Q> {
    pub fn new(
        hw: H,
        queue: Q,
        config: MarginConfig,
    ) -> Result<Self, MarginError> {
        config.validate()?;
        Ok(Margining {
            hw,
            queue,
            config,
            state: Mutex::new(RefCell::new(SchedState::new())),
        })
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn config(&self) -> &MarginConfig {
        &self.config
    }

    /// Lane `n`, if it's one of ours.
    pub fn lane(&self, n: u8) -> Result<Lane, MarginError> {
        Lane::new(n, self.config.lanes)
    }

    /// Lanes currently owed a step-margin result.
    pub fn scheduled(&self) -> LaneMask {
        self.with_state(|s| s.scheduled)
    }

    /// The lane holding the in-flight slot, if any.
    pub fn in_flight(&self) -> Option<Lane> {
        self.with_state(|s| s.in_flight().map(|f| f.lane))
    }

    pub fn lane_phase(&self, lane: Lane) -> LanePhase {
        self.with_state(|s| s.phase(lane))
    }

    /// The offset `lane` is believed to be armed with.
    pub fn last_step(&self, lane: Lane) -> Option<StepSetting> {
        self.with_state(|s| s.lane(lane).last)
    }

    pub fn error_counting(&self, lane: Lane) -> bool {
        self.with_state(|s| s.lane(lane).error_counting)
    }

    /// Nothing in flight and nothing owed.
    pub fn is_idle(&self) -> bool {
        self.with_state(|s| s.in_flight().is_none() && s.scheduled.is_empty())
    }

    /// Runs `f` on the shared state inside a critical section. `f` can't
    /// block, and nothing it borrows outlives the call.
    pub(crate) fn with_state<R>(
        &self,
        f: impl FnOnce(&mut SchedState) -> R,
    ) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }
}
