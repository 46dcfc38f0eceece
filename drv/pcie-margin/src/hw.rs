// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hardware this crate drives, as seen through [`MarginHw`].
//!
//! Register plumbing, address resolution and interrupt routing below the
//! margining leaf all belong to whoever implements the trait. Every method
//! here is a handful of register accesses: none of them block.

use crate::command::StepSetting;
use crate::lane::{Lane, LaneMask};
use crate::time::Timebase;
use bitfield::bitfield;
use drv_pcie_margin_api::{Capabilities, ControlWord, MarginError, StatusWord};

pub trait MarginHw: Timebase {
    /// Reads the host-written margining control register for `lane`.
    fn read_control(&self, lane: Lane) -> ControlWord;

    fn read_intr_status(&self) -> IntrStatus;

    /// Writes the interrupt acknowledge register. Write-one-to-clear; a
    /// zero in any position leaves that condition alone.
    fn ack_intr(&self, ack: IntrAck);

    /// Writes the shadow status register. A failure here is not
    /// recoverable.
    fn write_shadow_status(&self, status: StatusWord)
        -> Result<(), MarginError>;

    /// Sets or clears margining-ready in config space.
    fn set_margining_ready(&self, ready: bool);

    fn capabilities(&self) -> Capabilities;

    /// Points the multicast lane-select register at `mask`. Subsequent
    /// arm/disarm writes apply to exactly these lanes.
    fn select_lanes(&self, mask: LaneMask);

    /// Arms the analog front end of the selected lanes with an offset.
    fn arm_measurement(&self, setting: StepSetting);

    /// Clears margin-enable on the selected lanes.
    fn disarm_measurement(&self);

    /// True once the front end has settled at the armed offset.
    fn margin_settled(&self, lane: Lane) -> bool;

    fn read_error_count(&self, mask: LaneMask) -> u8;

    fn clear_error_count(&self, lane: Lane);

    fn set_error_limit(&self, lane: Lane, limit: u8);

    fn enable_error_counting(&self, lane: Lane, enable: bool);
}

const ERROR_LIMIT_SHIFT: u32 = 16;
const COMMAND_SHIFT: u32 = 32;
const STATUS_SHIFT: u32 = 48;

bitfield! {
    /// Snapshot of the margining interrupt status register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct IntrStatus(u64);
    impl Debug;
    pub ready, _: 0;
    pub abort, _: 1;
    pub u16, error_limit, _: 31, 16;
    pub u16, command, _: 47, 32;
    pub u16, status, _: 63, 48;
}

impl From<u64> for IntrStatus {
    fn from(raw: u64) -> Self {
        IntrStatus(raw)
    }
}

/// One interrupt condition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntrSource {
    Ready,
    Abort,
    ErrorLimit(Lane),
    Command(Lane),
    Status(Lane),
}

/// A value for the interrupt acknowledge register.
///
/// The only way to make one is [`IntrAck::only`], which sets the single bit
/// for the condition being handled. Writing back a status snapshot would
/// clear conditions nobody has looked at yet, and hardware ignores an
/// all-zero write, so neither is expressible.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IntrAck(u64);

impl IntrAck {
    pub fn only(source: IntrSource) -> Self {
        let bit = match source {
            IntrSource::Ready => 0,
            IntrSource::Abort => 1,
            IntrSource::ErrorLimit(lane) => {
                ERROR_LIMIT_SHIFT + u32::from(lane.number())
            }
            IntrSource::Command(lane) => {
                COMMAND_SHIFT + u32::from(lane.number())
            }
            IntrSource::Status(lane) => STATUS_SHIFT + u32::from(lane.number()),
        };
        IntrAck(1u64 << bit)
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}
