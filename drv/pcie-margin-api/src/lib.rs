// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-visible definitions for PCIe Lane Margining at the Receiver.
//!
//! Everything in here is fixed by the PCIe base specification: the layout of
//! the per-lane margining control word the Root Port writes, the layout of
//! the status word it polls, the margin-type and payload encodings, and the
//! widths of the capability values a receiver reports. The controller itself
//! lives in `drv-pcie-margin`.

#![cfg_attr(not(test), no_std)]

use bitfield::bitfield;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use static_assertions::const_assert;

/// Largest number of lanes a single margining block serves.
pub const MAX_LANES: usize = 16;

// Lane sets are carried around as a `u16` bitmask.
const_assert!(MAX_LANES <= u16::BITS as usize);

/// Error counts are reported in a 6-bit field and saturate there.
pub const MAX_ERROR_COUNT: u8 = 0x3f;

bitfield! {
    /// Per-lane margining control register, as written by the host.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ControlWord(u16);
    impl Debug;
    pub u8, receiver, set_receiver: 2, 0;
    pub u8, margin_type, set_margin_type: 5, 3;
    pub usage_model, set_usage_model: 6;
    pub u8, payload, set_payload: 15, 8;
}

impl ControlWord {
    pub fn new(
        receiver: u8,
        margin_type: u8,
        usage_model: bool,
        payload: u8,
    ) -> Self {
        let mut w = ControlWord(0);
        w.set_receiver(receiver);
        w.set_margin_type(margin_type);
        w.set_usage_model(usage_model);
        w.set_payload(payload);
        w
    }
}

impl From<u16> for ControlWord {
    fn from(raw: u16) -> Self {
        ControlWord(raw)
    }
}

impl From<ControlWord> for u16 {
    fn from(w: ControlWord) -> Self {
        w.0
    }
}

bitfield! {
    /// The shadow status register the host polls for replies.
    ///
    /// The low half mirrors the control word layout; the lane id is carried
    /// above it so a single register can serve every lane.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct StatusWord(u32);
    impl Debug;
    pub u8, receiver, set_receiver: 2, 0;
    pub u8, margin_type, set_margin_type: 5, 3;
    pub usage_model, set_usage_model: 6;
    pub u8, payload, set_payload: 15, 8;
    pub u8, lane, set_lane: 19, 16;
}

impl StatusWord {
    pub fn zeroed() -> Self {
        StatusWord(0)
    }
}

impl From<u32> for StatusWord {
    fn from(raw: u32) -> Self {
        StatusWord(raw)
    }
}

impl From<StatusWord> for u32 {
    fn from(w: StatusWord) -> Self {
        w.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum MarginType {
    Report = 1,
    Control = 2,
    StepTiming = 3,
    StepVoltage = 4,
    NoCommand = 7,
}

impl MarginType {
    /// Decodes the 3-bit margin type field. Encodings 0, 5 and 6 are
    /// reserved and come back as `None`.
    pub fn decode(raw: u8) -> Option<Self> {
        Self::from_u8(raw & 0b111)
    }
}

/// Execution status carried in the top two bits of a step-margin reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ExecStatus {
    TooManyErrors = 0b00,
    SetupInProgress = 0b01,
    MarginingInProgress = 0b10,
    Nak = 0b11,
}

/// Packs a step-margin reply payload.
pub fn step_payload(status: ExecStatus, error_count: u8) -> u8 {
    ((status as u8) << 6) | error_count.min(MAX_ERROR_COUNT)
}

/// Receiver numbers with a fixed meaning to this firmware.
pub mod receiver {
    /// Broadcast; legal only for the control commands and No-Command.
    pub const BROADCAST: u8 = 0b000;
    /// Receiver F, the upstream port: us.
    pub const UPSTREAM: u8 = 0b110;
}

/// Payload encodings for the report, control and no-command margin types.
pub mod payload {
    pub const GO_TO_NORMAL: u8 = 0x0f;
    pub const CLEAR_ERROR_LOG: u8 = 0x55;
    /// Set-Error-Count-Limit is `0b11xx_xxxx`, the limit in the low six bits.
    pub const SET_ERROR_LIMIT: u8 = 0xc0;
    pub const SET_ERROR_LIMIT_MASK: u8 = 0xc0;
    pub const ERROR_LIMIT_MASK: u8 = 0x3f;
    pub const NO_COMMAND: u8 = 0x9c;
}

/// Report (margin type 1) queries, keyed by their payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ReportKind {
    Capabilities = 0x88,
    NumVoltageSteps = 0x89,
    NumTimingSteps = 0x8a,
    MaxTimingOffset = 0x8b,
    MaxVoltageOffset = 0x8c,
    SamplingRateVoltage = 0x8d,
    SamplingRateTiming = 0x8e,
    SampleCount = 0x8f,
    MaxLanes = 0x90,
}

impl ReportKind {
    pub fn decode(payload: u8) -> Option<Self> {
        Self::from_u8(payload)
    }
}

/// Fixed margining capabilities of the receiver.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub voltage_supported: bool,
    pub ind_up_down_voltage: bool,
    pub ind_left_right_timing: bool,
    pub sample_reporting_method: bool,
    pub ind_error_sampler: bool,
    pub num_voltage_steps: u8,
    pub num_timing_steps: u8,
    pub max_timing_offset: u8,
    pub max_voltage_offset: u8,
    pub sampling_rate_voltage: u8,
    pub sampling_rate_timing: u8,
    pub sample_count: u8,
    /// Lanes that can be margined at once, minus one.
    pub max_lanes: u8,
}

impl Capabilities {
    /// Returns the reply payload for a report query, masked to the width
    /// the query defines.
    pub fn report(&self, kind: ReportKind) -> u8 {
        match kind {
            ReportKind::Capabilities => {
                u8::from(self.voltage_supported)
                    | u8::from(self.ind_up_down_voltage) << 1
                    | u8::from(self.ind_left_right_timing) << 2
                    | u8::from(self.sample_reporting_method) << 3
                    | u8::from(self.ind_error_sampler) << 4
            }
            ReportKind::NumVoltageSteps => self.num_voltage_steps & 0x7f,
            ReportKind::NumTimingSteps => self.num_timing_steps & 0x3f,
            ReportKind::MaxTimingOffset => self.max_timing_offset & 0x7f,
            ReportKind::MaxVoltageOffset => self.max_voltage_offset & 0x7f,
            ReportKind::SamplingRateVoltage => {
                self.sampling_rate_voltage & 0x3f
            }
            ReportKind::SamplingRateTiming => self.sampling_rate_timing & 0x3f,
            ReportKind::SampleCount => self.sample_count & 0x7f,
            ReportKind::MaxLanes => self.max_lanes & 0x1f,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, counters::Count)]
#[repr(u32)]
pub enum MarginError {
    /// The command addressed a receiver we aren't, or one its margin type
    /// doesn't allow.
    InvalidReceiverNumber = 1,
    /// The host sent something the protocol forbids outright.
    InvalidArgument,
    /// A bounded wait (work-item enqueue, hardware settle) ran out.
    Timeout,
    /// A lane or lane mask outside the configured lanes.
    OutOfRange,
    /// A reserved margin type or payload; no reply is produced.
    ReservedCommand,
    /// The shadow status register could not be written.
    StatusWriteFailed,
    /// An interrupt fired with nothing we recognize pending.
    NoPendingInterrupt,
}

impl MarginError {
    /// Errors that mean the firmware (or the host) is broken rather than
    /// that a single command went wrong.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            MarginError::InvalidArgument
                | MarginError::OutOfRange
                | MarginError::StatusWriteFailed
        )
    }
}

impl From<MarginError> for u32 {
    fn from(e: MarginError) -> Self {
        e as u32
    }
}
