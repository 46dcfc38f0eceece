// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding of the margining control word into typed commands.
//!
//! Decoding never fails: every bit pattern the host can write is a legal
//! byte on the wire, and the caller has to do *something* with it even when
//! that something is "ignore it". Legality is checked separately by
//! [`MarginRequest::validate_receiver`].

use crate::lane::Lane;
use drv_pcie_margin_api::{
    payload, receiver, Capabilities, ControlWord, MarginError, MarginType,
    ReportKind,
};

/// One decoded read of a lane's margining control register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MarginRequest {
    pub lane: Lane,
    pub control: ControlWord,
    /// `None` for the reserved encodings 0, 5 and 6.
    pub margin_type: Option<MarginType>,
    pub receiver: u8,
    pub usage_model: bool,
    pub payload: u8,
}

pub fn classify(lane: Lane, control: ControlWord) -> MarginRequest {
    MarginRequest {
        lane,
        control,
        margin_type: MarginType::decode(control.margin_type()),
        receiver: control.receiver(),
        usage_model: control.usage_model(),
        payload: control.payload(),
    }
}

/// Commands that complete in the context that received them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Immediate {
    Report(ReportKind),
    GoToNormal,
    ClearErrorLog,
    SetErrorLimit(u8),
    NoCommand,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Immediate(Immediate),
    Step(StepSetting),
    /// A reserved margin type or payload. Nothing is done and nothing is
    /// reported.
    Reserved,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepKind {
    Timing,
    Voltage,
}

/// A step-margin request: which offset to apply, as the raw payload byte
/// (step count plus direction).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StepSetting {
    pub kind: StepKind,
    pub offset: u8,
}

impl StepSetting {
    pub fn steps(&self) -> u8 {
        match self.kind {
            StepKind::Timing => self.offset & 0x3f,
            StepKind::Voltage => self.offset & 0x7f,
        }
    }

    /// Left for timing, down for voltage.
    pub fn reversed(&self) -> bool {
        match self.kind {
            StepKind::Timing => self.offset & 0x40 != 0,
            StepKind::Voltage => self.offset & 0x80 != 0,
        }
    }

    /// Whether the receiver can execute this offset at all. Anything it
    /// can't gets a NAK instead of being scheduled.
    pub fn supported(&self, caps: &Capabilities) -> bool {
        match self.kind {
            StepKind::Timing => {
                self.offset & 0x80 == 0
                    && self.steps() <= caps.num_timing_steps
                    && (!self.reversed() || caps.ind_left_right_timing)
            }
            StepKind::Voltage => {
                caps.voltage_supported
                    && self.steps() <= caps.num_voltage_steps
                    && (!self.reversed() || caps.ind_up_down_voltage)
            }
        }
    }
}

impl MarginRequest {
    pub fn command(&self) -> Command {
        match self.margin_type {
            Some(MarginType::Report) => match ReportKind::decode(self.payload)
            {
                Some(kind) => Command::Immediate(Immediate::Report(kind)),
                None => Command::Reserved,
            },
            Some(MarginType::Control) => match self.payload {
                payload::GO_TO_NORMAL => {
                    Command::Immediate(Immediate::GoToNormal)
                }
                payload::CLEAR_ERROR_LOG => {
                    Command::Immediate(Immediate::ClearErrorLog)
                }
                p if p & payload::SET_ERROR_LIMIT_MASK
                    == payload::SET_ERROR_LIMIT =>
                {
                    Command::Immediate(Immediate::SetErrorLimit(
                        p & payload::ERROR_LIMIT_MASK,
                    ))
                }
                _ => Command::Reserved,
            },
            Some(MarginType::StepTiming) => Command::Step(StepSetting {
                kind: StepKind::Timing,
                offset: self.payload,
            }),
            Some(MarginType::StepVoltage) => Command::Step(StepSetting {
                kind: StepKind::Voltage,
                offset: self.payload,
            }),
            Some(MarginType::NoCommand) => {
                Command::Immediate(Immediate::NoCommand)
            }
            None => Command::Reserved,
        }
    }

    /// Checks the receiver number against what the margin type allows.
    ///
    /// Reports and step margining are only ever addressed to us as the
    /// upstream port. Control commands may also be broadcast. No-Command
    /// has exactly one legal encoding; anything else means the host is
    /// misbehaving and comes back as `InvalidArgument`.
    pub fn validate_receiver(&self) -> Result<(), MarginError> {
        match self.margin_type {
            Some(
                MarginType::Report
                | MarginType::StepTiming
                | MarginType::StepVoltage,
            ) => {
                if self.receiver == receiver::UPSTREAM {
                    Ok(())
                } else {
                    Err(MarginError::InvalidReceiverNumber)
                }
            }
            Some(MarginType::Control) => match self.receiver {
                receiver::BROADCAST | receiver::UPSTREAM => Ok(()),
                _ => Err(MarginError::InvalidReceiverNumber),
            },
            Some(MarginType::NoCommand) => {
                if self.receiver == receiver::BROADCAST
                    && self.payload == payload::NO_COMMAND
                {
                    Ok(())
                } else {
                    Err(MarginError::InvalidArgument)
                }
            }
            None => Err(MarginError::ReservedCommand),
        }
    }
}
