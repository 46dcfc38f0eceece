// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An instrumented stand-in for the margining hardware.
//!
//! Control words, pending interrupts and error counts are set by the test;
//! everything the controller does to hardware is recorded in order.

#![allow(dead_code)]

use drv_pcie_margin::{
    IntrAck, IntrStatus, Lane, LaneMask, MarginConfig, MarginHw, Margining,
    Serviced, StepOutcome, StepQueue, StepSetting, Timebase,
};
use drv_pcie_margin_api::{
    Capabilities, ControlWord, MarginError, StatusWord, MAX_LANES,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Ack(u64),
    Status(StatusWord),
    Ready(bool),
    Select(u16),
    Arm(StepSetting),
    Disarm,
    ReadCount(u16),
    ClearCount(u8),
    SetLimit(u8, u8),
    Counting(u8, bool),
}

struct Regs {
    control: [u16; MAX_LANES],
    intr: u64,
    counts: [u8; MAX_LANES],
    caps: Capabilities,
    settles: bool,
    status_fails: bool,
    calls: Vec<Call>,
}

pub struct MockHw {
    regs: Mutex<Regs>,
    now: AtomicU64,
}

/// Advertises everything, with room for a few steps.
pub fn full_caps() -> Capabilities {
    Capabilities {
        voltage_supported: true,
        ind_up_down_voltage: true,
        ind_left_right_timing: true,
        sample_reporting_method: false,
        ind_error_sampler: true,
        num_voltage_steps: 50,
        num_timing_steps: 16,
        max_timing_offset: 40,
        max_voltage_offset: 30,
        sampling_rate_voltage: 31,
        sampling_rate_timing: 31,
        sample_count: 39,
        max_lanes: 15,
    }
}

impl MockHw {
    pub fn new() -> Self {
        MockHw {
            regs: Mutex::new(Regs {
                control: [0; MAX_LANES],
                intr: 0,
                counts: [0; MAX_LANES],
                caps: full_caps(),
                settles: true,
                status_fails: false,
                calls: Vec::new(),
            }),
            now: AtomicU64::new(0),
        }
    }

    fn regs(&self) -> std::sync::MutexGuard<'_, Regs> {
        self.regs.lock().unwrap()
    }

    fn log(&self, call: Call) {
        self.regs().calls.push(call);
    }

    pub fn set_control(&self, lane: u8, w: ControlWord) {
        self.regs().control[usize::from(lane)] = u16::from(w);
    }

    pub fn raise(&self, bits: u64) {
        self.regs().intr |= bits;
    }

    pub fn pending(&self) -> u64 {
        self.regs().intr
    }

    pub fn set_count(&self, lane: u8, count: u8) {
        self.regs().counts[usize::from(lane)] = count;
    }

    pub fn set_caps(&self, caps: Capabilities) {
        self.regs().caps = caps;
    }

    pub fn set_settles(&self, settles: bool) {
        self.regs().settles = settles;
    }

    pub fn fail_status_writes(&self) {
        self.regs().status_fails = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.regs().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.regs().calls)
    }

    pub fn statuses(&self) -> Vec<StatusWord> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Status(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    pub fn last_status(&self) -> Option<StatusWord> {
        self.statuses().last().copied()
    }

    pub fn arms(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Arm(_)))
            .count()
    }
}

impl Timebase for MockHw {
    fn now_ns(&self) -> u64 {
        self.now.fetch_add(1_000, Ordering::Relaxed)
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

impl MarginHw for MockHw {
    fn read_control(&self, lane: Lane) -> ControlWord {
        ControlWord::from(self.regs().control[lane.index()])
    }

    fn read_intr_status(&self) -> IntrStatus {
        IntrStatus::from(self.regs().intr)
    }

    fn ack_intr(&self, ack: IntrAck) {
        let mut regs = self.regs();
        regs.intr &= !ack.bits();
        regs.calls.push(Call::Ack(ack.bits()));
    }

    fn write_shadow_status(
        &self,
        status: StatusWord,
    ) -> Result<(), MarginError> {
        let mut regs = self.regs();
        if regs.status_fails {
            return Err(MarginError::StatusWriteFailed);
        }
        regs.calls.push(Call::Status(status));
        Ok(())
    }

    fn set_margining_ready(&self, ready: bool) {
        self.log(Call::Ready(ready));
    }

    fn capabilities(&self) -> Capabilities {
        self.regs().caps
    }

    fn select_lanes(&self, mask: LaneMask) {
        self.log(Call::Select(mask.bits()));
    }

    fn arm_measurement(&self, setting: StepSetting) {
        self.log(Call::Arm(setting));
    }

    fn disarm_measurement(&self) {
        self.log(Call::Disarm);
    }

    fn margin_settled(&self, _lane: Lane) -> bool {
        self.regs().settles
    }

    fn read_error_count(&self, mask: LaneMask) -> u8 {
        let mut regs = self.regs();
        regs.calls.push(Call::ReadCount(mask.bits()));
        mask.lowest().map(|l| regs.counts[l.index()]).unwrap_or(0)
    }

    fn clear_error_count(&self, lane: Lane) {
        let mut regs = self.regs();
        regs.counts[lane.index()] = 0;
        regs.calls.push(Call::ClearCount(lane.number()));
    }

    fn set_error_limit(&self, lane: Lane, limit: u8) {
        self.log(Call::SetLimit(lane.number(), limit));
    }

    fn enable_error_counting(&self, lane: Lane, enable: bool) {
        self.log(Call::Counting(lane.number(), enable));
    }
}

pub type Dut = Margining<MockHw, StepQueue<2>>;

pub fn dut() -> Dut {
    dut_with(MarginConfig::default())
}

pub fn dut_with(config: MarginConfig) -> Dut {
    Margining::new(MockHw::new(), StepQueue::new(), config).unwrap()
}

pub fn lane(n: u8) -> Lane {
    Lane::new(n, MAX_LANES as u8).unwrap()
}

pub fn command_bit(lane: u8) -> u64 {
    1 << (32 + lane)
}

pub fn error_limit_bit(lane: u8) -> u64 {
    1 << (16 + lane)
}

pub fn status_bit(lane: u8) -> u64 {
    1 << (48 + lane)
}

pub const READY_BIT: u64 = 1 << 0;
pub const ABORT_BIT: u64 = 1 << 1;

/// Step timing, receiver F (us), `steps` to the right.
pub fn timing(steps: u8) -> ControlWord {
    ControlWord::new(6, 3, false, steps)
}

/// Step voltage, receiver F.
pub fn voltage(payload: u8) -> ControlWord {
    ControlWord::new(6, 4, false, payload)
}

/// The host writes `w` into `lane`'s control register.
pub fn host_writes(dut: &Dut, lane: u8, w: ControlWord) {
    dut.hw().set_control(lane, w);
    dut.hw().raise(command_bit(lane));
}

/// The host writes `w` and we take the interrupt.
pub fn command(
    dut: &Dut,
    lane: u8,
    w: ControlWord,
) -> Result<Serviced, MarginError> {
    host_writes(dut, lane, w);
    dut.on_margining_interrupt()
}

/// Runs the worker until its queue is empty, returning each iteration.
pub fn drain(dut: &Dut) -> Vec<(Lane, Result<StepOutcome, MarginError>)> {
    let mut out = vec![];
    while let Some(work) = dut.queue().dequeue() {
        out.push((work.lane(), dut.service_step(work)));
    }
    out
}
