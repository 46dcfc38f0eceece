// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lane numbering and the state shared between interrupt and worker
//! contexts.
//!
//! [`SchedState`] is the only mutable state the two contexts share. It lives
//! behind a `critical_section::Mutex` in [`crate::Margining`] and is only
//! ever touched through `Margining::with_state`.

use crate::command::StepSetting;
use drv_pcie_margin_api::{MarginError, MAX_LANES};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lane(u8);

impl Lane {
    /// Returns lane `n` if it is one of the first `lanes` lanes.
    pub fn new(n: u8, lanes: u8) -> Result<Self, MarginError> {
        if n < lanes && usize::from(n) < MAX_LANES {
            Ok(Lane(n))
        } else {
            Err(MarginError::OutOfRange)
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn mask(self) -> LaneMask {
        LaneMask(1 << self.0)
    }
}

/// A set of lanes, one bit per lane.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LaneMask(u16);

impl LaneMask {
    pub const EMPTY: Self = LaneMask(0);

    pub fn from_bits(bits: u16) -> Self {
        LaneMask(bits)
    }

    /// The first `lanes` lanes.
    pub fn all(lanes: u8) -> Self {
        match 1u16.checked_shl(u32::from(lanes)) {
            Some(bit) => LaneMask(bit - 1),
            None => LaneMask(u16::MAX),
        }
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, lane: Lane) -> bool {
        self.0 & lane.mask().0 != 0
    }

    pub fn insert(&mut self, lane: Lane) {
        self.0 |= lane.mask().0;
    }

    pub fn remove(&mut self, lane: Lane) {
        self.0 &= !lane.mask().0;
    }

    /// True if every lane in `self` is one of the first `lanes` lanes.
    pub fn within(self, lanes: u8) -> bool {
        self.0 & !LaneMask::all(lanes).0 == 0
    }

    pub fn lowest(self) -> Option<Lane> {
        if self.is_empty() {
            None
        } else {
            Some(Lane(self.0.trailing_zeros() as u8))
        }
    }

    pub fn iter(self) -> impl Iterator<Item = Lane> {
        (0..MAX_LANES as u8)
            .map(Lane)
            .filter(move |&lane| self.contains(lane))
    }

    /// Round-robin successor: the first lane in `self` after `last`,
    /// wrapping past lane `lanes - 1` back to lane 0. `last` itself is the
    /// final candidate, so a lone lane keeps getting picked for as long as
    /// it stays in the set.
    pub fn next_after(self, last: Lane, lanes: u8) -> Option<Lane> {
        let lanes = lanes.min(MAX_LANES as u8);
        if self.is_empty() || lanes == 0 {
            return None;
        }
        (1..=lanes)
            .map(|i| Lane((last.0 + i) % lanes))
            .find(|&lane| self.contains(lane))
    }
}

/// Where a lane sits in the step-margining state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LanePhase {
    /// Not holding the in-flight slot. The lane may still be owed a result
    /// (see [`crate::Margining::scheduled`]); it is waiting its turn.
    Idle,
    /// Holds the slot; its work item is queued but the worker hasn't
    /// touched hardware yet.
    Armed,
    /// Hardware is running the offset and counting errors.
    Measuring,
    /// The error count has been read and is being committed or discarded.
    Reporting,
}

/// The lane holding the single in-flight slot and how far along it is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct InFlight {
    pub lane: Lane,
    pub phase: LanePhase,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LaneState {
    /// What the analog front end was last armed with for this lane, if we
    /// still trust it to be armed that way.
    pub last: Option<StepSetting>,
    /// Mirrors the hardware error-counting enable.
    pub error_counting: bool,
    /// Bumped whenever the lane is stopped or cancelled from outside the
    /// worker. A measurement started under an older epoch is stale even if
    /// the lane has since been asked for the very same step again.
    pub epoch: u8,
}

impl LaneState {
    const INIT: Self = LaneState {
        last: None,
        error_counting: false,
        epoch: 0,
    };
}

pub(crate) struct SchedState {
    /// Lanes owed a step-margin result.
    pub scheduled: LaneMask,
    /// At most one lane can be in flight; this is the only place that says
    /// which.
    in_flight: Option<InFlight>,
    lanes: [LaneState; MAX_LANES],
}

impl SchedState {
    pub const fn new() -> Self {
        SchedState {
            scheduled: LaneMask::EMPTY,
            in_flight: None,
            lanes: [LaneState::INIT; MAX_LANES],
        }
    }

    pub fn lane(&self, lane: Lane) -> &LaneState {
        &self.lanes[lane.index()]
    }

    pub fn lane_mut(&mut self, lane: Lane) -> &mut LaneState {
        &mut self.lanes[lane.index()]
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    pub fn phase(&self, lane: Lane) -> LanePhase {
        match self.in_flight {
            Some(f) if f.lane == lane => f.phase,
            _ => LanePhase::Idle,
        }
    }

    /// Takes the in-flight slot for `lane` if nobody holds it.
    pub fn claim(&mut self, lane: Lane) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        self.in_flight = Some(InFlight {
            lane,
            phase: LanePhase::Armed,
        });
        true
    }

    /// Passes the slot from whoever holds it to `lane`.
    pub fn hand_off(&mut self, lane: Lane) {
        self.in_flight = Some(InFlight {
            lane,
            phase: LanePhase::Armed,
        });
    }

    /// Moves the slot holder to `phase`. Returns false (and changes
    /// nothing) if `lane` doesn't hold the slot.
    pub fn advance(&mut self, lane: Lane, phase: LanePhase) -> bool {
        match &mut self.in_flight {
            Some(f) if f.lane == lane => {
                f.phase = phase;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self) {
        self.in_flight = None;
    }

    /// Drops what we believe each lane in `mask` is armed with.
    pub fn forget(&mut self, mask: LaneMask) {
        for lane in mask.iter() {
            let l = self.lane_mut(lane);
            l.last = None;
            l.epoch = l.epoch.wrapping_add(1);
        }
    }

    /// `lane` is no longer owed a result, and whatever the worker is doing
    /// with it is void.
    pub fn cancel(&mut self, lane: Lane) {
        self.scheduled.remove(lane);
        self.forget(lane.mask());
    }

    /// Start of a margining session, or the end of one: nothing is owed
    /// and nothing is trusted to be armed.
    pub fn reset_session(&mut self) {
        self.scheduled = LaneMask::EMPTY;
        for l in self.lanes.iter_mut() {
            l.last = None;
            l.epoch = l.epoch.wrapping_add(1);
        }
    }
}
