// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handing step-margin work from interrupt context to the worker.

use crate::lane::Lane;
use crate::time::{wait_for, Timebase};
use core::cell::RefCell;
use critical_section::Mutex;
use drv_pcie_margin_api::MarginError;
use heapless::Deque;

/// A unit of work for the worker: service one lane.
///
/// Only the scheduler mints these, and only for the lane that holds the
/// in-flight slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StepWork {
    lane: Lane,
}

impl StepWork {
    pub(crate) fn new(lane: Lane) -> Self {
        StepWork { lane }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }
}

pub trait WorkQueue {
    /// Queues `work`, waiting up to `timeout_ns` for room.
    fn enqueue<T: Timebase>(
        &self,
        work: StepWork,
        timeout_ns: u64,
        clock: &T,
    ) -> Result<(), MarginError>;
}

/// A fixed-capacity FIFO of work items, safe to fill from interrupt context
/// and drain from the worker.
///
/// The scheduler never has more than one item outstanding, so `N = 1` is
/// enough; more capacity is harmless.
pub struct StepQueue<const N: usize> {
    items: Mutex<RefCell<Deque<StepWork, N>>>,
}

impl<const N: usize> StepQueue<N> {
    pub const fn new() -> Self {
        StepQueue {
            items: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    pub fn dequeue(&self) -> Option<StepWork> {
        critical_section::with(|cs| self.items.borrow_ref_mut(cs).pop_front())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.items.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_push(&self, work: StepWork) -> bool {
        critical_section::with(|cs| {
            self.items.borrow_ref_mut(cs).push_back(work).is_ok()
        })
    }
}

impl<const N: usize> Default for StepQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> WorkQueue for StepQueue<N> {
    fn enqueue<T: Timebase>(
        &self,
        work: StepWork,
        timeout_ns: u64,
        clock: &T,
    ) -> Result<(), MarginError> {
        wait_for(clock, timeout_ns, || self.try_push(work))
    }
}
