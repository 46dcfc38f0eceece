// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deadlines.

use drv_pcie_margin_api::MarginError;

/// A free-running nanosecond clock.
pub trait Timebase {
    fn now_ns(&self) -> u64;

    /// Called between polls. Defaults to a spin hint; a task that can
    /// afford to yield should do so here.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Polls `ready` until it returns true or `timeout_ns` has passed.
///
/// `ready` is always tried at least once, so a zero timeout is a single
/// non-blocking attempt. Never call this inside a critical section.
pub fn wait_for<T: Timebase + ?Sized>(
    clock: &T,
    timeout_ns: u64,
    mut ready: impl FnMut() -> bool,
) -> Result<(), MarginError> {
    let deadline = clock.now_ns().saturating_add(timeout_ns);
    loop {
        if ready() {
            return Ok(());
        }
        if clock.now_ns() >= deadline {
            return Err(MarginError::Timeout);
        }
        clock.relax();
    }
}
