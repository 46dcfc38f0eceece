// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board configuration for the margining controller.
//!
//! This is the `config` table of the owning task in the app TOML, e.g.:
//!
//! ```toml
//! [tasks.pcie_margin.config]
//! lanes = 8
//! settle-timeout-ns = 250_000
//! ```

use drv_pcie_margin_api::{MarginError, MAX_LANES};
use serde::Deserialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MarginConfig {
    /// Lanes wired to the margining block.
    #[serde(default = "MarginConfig::default_lanes")]
    pub lanes: u8,

    /// How long the worker waits for room when requeueing itself.
    #[serde(default = "MarginConfig::default_step_timeout_ns")]
    pub step_timeout_ns: u64,

    /// How long the analog front end gets to settle after being armed.
    #[serde(default = "MarginConfig::default_settle_timeout_ns")]
    pub settle_timeout_ns: u64,
}

impl MarginConfig {
    pub const DEFAULT: Self = MarginConfig {
        lanes: MAX_LANES as u8,
        step_timeout_ns: 10_000_000,
        settle_timeout_ns: 100_000,
    };

    fn default_lanes() -> u8 {
        Self::DEFAULT.lanes
    }

    fn default_step_timeout_ns() -> u64 {
        Self::DEFAULT.step_timeout_ns
    }

    fn default_settle_timeout_ns() -> u64 {
        Self::DEFAULT.settle_timeout_ns
    }

    pub fn validate(&self) -> Result<(), MarginError> {
        if self.lanes == 0 || usize::from(self.lanes) > MAX_LANES {
            return Err(MarginError::OutOfRange);
        }
        Ok(())
    }
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
