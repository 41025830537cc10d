//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Configuration options for the bandwidth allocator.

use std::time::Duration;

use clap;

/// Policy knobs for per-receiver bandwidth allocation, set by command line
/// arguments or falls back to defaults.
#[derive(Default, clap::Parser, Debug, Clone)]
#[clap(name = "bandwidth_allocator")]
pub struct Config {
    /// Fraction by which the bandwidth estimate must change, relative to
    /// the last estimate we reacted to, before a re-allocation is
    /// triggered.
    #[clap(long, default_value = "0.15")]
    pub bwe_change_threshold: f64,

    /// Maximum time between two allocation runs (ms). The periodic timer
    /// re-allocates at least this often even when no other trigger fires.
    #[clap(long, default_value = "15000")]
    pub max_time_between_reallocations_ms: u64,

    /// Maximum height allocated for sources the receiver did not
    /// explicitly constrain (thumbnails in tile view).
    #[clap(long, default_value = "180")]
    pub thumbnail_max_height_px: u16,

    /// Height folded into the effective constraints of on-stage sources,
    /// so that an on-stage source is never capped below this.
    #[clap(long, default_value = "1080")]
    pub onstage_max_height_px: u16,

    /// The lowest layer height considered "preferred" for an on-stage
    /// source. Thumbnails get no bandwidth until the on-stage source has
    /// reached a layer of at least this height.
    #[clap(long, default_value = "360")]
    pub onstage_preferred_height_px: u16,

    /// The lowest layer frame rate considered "preferred" for an on-stage
    /// source.
    #[clap(long, default_value = "30")]
    pub onstage_preferred_framerate: f64,

    /// URL of the remote allocation predictor. When unset, the greedy
    /// algorithm always runs locally.
    #[clap(long)]
    pub predictor_url: Option<String>,

    /// Wall-clock timeout for one predictor request (ms).
    #[clap(long, default_value = "50")]
    pub predictor_timeout_ms: u64,
}

impl Config {
    pub fn max_time_between_reallocations(&self) -> Duration {
        Duration::from_millis(self.max_time_between_reallocations_ms)
    }

    pub fn predictor_timeout(&self) -> Duration {
        Duration::from_millis(self.predictor_timeout_ms)
    }
}

#[cfg(test)]
pub(crate) fn default_test_config() -> Config {
    Config {
        bwe_change_threshold: 0.15,
        max_time_between_reallocations_ms: 15000,
        thumbnail_max_height_px: 180,
        onstage_max_height_px: 1080,
        onstage_preferred_height_px: 360,
        onstage_preferred_framerate: 30.0,
        predictor_url: None,
        predictor_timeout_ms: 50,
    }
}
