//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use serde::Serialize;
use sfu_common::VideoHeight;

/// The maximum resolution and frame rate a receiver accepts for one source.
///
/// A zero maximum height disables the source entirely: no layer of a
/// disabled source is ever forwarded.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub max_height: VideoHeight,
    /// `None` means the receiver did not constrain the frame rate.
    pub max_framerate: Option<f64>,
}

impl VideoConstraints {
    pub const DISABLED: Self = Self {
        max_height: VideoHeight::ZERO,
        max_framerate: None,
    };

    pub fn new(max_height: VideoHeight) -> Self {
        Self {
            max_height,
            max_framerate: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.max_height == VideoHeight::ZERO
    }

    /// Whether a layer of the given height and frame rate satisfies these
    /// constraints.
    pub fn admits(&self, height: VideoHeight, frame_rate: f64) -> bool {
        !self.is_disabled()
            && height <= self.max_height
            && self.max_framerate.map_or(true, |max| frame_rate <= max)
    }
}
