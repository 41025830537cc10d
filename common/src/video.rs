//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt::{self, Display, Formatter};

use serde::Serialize;

/// The height of a video frame in pixels.
#[derive(
    Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize,
)]
#[serde(transparent)]
pub struct VideoHeight(u16);

impl VideoHeight {
    pub const ZERO: Self = Self(0);

    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl From<u16> for VideoHeight {
    fn from(height: u16) -> Self {
        Self(height)
    }
}

impl Display for VideoHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}p", self.0)
    }
}

#[cfg(test)]
mod video_height_tests {
    use super::VideoHeight;

    #[test]
    fn default_is_zero() {
        assert_eq!(VideoHeight::ZERO, Default::default());
    }

    #[test]
    fn ordering_follows_pixels() {
        assert!(VideoHeight::from(720) > VideoHeight::from(360));
        assert!(VideoHeight::from(180) < VideoHeight::from(360));
    }

    #[test]
    fn display() {
        assert_eq!("360p", format!("{}", VideoHeight::from(360)));
    }
}
