//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

mod data_rate;
mod video;

pub use data_rate::DataRate;
pub use video::VideoHeight;
