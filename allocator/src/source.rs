//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Descriptors for the video sources the allocator chooses between.

use serde::Serialize;
use sfu_common::{DataRate, VideoHeight};

/// One forwardable encoding of a video source, as discovered by the RTP
/// transceiver.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RtpLayerDesc {
    /// Dense 0-based index into the source's layer list; higher is better
    /// quality.
    pub index: usize,
    pub temporal_id: u8,
    pub spatial_id: u8,
    pub height: VideoHeight,
    pub frame_rate: f64,
    /// Running estimate of the layer's send rate. Zero when the sender has
    /// not produced this layer recently.
    pub bitrate: DataRate,
}

/// A video source owned by some endpoint in the conference.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaSourceDesc {
    /// Unique within the conference.
    pub source_name: String,
    pub owner: String,
    /// In ascending quality order, with dense indices.
    pub layers: Vec<RtpLayerDesc>,
}

impl MediaSourceDesc {
    /// Whether the sender is currently producing any video for this source.
    pub fn has_video(&self) -> bool {
        self.layers.iter().any(|layer| layer.bitrate > DataRate::ZERO)
    }
}

/// Connection statistics from an endpoint's transceiver, reported to the
/// remote predictor. Values that are unknown stay at zero.
#[derive(Clone, Debug, Default)]
pub struct TransceiverStats {
    pub rtt_ms: f64,
    /// One entry per incoming SSRC.
    pub ssrc_jitters_ms: Vec<f64>,
    pub packets_lost: u64,
    pub packets_received: u64,
}

/// The surface the allocator needs from a conference endpoint. The real
/// implementation lives with the RTP transceiver; tests provide their own.
pub trait MediaEndpoint {
    fn id(&self) -> &str;
    fn media_sources(&self) -> Vec<MediaSourceDesc>;
    fn transceiver_stats(&self) -> TransceiverStats;
}
