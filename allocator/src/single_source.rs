//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The working allocation for one source during a single run.

use std::cmp::min;

use sfu_common::{DataRate, VideoHeight};

use crate::{
    allocation::SingleAllocation,
    config::Config,
    constraints::VideoConstraints,
    source::{MediaSourceDesc, RtpLayerDesc},
};

/// One source's candidate layers and the layer chosen for it so far.
///
/// The target only ever moves up within a run; the bin-packing loop calls
/// [`SingleSourceAllocation::improve`] repeatedly until nothing fits.
pub struct SingleSourceAllocation {
    source: MediaSourceDesc,
    constraints: VideoConstraints,
    on_stage: bool,
    /// Active layers admitted by the constraints, ascending quality.
    /// Empty when the constraints are disabled.
    layers: Vec<RtpLayerDesc>,
    /// Position in `layers` above which an on-stage source yields to
    /// thumbnails. Present whenever `layers` is non-empty.
    preferred: Option<usize>,
    /// Position in `layers`; `None` is suspended.
    target: Option<usize>,
}

impl SingleSourceAllocation {
    pub fn new(
        source: MediaSourceDesc,
        constraints: VideoConstraints,
        on_stage: bool,
        config: &Config,
    ) -> Self {
        let layers: Vec<RtpLayerDesc> = if constraints.is_disabled() {
            Vec::new()
        } else {
            source
                .layers
                .iter()
                .filter(|layer| {
                    layer.bitrate > DataRate::ZERO
                        && constraints.admits(layer.height, layer.frame_rate)
                })
                .cloned()
                .collect()
        };

        // The preferred layer is the lowest candidate that meets the
        // configured quality bar, or the ideal layer if none does.
        let preferred_height = VideoHeight::from(config.onstage_preferred_height_px);
        let preferred_framerate = config.onstage_preferred_framerate;
        let preferred = if layers.is_empty() {
            None
        } else {
            Some(
                layers
                    .iter()
                    .position(|layer| {
                        layer.height >= preferred_height
                            && layer.frame_rate >= preferred_framerate
                    })
                    .unwrap_or(layers.len() - 1),
            )
        };

        Self {
            source,
            constraints,
            on_stage,
            layers,
            preferred,
            target: None,
        }
    }

    /// Try to raise the target layer within `budget`, and return the
    /// increase in target bitrate for the caller to subtract from its
    /// remaining budget.
    ///
    /// In stage view a suspended source is boosted straight to its
    /// preferred layer; afterwards (and always in tile view) the target
    /// advances one layer per call. A stage-view source that cannot afford
    /// even its lowest layer gets it anyway, so that the top-priority
    /// source never goes fully dark; the caller surfaces that as
    /// oversending.
    pub fn improve(&mut self, budget: DataRate, stage_view: bool) -> DataRate {
        if self.layers.is_empty() {
            return DataRate::ZERO;
        }
        let before = self.target_bitrate();

        if stage_view && self.target.is_none() {
            let preferred = self.preferred.expect("non-empty layers have a preferred");
            for position in 0..=preferred {
                if self.layers[position].bitrate > budget {
                    break;
                }
                self.target = Some(position);
            }
            if self.target.is_none() {
                // Minimum viable video.
                self.target = Some(0);
            }
        } else {
            let next = self.target.map_or(0, |target| target + 1);
            if next < self.layers.len() && self.layers[next].bitrate <= budget {
                self.target = Some(next);
            }
        }

        self.target_bitrate().saturating_sub(before)
    }

    /// Apply a remote predictor's target for this source. The hint is in
    /// the source's layer index space, clamped to the ideal layer; hints
    /// at or below -1 keep the source suspended. When the hinted layer
    /// cannot be used, because it does not fit the budget or no candidate
    /// survives at that index, this falls back to [`Self::improve`].
    pub fn apply_hint(&mut self, hint: i64, budget: DataRate, stage_view: bool) -> DataRate {
        if self.layers.is_empty() || hint < 0 {
            return DataRate::ZERO;
        }
        let hinted_index = min(
            hint as usize,
            self.layers.last().expect("non-empty").index,
        );
        let position = self
            .layers
            .iter()
            .rposition(|layer| layer.index <= hinted_index);
        match position {
            Some(position) if self.layers[position].bitrate <= budget => {
                let before = self.target_bitrate();
                self.target = Some(position);
                self.target_bitrate().saturating_sub(before)
            }
            _ => self.improve(budget, stage_view),
        }
    }

    pub fn source(&self) -> &MediaSourceDesc {
        &self.source
    }

    pub fn endpoint_id(&self) -> &str {
        &self.source.owner
    }

    pub fn constraints(&self) -> &VideoConstraints {
        &self.constraints
    }

    pub fn is_on_stage(&self) -> bool {
        self.on_stage
    }

    pub fn target_layer(&self) -> Option<&RtpLayerDesc> {
        self.target.map(|target| &self.layers[target])
    }

    pub fn ideal_layer(&self) -> Option<&RtpLayerDesc> {
        self.layers.last()
    }

    pub fn target_bitrate(&self) -> DataRate {
        self.target_layer().map_or(DataRate::ZERO, |layer| layer.bitrate)
    }

    pub fn ideal_bitrate(&self) -> DataRate {
        self.ideal_layer().map_or(DataRate::ZERO, |layer| layer.bitrate)
    }

    /// Sending video, not disabled, and still without a layer: starved by
    /// the available bandwidth.
    pub fn is_suspended(&self) -> bool {
        self.target.is_none() && !self.constraints.is_disabled() && self.source.has_video()
    }

    pub fn has_reached_preferred(&self) -> bool {
        match self.preferred {
            None => true,
            Some(preferred) => self.target.is_some_and(|target| target >= preferred),
        }
    }

    pub fn result(&self) -> SingleAllocation {
        SingleAllocation {
            endpoint_id: self.source.owner.clone(),
            source_name: self.source.source_name.clone(),
            target_layer: self.target_layer().cloned(),
            ideal_layer: self.ideal_layer().cloned(),
        }
    }
}
