//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The immutable result of one allocation run.

use std::collections::BTreeSet;

use serde::Serialize;
use sfu_common::DataRate;

use crate::source::RtpLayerDesc;

/// The decision for one source: the layer being forwarded (if any) and the
/// layer that would be forwarded with unlimited bandwidth.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleAllocation {
    pub endpoint_id: String,
    pub source_name: String,
    pub target_layer: Option<RtpLayerDesc>,
    pub ideal_layer: Option<RtpLayerDesc>,
}

impl SingleAllocation {
    pub fn is_forwarding(&self) -> bool {
        self.target_layer.is_some()
    }

    fn target_index(&self) -> Option<usize> {
        self.target_layer.as_ref().map(|layer| layer.index)
    }
}

/// The result of one allocation run over every source in the conference.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthAllocation {
    pub allocations: Vec<SingleAllocation>,
    /// The minimum viable layer of the top-priority source was admitted
    /// even though the budget did not cover it.
    pub oversending: bool,
    pub target_rate: DataRate,
    pub ideal_rate: DataRate,
    /// Sources with video available that got no layer due to bandwidth.
    pub suspended_sources: Vec<String>,
}

impl BandwidthAllocation {
    /// Whether this allocation forwards the same layers as `other`.
    /// Insensitive to the priority order the sources were visited in.
    pub fn is_the_same_as(&self, other: &Self) -> bool {
        fn forwarded(allocation: &BandwidthAllocation) -> BTreeSet<(&str, Option<usize>)> {
            allocation
                .allocations
                .iter()
                .map(|single| (single.source_name.as_str(), single.target_index()))
                .collect()
        }
        fn suspended(allocation: &BandwidthAllocation) -> BTreeSet<&str> {
            allocation
                .suspended_sources
                .iter()
                .map(String::as_str)
                .collect()
        }

        self.oversending == other.oversending
            && suspended(self) == suspended(other)
            && forwarded(self) == forwarded(other)
    }

    pub fn is_forwarding(&self, endpoint_id: &str) -> bool {
        self.allocations
            .iter()
            .any(|single| single.endpoint_id == endpoint_id && single.is_forwarding())
    }
}
