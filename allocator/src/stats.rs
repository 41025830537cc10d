//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Assembles the per-receiver statistics document sent to the remote
//! predictor. Unknown numeric values are reported as 0, never omitted.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Map, Value};
use sfu_common::DataRate;

use crate::{
    allocation::BandwidthAllocation,
    settings::AllocationSettings,
    source::{MediaEndpoint, RtpLayerDesc},
};

pub fn collect_stats<T: MediaEndpoint>(
    receiver_id: &str,
    endpoints: &[T],
    settings: &AllocationSettings,
    allocation: &BandwidthAllocation,
    layers_by_endpoint: &HashMap<String, Vec<RtpLayerDesc>>,
    available_bandwidth: DataRate,
) -> Value {
    let mut peers = Map::new();
    for endpoint in endpoints {
        if endpoint.id() == receiver_id {
            continue;
        }
        peers.insert(endpoint.id().to_string(), peer_stats(
            endpoint,
            settings,
            allocation,
            layers_by_endpoint.get(endpoint.id()),
        ));
    }

    peers.insert(
        "Summary".to_string(),
        json!({
            "Available_BW": available_bandwidth.as_bps(),
            "timestamp": epoch_millis(),
        }),
    );

    json!({ receiver_id: peers })
}

fn peer_stats<T: MediaEndpoint>(
    endpoint: &T,
    settings: &AllocationSettings,
    allocation: &BandwidthAllocation,
    layers: Option<&Vec<RtpLayerDesc>>,
) -> Value {
    let stats = endpoint.transceiver_stats();
    let jitters: Vec<f64> = stats
        .ssrc_jitters_ms
        .iter()
        .map(|jitter| jitter.abs())
        .filter(|jitter| *jitter != 0.0)
        .collect();
    let jitter_ms = if jitters.is_empty() {
        0.0
    } else {
        jitters.iter().sum::<f64>() / jitters.len() as f64
    };

    let constraints = endpoint
        .media_sources()
        .first()
        .map(|source| settings.constraints_for(&source.source_name))
        .unwrap_or(settings.default_constraints);

    let mut layer_stats = Map::new();
    for layer in layers.into_iter().flatten() {
        layer_stats.insert(
            layer.index.to_string(),
            json!({
                "temporal_id": layer.temporal_id,
                "spatial_id": layer.spatial_id,
                "height": layer.height,
                "framerate": layer.frame_rate,
                "bitrate": layer.bitrate.as_bps(),
            }),
        );
    }

    let mut allocation_stats = Map::new();
    if let Some(single) = allocation
        .allocations
        .iter()
        .find(|single| single.endpoint_id == endpoint.id())
    {
        if let Some(target) = &single.target_layer {
            allocation_stats.insert(
                "target".to_string(),
                json!({
                    "target_quality": target.index,
                    "target_temporal_id": target.temporal_id,
                    "target_spatial_id": target.spatial_id,
                    "target_framerate": target.frame_rate,
                    "target_height": target.height,
                }),
            );
        }
        if let Some(ideal) = &single.ideal_layer {
            allocation_stats.insert(
                "ideal".to_string(),
                json!({
                    "ideal_quality": ideal.index,
                    "ideal_temporal_id": ideal.temporal_id,
                    "ideal_spatial_id": ideal.spatial_id,
                    "ideal_framerate": ideal.frame_rate,
                    "ideal_height": ideal.height,
                }),
            );
        }
    }

    json!({
        "jitter_ms": jitter_ms,
        "round_trip_time_ms": stats.rtt_ms,
        "pkt_lost": stats.packets_lost,
        "pkt_received": stats.packets_received,
        "video_constraints": {
            "maxHeight": constraints.max_height,
            "maxFramerate": constraints.max_framerate.unwrap_or(0.0),
        },
        "layers": layer_stats,
        "Allocations": allocation_stats,
    })
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
