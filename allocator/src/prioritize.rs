//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Source ordering and the per-source constraints that ordering implies.

use std::{
    cmp::max,
    collections::{HashMap, HashSet},
};

use sfu_common::VideoHeight;

use crate::{
    config::Config, constraints::VideoConstraints, settings::AllocationSettings,
    source::MediaSourceDesc,
};

/// Order conference sources for allocation: sources named in `selection`
/// first, in selection order, then the rest in the order the endpoint
/// supplier produced them (most recent speaker first).
pub fn prioritize(
    sources: Vec<MediaSourceDesc>,
    selection: &[String],
) -> Vec<MediaSourceDesc> {
    let mut remaining: Vec<Option<MediaSourceDesc>> =
        sources.into_iter().map(Some).collect();
    let mut sorted = Vec::with_capacity(remaining.len());
    for source_name in selection {
        let found = remaining.iter_mut().find(|slot| {
            matches!(slot, Some(source) if source.source_name == *source_name)
        });
        if let Some(slot) = found {
            sorted.push(slot.take().expect("matched slots are occupied"));
        }
    }
    sorted.extend(remaining.into_iter().flatten());
    sorted
}

/// Compute the constraints actually used for allocation: the signaled
/// constraints, reduced to disabled for sources outside lastN, and raised
/// to the on-stage height for on-stage sources.
///
/// The result covers exactly `sorted_sources`; constraints signaled for
/// sources that are no longer in the conference are dropped.
pub fn derive_effective_constraints(
    sorted_sources: &[MediaSourceDesc],
    settings: &AllocationSettings,
    config: &Config,
) -> HashMap<String, VideoConstraints> {
    let selection: HashSet<&str> = settings
        .on_stage_sources
        .iter()
        .chain(settings.selected_sources.iter())
        .map(String::as_str)
        .collect();

    sorted_sources
        .iter()
        .enumerate()
        .map(|(rank, source)| {
            let source_name = source.source_name.clone();
            let outside_last_n = settings
                .last_n
                .is_some_and(|n| rank >= n && !selection.contains(source_name.as_str()));
            let constraints = if outside_last_n {
                VideoConstraints::DISABLED
            } else {
                let mut constraints = settings.constraints_for(&source_name);
                if settings.on_stage_sources.contains(&source_name) {
                    constraints.max_height = max(
                        constraints.max_height,
                        VideoHeight::from(config.onstage_max_height_px),
                    );
                }
                constraints
            };
            (source_name, constraints)
        })
        .collect()
}
