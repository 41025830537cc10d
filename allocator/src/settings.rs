//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::HashMap;

use serde::Serialize;
use sfu_common::VideoHeight;

use crate::{config::Config, constraints::VideoConstraints};

/// The allocation preferences signaled by the receiver.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationSettings {
    /// Sources the receiver displays at primary resolution, in the order
    /// the receiver listed them.
    pub on_stage_sources: Vec<String>,
    /// Other sources the receiver marked as high priority.
    pub selected_sources: Vec<String>,
    /// Applied to sources with no per-source entry.
    pub default_constraints: VideoConstraints,
    pub per_source_constraints: HashMap<String, VideoConstraints>,
    /// Receiver-side cap on how many sources are forwarded at once.
    /// `None` forwards every source the constraints allow.
    pub last_n: Option<usize>,
}

impl AllocationSettings {
    pub fn new(default_constraints: VideoConstraints) -> Self {
        Self {
            on_stage_sources: Vec::new(),
            selected_sources: Vec::new(),
            default_constraints,
            per_source_constraints: HashMap::new(),
            last_n: None,
        }
    }

    /// The settings in effect before the receiver has signaled anything:
    /// everything is a thumbnail.
    pub fn with_defaults(config: &Config) -> Self {
        Self::new(VideoConstraints::new(VideoHeight::from(
            config.thumbnail_max_height_px,
        )))
    }

    pub(crate) fn constraints_for(&self, source_name: &str) -> VideoConstraints {
        self.per_source_constraints
            .get(source_name)
            .copied()
            .unwrap_or(self.default_constraints)
    }

    /// The combined selection order: on-stage sources are considered
    /// selected with higher priority, then the explicitly selected ones,
    /// deduplicated.
    pub(crate) fn selection_order(&self) -> Vec<String> {
        let mut selection = self.on_stage_sources.clone();
        for source_name in &self.selected_sources {
            if !selection.contains(source_name) {
                selection.push(source_name.clone());
            }
        }
        selection
    }
}

#[cfg(test)]
mod allocation_settings_tests {
    use super::*;

    fn settings(on_stage: &[&str], selected: &[&str]) -> AllocationSettings {
        AllocationSettings {
            on_stage_sources: on_stage.iter().map(|s| s.to_string()).collect(),
            selected_sources: selected.iter().map(|s| s.to_string()).collect(),
            ..AllocationSettings::new(VideoConstraints::new(VideoHeight::from(180)))
        }
    }

    #[test]
    fn on_stage_always_precedes_selected() {
        let settings = settings(&["c"], &["a", "b"]);
        assert_eq!(vec!["c", "a", "b"], settings.selection_order());
    }

    #[test]
    fn selection_order_deduplicates() {
        let settings = settings(&["a", "b"], &["b", "c", "a"]);
        assert_eq!(vec!["a", "b", "c"], settings.selection_order());
    }

    #[test]
    fn per_source_constraints_override_the_default() {
        let mut settings = settings(&[], &[]);
        settings.per_source_constraints.insert(
            "a".to_string(),
            VideoConstraints::new(VideoHeight::from(720)),
        );
        assert_eq!(
            VideoHeight::from(720),
            settings.constraints_for("a").max_height
        );
        assert_eq!(
            VideoHeight::from(180),
            settings.constraints_for("b").max_height
        );
    }
}
