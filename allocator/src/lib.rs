//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub mod allocation;
pub mod allocator;
pub mod config;
pub mod constraints;
pub mod predictor;
pub mod prioritize;
pub mod settings;
pub mod single_source;
pub mod source;
pub mod stats;

pub use crate::{
    allocation::{BandwidthAllocation, SingleAllocation},
    allocator::{BandwidthAllocator, EndpointSupplier, EventHandler, TrustBwe},
    config::Config,
    constraints::VideoConstraints,
    settings::AllocationSettings,
    source::{MediaEndpoint, MediaSourceDesc, RtpLayerDesc, TransceiverStats},
};
