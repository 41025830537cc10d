//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The per-receiver allocation control loop: reacts to bandwidth estimate
//! changes, settings changes, and a periodic timer, and tells downstream
//! subsystems which layer of each source to forward.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::*;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use sfu_common::DataRate;
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};

use crate::{
    allocation::BandwidthAllocation,
    config::Config,
    constraints::VideoConstraints,
    predictor::{Prediction, PredictorClient},
    prioritize::{derive_effective_constraints, prioritize},
    settings::AllocationSettings,
    single_source::SingleSourceAllocation,
    source::{MediaEndpoint, MediaSourceDesc, RtpLayerDesc},
    stats::collect_stats,
};

/// The budget used when the bandwidth estimate is not trusted: never binds,
/// but still leaves headroom so that sums with layer bitrates cannot
/// overflow.
const UNRESTRICTED_BANDWIDTH: DataRate = DataRate::from_bps(u64::MAX / 2);

/// Added to every timer re-arm so the tick that fires never has to
/// re-schedule itself immediately.
const RESCHEDULE_SLACK: Duration = Duration::from_millis(5);

/// Target index assumed for a peer the predictor did not mention. Clamped
/// to each source's ideal layer, so with fewer layers it means "ideal".
const FALLBACK_TARGET_INDEX: i64 = 5;

/// Receives the results of allocation runs. Handlers are invoked inside
/// the allocator's critical section, in registration order; a completed
/// run happens-before its handler calls.
pub trait EventHandler: Send {
    fn allocation_changed(&self, _allocation: &BandwidthAllocation) {}
    fn effective_constraints_changed(
        &self,
        _old_constraints: &HashMap<String, VideoConstraints>,
        _new_constraints: &HashMap<String, VideoConstraints>,
    ) {
    }
    fn source_list_changed(&self, _sources: &[MediaSourceDesc]) {}
}

/// Provides the current endpoint list, in most-recent-speaker order.
pub type EndpointSupplier<T> = Box<dyn Fn() -> Vec<T> + Send + Sync>;

/// Whether allocation should be constrained to the estimated bandwidth
/// (`true`), or assume unrestricted bandwidth (`false`).
pub type TrustBwe = Box<dyn Fn() -> bool + Send + Sync>;

/// State owned by the allocation critical section.
struct Inner {
    /// `None` until the first estimate arrives.
    bwe: Option<DataRate>,
    settings: AllocationSettings,
    effective_constraints: HashMap<String, VideoConstraints>,
    allocation: BandwidthAllocation,
    last_update: Instant,
    handlers: Vec<Box<dyn EventHandler>>,
    predictor: PredictorClient,
}

/// The published results of the most recent run, readable without entering
/// the critical section. At worst one run stale.
struct Snapshot {
    bwe: Option<DataRate>,
    settings: AllocationSettings,
    allocation: BandwidthAllocation,
    effective_constraints: HashMap<String, VideoConstraints>,
    target_rates_by_endpoint: HashMap<String, DataRate>,
    layers_by_endpoint: HashMap<String, Vec<RtpLayerDesc>>,
}

impl Snapshot {
    fn new(config: &Config) -> Self {
        Self {
            bwe: None,
            settings: AllocationSettings::with_defaults(config),
            allocation: BandwidthAllocation::default(),
            effective_constraints: HashMap::new(),
            target_rates_by_endpoint: HashMap::new(),
            layers_by_endpoint: HashMap::new(),
        }
    }
}

pub struct BandwidthAllocator<T: 'static> {
    config: &'static Config,
    /// The receiving endpoint this allocator serves.
    receiver_id: String,
    endpoint_supplier: EndpointSupplier<T>,
    trust_bwe: TrustBwe,
    expired: AtomicBool,
    inner: Mutex<Inner>,
    snapshot: RwLock<Snapshot>,
    update_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: MediaEndpoint + 'static> BandwidthAllocator<T> {
    pub fn new(
        config: &'static Config,
        receiver_id: String,
        endpoint_supplier: EndpointSupplier<T>,
        trust_bwe: TrustBwe,
        event_handler: Box<dyn EventHandler>,
    ) -> Arc<Self> {
        let allocator = Arc::new(Self {
            config,
            receiver_id,
            endpoint_supplier,
            trust_bwe,
            expired: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                bwe: None,
                settings: AllocationSettings::with_defaults(config),
                effective_constraints: HashMap::new(),
                allocation: BandwidthAllocation::default(),
                last_update: Instant::now(),
                handlers: vec![event_handler],
                predictor: PredictorClient::from_config(config),
            }),
            snapshot: RwLock::new(Snapshot::new(config)),
            update_task: Mutex::new(None),
        });
        // Don't run an allocation yet; the receiver's settings may not have
        // been signaled. The periodic timer covers the gap.
        allocator.reschedule_update();
        allocator
    }

    pub fn add_event_handler(&self, handler: Box<dyn EventHandler>) {
        self.inner.lock().handlers.push(handler);
    }

    /// Notification that the estimated available bandwidth has changed.
    /// Changes within the configured fraction of the last estimate we
    /// reacted to are ignored, to limit resolution switching during
    /// ramp-up.
    pub fn bandwidth_changed(&self, new_bwe: DataRate) {
        let mut inner = self.inner.lock();
        if !bwe_change_exceeds_threshold(self.config, inner.bwe, new_bwe) {
            debug!(
                "new bandwidth ({}) is not significantly changed from previous estimate ({:?}), ignoring",
                new_bwe, inner.bwe,
            );
            return;
        }
        debug!("new bandwidth is {}, updating", new_bwe);
        inner.bwe = Some(new_bwe);
        self.update_locked(&mut inner);
    }

    /// Replace the allocation settings signaled by the receiver and run an
    /// allocation with them.
    pub fn update_settings(&self, settings: AllocationSettings) {
        let mut inner = self.inner.lock();
        inner.settings = settings;
        self.update_locked(&mut inner);
    }

    /// Run one allocation and fire events if the result differs from the
    /// previous one. A no-op once the allocator is expired.
    pub fn update(&self) {
        let mut inner = self.inner.lock();
        self.update_locked(&mut inner);
    }

    /// Stop this allocator: cancel the periodic timer and turn every
    /// future `update` into a no-op. Idempotent. Getters keep returning
    /// the last published snapshot.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::Release);
        if let Some(update_task) = self.update_task.lock().take() {
            update_task.abort();
        }
    }

    pub fn get_allocation(&self) -> BandwidthAllocation {
        self.snapshot.read().allocation.clone()
    }

    /// Whether any source of the given endpoint had a layer forwarded by
    /// the most recent run.
    pub fn is_forwarding(&self, endpoint_id: &str) -> bool {
        self.snapshot.read().allocation.is_forwarding(endpoint_id)
    }

    pub fn has_non_zero_effective_constraints(&self, source_name: &str) -> bool {
        self.snapshot
            .read()
            .effective_constraints
            .get(source_name)
            .is_some_and(|constraints| !constraints.is_disabled())
    }

    pub fn target_rates_by_endpoint(&self) -> HashMap<String, DataRate> {
        self.snapshot.read().target_rates_by_endpoint.clone()
    }

    pub fn layer_snapshots_by_endpoint(&self) -> HashMap<String, Vec<RtpLayerDesc>> {
        self.snapshot.read().layers_by_endpoint.clone()
    }

    /// A JSON view of the state that is useful for debugging. Reads the
    /// published snapshot, so it may trail the critical section by a run.
    pub fn get_debug_state(&self) -> serde_json::Value {
        let snapshot = self.snapshot.read();
        json!({
            "trustBwe": (self.trust_bwe)(),
            "bweBps": snapshot.bwe.map_or(-1i64, |bwe| bwe.as_bps() as i64),
            "allocation": &snapshot.allocation,
            "allocationSettings": &snapshot.settings,
            "effectiveConstraints": &snapshot.effective_constraints,
        })
    }

    fn available_bandwidth(&self, inner: &Inner) -> DataRate {
        if (self.trust_bwe)() {
            inner.bwe.unwrap_or(DataRate::ZERO)
        } else {
            UNRESTRICTED_BANDWIDTH
        }
    }

    fn update_locked(&self, inner: &mut Inner) {
        if self.expired.load(Ordering::Acquire) {
            return;
        }
        inner.last_update = Instant::now();

        let endpoints = (self.endpoint_supplier)();
        let sources: Vec<MediaSourceDesc> = endpoints
            .iter()
            .flat_map(|endpoint| endpoint.media_sources())
            .collect();
        let sorted_sources = prioritize(sources, &inner.settings.selection_order());

        let old_effective_constraints = std::mem::take(&mut inner.effective_constraints);
        inner.effective_constraints =
            derive_effective_constraints(&sorted_sources, &inner.settings, self.config);
        trace!(
            "allocating: sorted_sources=[{}] effective_constraints={:?}",
            sorted_sources
                .iter()
                .map(|source| source.source_name.as_str())
                .collect::<Vec<_>>()
                .join(","),
            inner.effective_constraints,
        );

        let budget = self.available_bandwidth(inner);
        let prediction = inner.predictor.take_prediction();

        let mut single_allocations: Vec<SingleSourceAllocation> = sorted_sources
            .iter()
            .map(|source| {
                // Effective constraints, not the receiver's raw ones: a
                // source outside lastN keeps its disabled constraints here
                // and is never allocated a layer.
                SingleSourceAllocation::new(
                    source.clone(),
                    inner
                        .effective_constraints
                        .get(&source.source_name)
                        .copied()
                        .unwrap_or(VideoConstraints::DISABLED),
                    inner.settings.on_stage_sources.contains(&source.source_name),
                    self.config,
                )
            })
            .collect();

        let new_allocation = if single_allocations.is_empty() {
            BandwidthAllocation::default()
        } else {
            match prediction {
                Some(prediction) if prediction.use_rl => {
                    apply_prediction(&mut single_allocations, &prediction, budget)
                }
                _ => run_greedy(&mut single_allocations, budget),
            }
            build_allocation(&single_allocations, budget)
        };

        for handler in &inner.handlers {
            handler.source_list_changed(&sorted_sources);
        }

        let allocation_changed = !inner.allocation.is_the_same_as(&new_allocation);
        let constraints_changed =
            inner.effective_constraints != old_effective_constraints;

        let mut layers_by_endpoint: HashMap<String, Vec<RtpLayerDesc>> = HashMap::new();
        for source in &sorted_sources {
            layers_by_endpoint
                .entry(source.owner.clone())
                .or_default()
                .extend(source.layers.iter().cloned());
        }
        let mut target_rates_by_endpoint: HashMap<String, DataRate> = HashMap::new();
        for single in &single_allocations {
            *target_rates_by_endpoint
                .entry(single.endpoint_id().to_string())
                .or_default() += single.target_bitrate();
        }

        // Publish before notifying, so a handler that re-reads the
        // snapshot observes the state it is being told about.
        {
            let mut snapshot = self.snapshot.write();
            snapshot.bwe = inner.bwe;
            snapshot.settings = inner.settings.clone();
            snapshot.allocation = new_allocation.clone();
            snapshot.effective_constraints = inner.effective_constraints.clone();
            snapshot.target_rates_by_endpoint = target_rates_by_endpoint;
            snapshot.layers_by_endpoint = layers_by_endpoint.clone();
        }
        inner.allocation = new_allocation.clone();

        if allocation_changed {
            for handler in &inner.handlers {
                handler.allocation_changed(&new_allocation);
            }
        }
        trace!(
            "finished allocation: allocation_changed={} constraints_changed={}",
            allocation_changed,
            constraints_changed,
        );
        if constraints_changed {
            for handler in &inner.handlers {
                handler.effective_constraints_changed(
                    &old_effective_constraints,
                    &inner.effective_constraints,
                );
            }
        }

        if inner.predictor.is_enabled() {
            let stats = collect_stats(
                &self.receiver_id,
                &endpoints,
                &inner.settings,
                &new_allocation,
                &layers_by_endpoint,
                budget,
            );
            inner.predictor.request(stats);
        }
    }

    /// Submit an `update` to a worker if allocation has not run recently,
    /// and re-arm the timer so allocation runs at least every
    /// `max_time_between_reallocations`. Runs in the constructor and the
    /// timer task only; anywhere else would arm duplicate timers.
    fn reschedule_update(self: &Arc<Self>) {
        if self.expired.load(Ordering::Acquire) {
            return;
        }
        if Handle::try_current().is_err() {
            debug!("no async runtime; periodic re-allocation disabled");
            return;
        }

        let period = self.config.max_time_between_reallocations();
        let time_since_last_update = self.inner.lock().last_update.elapsed();
        let delay = if time_since_last_update > period {
            debug!("running periodic re-allocation");
            let this = Arc::downgrade(self);
            tokio::spawn(async move {
                if let Some(this) = this.upgrade() {
                    this.update();
                }
            });
            period
        } else {
            period - time_since_last_update
        };

        let this = Arc::downgrade(self);
        let update_task = tokio::spawn(async move {
            tokio::time::sleep(delay + RESCHEDULE_SLACK).await;
            if let Some(this) = this.upgrade() {
                this.reschedule_update();
            }
        });
        *self.update_task.lock() = Some(update_task);
    }
}

/// Whether the estimate has moved enough, relative to the last estimate we
/// reacted to, to be worth a re-allocation. The first estimate always is.
/// When the estimate ramps up, probing eventually crosses the threshold;
/// when it drops, AIMD usually exceeds it in one step.
fn bwe_change_exceeds_threshold(
    config: &Config,
    previous: Option<DataRate>,
    current: DataRate,
) -> bool {
    match previous {
        None => true,
        Some(previous) => {
            let delta = current.abs_diff(previous);
            delta.as_bps() as f64 > previous.as_bps() as f64 * config.bwe_change_threshold
        }
    }
}

/// The greedy bin-packing loop: repeat passes over the sources in priority
/// order until a whole pass makes no progress. Terminates after at most
/// sources x layers passes, since every productive pass raises some target.
fn run_greedy(allocations: &mut [SingleSourceAllocation], budget: DataRate) {
    let mut remaining = budget;
    let mut previous_remaining = None;
    while previous_remaining != Some(remaining) {
        previous_remaining = Some(remaining);
        for i in 0..allocations.len() {
            let allocation = &mut allocations[i];
            if allocation.constraints().is_disabled() {
                continue;
            }

            // In stage view improve greedily until preferred, in tile view
            // go step-by-step.
            let delta = allocation.improve(remaining, i == 0);
            remaining = remaining.saturating_sub(delta);

            // Keep thumbnails dark until the on-stage source reaches its
            // preferred layer; otherwise a small bwe increase would enable
            // them only to disable them again when on-stage takes more.
            if allocation.is_on_stage() && !allocation.has_reached_preferred() {
                break;
            }
        }
    }
}

/// Apply the predictor's per-endpoint target hints in a single pass.
fn apply_prediction(
    allocations: &mut [SingleSourceAllocation],
    prediction: &Prediction,
    budget: DataRate,
) {
    let mut remaining = budget;
    for i in 0..allocations.len() {
        let allocation = &mut allocations[i];
        if allocation.constraints().is_disabled() {
            continue;
        }
        let hint = prediction
            .target_index_by_endpoint
            .get(allocation.endpoint_id())
            .copied()
            .unwrap_or(FALLBACK_TARGET_INDEX);
        let delta = allocation.apply_hint(hint, remaining, i == 0);
        remaining = remaining.saturating_sub(delta);
        if allocation.is_on_stage() && !allocation.has_reached_preferred() {
            break;
        }
    }
}

fn build_allocation(
    allocations: &[SingleSourceAllocation],
    budget: DataRate,
) -> BandwidthAllocation {
    let suspended_sources: Vec<String> = allocations
        .iter()
        .filter(|allocation| allocation.is_suspended())
        .map(|allocation| allocation.source().source_name.clone())
        .collect();
    if !suspended_sources.is_empty() {
        info!(
            "sources suspended due to insufficient bandwidth (bwe={}): {}",
            budget,
            suspended_sources.join(","),
        );
    }

    let target_rate = allocations
        .iter()
        .map(SingleSourceAllocation::target_bitrate)
        .sum();
    let ideal_rate = allocations
        .iter()
        .map(SingleSourceAllocation::ideal_bitrate)
        .sum();

    BandwidthAllocation {
        allocations: allocations
            .iter()
            .map(SingleSourceAllocation::result)
            .collect(),
        oversending: target_rate > budget,
        target_rate,
        ideal_rate,
        suspended_sources,
    }
}

#[cfg(test)]
mod allocator_tests {
    use once_cell::sync::Lazy;
    use sfu_common::VideoHeight;

    use super::*;
    use crate::{
        config::default_test_config,
        source::{RtpLayerDesc, TransceiverStats},
    };

    static CONFIG: Lazy<Config> = Lazy::new(default_test_config);

    fn leaked_config(adjust: impl FnOnce(&mut Config)) -> &'static Config {
        let mut config = default_test_config();
        adjust(&mut config);
        Box::leak(Box::new(config))
    }

    #[derive(Clone)]
    struct TestEndpoint {
        id: String,
        sources: Vec<MediaSourceDesc>,
    }

    impl MediaEndpoint for TestEndpoint {
        fn id(&self) -> &str {
            &self.id
        }
        fn media_sources(&self) -> Vec<MediaSourceDesc> {
            self.sources.clone()
        }
        fn transceiver_stats(&self) -> TransceiverStats {
            TransceiverStats::default()
        }
    }

    fn layer(index: usize, height: u16, frame_rate: f64, kbps: u64) -> RtpLayerDesc {
        RtpLayerDesc {
            index,
            temporal_id: 0,
            spatial_id: index as u8,
            height: VideoHeight::from(height),
            frame_rate,
            bitrate: DataRate::from_kbps(kbps),
        }
    }

    /// The simulcast ladder used throughout: 180p@15 at 150 kbps,
    /// 360p@30 at 500 kbps, 720p@30 at 2000 kbps.
    fn simulcast_source(source_name: &str, owner: &str) -> MediaSourceDesc {
        MediaSourceDesc {
            source_name: source_name.to_string(),
            owner: owner.to_string(),
            layers: vec![
                layer(0, 180, 15.0, 150),
                layer(1, 360, 30.0, 500),
                layer(2, 720, 30.0, 2000),
            ],
        }
    }

    fn endpoint(id: &str, source_names: &[&str]) -> TestEndpoint {
        TestEndpoint {
            id: id.to_string(),
            sources: source_names
                .iter()
                .map(|source_name| simulcast_source(source_name, id))
                .collect(),
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Event {
        SourceList(Vec<String>),
        Allocation(BandwidthAllocation),
        Constraints,
    }

    #[derive(Clone, Default)]
    struct RecordingHandler {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl EventHandler for RecordingHandler {
        fn allocation_changed(&self, allocation: &BandwidthAllocation) {
            self.events
                .lock()
                .push(Event::Allocation(allocation.clone()));
        }
        fn effective_constraints_changed(
            &self,
            _old_constraints: &HashMap<String, VideoConstraints>,
            _new_constraints: &HashMap<String, VideoConstraints>,
        ) {
            self.events.lock().push(Event::Constraints);
        }
        fn source_list_changed(&self, sources: &[MediaSourceDesc]) {
            self.events.lock().push(Event::SourceList(
                sources
                    .iter()
                    .map(|source| source.source_name.clone())
                    .collect(),
            ));
        }
    }

    impl RecordingHandler {
        fn source_list_count(&self) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|event| matches!(event, Event::SourceList(_)))
                .count()
        }
        fn allocation_count(&self) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|event| matches!(event, Event::Allocation(_)))
                .count()
        }
    }

    fn new_allocator(
        config: &'static Config,
        endpoints: Vec<TestEndpoint>,
    ) -> (Arc<BandwidthAllocator<TestEndpoint>>, RecordingHandler) {
        let handler = RecordingHandler::default();
        let allocator = BandwidthAllocator::new(
            config,
            "recv".to_string(),
            Box::new(move || endpoints.clone()),
            Box::new(|| true),
            Box::new(handler.clone()),
        );
        (allocator, handler)
    }

    fn on_stage_settings(config: &Config, on_stage: &[&str]) -> AllocationSettings {
        let mut settings = AllocationSettings::with_defaults(config);
        settings.on_stage_sources =
            on_stage.iter().map(|source| source.to_string()).collect();
        settings
    }

    fn target_index(
        allocation: &BandwidthAllocation,
        source_name: &str,
    ) -> Option<usize> {
        allocation
            .allocations
            .iter()
            .find(|single| single.source_name == source_name)
            .expect("source is in the allocation")
            .target_layer
            .as_ref()
            .map(|layer| layer.index)
    }

    #[test]
    fn single_on_stage_source_with_ample_budget_reaches_ideal() {
        let _ = env_logger::builder().is_test(true).try_init();

        let (allocator, _) = new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(3_000));

        let allocation = allocator.get_allocation();
        assert_eq!(Some(2), target_index(&allocation, "a-video"));
        assert!(!allocation.oversending);
        assert_eq!(DataRate::from_kbps(2_000), allocation.target_rate);
        assert_eq!(DataRate::from_kbps(2_000), allocation.ideal_rate);
        assert!(allocator.is_forwarding("A"));
    }

    #[test]
    fn single_on_stage_source_with_tight_budget_stops_at_preferred() {
        let (allocator, _) = new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(600));

        let allocation = allocator.get_allocation();
        assert_eq!(Some(1), target_index(&allocation, "a-video"));
        assert!(!allocation.oversending);
    }

    #[test]
    fn thumbnails_get_the_leftover_budget() {
        let (allocator, _) = new_allocator(
            &CONFIG,
            vec![endpoint("A", &["a-video"]), endpoint("B", &["b-video"])],
        );
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(700));

        let allocation = allocator.get_allocation();
        assert_eq!(Some(1), target_index(&allocation, "a-video"));
        assert_eq!(Some(0), target_index(&allocation, "b-video"));
        assert!(!allocation.oversending);
        assert!(allocation.suspended_sources.is_empty());
    }

    #[test]
    fn thumbnails_stay_dark_until_on_stage_reaches_preferred() {
        let config = leaked_config(|config| config.onstage_preferred_height_px = 720);
        let (allocator, _) = new_allocator(
            config,
            vec![endpoint("A", &["a-video"]), endpoint("B", &["b-video"])],
        );
        allocator.update_settings(on_stage_settings(config, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(700));

        let allocation = allocator.get_allocation();
        assert_eq!(Some(1), target_index(&allocation, "a-video"));
        assert_eq!(None, target_index(&allocation, "b-video"));
        assert_eq!(vec!["b-video".to_string()], allocation.suspended_sources);
        assert!(!allocator.is_forwarding("B"));
    }

    #[test]
    fn on_stage_source_is_forwarded_even_over_budget() {
        let (allocator, _) = new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(50));

        let allocation = allocator.get_allocation();
        assert_eq!(Some(0), target_index(&allocation, "a-video"));
        assert!(allocation.oversending);
        assert_eq!(DataRate::from_kbps(150), allocation.target_rate);
    }

    #[test]
    fn disabled_constraints_forbid_forwarding_at_any_budget() {
        let (allocator, _) = new_allocator(
            &CONFIG,
            vec![endpoint("A", &["a-video"]), endpoint("B", &["b-video"])],
        );
        let mut settings = on_stage_settings(&CONFIG, &["a-video"]);
        settings.per_source_constraints.insert(
            "b-video".to_string(),
            VideoConstraints::new(VideoHeight::ZERO),
        );
        allocator.update_settings(settings);
        allocator.bandwidth_changed(DataRate::from_kbps(10_000));

        let allocation = allocator.get_allocation();
        assert_eq!(None, target_index(&allocation, "b-video"));
        // Disabled is not suspended: the receiver asked for nothing.
        assert!(allocation.suspended_sources.is_empty());
        assert!(!allocator.is_forwarding("B"));
        assert!(!allocator.has_non_zero_effective_constraints("b-video"));
        assert!(allocator.has_non_zero_effective_constraints("a-video"));
    }

    #[test]
    fn sources_outside_last_n_are_disabled() {
        let (allocator, _) = new_allocator(
            &CONFIG,
            vec![
                endpoint("A", &["a-video"]),
                endpoint("B", &["b-video"]),
                endpoint("C", &["c-video"]),
            ],
        );
        let mut settings = AllocationSettings::with_defaults(&CONFIG);
        settings.last_n = Some(1);
        allocator.update_settings(settings);
        allocator.bandwidth_changed(DataRate::from_kbps(10_000));

        assert!(allocator.has_non_zero_effective_constraints("a-video"));
        assert!(!allocator.has_non_zero_effective_constraints("b-video"));
        assert!(!allocator.has_non_zero_effective_constraints("c-video"));
        assert!(allocator.is_forwarding("A"));
        assert!(!allocator.is_forwarding("B"));
        assert!(!allocator.is_forwarding("C"));
    }

    #[test]
    fn bwe_debounce_ignores_small_changes() {
        let (allocator, handler) =
            new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        assert_eq!(1, handler.source_list_count());

        allocator.bandwidth_changed(DataRate::from_bps(1_000_000));
        assert_eq!(2, handler.source_list_count());

        // 10% is under the 15% threshold.
        allocator.bandwidth_changed(DataRate::from_bps(1_100_000));
        assert_eq!(2, handler.source_list_count());

        // 20% is over it.
        allocator.bandwidth_changed(DataRate::from_bps(1_200_000));
        assert_eq!(3, handler.source_list_count());
    }

    #[test]
    fn update_is_idempotent() {
        let (allocator, handler) =
            new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(3_000));

        let allocation_events = handler.allocation_count();
        let before = allocator.get_allocation();
        allocator.update();
        let after = allocator.get_allocation();

        assert_eq!(before, after);
        // The source list is re-announced, but nothing else fires.
        assert_eq!(allocation_events, handler.allocation_count());
    }

    #[test]
    fn events_fire_in_order_within_a_cycle() {
        let (allocator, handler) =
            new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));

        let events = handler.events.lock().clone();
        assert!(matches!(events[0], Event::SourceList(_)));
        assert!(matches!(events[1], Event::Allocation(_)));
        assert!(matches!(events[2], Event::Constraints));
    }

    #[test]
    fn empty_source_list_produces_an_empty_allocation() {
        let (allocator, handler) = new_allocator(&CONFIG, vec![]);
        allocator.bandwidth_changed(DataRate::from_kbps(1_000));

        let allocation = allocator.get_allocation();
        assert!(allocation.allocations.is_empty());
        assert!(!allocation.oversending);
        assert_eq!(DataRate::ZERO, allocation.target_rate);
        // The (empty) source list is announced, but the allocation did not
        // change from its initial empty value.
        assert_eq!(1, handler.source_list_count());
        assert_eq!(0, handler.allocation_count());
    }

    #[test]
    fn update_after_expire_is_a_noop() {
        let (allocator, handler) =
            new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(3_000));
        let before = allocator.get_allocation();
        let events_before = handler.events.lock().len();

        allocator.expire();
        allocator.expire();
        allocator.update();
        allocator.bandwidth_changed(DataRate::from_kbps(10_000));

        assert_eq!(before, allocator.get_allocation());
        assert_eq!(events_before, handler.events.lock().len());
    }

    #[test]
    fn shrinking_the_budget_never_raises_a_layer() {
        let endpoints = vec![endpoint("A", &["a-video"]), endpoint("B", &["b-video"])];
        let mut previous: Option<(Option<usize>, Option<usize>)> = None;
        for budget_kbps in (0..=3_000).step_by(50) {
            let (allocator, _) = new_allocator(&CONFIG, endpoints.clone());
            allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
            allocator.bandwidth_changed(DataRate::from_kbps(budget_kbps));

            let allocation = allocator.get_allocation();
            assert_eq!(
                allocation.oversending,
                allocation.target_rate > DataRate::from_kbps(budget_kbps),
            );

            let targets = (
                target_index(&allocation, "a-video"),
                target_index(&allocation, "b-video"),
            );
            if let Some((previous_a, previous_b)) = previous {
                assert!(
                    targets.0 >= previous_a && targets.1 >= previous_b,
                    "budget {} kbps lowered a layer: {:?} -> {:?}",
                    budget_kbps,
                    (previous_a, previous_b),
                    targets,
                );
            }
            previous = Some(targets);
        }
    }

    #[test]
    fn untrusted_bwe_allocates_as_if_unlimited() {
        let handler = RecordingHandler::default();
        let endpoints = vec![endpoint("A", &["a-video"])];
        let allocator = BandwidthAllocator::new(
            &CONFIG,
            "recv".to_string(),
            Box::new(move || endpoints.clone()),
            Box::new(|| false),
            Box::new(handler),
        );
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));

        let allocation = allocator.get_allocation();
        assert_eq!(Some(2), target_index(&allocation, "a-video"));
        assert!(!allocation.oversending);
    }

    #[test]
    fn debug_state_has_the_expected_keys() {
        let (allocator, _) = new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        let state = allocator.get_debug_state();
        assert_eq!(true, state["trustBwe"]);
        assert_eq!(-1, state["bweBps"]);

        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(3_000));
        let state = allocator.get_debug_state();
        assert_eq!(3_000_000, state["bweBps"]);
        assert!(state["allocation"]["allocations"].is_array());
        assert!(state["allocationSettings"]["onStageSources"].is_array());
        assert!(state["effectiveConstraints"]["a-video"]["maxHeight"].is_number());
    }

    #[test]
    fn per_endpoint_rate_and_layer_snapshots_are_published() {
        let (allocator, _) = new_allocator(
            &CONFIG,
            vec![endpoint("A", &["a-video"]), endpoint("B", &["b-video"])],
        );
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(700));

        let rates = allocator.target_rates_by_endpoint();
        assert_eq!(Some(&DataRate::from_kbps(500)), rates.get("A"));
        assert_eq!(Some(&DataRate::from_kbps(150)), rates.get("B"));

        let layers = allocator.layer_snapshots_by_endpoint();
        assert_eq!(3, layers["A"].len());
        assert_eq!(3, layers["B"].len());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_reallocates_and_expire_cancels_it() {
        let _ = env_logger::builder().is_test(true).try_init();

        let (allocator, handler) =
            new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        assert_eq!(0, handler.source_list_count());

        tokio::time::advance(
            CONFIG.max_time_between_reallocations() + Duration::from_millis(10),
        )
        .await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(1, handler.source_list_count());

        allocator.expire();
        tokio::time::advance(CONFIG.max_time_between_reallocations() * 3).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(1, handler.source_list_count());
    }

    #[tokio::test(start_paused = true)]
    async fn predictor_hints_apply_on_the_next_cycle() {
        let (allocator, _) = new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.inner.lock().predictor = PredictorClient::with_callback(
            |_body| Box::pin(async { Ok(r#"{"useRL": 1, "A": 1}"#.to_string()) }),
            Duration::from_millis(50),
        );

        // First cycle runs greedy and sends the stats snapshot out.
        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(3_000));
        assert_eq!(Some(2), target_index(&allocator.get_allocation(), "a-video"));

        tokio::task::yield_now().await;

        // The next cycle applies the remote decision instead of greedy.
        allocator.update();
        assert_eq!(Some(1), target_index(&allocator.get_allocation(), "a-video"));
    }

    #[tokio::test(start_paused = true)]
    async fn predictor_opt_out_keeps_the_greedy_result() {
        let (allocator, _) = new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.inner.lock().predictor = PredictorClient::with_callback(
            |_body| Box::pin(async { Ok(r#"{"useRL": 0, "A": 1}"#.to_string()) }),
            Duration::from_millis(50),
        );

        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(3_000));
        tokio::task::yield_now().await;

        allocator.update();
        assert_eq!(Some(2), target_index(&allocator.get_allocation(), "a-video"));
    }

    #[tokio::test(start_paused = true)]
    async fn predictor_timeout_falls_back_to_greedy() {
        let (allocator, _) = new_allocator(&CONFIG, vec![endpoint("A", &["a-video"])]);
        allocator.inner.lock().predictor = PredictorClient::with_callback(
            |_body| Box::pin(futures::future::pending()),
            Duration::from_millis(50),
        );

        allocator.update_settings(on_stage_settings(&CONFIG, &["a-video"]));
        allocator.bandwidth_changed(DataRate::from_kbps(3_000));

        tokio::time::advance(Duration::from_millis(51)).await;
        tokio::task::yield_now().await;

        allocator.update();
        assert_eq!(Some(2), target_index(&allocator.get_allocation(), "a-video"));
    }
}
