//! Fog Orchestrator: wires the Model Cache, Regional Aggregator, and Edge
//! Coordinator together, routes events between them, and runs the
//! background monitoring and stats loops.

use crate::aggregator::{AggregationResult, AggregatorConfig, EdgeUpdate, RegionalAggregator};
use crate::cache::{ModelCache, ModelCacheConfig};
use crate::config::Config;
use crate::coordinator::{CoordinatorConfig, CoordinatorEvent, DeviceCapabilities, EdgeCoordinator, WorkloadType};
use crate::error::Result;
use crate::resource::{ResourceSampler, ResourceSnapshot, SystemResourceSampler};
use crate::transport::{CloudTransport, EdgeTransport, PeerTransport};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct FogNodeStatus {
    pub fog_node_id: String,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub registered_devices: usize,
    pub online_devices: usize,
    pub current_round: u64,
    pub rounds_completed: u64,
    pub resources: ResourceSnapshot,
}

const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const STATS_INTERVAL: Duration = Duration::from_secs(60);
/// Model id under which the aggregator's rolling output is cached and
/// pushed to newly connected devices, distinct from per-round aggregation
/// results which live under the `aggregation:{round_id}` namespace.
const GLOBAL_MODEL_ID: &str = "global";

/// Owns the three core components and the transports they speak through.
pub struct FogNode {
    fog_node_id: String,
    cache: Arc<ModelCache>,
    aggregator: Arc<RegionalAggregator>,
    coordinator: Arc<EdgeCoordinator>,
    edge_transport: Arc<dyn EdgeTransport>,
    cloud_transport: Arc<dyn CloudTransport>,
    #[allow(dead_code)]
    peer_transport: Arc<dyn PeerTransport>,
    resource_sampler: Arc<dyn ResourceSampler>,
    monitor_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stats_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FogNode {
    pub fn new(
        config: &Config,
        edge_transport: Arc<dyn EdgeTransport>,
        cloud_transport: Arc<dyn CloudTransport>,
        peer_transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let cache = Arc::new(ModelCache::new(ModelCacheConfig {
            max_size_bytes: config.cache_max_size_bytes(),
            default_ttl: Some(config.cache_default_ttl()),
            persistence_path: None,
        }));

        let coordinator = Arc::new(EdgeCoordinator::new(CoordinatorConfig {
            max_devices: config.edge_interface.max_edge_clients,
            health_check_interval: config.monitoring.health_check_interval,
            device_timeout: config.edge_interface.device_timeout,
        }));

        let fog_node_id = config.fog_node.id.clone();
        let cloud_for_callback = Arc::clone(&cloud_transport);
        let cache_for_callback = Arc::clone(&cache);
        let on_result = Arc::new(move |result: AggregationResult| {
            let cloud = Arc::clone(&cloud_for_callback);
            let cache = Arc::clone(&cache_for_callback);
            tokio::spawn(async move {
                if let Err(e) = cache.cache_aggregation_result(result.round_number, &result.weights, None) {
                    tracing::warn!(error = %e, "failed to cache aggregation result");
                }
                let version = result.round_number.to_string();
                if let Err(e) = cache.cache_model(GLOBAL_MODEL_ID, &result.weights, &version, None) {
                    tracing::warn!(error = %e, "failed to cache rolling global model");
                }
                if let Err(e) = cloud.send_aggregation_result(&result).await {
                    tracing::warn!(error = %e, "failed to sync aggregation result upstream");
                }
            });
        });

        let aggregator = Arc::new(RegionalAggregator::new(
            AggregatorConfig {
                fog_node_id: fog_node_id.clone(),
                strategy: config.aggregation.strategy,
                min_clients: config.aggregation.min_clients,
                max_wait_time: config.aggregation.max_wait_time,
                fedprox_mu: config.aggregation.fedprox_mu,
            },
            on_result,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            fog_node_id,
            cache,
            aggregator,
            coordinator,
            edge_transport,
            cloud_transport,
            peer_transport,
            resource_sampler: Arc::new(SystemResourceSampler::new()),
            monitor_task: parking_lot::Mutex::new(None),
            stats_task: parking_lot::Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Starts sub-components in dependency order: cache has nothing to
    /// start, coordinator's health monitor next, then the background loops.
    pub fn start(self: &Arc<Self>) {
        self.coordinator.start_health_monitor();

        let edge_transport = Arc::clone(&self.edge_transport);
        let cache = Arc::clone(&self.cache);
        let aggregator = Arc::clone(&self.aggregator);
        self.coordinator.add_event_callback(Arc::new(move |event| match event {
            CoordinatorEvent::DeviceConnected { device_id } => {
                let edge_transport = Arc::clone(&edge_transport);
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    if let Some(weights) = cache.get_latest_model(GLOBAL_MODEL_ID) {
                        if let Ok(bytes) = bincode::serialize(&weights) {
                            let _ = edge_transport.send_model(&device_id, GLOBAL_MODEL_ID, bytes).await;
                        }
                    }
                });
            }
            CoordinatorEvent::DeviceOverloaded { device_id } => {
                tracing::warn!(device_id, "device reported overloaded");
            }
            CoordinatorEvent::WorkloadCompleted { workload_id, device_id, workload_type, result } => {
                if workload_type != WorkloadType::Training {
                    return;
                }
                let Some(training) = result.model_update else {
                    return;
                };
                let aggregator = Arc::clone(&aggregator);
                tokio::spawn(async move {
                    let update = EdgeUpdate {
                        client_id: device_id,
                        model_weights: training.weights,
                        sample_count: training.sample_count,
                        training_loss: training.training_loss,
                        timestamp: std::time::SystemTime::now(),
                        privacy_budget: None,
                        compression_ratio: None,
                    };
                    if let Err(e) = aggregator.add_edge_update(update) {
                        tracing::warn!(workload_id, error = %e, "training update rejected by aggregator");
                    }
                });
            }
            CoordinatorEvent::DeviceDisconnected { .. } => {}
        }));

        self.spawn_monitor_loop();
        self.spawn_stats_loop();
        tracing::info!(fog_node_id = %self.fog_node_id, "fog node started");
    }

    fn spawn_monitor_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.cache.cleanup_expired();
                        if this.aggregator.state() == crate::aggregator::RoundState::Idle {
                            this.aggregator.start_round();
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.monitor_task.lock() = Some(handle);
    }

    fn spawn_stats_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = this.get_status();
                        tracing::debug!(
                            cache_entries = status.cache_entries,
                            registered_devices = status.registered_devices,
                            current_round = status.current_round,
                            "fog node stats tick"
                        );
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.stats_task.lock() = Some(handle);
    }

    /// Stops background loops in reverse of start order.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.aggregator.cleanup();
        self.coordinator.cleanup();
        if let Some(h) = self.stats_task.lock().take() {
            h.abort();
        }
        if let Some(h) = self.monitor_task.lock().take() {
            h.abort();
        }
        tracing::info!(fog_node_id = %self.fog_node_id, "fog node stopped");
    }

    pub fn register_edge_device(&self, device_id: &str, device_type: &str, capabilities: DeviceCapabilities) -> Result<()> {
        self.coordinator.register_device(device_id, device_type, capabilities)
    }

    pub fn submit_training_update(&self, update: EdgeUpdate) -> Result<()> {
        self.aggregator.add_edge_update(update)
    }

    pub fn request_model(&self, model_key: &str) -> Option<Vec<u8>> {
        self.cache.get(model_key)
    }

    pub fn assign_task(
        &self,
        workload_type: WorkloadType,
        parameters: Value,
        priority: u8,
    ) -> Result<String> {
        self.coordinator.assign_workload(workload_type, parameters, priority, None)
    }

    pub fn complete_task(&self, workload_id: &str, result: crate::coordinator::WorkloadResult) -> Result<()> {
        self.coordinator.complete_workload(workload_id, result)
    }

    /// Cloud -> core `model/latest` path: caches the pushed model and
    /// rebroadcasts it to every currently registered device.
    pub async fn receive_cloud_model(
        &self,
        model_id: &str,
        version: &str,
        weights: HashMap<String, Vec<f64>>,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.cache.cache_model(model_id, &weights, version, metadata)?;
        let bytes = bincode::serialize(&weights)?;
        for device_id in self.coordinator.device_ids() {
            if let Err(e) = self.edge_transport.send_model(&device_id, model_id, bytes.clone()).await {
                tracing::warn!(device_id, error = %e, "failed to push cloud model to device");
            }
        }
        Ok(())
    }

    pub fn get_status(&self) -> FogNodeStatus {
        let cache_stats = self.cache.stats();
        let coordinator_stats = self.coordinator.stats();
        let aggregator_stats = self.aggregator.stats();
        FogNodeStatus {
            fog_node_id: self.fog_node_id.clone(),
            cache_entries: cache_stats.entries,
            cache_bytes: cache_stats.current_size_bytes,
            registered_devices: coordinator_stats.registered_devices,
            online_devices: coordinator_stats.online_devices,
            current_round: aggregator_stats.current_round,
            rounds_completed: aggregator_stats.rounds_completed,
            resources: self.resource_sampler.sample(),
        }
    }
}
