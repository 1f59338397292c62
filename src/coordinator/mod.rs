//! Edge Coordinator: device registry, health monitoring, and workload
//! scheduling for the devices attached to this fog node.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Idle,
    Busy,
    Overloaded,
    LowBattery,
    Offline,
}

/// Numeric/boolean capability hints reported at registration.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub cpu_cores: u32,
    pub memory_gb: f64,
    /// 0-100; devices at 100 are treated as mains-powered.
    pub battery_level: u8,
    pub network_bandwidth_mbps: f64,
    pub sensors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceMetrics {
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_type: String,
    pub status: DeviceStatus,
    pub capabilities: DeviceCapabilities,
    pub connected_at: Instant,
    pub last_seen: Instant,
    pub current_workload_id: Option<String>,
    pub performance_metrics: Option<PerformanceMetrics>,
    pub completed_workloads: u64,
    pub failed_workloads: u64,
    pub mean_completion_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadType {
    Training,
    Inference,
    DataCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadStatus {
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkloadStatus {
    fn is_terminal(self) -> bool {
        matches!(self, WorkloadStatus::Completed | WorkloadStatus::Failed | WorkloadStatus::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadAssignment {
    pub workload_id: String,
    pub device_id: String,
    pub workload_type: WorkloadType,
    pub parameters: Value,
    pub priority: u8,
    pub status: WorkloadStatus,
    pub assigned_at: Instant,
    pub expected_completion: Instant,
}

/// The outcome a caller reports via `complete_workload`. `model_update` is
/// populated for training workloads and carries what the Aggregator needs.
#[derive(Debug, Clone, Default)]
pub struct WorkloadResult {
    pub model_update: Option<TrainingResult>,
}

#[derive(Debug, Clone)]
pub struct TrainingResult {
    pub weights: HashMap<String, Vec<f64>>,
    pub sample_count: u64,
    pub training_loss: f64,
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    DeviceConnected { device_id: String },
    DeviceDisconnected { device_id: String },
    WorkloadCompleted { workload_id: String, device_id: String, workload_type: WorkloadType, result: WorkloadResult },
    DeviceOverloaded { device_id: String },
}

type EventCallback = Arc<dyn Fn(CoordinatorEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_devices: usize,
    pub health_check_interval: Duration,
    pub device_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub registered_devices: usize,
    pub online_devices: usize,
    pub active_workloads: usize,
    pub completed_workloads: u64,
    pub failed_workloads: u64,
}

const WORKLOAD_SOFT_DEADLINE: Duration = Duration::from_secs(300);

struct Inner {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    workloads: RwLock<HashMap<String, WorkloadAssignment>>,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    config: CoordinatorConfig,
    callbacks: RwLock<Vec<EventCallback>>,
}

/// Registry, scorer, and health monitor for edge devices attached to this
/// fog node.
pub struct EdgeCoordinator {
    inner: Arc<Inner>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EdgeCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                devices: RwLock::new(HashMap::new()),
                workloads: RwLock::new(HashMap::new()),
                completed_total: AtomicU64::new(0),
                failed_total: AtomicU64::new(0),
                config,
                callbacks: RwLock::new(Vec::new()),
            }),
            task: parking_lot::Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn add_event_callback(&self, callback: EventCallback) {
        self.inner.callbacks.write().push(callback);
    }

    fn emit(&self, event: CoordinatorEvent) {
        for callback in self.inner.callbacks.read().iter() {
            callback(event.clone());
        }
    }

    pub fn register_device(&self, device_id: &str, device_type: &str, capabilities: DeviceCapabilities) -> Result<()> {
        let mut devices = self.inner.devices.write();
        if devices.len() >= self.inner.config.max_devices {
            return Err(Error::CapacityExceeded { max: self.inner.config.max_devices });
        }
        if devices.contains_key(device_id) {
            return Err(Error::AlreadyRegistered(device_id.to_string()));
        }
        let now = Instant::now();
        devices.insert(
            device_id.to_string(),
            DeviceRecord {
                device_id: device_id.to_string(),
                device_type: device_type.to_string(),
                status: DeviceStatus::Online,
                capabilities,
                connected_at: now,
                last_seen: now,
                current_workload_id: None,
                performance_metrics: None,
                completed_workloads: 0,
                failed_workloads: 0,
                mean_completion_secs: 0.0,
            },
        );
        drop(devices);
        tracing::info!(device_id, "edge device registered");
        self.emit(CoordinatorEvent::DeviceConnected { device_id: device_id.to_string() });
        Ok(())
    }

    pub fn unregister_device(&self, device_id: &str) -> Result<()> {
        let mut devices = self.inner.devices.write();
        if devices.remove(device_id).is_none() {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }
        drop(devices);
        self.fail_workloads_for_device(device_id);
        tracing::info!(device_id, "edge device unregistered");
        self.emit(CoordinatorEvent::DeviceDisconnected { device_id: device_id.to_string() });
        Ok(())
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.inner.devices.read().keys().cloned().collect()
    }

    /// Refresh `status`/`last_seen`, merge in `metrics`, and apply the
    /// overload/low-battery cancellation rules.
    pub fn update_device_status(&self, device_id: &str, status: DeviceStatus, metrics: Option<PerformanceMetrics>) -> Result<()> {
        let mut devices = self.inner.devices.write();
        let device = devices.get_mut(device_id).ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        device.status = status;
        device.last_seen = Instant::now();
        if let Some(m) = metrics {
            device.performance_metrics = Some(m);
        }
        let current_workload = device.current_workload_id.clone();
        drop(devices);

        match status {
            DeviceStatus::Overloaded => {
                if let Some(workload_id) = current_workload {
                    self.cancel_workload_if(&workload_id, |priority| priority <= 5);
                }
                self.emit(CoordinatorEvent::DeviceOverloaded { device_id: device_id.to_string() });
            }
            DeviceStatus::LowBattery => {
                if let Some(workload_id) = current_workload {
                    self.cancel_workload_if(&workload_id, |priority| priority > 5);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn cancel_workload_if(&self, workload_id: &str, should_cancel: impl Fn(u8) -> bool) {
        let mut workloads = self.inner.workloads.write();
        let Some(workload) = workloads.get_mut(workload_id) else {
            return;
        };
        if workload.status.is_terminal() || !should_cancel(workload.priority) {
            return;
        }
        workload.status = WorkloadStatus::Cancelled;
        let device_id = workload.device_id.clone();
        drop(workloads);
        if let Some(device) = self.inner.devices.write().get_mut(&device_id) {
            device.current_workload_id = None;
        }
    }

    pub fn heartbeat(&self, device_id: &str) -> Result<()> {
        let mut devices = self.inner.devices.write();
        let device = devices.get_mut(device_id).ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        device.last_seen = Instant::now();
        Ok(())
    }

    fn capable(workload_type: WorkloadType, caps: &DeviceCapabilities) -> bool {
        match workload_type {
            WorkloadType::Training => caps.memory_gb >= 1.0 && caps.cpu_cores >= 1,
            WorkloadType::Inference => caps.cpu_cores >= 1,
            WorkloadType::DataCollection => !caps.sensors.is_empty(),
        }
    }

    /// 0-100 composite score: resources (0-40), performance history (0-30),
    /// power (0-20), network (0-10).
    fn score_device(device: &DeviceRecord) -> f64 {
        let resources = (device.capabilities.cpu_cores as f64 / 2.0).min(1.0) * 20.0
            + (device.capabilities.memory_gb / 4.0).min(1.0) * 20.0;

        let performance = match device.performance_metrics {
            Some(m) => (1.0
                - (m.avg_cpu_usage / 100.0 - 0.6).abs()
                - (m.avg_memory_usage / 100.0 - 0.6).abs())
            .max(0.0)
                * 30.0,
            None => 0.0,
        };

        let power = if device.capabilities.battery_level < 100 {
            (device.capabilities.battery_level as f64 / 50.0).min(1.0) * 20.0
        } else {
            20.0
        };

        let network = (device.capabilities.network_bandwidth_mbps / 50.0).min(1.0) * 10.0;

        resources + performance + power + network
    }

    /// Candidate filter: online/idle, capable of the workload type, and
    /// passing the caller's optional predicate. Score each candidate and
    /// pick the maximum, ties broken by earliest `connected_at`.
    pub fn assign_workload(
        &self,
        workload_type: WorkloadType,
        parameters: Value,
        priority: u8,
        device_filter: Option<&dyn Fn(&DeviceRecord) -> bool>,
    ) -> Result<String> {
        let devices = self.inner.devices.read();
        let mut candidates: Vec<&DeviceRecord> = devices
            .values()
            .filter(|d| matches!(d.status, DeviceStatus::Online | DeviceStatus::Idle))
            .filter(|d| Self::capable(workload_type, &d.capabilities))
            .filter(|d| device_filter.map(|f| f(d)).unwrap_or(true))
            .collect();
        candidates.sort_by(|a, b| {
            Self::score_device(b)
                .total_cmp(&Self::score_device(a))
                .then_with(|| a.connected_at.cmp(&b.connected_at))
        });
        let best = candidates
            .first()
            .map(|d| d.device_id.clone())
            .ok_or_else(|| Error::UnknownDevice("<no eligible device>".to_string()))?;
        drop(devices);

        let unix_ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let workload_id = format!("workload_{unix_ts}_{best}");
        let now = Instant::now();
        self.inner.workloads.write().insert(
            workload_id.clone(),
            WorkloadAssignment {
                workload_id: workload_id.clone(),
                device_id: best.clone(),
                workload_type,
                parameters,
                priority,
                status: WorkloadStatus::Assigned,
                assigned_at: now,
                expected_completion: now + WORKLOAD_SOFT_DEADLINE,
            },
        );
        if let Some(device) = self.inner.devices.write().get_mut(&best) {
            device.status = DeviceStatus::Busy;
            device.current_workload_id = Some(workload_id.clone());
        }
        tracing::debug!(workload_id, device_id = %best, "workload assigned");
        Ok(workload_id)
    }

    /// Transitions `assigned|running -> completed`. Returns
    /// `Error::AlreadyTerminal` if the assignment was already terminal.
    pub fn complete_workload(&self, workload_id: &str, result: WorkloadResult) -> Result<()> {
        let mut workloads = self.inner.workloads.write();
        let workload = workloads.get_mut(workload_id).ok_or_else(|| Error::UnknownWorkload(workload_id.to_string()))?;
        if workload.status.is_terminal() {
            return Err(Error::AlreadyTerminal(workload_id.to_string()));
        }
        workload.status = WorkloadStatus::Completed;
        let device_id = workload.device_id.clone();
        let workload_type = workload.workload_type;
        let elapsed = workload.assigned_at.elapsed().as_secs_f64();
        drop(workloads);

        let mut devices = self.inner.devices.write();
        if let Some(device) = devices.get_mut(&device_id) {
            let n = device.completed_workloads as f64;
            device.mean_completion_secs = (device.mean_completion_secs * n + elapsed) / (n + 1.0);
            device.completed_workloads += 1;
            device.current_workload_id = None;
            device.status = DeviceStatus::Idle;
        }
        drop(devices);

        self.inner.completed_total.fetch_add(1, Ordering::SeqCst);
        self.emit(CoordinatorEvent::WorkloadCompleted { workload_id: workload_id.to_string(), device_id, workload_type, result });
        Ok(())
    }

    fn fail_workload(&self, workload_id: &str) {
        let mut workloads = self.inner.workloads.write();
        if let Some(workload) = workloads.get_mut(workload_id) {
            if workload.status.is_terminal() {
                return;
            }
            workload.status = WorkloadStatus::Failed;
            let device_id = workload.device_id.clone();
            drop(workloads);
            if let Some(device) = self.inner.devices.write().get_mut(&device_id) {
                device.failed_workloads += 1;
                device.current_workload_id = None;
                if device.status == DeviceStatus::Busy {
                    device.status = DeviceStatus::Idle;
                }
            }
            self.inner.failed_total.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fail_workloads_for_device(&self, device_id: &str) {
        let ids: Vec<String> = self
            .inner
            .workloads
            .read()
            .values()
            .filter(|w| w.device_id == device_id && !w.status.is_terminal())
            .map(|w| w.workload_id.clone())
            .collect();
        for id in ids {
            self.fail_workload(&id);
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        let devices = self.inner.devices.read();
        let workloads = self.inner.workloads.read();
        CoordinatorStats {
            registered_devices: devices.len(),
            online_devices: devices.values().filter(|d| matches!(d.status, DeviceStatus::Online | DeviceStatus::Idle | DeviceStatus::Busy)).count(),
            active_workloads: workloads.values().filter(|w| !w.status.is_terminal()).count(),
            completed_workloads: self.inner.completed_total.load(Ordering::SeqCst),
            failed_workloads: self.inner.failed_total.load(Ordering::SeqCst),
        }
    }

    pub fn start_health_monitor(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.inner.config.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let timeout = inner.config.device_timeout;
                        let timed_out: Vec<String> = inner
                            .devices
                            .read()
                            .values()
                            .filter(|d| d.last_seen.elapsed() > timeout)
                            .map(|d| d.device_id.clone())
                            .collect();
                        for device_id in timed_out {
                            inner.devices.write().remove(&device_id);
                            let ids: Vec<String> = inner
                                .workloads
                                .read()
                                .values()
                                .filter(|w| w.device_id == device_id && !w.status.is_terminal())
                                .map(|w| w.workload_id.clone())
                                .collect();
                            for id in ids {
                                if let Some(w) = inner.workloads.write().get_mut(&id) {
                                    w.status = WorkloadStatus::Failed;
                                }
                                inner.failed_total.fetch_add(1, Ordering::SeqCst);
                            }
                            tracing::warn!(device_id, "device timed out, reaping workloads");
                        }

                        let now = Instant::now();
                        let overdue: Vec<(String, String)> = inner
                            .workloads
                            .read()
                            .values()
                            .filter(|w| !w.status.is_terminal() && now > w.expected_completion)
                            .map(|w| (w.workload_id.clone(), w.device_id.clone()))
                            .collect();
                        for (workload_id, device_id) in overdue {
                            if let Some(w) = inner.workloads.write().get_mut(&workload_id) {
                                w.status = WorkloadStatus::Failed;
                            }
                            if let Some(d) = inner.devices.write().get_mut(&device_id) {
                                d.current_workload_id = None;
                                if d.status == DeviceStatus::Busy {
                                    d.status = DeviceStatus::Idle;
                                }
                            }
                            inner.failed_total.fetch_add(1, Ordering::SeqCst);
                            tracing::warn!(workload_id, device_id, "workload missed its soft deadline");
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
        *self.task.lock() = Some(handle);
    }

    pub fn cleanup(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities { cpu_cores: 4, memory_gb: 2.0, battery_level: 80, network_bandwidth_mbps: 50.0, sensors: Vec::new() }
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig { max_devices: 2, health_check_interval: Duration::from_secs(30), device_timeout: Duration::from_secs(60) }
    }

    #[test]
    fn register_rejects_past_capacity() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        coordinator.register_device("b", "sensor", caps()).unwrap();
        let err = coordinator.register_device("c", "sensor", caps()).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 2 }));
    }

    #[test]
    fn register_rejects_duplicate() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        let err = coordinator.register_device("a", "sensor", caps()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
    }

    #[test]
    fn assign_workload_picks_an_eligible_device() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        let workload_id = coordinator.assign_workload(WorkloadType::Training, Value::Null, 5, None).unwrap();
        assert!(workload_id.ends_with("_a"));
        assert_eq!(coordinator.stats().active_workloads, 1);
    }

    #[test]
    fn assign_workload_skips_incapable_devices() {
        let coordinator = EdgeCoordinator::new(config());
        let thin = DeviceCapabilities { cpu_cores: 1, memory_gb: 0.1, battery_level: 100, network_bandwidth_mbps: 10.0, sensors: Vec::new() };
        coordinator.register_device("thin", "sensor", thin).unwrap();
        let err = coordinator.assign_workload(WorkloadType::Training, Value::Null, 5, None).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
    }

    #[test]
    fn assign_workload_requires_sensors_for_data_collection() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        let err = coordinator.assign_workload(WorkloadType::DataCollection, Value::Null, 5, None).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));

        let mut with_sensor = caps();
        with_sensor.sensors = vec!["temperature".to_string()];
        coordinator.register_device("b", "sensor", with_sensor).unwrap();
        coordinator.assign_workload(WorkloadType::DataCollection, Value::Null, 5, None).unwrap();
    }

    #[test]
    fn complete_workload_updates_stats_and_frees_device() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        let workload_id = coordinator.assign_workload(WorkloadType::Training, Value::Null, 5, None).unwrap();
        coordinator.complete_workload(&workload_id, WorkloadResult::default()).unwrap();
        assert_eq!(coordinator.stats().completed_workloads, 1);
        assert_eq!(coordinator.stats().active_workloads, 0);
    }

    #[test]
    fn complete_workload_rejects_already_terminal() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        let workload_id = coordinator.assign_workload(WorkloadType::Training, Value::Null, 5, None).unwrap();
        coordinator.complete_workload(&workload_id, WorkloadResult::default()).unwrap();
        let err = coordinator.complete_workload(&workload_id, WorkloadResult::default()).unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminal(_)));
        assert_eq!(coordinator.stats().completed_workloads, 1);
    }

    #[test]
    fn unregister_fails_in_flight_workloads() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        coordinator.assign_workload(WorkloadType::Training, Value::Null, 5, None).unwrap();
        coordinator.unregister_device("a").unwrap();
        assert_eq!(coordinator.stats().failed_workloads, 1);
    }

    #[test]
    fn overload_cancels_non_critical_workload() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        let workload_id = coordinator.assign_workload(WorkloadType::Training, Value::Null, 3, None).unwrap();
        coordinator.update_device_status("a", DeviceStatus::Overloaded, None).unwrap();
        let active = coordinator.stats().active_workloads;
        assert_eq!(active, 0);
        let _ = workload_id;
    }

    #[test]
    fn low_battery_cancels_critical_workload() {
        let coordinator = EdgeCoordinator::new(config());
        coordinator.register_device("a", "sensor", caps()).unwrap();
        coordinator.assign_workload(WorkloadType::Training, Value::Null, 9, None).unwrap();
        coordinator.update_device_status("a", DeviceStatus::LowBattery, None).unwrap();
        assert_eq!(coordinator.stats().active_workloads, 0);
    }

    #[test]
    fn scoring_rewards_resources_and_battery() {
        let strong = DeviceRecord {
            device_id: "strong".into(),
            device_type: "sensor".into(),
            status: DeviceStatus::Idle,
            capabilities: DeviceCapabilities { cpu_cores: 8, memory_gb: 8.0, battery_level: 100, network_bandwidth_mbps: 100.0, sensors: Vec::new() },
            connected_at: Instant::now(),
            last_seen: Instant::now(),
            current_workload_id: None,
            performance_metrics: None,
            completed_workloads: 0,
            failed_workloads: 0,
            mean_completion_secs: 0.0,
        };
        let weak = DeviceRecord {
            capabilities: DeviceCapabilities { cpu_cores: 1, memory_gb: 0.5, battery_level: 20, network_bandwidth_mbps: 1.0, sensors: Vec::new() },
            ..strong.clone()
        };
        assert!(EdgeCoordinator::score_device(&strong) > EdgeCoordinator::score_device(&weak));
        assert!((EdgeCoordinator::score_device(&strong) - 100.0).abs() < 1e-9);
    }
}
