//! End-to-end scenario: a device that stops sending heartbeats is reaped
//! along with any workload still assigned to it.

use fog_node::coordinator::{CoordinatorConfig, DeviceCapabilities, EdgeCoordinator, WorkloadType};
use serde_json::Value;
use std::time::Duration;

fn caps() -> DeviceCapabilities {
    DeviceCapabilities {
        cpu_cores: 2,
        memory_gb: 1.0,
        battery_level: 90,
        network_bandwidth_mbps: 20.0,
        sensors: Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn device_timeout_reaps_its_workloads() {
    let coordinator = EdgeCoordinator::new(CoordinatorConfig {
        max_devices: 10,
        health_check_interval: Duration::from_secs(5),
        device_timeout: Duration::from_secs(30),
    });

    coordinator.register_device("dev-1", "sensor", caps()).unwrap();
    coordinator.assign_workload(WorkloadType::Training, Value::Null, 5, None).unwrap();
    coordinator.start_health_monitor();

    tokio::time::advance(Duration::from_secs(35)).await;
    tokio::task::yield_now().await;

    let stats = coordinator.stats();
    assert_eq!(stats.registered_devices, 0);
    assert_eq!(stats.failed_workloads, 1);

    coordinator.cleanup();
}
