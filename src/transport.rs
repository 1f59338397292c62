//! Transport boundary: the fog node talks to edge devices, the cloud
//! aggregator, and peer fog nodes only through these traits. Production
//! wiring (MQTT, HTTP, gRPC) lives outside this crate; tests use the
//! channel-backed mocks below.

use crate::aggregator::AggregationResult;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outbound channel to edge devices: model distribution and task dispatch.
#[async_trait]
pub trait EdgeTransport: Send + Sync {
    async fn send_model(&self, device_id: &str, model_key: &str, payload: Vec<u8>) -> Result<()>;
    async fn dispatch_task(&self, device_id: &str, task_id: &str) -> Result<()>;
}

/// Outbound channel to the cloud aggregator: upstream sync of regional results.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn send_aggregation_result(&self, result: &AggregationResult) -> Result<()>;
    async fn fetch_global_model(&self, model_key: &str) -> Result<Vec<u8>>;
}

/// Outbound channel to sibling fog nodes in the same region.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn broadcast_status(&self, fog_node_id: &str, payload: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum MockEdgeCall {
    SendModel { device_id: String, model_key: String, size_bytes: usize },
    DispatchTask { device_id: String, task_id: String },
}

/// Records calls instead of performing I/O; used by integration tests.
#[derive(Default)]
pub struct MockEdgeTransport {
    pub calls: Arc<Mutex<Vec<MockEdgeCall>>>,
}

#[async_trait]
impl EdgeTransport for MockEdgeTransport {
    async fn send_model(&self, device_id: &str, model_key: &str, payload: Vec<u8>) -> Result<()> {
        self.calls.lock().await.push(MockEdgeCall::SendModel {
            device_id: device_id.to_string(),
            model_key: model_key.to_string(),
            size_bytes: payload.len(),
        });
        Ok(())
    }

    async fn dispatch_task(&self, device_id: &str, task_id: &str) -> Result<()> {
        self.calls.lock().await.push(MockEdgeCall::DispatchTask {
            device_id: device_id.to_string(),
            task_id: task_id.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MockCloudTransport {
    pub sent: Arc<Mutex<Vec<AggregationResult>>>,
}

#[async_trait]
impl CloudTransport for MockCloudTransport {
    async fn send_aggregation_result(&self, result: &AggregationResult) -> Result<()> {
        self.sent.lock().await.push(result.clone());
        Ok(())
    }

    async fn fetch_global_model(&self, _model_key: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct MockPeerTransport {
    pub broadcasts: Arc<Mutex<Vec<(String, usize)>>>,
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn broadcast_status(&self, fog_node_id: &str, payload: Vec<u8>) -> Result<()> {
        self.broadcasts.lock().await.push((fog_node_id.to_string(), payload.len()));
        Ok(())
    }
}
