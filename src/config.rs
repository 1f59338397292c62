//! Configuration loading for the fog node
//!
//! Mirrors the teacher's `Config::load` pattern: read a TOML file, let
//! environment variables override specific fields, then validate.

use crate::aggregator::AggregationStrategy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FogNodeIdentity {
    pub id: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeInterfaceConfig {
    pub max_edge_clients: usize,
    pub mqtt_broker: String,
    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    pub device_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub strategy: AggregationStrategy,
    pub min_clients: usize,
    #[serde(with = "humantime_serde")]
    pub max_wait_time: Duration,
    #[serde(default = "default_fedprox_mu")]
    pub fedprox_mu: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    pub max_size_gb: f64,
    pub ttl_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInterfaceConfig {
    pub server_url: String,
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub fog_node: FogNodeIdentity,
    pub edge_interface: EdgeInterfaceConfig,
    pub aggregation: AggregationConfig,
    pub caching: CachingConfig,
    pub monitoring: MonitoringConfig,
    pub cloud_interface: CloudInterfaceConfig,
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_fedprox_mu() -> f64 {
    0.1
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fog_node: FogNodeIdentity {
                id: "fog-node-1".to_string(),
                region: "default".to_string(),
            },
            edge_interface: EdgeInterfaceConfig {
                max_edge_clients: 1000,
                mqtt_broker: "mqtt://localhost:1883".to_string(),
                device_timeout: Duration::from_secs(300),
            },
            aggregation: AggregationConfig {
                strategy: AggregationStrategy::FedAvg,
                min_clients: 3,
                max_wait_time: Duration::from_secs(120),
                fedprox_mu: default_fedprox_mu(),
            },
            caching: CachingConfig {
                max_size_gb: 1.0,
                ttl_hours: 24.0,
            },
            monitoring: MonitoringConfig {
                health_check_interval: Duration::from_secs(30),
            },
            cloud_interface: CloudInterfaceConfig {
                server_url: "http://localhost:8080".to_string(),
                sync_interval: Duration::from_secs(60),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `FOG_NODE_*` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.override_from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    fn override_from_env(&mut self) {
        if let Ok(id) = env::var("FOG_NODE_ID") {
            self.fog_node.id = id;
        }
        if let Ok(region) = env::var("FOG_NODE_REGION") {
            self.fog_node.region = region;
        }
        if let Ok(url) = env::var("FOG_NODE_CLOUD_URL") {
            self.cloud_interface.server_url = url;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.edge_interface.max_edge_clients == 0 {
            return Err(Error::Config(
                "edge_interface.max_edge_clients must be non-zero".to_string(),
            ));
        }
        if self.caching.max_size_gb <= 0.0 {
            return Err(Error::Config(
                "caching.max_size_gb must be positive".to_string(),
            ));
        }
        if self.aggregation.min_clients == 0 {
            return Err(Error::Config(
                "aggregation.min_clients must be non-zero".to_string(),
            ));
        }
        if self.aggregation.max_wait_time.is_zero() {
            return Err(Error::Config(
                "aggregation.max_wait_time must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_max_size_bytes(&self) -> u64 {
        (self.caching.max_size_gb * 1_073_741_824.0) as u64
    }

    pub fn cache_default_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.caching.ttl_hours * 3600.0)
    }
}
