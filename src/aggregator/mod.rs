//! Regional Aggregator: a round-based state machine that collects edge
//! updates under a quorum-and-deadline rule and computes a weighted
//! aggregate under one of several strategies.

use crate::error::{Error, InvalidUpdateReason, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A single model parameter tensor. Any representation works as long as
/// shape (length) equality is decidable; a flat `Vec<f64>` is the simplest
/// one that satisfies the contract.
pub type Tensor = Vec<f64>;
pub type ModelWeights = HashMap<String, Tensor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    FedAvg,
    FedProx,
    Regional,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Idle,
    Collecting,
    Aggregating,
}

/// An admitted (or rejected) contribution from one edge client.
#[derive(Debug, Clone)]
pub struct EdgeUpdate {
    pub client_id: String,
    pub model_weights: ModelWeights,
    pub sample_count: u64,
    pub training_loss: f64,
    pub timestamp: SystemTime,
    pub privacy_budget: Option<f64>,
    pub compression_ratio: Option<f64>,
}

/// Output of one completed round.
#[derive(Debug, Clone)]
pub struct AggregationResult {
    pub weights: ModelWeights,
    pub participants: Vec<String>,
    pub total_samples: u64,
    pub weighted_avg_loss: f64,
    pub round_number: u64,
    pub fog_node_id: String,
    pub created_at: SystemTime,
    pub sent_upstream: bool,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub fog_node_id: String,
    pub strategy: AggregationStrategy,
    pub min_clients: usize,
    pub max_wait_time: Duration,
    pub fedprox_mu: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    pub rounds_completed: u64,
    pub current_round: u64,
    pub mean_participants: f64,
    pub mean_samples: f64,
    pub mean_loss: f64,
    pub last_result_at: Option<SystemTime>,
}

struct RollingResult {
    participants: usize,
    samples: u64,
    loss: f64,
}

#[derive(Default)]
struct StatsInner {
    rounds_completed: u64,
    recent: std::collections::VecDeque<RollingResult>,
    last_result_at: Option<SystemTime>,
}

const ROLLING_WINDOW: usize = 10;
const DEADLINE_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Inner {
    state: RwLock<RoundState>,
    round_number: AtomicU64,
    round_start: RwLock<Option<Instant>>,
    round_start_wall: RwLock<Option<SystemTime>>,
    pending: RwLock<Vec<EdgeUpdate>>,
    stats: RwLock<StatsInner>,
}

type ResultCallback = Arc<dyn Fn(AggregationResult) + Send + Sync>;

/// Round state machine. One active round per fog node at a time.
pub struct RegionalAggregator {
    inner: Arc<Inner>,
    config: AggregatorConfig,
    on_result: ResultCallback,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RegionalAggregator {
    pub fn new(config: AggregatorConfig, on_result: ResultCallback) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(RoundState::Idle),
                round_number: AtomicU64::new(0),
                round_start: RwLock::new(None),
                round_start_wall: RwLock::new(None),
                pending: RwLock::new(Vec::new()),
                stats: RwLock::new(StatsInner::default()),
            }),
            config,
            on_result,
            task: parking_lot::Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn state(&self) -> RoundState {
        *self.inner.state.read()
    }

    /// `Idle -> Collecting`. Bumps the round counter, clears pending updates,
    /// and starts the coordination task that watches for quorum-or-deadline.
    pub fn start_round(&self) {
        {
            let mut state = self.inner.state.write();
            if *state != RoundState::Idle {
                return;
            }
            *state = RoundState::Collecting;
        }
        self.inner.round_number.fetch_add(1, Ordering::SeqCst);
        self.inner.pending.write().clear();
        *self.inner.round_start.write() = Some(Instant::now());
        *self.inner.round_start_wall.write() = Some(SystemTime::now());

        let round_number = self.inner.round_number.load(Ordering::SeqCst);
        tracing::info!(round_number, "aggregation round started");

        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        let on_result = Arc::clone(&self.on_result);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEADLINE_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if Self::round_should_complete(&inner, &config) {
                            Self::finalize_round(&inner, &config, &on_result, round_number);
                            break;
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

    fn round_should_complete(inner: &Inner, config: &AggregatorConfig) -> bool {
        let elapsed = inner
            .round_start
            .read()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        if elapsed >= config.max_wait_time {
            return true;
        }

        let pending = inner.pending.read();
        if pending.len() < config.min_clients {
            return false;
        }
        match config.strategy {
            AggregationStrategy::FedAvg | AggregationStrategy::FedProx | AggregationStrategy::Regional => true,
            AggregationStrategy::Adaptive => {
                let total_samples: u64 = pending.iter().map(|u| u.sample_count).sum();
                if total_samples < 100 {
                    return false;
                }
                let mean = pending.iter().map(|u| u.training_loss).sum::<f64>() / pending.len() as f64;
                let variance = pending
                    .iter()
                    .map(|u| (u.training_loss - mean).powi(2))
                    .sum::<f64>()
                    / pending.len() as f64;
                variance < 0.1 || pending.len() >= 2 * config.min_clients
            }
        }
    }

    fn finalize_round(
        inner: &Inner,
        config: &AggregatorConfig,
        on_result: &ResultCallback,
        round_number: u64,
    ) {
        *inner.state.write() = RoundState::Aggregating;
        let updates = inner.pending.read().clone();

        if updates.is_empty() {
            tracing::info!(round_number, "round reached deadline with no admitted updates, emitting nothing");
            *inner.state.write() = RoundState::Idle;
            return;
        }

        match aggregate(&updates, config.strategy, config.fedprox_mu) {
            Ok(weights) => {
                let total_samples: u64 = updates.iter().map(|u| u.sample_count).sum();
                let weighted_avg_loss = updates
                    .iter()
                    .map(|u| u.training_loss * u.sample_count as f64)
                    .sum::<f64>()
                    / total_samples as f64;

                let result = AggregationResult {
                    weights,
                    participants: updates.iter().map(|u| u.client_id.clone()).collect(),
                    total_samples,
                    weighted_avg_loss,
                    round_number,
                    fog_node_id: config.fog_node_id.clone(),
                    created_at: SystemTime::now(),
                    sent_upstream: false,
                };

                {
                    let mut stats = inner.stats.write();
                    stats.rounds_completed += 1;
                    stats.last_result_at = Some(result.created_at);
                    stats.recent.push_back(RollingResult {
                        participants: result.participants.len(),
                        samples: result.total_samples,
                        loss: result.weighted_avg_loss,
                    });
                    if stats.recent.len() > ROLLING_WINDOW {
                        stats.recent.pop_front();
                    }
                }

                tracing::info!(round_number, participants = result.participants.len(), "aggregation round completed");
                on_result(result);
            }
            Err(e) => {
                tracing::warn!(round_number, error = %e, "aggregation round aborted");
            }
        }

        *inner.state.write() = RoundState::Idle;
    }

    /// Admit (or reject) a single edge update into the active round.
    pub fn add_edge_update(&self, update: EdgeUpdate) -> Result<()> {
        if *self.inner.state.read() != RoundState::Collecting {
            return Err(Error::InvalidUpdate(InvalidUpdateReason::NoActiveRound));
        }
        let round_start_wall = self
            .inner
            .round_start_wall
            .read()
            .ok_or(Error::InvalidUpdate(InvalidUpdateReason::NoActiveRound))?;
        if update.timestamp < round_start_wall {
            return Err(Error::InvalidUpdate(InvalidUpdateReason::TimestampBeforeRound));
        }
        if update.model_weights.is_empty() {
            return Err(Error::InvalidUpdate(InvalidUpdateReason::BadWeights));
        }
        if update.sample_count == 0 {
            return Err(Error::InvalidUpdate(InvalidUpdateReason::NonPositiveSamples));
        }

        let mut pending = self.inner.pending.write();
        if pending.iter().any(|u| u.client_id == update.client_id) {
            return Err(Error::InvalidUpdate(InvalidUpdateReason::DuplicateClient));
        }
        pending.push(update);
        Ok(())
    }

    pub fn stats(&self) -> AggregatorStats {
        let stats = self.inner.stats.read();
        let n = stats.recent.len().max(1) as f64;
        AggregatorStats {
            rounds_completed: stats.rounds_completed,
            current_round: self.inner.round_number.load(Ordering::SeqCst),
            mean_participants: stats.recent.iter().map(|r| r.participants as f64).sum::<f64>() / n,
            mean_samples: stats.recent.iter().map(|r| r.samples as f64).sum::<f64>() / n,
            mean_loss: stats.recent.iter().map(|r| r.loss).sum::<f64>() / n,
            last_result_at: stats.last_result_at,
        }
    }

    /// Cancel the coordination task, observed at its next 1-second poll.
    pub fn cleanup(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// Compute the weighted aggregate over `updates` under `strategy`. All
/// updates must agree on the parameter-name set taken from the first
/// update; a missing parameter anywhere aborts with `HeterogeneousShapes`.
fn aggregate(
    updates: &[EdgeUpdate],
    strategy: AggregationStrategy,
    fedprox_mu: f64,
) -> Result<ModelWeights> {
    let total_samples: u64 = updates.iter().map(|u| u.sample_count).sum();
    let param_names: Vec<&String> = updates[0].model_weights.keys().collect();

    for u in updates {
        if param_names.iter().any(|p| !u.model_weights.contains_key(p.as_str())) {
            return Err(Error::HeterogeneousShapes);
        }
    }

    let weights: Vec<f64> = updates
        .iter()
        .map(|u| client_weight(u, strategy, fedprox_mu, total_samples))
        .collect();

    let mut result = ModelWeights::new();
    for param in param_names {
        let shape = updates[0].model_weights[param].len();
        let mut acc = vec![0.0f64; shape];
        for (u, w) in updates.iter().zip(weights.iter()) {
            let tensor = &u.model_weights[param];
            if tensor.len() != shape {
                return Err(Error::HeterogeneousShapes);
            }
            for (a, v) in acc.iter_mut().zip(tensor.iter()) {
                *a += w * v;
            }
        }
        result.insert(param.clone(), acc);
    }
    Ok(result)
}

fn client_weight(u: &EdgeUpdate, strategy: AggregationStrategy, fedprox_mu: f64, total_samples: u64) -> f64 {
    let sample_share = u.sample_count as f64 / total_samples as f64;
    match strategy {
        AggregationStrategy::FedAvg | AggregationStrategy::Regional => sample_share,
        AggregationStrategy::FedProx => sample_share * (1.0 / (1.0 + fedprox_mu * u.training_loss)),
        AggregationStrategy::Adaptive => {
            let privacy_budget = u.privacy_budget.unwrap_or(0.0);
            let compression_ratio = u.compression_ratio.unwrap_or(1.0);
            sample_share
                * (1.0 / (1.0 + u.training_loss))
                * (1.0 / (1.0 + privacy_budget))
                * compression_ratio
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn update(client_id: &str, samples: u64, weight: f64, loss: f64, start: SystemTime) -> EdgeUpdate {
        EdgeUpdate {
            client_id: client_id.to_string(),
            model_weights: [("w".to_string(), vec![weight])].into(),
            sample_count: samples,
            training_loss: loss,
            timestamp: start,
            privacy_budget: None,
            compression_ratio: None,
        }
    }

    fn collector() -> (ResultCallback, Arc<Mutex<Vec<AggregationResult>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let r2 = Arc::clone(&results);
        let cb: ResultCallback = Arc::new(move |r| r2.lock().unwrap().push(r));
        (cb, results)
    }

    #[test]
    fn fedavg_weighted_combination() {
        let now = SystemTime::now();
        let updates = vec![
            update("a", 10, 1.0, 0.1, now),
            update("b", 20, 2.0, 0.1, now),
            update("c", 70, 3.0, 0.1, now),
        ];
        let weights = aggregate(&updates, AggregationStrategy::FedAvg, 0.1).unwrap();
        assert!((weights["w"][0] - 2.6).abs() < 1e-9);
    }

    #[test]
    fn heterogeneous_shapes_is_rejected() {
        let now = SystemTime::now();
        let mut a = update("a", 10, 1.0, 0.1, now);
        let mut b = update("b", 10, 1.0, 0.1, now);
        a.model_weights = [("w1".to_string(), vec![1.0])].into();
        b.model_weights = [("w2".to_string(), vec![1.0])].into();
        let err = aggregate(&[a, b], AggregationStrategy::FedAvg, 0.1).unwrap_err();
        assert!(matches!(err, Error::HeterogeneousShapes));
    }

    #[test]
    fn add_edge_update_rejects_without_active_round() {
        let (cb, _) = collector();
        let agg = RegionalAggregator::new(
            AggregatorConfig {
                fog_node_id: "fog-1".into(),
                strategy: AggregationStrategy::FedAvg,
                min_clients: 3,
                max_wait_time: Duration::from_secs(120),
                fedprox_mu: 0.1,
            },
            cb,
        );
        let err = agg.add_edge_update(update("a", 1, 1.0, 0.1, SystemTime::now())).unwrap_err();
        assert!(matches!(err, Error::InvalidUpdate(InvalidUpdateReason::NoActiveRound)));
    }

    #[tokio::test]
    async fn add_edge_update_rejects_duplicate_client() {
        let (cb, _) = collector();
        let agg = RegionalAggregator::new(
            AggregatorConfig {
                fog_node_id: "fog-1".into(),
                strategy: AggregationStrategy::FedAvg,
                min_clients: 3,
                max_wait_time: Duration::from_secs(120),
                fedprox_mu: 0.1,
            },
            cb,
        );
        agg.start_round();
        agg.cleanup();
        let now = SystemTime::now();
        agg.add_edge_update(update("a", 1, 1.0, 0.1, now)).unwrap();
        let err = agg.add_edge_update(update("a", 1, 1.0, 0.1, now)).unwrap_err();
        assert!(matches!(err, Error::InvalidUpdate(InvalidUpdateReason::DuplicateClient)));
    }
}
