//! End-to-end scenarios for the regional aggregation round state machine.

use fog_node::aggregator::{AggregationStrategy, AggregatorConfig, EdgeUpdate, RegionalAggregator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

fn update(client_id: &str, samples: u64, loss: f64, start: SystemTime) -> EdgeUpdate {
    EdgeUpdate {
        client_id: client_id.to_string(),
        model_weights: HashMap::from([("w".to_string(), vec![1.0, 2.0])]),
        sample_count: samples,
        training_loss: loss,
        timestamp: start,
        privacy_budget: None,
        compression_ratio: None,
    }
}

fn config(strategy: AggregationStrategy, min_clients: usize, max_wait_time: Duration) -> AggregatorConfig {
    AggregatorConfig {
        fog_node_id: "fog-test".to_string(),
        strategy,
        min_clients,
        max_wait_time,
        fedprox_mu: 0.1,
    }
}

#[tokio::test(start_paused = true)]
async fn happy_path_round_completes_on_quorum() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let results_clone = Arc::clone(&results);
    let aggregator = RegionalAggregator::new(
        config(AggregationStrategy::FedAvg, 2, Duration::from_secs(120)),
        Arc::new(move |r| results_clone.lock().unwrap().push(r)),
    );

    aggregator.start_round();
    let now = SystemTime::now();
    aggregator.add_edge_update(update("a", 10, 0.2, now)).unwrap();
    aggregator.add_edge_update(update("b", 10, 0.2, now)).unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;

    let completed = results.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].participants.len(), 2);
    assert_eq!(completed[0].total_samples, 20);
}

#[tokio::test(start_paused = true)]
async fn deadline_with_partial_quorum_still_aggregates() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let results_clone = Arc::clone(&results);
    let aggregator = RegionalAggregator::new(
        config(AggregationStrategy::FedAvg, 3, Duration::from_secs(10)),
        Arc::new(move |r| results_clone.lock().unwrap().push(r)),
    );

    aggregator.start_round();
    let now = SystemTime::now();
    aggregator.add_edge_update(update("a", 5, 0.3, now)).unwrap();

    tokio::time::advance(Duration::from_secs(11)).await;
    tokio::task::yield_now().await;

    let completed = results.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].participants, vec!["a".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn empty_round_at_deadline_emits_nothing() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let results_clone = Arc::clone(&results);
    let aggregator = RegionalAggregator::new(
        config(AggregationStrategy::FedAvg, 3, Duration::from_secs(10)),
        Arc::new(move |r| results_clone.lock().unwrap().push(r)),
    );

    aggregator.start_round();
    tokio::time::advance(Duration::from_secs(11)).await;
    tokio::task::yield_now().await;

    assert!(results.lock().unwrap().is_empty());
    let stats = aggregator.stats();
    assert_eq!(stats.rounds_completed, 0);
    assert_eq!(stats.current_round, 1);
}

#[tokio::test(start_paused = true)]
async fn heterogeneous_shapes_abort_the_round() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let results_clone = Arc::clone(&results);
    let aggregator = RegionalAggregator::new(
        config(AggregationStrategy::FedAvg, 2, Duration::from_secs(10)),
        Arc::new(move |r| results_clone.lock().unwrap().push(r)),
    );

    aggregator.start_round();
    let now = SystemTime::now();
    let mut a = update("a", 5, 0.1, now);
    a.model_weights = HashMap::from([("w1".to_string(), vec![1.0])]);
    let mut b = update("b", 5, 0.1, now);
    b.model_weights = HashMap::from([("w2".to_string(), vec![1.0])]);
    aggregator.add_edge_update(a).unwrap();
    aggregator.add_edge_update(b).unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;

    assert!(results.lock().unwrap().is_empty());
    assert_eq!(aggregator.stats().rounds_completed, 0);
}
