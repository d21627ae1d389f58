// LibertAI gateway — replica health monitor
//
// Probes every (model, url) pair concurrently and maintains two atomic
// views: healthy replica URLs per model, and per-URL load metrics. Both
// are whole-snapshot swapped after each sweep so request handlers never
// observe a partially updated state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Client;
use tokio::sync::RwLock;

use crate::config::Replica;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

// llama.cpp server gauges exposed on /health bodies.
const METRIC_REQUESTS_PROCESSING: &str = "llamacpp:requests_processing";
const METRIC_REQUESTS_DEFERRED: &str = "llamacpp:requests_deferred";

/// Snapshot of one replica's last probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaMetrics {
    pub is_healthy: bool,
    pub requests_processing: u64,
    pub requests_deferred: u64,
}

impl ReplicaMetrics {
    pub fn load_score(&self) -> u64 {
        self.requests_processing + self.requests_deferred
    }
}

pub struct HealthMonitor {
    /// Model → configured replica URLs, config order. Immutable.
    model_urls: HashMap<String, Vec<String>>,
    /// Model → currently healthy replica URLs, config order.
    healthy_model_urls: RwLock<Arc<HashMap<String, Vec<String>>>>,
    /// Replica URL → last probe result. Missing entry = never probed,
    /// treated as unhealthy with an infinite load score.
    server_metrics: RwLock<Arc<HashMap<String, ReplicaMetrics>>>,
}

impl HealthMonitor {
    pub fn new(models: &HashMap<String, Vec<Replica>>) -> Self {
        let model_urls: HashMap<String, Vec<String>> = models
            .iter()
            .map(|(name, replicas)| (name.clone(), replicas.iter().map(|r| r.url.clone()).collect()))
            .collect();

        // Start with every model known but nothing healthy yet.
        let empty: HashMap<String, Vec<String>> =
            model_urls.keys().map(|name| (name.clone(), Vec::new())).collect();

        Self {
            model_urls,
            healthy_model_urls: RwLock::new(Arc::new(empty)),
            server_metrics: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn model_urls(&self) -> &HashMap<String, Vec<String>> {
        &self.model_urls
    }

    /// Snapshot of the healthy view. Callers hold the `Arc` for the whole
    /// request; later sweeps never mutate it.
    pub async fn healthy_model_urls(&self) -> Arc<HashMap<String, Vec<String>>> {
        self.healthy_model_urls.read().await.clone()
    }

    pub async fn metrics(&self) -> Arc<HashMap<String, ReplicaMetrics>> {
        self.server_metrics.read().await.clone()
    }

    /// Probe all (model, url) pairs concurrently, then swap in fresh
    /// healthy + metrics views. Never blocks request serving.
    pub async fn check_all_servers(&self, client: &Client) {
        let mut probes = Vec::new();
        for (model, urls) in &self.model_urls {
            for url in urls {
                probes.push(async move {
                    let metrics = probe(client, url, model).await;
                    (model.clone(), url.clone(), metrics)
                });
            }
        }

        let results = join_all(probes).await;

        let mut healthy: HashMap<String, Vec<String>> =
            self.model_urls.keys().map(|name| (name.clone(), Vec::new())).collect();
        let mut metrics: HashMap<String, ReplicaMetrics> = HashMap::new();

        // join_all preserves launch order, so per-model lists keep the
        // config order the round-robin rotation relies on.
        for (model, url, probe_result) in results {
            if probe_result.is_healthy {
                healthy.entry(model).or_default().push(url.clone());
            }
            metrics.insert(url, probe_result);
        }

        let total: usize = self.model_urls.values().map(|urls| urls.len()).sum();
        let up: usize = healthy.values().map(|urls| urls.len()).sum();
        tracing::debug!("health: sweep complete, {up}/{total} replicas healthy");

        self.install_views(healthy, metrics).await;
    }

    pub(crate) async fn install_views(
        &self,
        healthy: HashMap<String, Vec<String>>,
        metrics: HashMap<String, ReplicaMetrics>,
    ) {
        *self.healthy_model_urls.write().await = Arc::new(healthy);
        *self.server_metrics.write().await = Arc::new(metrics);
    }

    /// Pick a replica URL for `model`:
    /// - `None` when the model has no healthy replicas,
    /// - `preferred` when it is present in the healthy list (stickiness
    ///   wins over load),
    /// - otherwise the healthy replica with the minimum load score, ties
    ///   broken by first occurrence in the healthy list.
    pub async fn get_least_busy(&self, model: &str, preferred: Option<&str>) -> Option<String> {
        let healthy = self.healthy_model_urls().await;
        let urls = healthy.get(model)?;
        if urls.is_empty() {
            return None;
        }

        if let Some(preferred) = preferred {
            if urls.iter().any(|u| u == preferred) {
                return Some(preferred.to_string());
            }
        }

        let metrics = self.metrics().await;
        urls.iter()
            .min_by_key(|url| metrics.get(*url).map_or(u64::MAX, |m| m.load_score()))
            .cloned()
    }
}

/// GET {url}/health/{model}. A 200 marks the replica healthy; the body is
/// additionally parsed as Prometheus text to pick up llama.cpp load
/// gauges when the replica exposes them. Liveness-only bodies yield zero
/// scores.
async fn probe(client: &Client, url: &str, model: &str) -> ReplicaMetrics {
    let probe_url = format!("{url}/health/{model}");
    let response = match client.get(&probe_url).timeout(PROBE_TIMEOUT).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("health: probe failed for {probe_url}: {e}");
            return ReplicaMetrics::default();
        }
    };

    if response.status() != reqwest::StatusCode::OK {
        tracing::debug!("health: {probe_url} returned {}", response.status());
        return ReplicaMetrics::default();
    }

    let (requests_processing, requests_deferred) = match response.text().await {
        Ok(body) => parse_llamacpp_metrics(&body),
        Err(_) => (0, 0),
    };

    ReplicaMetrics {
        is_healthy: true,
        requests_processing,
        requests_deferred,
    }
}

/// Extract `llamacpp:requests_processing` / `llamacpp:requests_deferred`
/// from a Prometheus text body. Missing metrics default to zero.
fn parse_llamacpp_metrics(body: &str) -> (u64, u64) {
    let mut processing = 0;
    let mut deferred = 0;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        match name {
            METRIC_REQUESTS_PROCESSING => processing = value.max(0.0) as u64,
            METRIC_REQUESTS_DEFERRED => deferred = value.max(0.0) as u64,
            _ => {}
        }
    }

    (processing, deferred)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(url: &str) -> Replica {
        Replica {
            url: url.into(),
            weight: 1,
            gpu: false,
            completion_paths: vec![],
        }
    }

    fn monitor_with(model: &str, urls: &[&str]) -> HealthMonitor {
        let mut models = HashMap::new();
        models.insert(model.to_string(), urls.iter().map(|u| replica(u)).collect());
        HealthMonitor::new(&models)
    }

    fn healthy_metrics(processing: u64, deferred: u64) -> ReplicaMetrics {
        ReplicaMetrics {
            is_healthy: true,
            requests_processing: processing,
            requests_deferred: deferred,
        }
    }

    #[test]
    fn parse_llamacpp_metrics_extracts_gauges() {
        let body = "\
# HELP llamacpp:requests_processing Number of requests processing.
# TYPE llamacpp:requests_processing gauge
llamacpp:requests_processing 3
llamacpp:requests_deferred 2
llamacpp:prompt_tokens_total 12345
";
        assert_eq!(parse_llamacpp_metrics(body), (3, 2));
    }

    #[test]
    fn parse_llamacpp_metrics_defaults_to_zero() {
        assert_eq!(parse_llamacpp_metrics("ok"), (0, 0));
        assert_eq!(parse_llamacpp_metrics(""), (0, 0));
        assert_eq!(parse_llamacpp_metrics("llamacpp:requests_processing nan-ish"), (0, 0));
    }

    #[tokio::test]
    async fn least_busy_picks_minimum_score() {
        let monitor = monitor_with("m1", &["http://a", "http://b", "http://c"]);

        let healthy = HashMap::from([(
            "m1".to_string(),
            vec!["http://a".to_string(), "http://b".to_string(), "http://c".to_string()],
        )]);
        let metrics = HashMap::from([
            ("http://a".to_string(), healthy_metrics(5, 1)),
            ("http://b".to_string(), healthy_metrics(0, 1)),
            ("http://c".to_string(), healthy_metrics(4, 0)),
        ]);
        monitor.install_views(healthy, metrics).await;

        assert_eq!(monitor.get_least_busy("m1", None).await.as_deref(), Some("http://b"));
    }

    #[tokio::test]
    async fn least_busy_prefers_sticky_replica() {
        let monitor = monitor_with("m1", &["http://a", "http://b"]);

        let healthy = HashMap::from([(
            "m1".to_string(),
            vec!["http://a".to_string(), "http://b".to_string()],
        )]);
        let metrics = HashMap::from([
            ("http://a".to_string(), healthy_metrics(9, 9)),
            ("http://b".to_string(), healthy_metrics(0, 0)),
        ]);
        monitor.install_views(healthy, metrics).await;

        // Stickiness wins over load.
        assert_eq!(
            monitor.get_least_busy("m1", Some("http://a")).await.as_deref(),
            Some("http://a")
        );
        // Unknown preferred URL is ignored.
        assert_eq!(
            monitor.get_least_busy("m1", Some("http://nope")).await.as_deref(),
            Some("http://b")
        );
    }

    #[tokio::test]
    async fn least_busy_breaks_ties_by_first_occurrence() {
        let monitor = monitor_with("m1", &["http://a", "http://b"]);

        let healthy = HashMap::from([(
            "m1".to_string(),
            vec!["http://a".to_string(), "http://b".to_string()],
        )]);
        let metrics = HashMap::from([
            ("http://a".to_string(), healthy_metrics(1, 1)),
            ("http://b".to_string(), healthy_metrics(2, 0)),
        ]);
        monitor.install_views(healthy, metrics).await;

        assert_eq!(monitor.get_least_busy("m1", None).await.as_deref(), Some("http://a"));
    }

    #[tokio::test]
    async fn least_busy_none_when_no_healthy_replicas() {
        let monitor = monitor_with("m1", &["http://a"]);
        assert_eq!(monitor.get_least_busy("m1", None).await, None);
        assert_eq!(monitor.get_least_busy("unknown", None).await, None);
    }

    #[tokio::test]
    async fn concurrent_swaps_never_expose_partial_views() {
        let monitor = Arc::new(monitor_with("m1", &["http://a", "http://b", "http://c"]));

        // Two alternating full views; http://c is never healthy in either.
        let view = |url: &str| {
            (
                HashMap::from([("m1".to_string(), vec![url.to_string()])]),
                HashMap::from([(url.to_string(), healthy_metrics(1, 0))]),
            )
        };

        let writer = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let (healthy, metrics) = if i % 2 == 0 { view("http://a") } else { view("http://b") };
                    monitor.install_views(healthy, metrics).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let monitor = monitor.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        if let Some(url) = monitor.get_least_busy("m1", None).await {
                            assert!(url == "http://a" || url == "http://b");
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_metrics_score_as_infinite() {
        let monitor = monitor_with("m1", &["http://a", "http://b"]);

        // b is healthy but was never scored; a carries a real score.
        let healthy = HashMap::from([(
            "m1".to_string(),
            vec!["http://b".to_string(), "http://a".to_string()],
        )]);
        let metrics = HashMap::from([("http://a".to_string(), healthy_metrics(100, 100))]);
        monitor.install_views(healthy, metrics).await;

        assert_eq!(monitor.get_least_busy("m1", None).await.as_deref(), Some("http://a"));
    }
}
