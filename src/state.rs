// LibertAI gateway — application state
//
// Everything request handlers and background loops share. The former
// process-wide singletons (key set, price catalogue, health monitor)
// live here as long-lived values; their contents are swapped atomically,
// never mutated in place.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;

use crate::api_keys::KeySet;
use crate::config::Config;
use crate::health::HealthMonitor;
use crate::pricing::PriceCatalogue;
use crate::selection::Selector;

// Upstream relay pool. Long reads are expected while a model generates,
// so the overall deadline is the read bound. reqwest exposes no separate
// pool-acquire or body-write timeout and no total-connection cap; the
// overall deadline also bounds those phases, so a saturated pool or a
// stuck replica can never hold a request open past it.
const UPSTREAM_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(100);

// Admin backend, settlement service and key distribution calls.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Central application state. Clone-friendly — every field is an `Arc`
/// or an internally shared handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub keys: KeySet,
    pub prices: PriceCatalogue,
    pub health: Arc<HealthMonitor>,
    pub selector: Arc<Selector>,
    /// Pooled client for relaying requests to replicas.
    pub client: Client,
    /// Short-timeout client for admin, settlement and probe traffic.
    /// Probes override the timeout per request.
    pub control_client: Client,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let health = Arc::new(HealthMonitor::new(&config.models));
        let selector = Arc::new(Selector::new(&config.models));

        let client = Client::builder()
            .timeout(UPSTREAM_TOTAL_TIMEOUT)
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .pool_idle_timeout(UPSTREAM_POOL_IDLE_TIMEOUT)
            .build()
            .expect("Failed to build upstream HTTP client");

        let control_client = Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .connect_timeout(CONTROL_CONNECT_TIMEOUT)
            .build()
            .expect("Failed to build control HTTP client");

        tracing::info!(
            "AppState initialised — {} models, {} replicas, strategy {:?}",
            config.models.len(),
            config.models.values().map(|r| r.len()).sum::<usize>(),
            config.routing_strategy,
        );

        Self {
            config: Arc::new(config),
            keys: KeySet::default(),
            prices: PriceCatalogue::default(),
            health,
            selector,
            client,
            control_client,
            start_time: Instant::now(),
        }
    }
}
