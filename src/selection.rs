// LibertAI gateway — replica selection
//
// Three policies share the same inputs (model, optional preferred URL):
//
// - round-robin: rotate the full configured list with a per-model atomic
//   cursor and yield an ordered candidate sequence; the proxy walks it on
//   connection errors. Works with liveness-only backends.
// - least-busy: delegate to the health monitor's load scores (handled in
//   `health::get_least_busy`, not here).
// - weighted: weight-proportional random pick among healthy replicas,
//   with optional GPU preference. Used for stateless fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::Replica;

pub struct Selector {
    /// Per-model round-robin cursor. The model set is fixed after config
    /// load, so the map itself needs no lock.
    cursors: HashMap<String, AtomicUsize>,
}

impl Selector {
    pub fn new(models: &HashMap<String, Vec<Replica>>) -> Self {
        let cursors = models.keys().map(|name| (name.clone(), AtomicUsize::new(0))).collect();
        Self { cursors }
    }

    /// Round-robin candidate order for `model`: advance the cursor once,
    /// rotate `replicas` left by the post-increment cursor, then move the
    /// preferred replica (if present) to the front.
    ///
    /// The cursor advances on every call regardless of request outcome, so
    /// two back-to-back requests without a stickiness hint start from
    /// different replicas.
    pub fn rotate<'a>(&self, model: &str, replicas: &'a [Replica], preferred: Option<&str>) -> Vec<&'a Replica> {
        if replicas.is_empty() {
            return Vec::new();
        }

        let cursor = match self.cursors.get(model) {
            Some(c) => c.fetch_add(1, Ordering::Relaxed) + 1,
            None => 0,
        };
        let offset = cursor % replicas.len();

        let mut candidates: Vec<&Replica> = replicas[offset..].iter().chain(replicas[..offset].iter()).collect();

        if let Some(preferred) = preferred {
            if let Some(pos) = candidates.iter().position(|r| r.url == preferred) {
                let sticky = candidates.remove(pos);
                candidates.insert(0, sticky);
            }
        }

        candidates
    }
}

/// Weight-proportional random choice. When `prefer_gpu` is set and at
/// least one GPU replica is in the pool, the pool narrows to GPU replicas
/// first. Returns `None` on an empty pool.
pub fn weighted_choice<'a>(replicas: &[&'a Replica], prefer_gpu: bool) -> Option<&'a Replica> {
    if replicas.is_empty() {
        return None;
    }

    let mut pool: Vec<&Replica> = replicas.to_vec();
    if prefer_gpu {
        let gpu: Vec<&Replica> = pool.iter().copied().filter(|r| r.gpu).collect();
        if !gpu.is_empty() {
            pool = gpu;
        }
    }

    let total_weight: u64 = pool.iter().map(|r| u64::from(r.weight)).sum();
    if total_weight == 0 {
        let idx = rand::rng().random_range(0..pool.len());
        return Some(pool[idx]);
    }

    let mut roll = rand::rng().random_range(0..total_weight);
    for replica in &pool {
        let weight = u64::from(replica.weight);
        if roll < weight {
            return Some(replica);
        }
        roll -= weight;
    }

    pool.last().copied()
}
