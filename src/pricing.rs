// LibertAI gateway — x402 price catalogue
//
// Per-model pricing pulled from the admin backend. A model without an
// entry is not x402-eligible. The table is swapped atomically on refresh
// and the previous table is retained on any fetch failure.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceEntry {
    Image {
        price_per_image: f64,
    },
    Tokens {
        price_per_million_input_tokens: f64,
        price_per_million_output_tokens: f64,
        #[serde(default)]
        default_max_tokens: Option<u64>,
    },
}

#[derive(Clone, Default)]
pub struct PriceCatalogue {
    inner: Arc<RwLock<Arc<HashMap<String, PriceEntry>>>>,
}

impl PriceCatalogue {
    pub async fn get(&self, model: &str) -> Option<PriceEntry> {
        self.inner.read().await.get(model).cloned()
    }

    pub async fn current(&self) -> Arc<HashMap<String, PriceEntry>> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, prices: HashMap<String, PriceEntry>) {
        *self.inner.write().await = Arc::new(prices);
    }
}

/// GET {backend}/x402/prices with the admin token. On any failure the
/// previous catalogue stays in place.
pub async fn refresh_prices(state: &AppState) {
    let url = format!("{}/x402/prices", state.config.backend_api_url);

    let response = match state
        .control_client
        .get(&url)
        .header("x-admin-token", &state.config.backend_secret_token)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("prices: fetch failed: {e}");
            return;
        }
    };

    if response.status() != reqwest::StatusCode::OK {
        tracing::error!("prices: backend returned {}", response.status());
        return;
    }

    match response.json::<HashMap<String, PriceEntry>>().await {
        Ok(prices) => {
            tracing::debug!("prices: refreshed, {} models priced", prices.len());
            state.prices.replace(prices).await;
        }
        Err(e) => tracing::error!("prices: invalid response body: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_image_entry() {
        let entry: PriceEntry = serde_json::from_str(r#"{"price_per_image": 0.05}"#).unwrap();
        assert_eq!(entry, PriceEntry::Image { price_per_image: 0.05 });
    }

    #[test]
    fn deserializes_token_entry() {
        let entry: PriceEntry = serde_json::from_str(
            r#"{"price_per_million_input_tokens": 0.4, "price_per_million_output_tokens": 1.2, "default_max_tokens": 2048}"#,
        )
        .unwrap();
        assert_eq!(
            entry,
            PriceEntry::Tokens {
                price_per_million_input_tokens: 0.4,
                price_per_million_output_tokens: 1.2,
                default_max_tokens: Some(2048),
            }
        );
    }

    #[test]
    fn token_entry_without_default_max_tokens() {
        let entry: PriceEntry = serde_json::from_str(
            r#"{"price_per_million_input_tokens": 0.4, "price_per_million_output_tokens": 1.2}"#,
        )
        .unwrap();
        assert!(matches!(entry, PriceEntry::Tokens { default_max_tokens: None, .. }));
    }

    #[tokio::test]
    async fn catalogue_swap_is_whole_table() {
        let catalogue = PriceCatalogue::default();
        assert!(catalogue.get("m1").await.is_none());

        let snapshot_before = catalogue.current().await;

        catalogue
            .replace(HashMap::from([(
                "m1".to_string(),
                PriceEntry::Image { price_per_image: 0.01 },
            )]))
            .await;

        assert!(catalogue.get("m1").await.is_some());
        // The old snapshot is untouched by the swap.
        assert!(snapshot_before.get("m1").is_none());
    }
}
