// LibertAI gateway — x402 payment gate
//
// Requests without a valid API key can pay per request: the gateway
// computes a maximum price from the request body, fetches payment
// requirements from the settlement service, and either challenges with a
// 402 or verifies a presented X-PAYMENT header. Accepted payments are
// verified only, never settled here.

use std::sync::OnceLock;

use serde_json::{Value, json};
use tiktoken_rs::CoreBPE;

use crate::pricing::PriceEntry;
use crate::state::AppState;

/// USDC contract on Base mainnet.
pub const USDC_BASE_ADDRESS: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

pub const X402_VERSION: u32 = 2;
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

const MIN_PRICE: f64 = 0.0001;
const DEFAULT_MAX_TOKENS: u64 = 4096;

static ENCODER: OnceLock<CoreBPE> = OnceLock::new();

fn encoder() -> &'static CoreBPE {
    ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base encoding is embedded"))
}

/// Maximum price in USD for a request against `entry`.
///
/// Image models are priced flat. Token models tokenize the serialized
/// `messages` array with cl100k_base — CPU-bound, so it runs on the
/// blocking pool — and add the worst-case output cost from the
/// `max_tokens` fallback chain. The result never goes below the price
/// floor.
pub async fn compute_max_price(
    entry: &PriceEntry,
    messages: &Value,
    requested_max_tokens: Option<u64>,
) -> anyhow::Result<f64> {
    let (input_price, output_price, default_max) = match entry {
        PriceEntry::Image { price_per_image } => return Ok(*price_per_image),
        PriceEntry::Tokens {
            price_per_million_input_tokens,
            price_per_million_output_tokens,
            default_max_tokens,
        } => (
            *price_per_million_input_tokens,
            *price_per_million_output_tokens,
            *default_max_tokens,
        ),
    };

    let messages_text = serde_json::to_string(messages)?;
    let input_tokens = tokio::task::spawn_blocking(move || encoder().encode_ordinary(&messages_text).len())
        .await
        .map_err(|e| anyhow::anyhow!("tokenizer task failed: {e}"))? as f64;

    let max_tokens = requested_max_tokens.or(default_max).unwrap_or(DEFAULT_MAX_TOKENS) as f64;

    let price = input_tokens / 1e6 * input_price + max_tokens / 1e6 * output_price;
    Ok(price.max(MIN_PRICE))
}

/// Price in micro-USDC, as the settlement service expects it.
pub fn amount_string(max_price: f64) -> String {
    ((max_price * 1e6).round() as u64).to_string()
}

/// POST {settlement}/accepts to obtain the `accepts` array for a 402
/// challenge.
pub async fn fetch_accepts(
    state: &AppState,
    model: &str,
    max_price: f64,
    resource_url: &str,
) -> Result<Vec<Value>, String> {
    let config = &state.config;
    let payload = json!({
        "resourceUrl": resource_url,
        "method": "POST",
        "network": "eip155:8453",
        "price": {
            "amount": amount_string(max_price),
            "asset": { "address": USDC_BASE_ADDRESS, "decimals": 6 },
        },
        "scheme": "upto",
        "serverWalletAddress": config.server_wallet_address,
        "recipientAddress": config.recipient_address,
        "x402Version": X402_VERSION,
        "routeConfig": {
            "description": format!("Pay-per-use inference for {model}"),
            "mimeType": "application/json",
        },
    });

    let response = state
        .control_client
        .post(format!("{}/accepts", config.settlement_api_url))
        .header("x-secret-key", &config.settlement_secret_key)
        .json(&payload)
        .send()
        .await
        .map_err(|e| format!("accepts request failed: {e}"))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(format!("accepts returned {}", response.status()));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| format!("invalid accepts body: {e}"))?;

    // The service answers either with the bare array or wrapped in a
    // payment-required envelope.
    let accepts = match body {
        Value::Array(items) => items,
        Value::Object(ref map) => map
            .get("accepts")
            .and_then(Value::as_array)
            .cloned()
            .ok_or("accepts body has no 'accepts' array")?,
        _ => return Err("unexpected accepts body shape".to_string()),
    };

    if accepts.is_empty() {
        return Err("settlement service returned no payment requirements".to_string());
    }

    Ok(accepts)
}

/// 402 response body shared by the challenge and the invalid-payment
/// retry.
pub fn payment_required_body(accepts: &[Value]) -> Value {
    json!({
        "x402Version": X402_VERSION,
        "error": format!("{PAYMENT_HEADER} header is required"),
        "accepts": accepts,
    })
}

/// POST {settlement}/verify. Success iff the service answers 200 with
/// `isValid == true`; transport errors, non-200 statuses and malformed
/// bodies all count as verification failure.
pub async fn verify_payment(state: &AppState, payment_header: &str, requirements: &Value) -> bool {
    let payment_payload: Value = match serde_json::from_str(payment_header) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("x402: X-PAYMENT header is not valid JSON: {e}");
            return false;
        }
    };

    let payload = json!({
        "x402Version": X402_VERSION,
        "paymentPayload": payment_payload,
        "paymentRequirements": requirements,
    });

    let response = match state
        .control_client
        .post(format!("{}/verify", state.config.settlement_api_url))
        .header("x-secret-key", &state.config.settlement_secret_key)
        .json(&payload)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("x402: verify request failed: {e}");
            return false;
        }
    };

    if response.status() != reqwest::StatusCode::OK {
        tracing::error!("x402: verify returned {}", response.status());
        return false;
    }

    match response.json::<Value>().await {
        Ok(body) => body.get("isValid").and_then(Value::as_bool).unwrap_or(false),
        Err(e) => {
            tracing::error!("x402: invalid verify body: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn image_price_is_returned_verbatim() {
        let entry = PriceEntry::Image { price_per_image: 0.05 };
        let price = compute_max_price(&entry, &json!([]), None).await.unwrap();
        assert_eq!(price, 0.05);
    }

    #[tokio::test]
    async fn output_cost_uses_requested_max_tokens() {
        // Zero input price isolates the output term: price = max_tokens / 1e6.
        let entry = PriceEntry::Tokens {
            price_per_million_input_tokens: 0.0,
            price_per_million_output_tokens: 1.0,
            default_max_tokens: Some(2000),
        };

        let price = compute_max_price(&entry, &json!([]), Some(50_000)).await.unwrap();
        assert_eq!(price, 0.05);
    }

    #[tokio::test]
    async fn max_tokens_falls_back_to_entry_default_then_4096() {
        let with_default = PriceEntry::Tokens {
            price_per_million_input_tokens: 0.0,
            price_per_million_output_tokens: 1.0,
            default_max_tokens: Some(200_000),
        };
        let price = compute_max_price(&with_default, &json!([]), None).await.unwrap();
        assert_eq!(price, 0.2);

        let without_default = PriceEntry::Tokens {
            price_per_million_input_tokens: 0.0,
            price_per_million_output_tokens: 1000.0,
            default_max_tokens: None,
        };
        let price = compute_max_price(&without_default, &json!([]), None).await.unwrap();
        assert_eq!(price, 4096.0 / 1e6 * 1000.0);
    }

    #[tokio::test]
    async fn price_is_clamped_to_floor() {
        let entry = PriceEntry::Tokens {
            price_per_million_input_tokens: 0.0,
            price_per_million_output_tokens: 0.0,
            default_max_tokens: None,
        };
        let price = compute_max_price(&entry, &json!([]), None).await.unwrap();
        assert_eq!(price, 0.0001);
    }

    #[tokio::test]
    async fn longer_messages_cost_more() {
        let entry = PriceEntry::Tokens {
            price_per_million_input_tokens: 10.0,
            price_per_million_output_tokens: 0.0,
            default_max_tokens: Some(1),
        };

        let short = compute_max_price(&entry, &json!([{"role": "user", "content": "hi"}]), None)
            .await
            .unwrap();
        let long_text = "the quick brown fox jumps over the lazy dog ".repeat(200);
        let long = compute_max_price(&entry, &json!([{"role": "user", "content": long_text}]), None)
            .await
            .unwrap();

        assert!(long > short, "more input tokens must raise the max price");
    }

    #[test]
    fn amount_string_rounds_to_micro_usdc() {
        assert_eq!(amount_string(0.05), "50000");
        assert_eq!(amount_string(0.0001), "100");
        assert_eq!(amount_string(1.2345678), "1234568");
    }

    #[test]
    fn payment_required_body_shape() {
        let accepts = vec![json!({"scheme": "upto"})];
        let body = payment_required_body(&accepts);
        assert_eq!(body["x402Version"], 2);
        assert_eq!(body["error"], "X-PAYMENT header is required");
        assert_eq!(body["accepts"][0]["scheme"], "upto");
    }
}
