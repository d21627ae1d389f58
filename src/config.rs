// LibertAI gateway — configuration
//
// Everything is loaded once at startup: the model catalogue from a JSON
// file referenced by LTAI_MODELS_FILE, secrets and collaborator endpoints
// from the environment. The resulting Config is read-only for the rest of
// the process lifetime.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// One inference backend instance serving a model.
#[derive(Debug, Clone, Deserialize)]
pub struct Replica {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub gpu: bool,
    /// Path prefixes this replica will honor. Empty = accepts any path.
    #[serde(default)]
    pub completion_paths: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

impl Replica {
    /// Whether this replica accepts a request for the given path
    /// (leading-slash form, e.g. `/v1/chat/completions`).
    pub fn supports_path(&self, path: &str) -> bool {
        self.completion_paths.is_empty() || self.completion_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// Replica selection policy, see `selection` module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
    /// Rotate through the full configured replica list, retrying the next
    /// candidate on connection errors.
    #[default]
    RoundRobin,
    /// Pick the healthy replica with the lowest reported load score.
    LeastBusy,
    /// Weight-proportional random choice among healthy replicas.
    Weighted,
}

impl RoutingStrategy {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "round-robin" => Ok(Self::RoundRobin),
            "least-busy" => Ok(Self::LeastBusy),
            "weighted" => Ok(Self::Weighted),
            other => anyhow::bail!("unknown routing strategy '{other}' (expected round-robin, least-busy or weighted)"),
        }
    }
}

/// Process-wide configuration, owned by `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Lowercased model name → ordered replica list (config-file order).
    pub models: HashMap<String, Vec<Replica>>,
    pub backend_api_url: String,
    pub backend_secret_token: String,
    /// Base64-encoded RSA private key PEM used to sign key bundles.
    pub private_key_b64: String,
    pub settlement_api_url: String,
    pub settlement_secret_key: String,
    pub server_wallet_address: String,
    pub recipient_address: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_topic_id: Option<i64>,
    pub primary_lock_path: PathBuf,
    pub routing_strategy: RoutingStrategy,
}

const DEFAULT_LOCK_PATH: &str = "/tmp/libertai-primary-worker.lock";
const DEFAULT_SETTLEMENT_API_URL: &str = "https://api.thirdweb.com/v1/payments/x402";

impl Config {
    /// Load the full configuration from the environment. `dotenvy` is
    /// expected to have run already (done in `main`).
    pub fn from_env() -> anyhow::Result<Self> {
        let models_file = required("LTAI_MODELS_FILE")?;
        let raw = std::fs::read_to_string(&models_file)
            .with_context(|| format!("failed to read models file {models_file}"))?;
        let models = parse_models(&raw).with_context(|| format!("invalid models file {models_file}"))?;

        let routing_strategy = match std::env::var("LTAI_ROUTING_STRATEGY") {
            Ok(v) => RoutingStrategy::parse(&v)?,
            Err(_) => RoutingStrategy::default(),
        };

        Ok(Self {
            models,
            backend_api_url: required("LTAI_BACKEND_API_URL")?,
            backend_secret_token: required("LTAI_BACKEND_SECRET_TOKEN")?,
            private_key_b64: required("LTAI_PRIVATE_KEY")?,
            settlement_api_url: optional("LTAI_SETTLEMENT_API_URL")
                .unwrap_or_else(|| DEFAULT_SETTLEMENT_API_URL.to_string()),
            settlement_secret_key: optional("LTAI_SETTLEMENT_SECRET_KEY").unwrap_or_default(),
            server_wallet_address: optional("LTAI_SERVER_WALLET_ADDRESS").unwrap_or_default(),
            recipient_address: optional("LTAI_RECIPIENT_ADDRESS").unwrap_or_default(),
            telegram_bot_token: optional("LTAI_TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: optional("LTAI_TELEGRAM_CHAT_ID"),
            telegram_topic_id: optional("LTAI_TELEGRAM_TOPIC_ID")
                .map(|v| v.parse::<i64>().context("LTAI_TELEGRAM_TOPIC_ID must be an integer"))
                .transpose()?,
            primary_lock_path: optional("LTAI_PRIMARY_LOCK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_PATH)),
            routing_strategy,
        })
    }
}

/// Parse and normalize the models catalogue: lowercase model names, strip
/// trailing slashes from replica URLs, reject replicas without a URL.
pub fn parse_models(raw: &str) -> anyhow::Result<HashMap<String, Vec<Replica>>> {
    let parsed: HashMap<String, Vec<Replica>> = serde_json::from_str(raw)?;

    let mut models = HashMap::with_capacity(parsed.len());
    for (name, mut replicas) in parsed {
        for replica in &mut replicas {
            if replica.url.trim().is_empty() {
                anyhow::bail!("model '{name}' has a replica without a url");
            }
            while replica.url.ends_with('/') {
                replica.url.pop();
            }
            url::Url::parse(&replica.url)
                .with_context(|| format!("model '{name}' has an invalid replica url '{}'", replica.url))?;
        }
        models.insert(name.to_lowercase(), replicas);
    }
    Ok(models)
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} environment variable is required"))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
