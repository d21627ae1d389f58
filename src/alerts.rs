// LibertAI gateway — health alerting
//
// Every alert period the primary worker diffs the configured catalogue
// against the healthy view and, only when something is down, sends a
// Markdown summary to the operators' Telegram chat. A fully healthy
// fleet stays silent.

use serde_json::json;

use crate::state::AppState;

/// Compute (model, down URLs) pairs: configured replicas absent from the
/// healthy view. Empty when everything is reachable.
pub async fn unhealthy_by_model(state: &AppState) -> Vec<(String, Vec<String>)> {
    let healthy = state.health.healthy_model_urls().await;

    let mut down = Vec::new();
    for (model, urls) in state.health.model_urls() {
        if urls.is_empty() {
            continue;
        }
        let healthy_urls = healthy.get(model).map(Vec::as_slice).unwrap_or_default();
        let unhealthy: Vec<String> = urls.iter().filter(|u| !healthy_urls.contains(u)).cloned().collect();
        if !unhealthy.is_empty() {
            down.push((model.clone(), unhealthy));
        }
    }

    down.sort_by(|a, b| a.0.cmp(&b.0));
    down
}

fn format_alert(down: &[(String, Vec<String>)], total_urls: usize) -> String {
    let total_down: usize = down.iter().map(|(_, urls)| urls.len()).sum();
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");

    let mut message = format!("🚨 *LibertAI Health Alert* ({now})\n\n");
    message.push_str(&format!("*{total_down} of {total_urls} servers are DOWN*\n\n"));

    for (model, urls) in down {
        message.push_str(&format!("*Model: {model}*\n"));
        for url in urls {
            message.push_str(&format!("- `{url}`\n"));
        }
        message.push('\n');
    }

    message
}

/// Send a health alert if any replica is down. No-op when the Telegram
/// bot is not configured or the fleet is fully healthy.
pub async fn send_health_alert(state: &AppState) {
    let (Some(bot_token), Some(chat_id)) = (
        state.config.telegram_bot_token.as_deref(),
        state.config.telegram_chat_id.as_deref(),
    ) else {
        return;
    };

    let down = unhealthy_by_model(state).await;
    let total_urls: usize = state.health.model_urls().values().map(|urls| urls.len()).sum();
    if down.is_empty() || total_urls == 0 {
        return;
    }

    let message = format_alert(&down, total_urls);

    let mut payload = json!({
        "chat_id": chat_id,
        "text": message,
        "parse_mode": "Markdown",
    });
    if let Some(topic_id) = state.config.telegram_topic_id {
        payload["message_thread_id"] = json!(topic_id);
    }

    let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
    match state.control_client.post(&url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {
            let total_down: usize = down.iter().map(|(_, urls)| urls.len()).sum();
            tracing::info!("alerts: health alert sent, {total_down} servers down");
        }
        Ok(response) => {
            tracing::error!("alerts: Telegram API returned {}", response.status());
        }
        Err(e) => {
            tracing::error!("alerts: failed to send health alert: {e}");
        }
    }
}
