//! Health report of the data relay and the public API, posted to Discord.

use std::fmt::Write as _;

use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::error;
use tracing::info;

use crate::config::HealthcheckConfig;
use crate::error::FlowError;
use crate::error::FlowResult;
use crate::flow::FlowContext;
use crate::flow::FlowReport;
use crate::registry::FlowKind;

const OK: &str = "OK";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayStatus {
    pub status: String,
    #[serde(default)]
    pub queues: Vec<QueueStatus>,
}

impl RelayStatus {
    pub fn error() -> Self {
        Self {
            status: "ERROR".to_string(),
            queues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub messages_ready: u64,
}

fn base_url<'a>(
    urls: &'a crate::config::EnvironmentUrls,
    environment: &str,
) -> FlowResult<&'a str> {
    urls.for_environment(environment).ok_or_else(|| {
        FlowError::Config(format!(
            "invalid environment `{environment}`, expected staging or prod"
        ))
    })
}

async fn get_health(http: &reqwest::Client, base_url: &str) -> Result<Value, reqwest::Error> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    http.get(url).send().await?.error_for_status()?.json().await
}

/// Any failure to reach the relay reads as status `ERROR`.
pub async fn data_relay_status(http: &reqwest::Client, base_url: &str) -> RelayStatus {
    match get_health(http, base_url).await {
        Ok(value) => match serde_json::from_value::<RelayStatus>(value) {
            Ok(status) => {
                info!("Data relay service status: {status:?}");
                status
            }
            Err(err) => {
                error!("Unexpected data relay status payload: {err}");
                RelayStatus::error()
            }
        },
        Err(err) => {
            error!("Failed to get data relay service status: {err}");
            RelayStatus::error()
        }
    }
}

pub async fn api_is_up(http: &reqwest::Client, base_url: &str) -> bool {
    match get_health(http, base_url).await {
        Ok(value) => {
            info!("API status: {value}");
            value.get("status").and_then(Value::as_str) == Some(OK)
        }
        Err(err) => {
            error!("Failed to get API status: {err}");
            false
        }
    }
}

pub fn generate_message(
    relay: &RelayStatus,
    api_up: bool,
    min_messages_warning: u64,
    min_messages_critical: u64,
) -> String {
    let mut message = String::from("<emoji> **Healthcheck report:**\n\n");
    let mut emoji = "✅";

    if relay.status != OK {
        message.push_str("- ❌ Data relay service is **down**.\n");
        emoji = "❌";
    } else {
        message.push_str("- Data relay service is **up**.\n");
        for queue in &relay.queues {
            let ready = queue.messages_ready;
            let mut queue_emoji = "";
            if ready >= min_messages_critical {
                queue_emoji = "❌ ";
                emoji = "❌";
            } else if ready >= min_messages_warning {
                queue_emoji = "⚠️ ";
                // A later warning must not hide an earlier critical queue.
                if emoji != "❌" {
                    emoji = "⚠️";
                }
            }
            let _ = writeln!(
                message,
                "  - {queue_emoji}{}: {ready} messages to process",
                queue.name
            );
        }
    }

    message.push('\n');

    if api_up {
        message.push_str("- Civitas API is **up**.\n");
    } else {
        message.push_str("- ❌ Civitas API is **down**.\n");
        emoji = "❌";
    }

    message.replace("<emoji>", emoji)
}

pub async fn send_to_discord(
    http: &reqwest::Client,
    webhook_url: &str,
    message: &str,
) -> FlowResult<()> {
    let result = http
        .post(webhook_url)
        .json(&json!({ "content": message }))
        .send()
        .await
        .and_then(reqwest::Response::error_for_status);
    match result {
        Ok(_) => {
            info!("Message sent to Discord successfully.");
            Ok(())
        }
        Err(err) => {
            error!("Failed to send message to Discord: {err}");
            Err(err.into())
        }
    }
}

pub async fn run(ctx: &FlowContext, config: &HealthcheckConfig) -> FlowResult<FlowReport> {
    let relay_url = base_url(&config.data_relay, &config.environment)?;
    let api_url = base_url(&config.api, &config.environment)?;

    let relay = data_relay_status(&ctx.http, relay_url).await;
    let api_up = api_is_up(&ctx.http, api_url).await;
    let message = generate_message(
        &relay,
        api_up,
        config.min_messages_warning,
        config.min_messages_critical,
    );

    let webhook_url = ctx.secrets.get_secret(&config.discord_webhook_secret_name)?;
    send_to_discord(&ctx.http, &webhook_url, &message).await?;

    Ok(FlowReport {
        flow: FlowKind::Healthcheck,
        rows: 0,
        outputs: vec![message],
    })
}
