use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use tracing::info;

use crate::error::FlowError;
use crate::error::FlowResult;

#[derive(Debug, Deserialize)]
struct InfoprefResponse {
    status: String,
    #[serde(default)]
    data: Option<Vec<Map<String, Value>>>,
}

/// Work items from the infopref API, authenticated with a Basic `token`.
///
/// Any envelope status other than `success` fails the fetch.
pub async fn fetch_realizacoes(
    http: &reqwest::Client,
    url: &str,
    token: &str,
) -> FlowResult<Vec<Map<String, Value>>> {
    let response = http
        .get(url)
        .header(reqwest::header::AUTHORIZATION, format!("Basic {token}"))
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(FlowError::Api {
            service: "infopref",
            status: status.as_u16(),
            message: body,
        });
    }
    let parsed: InfoprefResponse = serde_json::from_str(&body)?;
    if parsed.status != "success" {
        return Err(FlowError::payload(
            "infopref",
            format!("API returned status {}", parsed.status),
        ));
    }
    let entries = parsed.data.unwrap_or_default();
    info!("Fetched {} entries from infopref.", entries.len());
    Ok(entries)
}
