use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::info;

use crate::error::FlowError;
use crate::error::FlowResult;

const LAST_UPDATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Rain status of one H3 hexagon, from the 15 minute precipitation API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RainReading {
    pub id_h3: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub bairro: Option<String>,
    #[serde(default)]
    pub chuva_15min: Option<f64>,
}

/// Parses the API's `"dd/mm/YYYY HH:MM:SS"` body, quotes included.
pub fn parse_last_update(body: &str) -> FlowResult<NaiveDateTime> {
    let trimmed = body.trim().trim_matches('"');
    NaiveDateTime::parse_from_str(trimmed, LAST_UPDATE_FORMAT).map_err(|err| {
        FlowError::payload("rain API", format!("bad last update `{trimmed}`: {err}"))
    })
}

async fn get_text(http: &reqwest::Client, url: &str) -> FlowResult<String> {
    let response = http.get(url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(FlowError::Api {
            service: "rain API",
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(body)
}

pub async fn fetch_last_update(http: &reqwest::Client, url: &str) -> FlowResult<NaiveDateTime> {
    let last_update = parse_last_update(&get_text(http, url).await?)?;
    info!("Last update: {last_update}");
    Ok(last_update)
}

pub async fn fetch_rain(http: &reqwest::Client, url: &str) -> FlowResult<Vec<RainReading>> {
    let readings: Vec<RainReading> = serde_json::from_str(&get_text(http, url).await?)?;
    info!("Successfully downloaded rain data ({} hexagons).", readings.len());
    Ok(readings)
}
