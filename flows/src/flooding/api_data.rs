use chrono::DateTime;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use super::buffer::PredictionBuffer;
use super::buffer::majority;
use super::classify::AiClassification;
use super::classify::ClassifiedCamera;
use crate::error::FlowResult;
use crate::state::StateStore;

pub const API_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One camera as published to the flooding API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRecord {
    pub datetime: String,
    pub id_camera: String,
    pub url_camera: String,
    pub latitude: f64,
    pub longitude: f64,
    pub image_base64: Option<String>,
    pub ai_classification: Vec<AiClassification>,
}

/// Flat history row written to the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRow {
    #[serde(skip)]
    pub data_particao: NaiveDate,
    pub datetime: String,
    pub id_camera: String,
    pub url_camera: String,
    pub latitude: f64,
    pub longitude: f64,
    pub object: Option<String>,
    pub label: Option<bool>,
    pub confidence: Option<f64>,
    pub model: String,
}

/// Feeds each labelled camera into its buffer and publishes the smoothed
/// label.
///
/// Cameras without a label are published with an empty classification list
/// and leave their buffer untouched. The JSON list is stored at `data_key` and
/// `now` at `last_update_key`.
pub fn update_api_data(
    store: &dyn StateStore,
    buffer: &PredictionBuffer,
    cameras: &[ClassifiedCamera],
    data_key: &str,
    last_update_key: &str,
    now: DateTime<Tz>,
) -> FlowResult<Vec<ApiRecord>> {
    let datetime = now.format(API_DATETIME_FORMAT).to_string();
    let mut records = Vec::with_capacity(cameras.len());
    for classified in cameras {
        let mut ai_classification = Vec::new();
        if let Some(label) = classified.label {
            let predictions = buffer.push(&classified.camera.id_camera, label)?;
            let smoothed = majority(&predictions).unwrap_or(label);
            ai_classification.push(AiClassification::flooding(smoothed));
        }
        records.push(ApiRecord {
            datetime: datetime.clone(),
            id_camera: classified.camera.id_camera.clone(),
            url_camera: classified.camera.url_camera.clone(),
            latitude: classified.camera.latitude,
            longitude: classified.camera.longitude,
            image_base64: classified.image_base64.clone(),
            ai_classification,
        });
    }

    store.set(data_key, &serde_json::to_string(&records)?)?;
    store.set(last_update_key, &datetime)?;
    info!("Successfully updated flooding detection data ({} cameras).", records.len());
    Ok(records)
}

pub fn prediction_rows(records: &[ApiRecord], model: &str, date: NaiveDate) -> Vec<PredictionRow> {
    records
        .iter()
        .map(|record| {
            let classification = record.ai_classification.first();
            PredictionRow {
                data_particao: date,
                datetime: record.datetime.clone(),
                id_camera: record.id_camera.clone(),
                url_camera: record.url_camera.clone(),
                latitude: record.latitude,
                longitude: record.longitude,
                object: classification.map(|c| c.object.clone()),
                label: classification.map(|c| c.label),
                confidence: classification.map(|c| c.confidence),
                model: model.to_string(),
            }
        })
        .collect()
}
