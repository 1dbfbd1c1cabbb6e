//! Flooding detection from street cameras.
//!
//! Cameras in hexagons with meaningful rain (or with recent flooding
//! predictions) are photographed and sent to a vision model. Labels are
//! smoothed with a short per-camera history before being published.

pub mod api_data;
pub mod buffer;
pub mod cameras;
pub mod classify;
pub mod rain;
pub mod snapshot;

use chrono::DateTime;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use tracing::info;

use crate::config::FloodingConfig;
use crate::error::FlowResult;
use crate::flow::FlowContext;
use crate::flow::FlowReport;
use crate::registry::FlowKind;
use crate::registry::SCHEDULE_TIMEZONE;
use buffer::PredictionBuffer;
use classify::ClassifiedCamera;
use classify::VisionClient;
use snapshot::SnapshotSource;

pub async fn run(
    ctx: &FlowContext,
    config: &FloodingConfig,
    snapshots: &dyn SnapshotSource,
    vision: &dyn VisionClient,
    now: DateTime<Utc>,
) -> FlowResult<FlowReport> {
    let buffer = PredictionBuffer::new(
        ctx.state.clone(),
        config.predictions_buffer_key.clone(),
        config.buffer_length,
    );

    let last_update = rain::fetch_last_update(&ctx.http, &config.rain_api_update_url).await?;
    let readings = rain::fetch_rain(&ctx.http, &config.rain_api_url).await?;
    let cameras = cameras::fetch_cameras(&ctx.http, &config.cameras_url).await?;
    let joined = cameras::join_rain(cameras, &readings);
    info!("Joined {} cameras with rain data updated at {last_update}.", joined.len());

    let picked = {
        let mut rng = rand::rng();
        cameras::pick_cameras(joined, &buffer, config.mocked_cameras_number, &mut rng)?
    };

    let retry = classify::default_classification_retry();
    let classified: Vec<ClassifiedCamera> = stream::iter(picked)
        .map(|camera| classify::classify_camera(camera, snapshots, vision, &retry))
        .buffered(config.parallelism.max(1))
        .collect()
        .await;

    let local_now = now.with_timezone(&SCHEDULE_TIMEZONE);
    let records = api_data::update_api_data(
        ctx.state.as_ref(),
        &buffer,
        &classified,
        &config.data_key,
        &config.last_update_key,
        local_now,
    )?;

    let mut report = FlowReport::new(FlowKind::FloodingDetection);
    if records.is_empty() {
        return Ok(report);
    }
    let rows = api_data::prediction_rows(&records, &config.vision.model, local_now.date_naive());
    report.outputs = ctx
        .load(&config.target, &rows, |row| row.data_particao)
        .await?;
    report.rows = rows.len();
    Ok(report)
}
