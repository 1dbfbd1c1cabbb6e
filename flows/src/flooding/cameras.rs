use std::collections::HashMap;
use std::io::Read;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use super::buffer::PredictionBuffer;
use super::buffer::majority;
use super::rain::RainReading;
use crate::error::FlowError;
use crate::error::FlowResult;

/// Status forced on cameras whose recent predictions saw flooding.
pub const RAINING_STATUS: &str = "chuva moderada";

/// Rain statuses that are too light to be worth a classification call.
const SKIP_STATUSES: [&str; 2] = ["sem chuva", "chuva fraca"];

/// A row of the cameras sheet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Camera {
    pub id_camera: String,
    pub nome: String,
    pub rtsp: String,
    pub latitude: f64,
    pub longitude: f64,
    pub id_h3: String,
    #[serde(default)]
    pub identificador: Option<String>,
}

/// A camera joined with the rain status of its hexagon.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraWithRain {
    pub camera: Camera,
    pub status: Option<String>,
}

/// A camera selected for this run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PickedCamera {
    pub id_camera: String,
    pub nome_camera: String,
    pub url_camera: String,
    pub latitude: f64,
    pub longitude: f64,
    pub attempt_classification: bool,
    pub identifier: String,
}

/// Reads the cameras CSV, keeping only cameras with an identifier.
pub fn parse_cameras<R: Read>(reader: R) -> FlowResult<Vec<Camera>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut cameras = Vec::new();
    for record in csv_reader.deserialize::<Camera>() {
        let camera = record?;
        if camera
            .identificador
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty())
        {
            cameras.push(camera);
        }
    }
    info!("Cameras with identifier: {}", cameras.len());
    Ok(cameras)
}

pub async fn fetch_cameras(http: &reqwest::Client, url: &str) -> FlowResult<Vec<Camera>> {
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FlowError::Api {
            service: "cameras sheet",
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }
    let bytes = response.bytes().await?;
    parse_cameras(bytes.as_ref())
}

/// Left join on `id_h3`; the first reading of a hexagon wins.
pub fn join_rain(cameras: Vec<Camera>, rain: &[RainReading]) -> Vec<CameraWithRain> {
    let mut by_hexagon: HashMap<&str, Option<&str>> = HashMap::new();
    for reading in rain {
        by_hexagon
            .entry(reading.id_h3.as_str())
            .or_insert(reading.status.as_deref());
    }
    cameras
        .into_iter()
        .map(|camera| {
            let status = by_hexagon
                .get(camera.id_h3.as_str())
                .copied()
                .flatten()
                .map(str::to_string);
            CameraWithRain { camera, status }
        })
        .collect()
}

/// A camera is classified unless its hexagon reports no or light rain.
/// Cameras without a known status are classified.
pub fn should_attempt(status: Option<&str>) -> bool {
    status.is_none_or(|status| !SKIP_STATUSES.contains(&status))
}

/// Decides which cameras get classified.
///
/// A camera whose buffered majority or last prediction is `true` keeps being
/// classified regardless of rain. `mocked` random cameras are also forced in.
pub fn pick_cameras<R: Rng + ?Sized>(
    mut cameras: Vec<CameraWithRain>,
    buffer: &PredictionBuffer,
    mocked: usize,
    rng: &mut R,
) -> FlowResult<Vec<PickedCamera>> {
    for entry in &mut cameras {
        let predictions = buffer.get(&entry.camera.id_camera)?;
        let most_common = majority(&predictions).unwrap_or(false);
        let last = predictions.last().copied().unwrap_or(false);
        if most_common || last {
            entry.status = Some(RAINING_STATUS.to_string());
        }
    }

    if !cameras.is_empty() {
        for _ in 0..mocked {
            let index = rng.random_range(0..cameras.len());
            cameras[index].status = Some(RAINING_STATUS.to_string());
            info!("Mocked camera ID: {}", cameras[index].camera.id_camera);
        }
    }

    let picked: Vec<PickedCamera> = cameras
        .into_iter()
        .map(|CameraWithRain { camera, status }| PickedCamera {
            attempt_classification: should_attempt(status.as_deref()),
            id_camera: camera.id_camera,
            nome_camera: camera.nome,
            url_camera: camera.rtsp,
            latitude: camera.latitude,
            longitude: camera.longitude,
            identifier: camera.identificador.unwrap_or_default(),
        })
        .collect();
    info!(
        "Picked {} cameras, {} to classify.",
        picked.len(),
        picked.iter().filter(|c| c.attempt_classification).count()
    );
    Ok(picked)
}
