//! Infopref entries to public works map documents.

use serde_json::Map;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use super::firestore::FieldValue;
use super::firestore::Fields;
use super::geocode::Coordinates;
use super::geocode::Geocoder;
use crate::error::FlowError;
use crate::error::FlowResult;
use crate::retry::BackoffPolicy;

/// Keys every infopref entry must carry.
pub const REQUIRED_KEYS: [&str; 12] = [
    "populacao_beneficiada",
    "logradouro",
    "entrega_projeto",
    "inicio_projeto",
    "descricao_projeto",
    "bairro",
    "status",
    "titulo",
    "investimento",
    "orgao_extenso",
    "programa",
    "tema",
];

const CITY: &str = "Rio de Janeiro, Brazil";

/// Every work item from infopref is a construction work.
pub const WORK_KIND: &str = "obra";

/// Trimmed, lowercased, spaces turned into underscores.
pub fn to_snake_case(value: &str) -> String {
    value.trim().to_lowercase().replace(' ', "_")
}

/// Inverse of [`to_snake_case`] for display names: each word capitalized and
/// underscores turned back into spaces.
pub fn to_display_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    let mut in_word = false;
    for ch in id.trim().chars() {
        if ch.is_alphabetic() {
            if in_word {
                name.extend(ch.to_lowercase());
            } else {
                name.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            name.push(if ch == '_' { ' ' } else { ch });
            in_word = false;
        }
    }
    name
}

/// One work item ready for the map.
#[derive(Debug, Clone, PartialEq)]
pub struct Realizacao {
    pub id: String,
    pub nome: String,
    pub descricao: Value,
    pub data_inicio: Value,
    pub data_fim: Value,
    pub cariocas_atendidos: i64,
    pub investimento: f64,
    pub coords: Coordinates,
    pub id_bairro: String,
    pub id_status: String,
    pub id_tipo: String,
    pub image_folder: String,
    pub id_orgao: String,
    pub id_programa: String,
    pub id_tema: String,
}

impl Realizacao {
    /// Fields of the `realizacao` document. Agency, program and theme live in
    /// their own link collections.
    pub fn fields(&self) -> Fields {
        [
            ("cariocas_atendidos", FieldValue::Integer(self.cariocas_atendidos)),
            ("coords", FieldValue::GeoPoint(self.coords)),
            ("data_fim", FieldValue::from_json(&self.data_fim)),
            ("data_inicio", FieldValue::from_json(&self.data_inicio)),
            ("descricao", FieldValue::from_json(&self.descricao)),
            ("id_bairro", self.id_bairro.as_str().into()),
            ("id_status", self.id_status.as_str().into()),
            ("id_tipo", self.id_tipo.as_str().into()),
            ("image_folder", self.image_folder.as_str().into()),
            ("investimento", FieldValue::Double(self.investimento)),
            ("nome", self.nome.as_str().into()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

fn text(entry: &Map<String, Value>, key: &str) -> String {
    match entry.get(key) {
        Some(Value::String(value)) => value.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Number(number) => number.as_f64() == Some(0.0),
        _ => false,
    }
}

/// Beneficiary count; blank values count as zero.
pub fn parse_count(value: &Value) -> FlowResult<i64> {
    if is_blank(value) {
        return Ok(0);
    }
    let parsed = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        FlowError::payload("infopref", format!("populacao_beneficiada is not a count: {value}"))
    })
}

/// Investment amount; blank values count as zero.
pub fn parse_amount(value: &Value) -> FlowResult<f64> {
    if is_blank(value) {
        return Ok(0.0);
    }
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        FlowError::payload("infopref", format!("investimento is not a number: {value}"))
    })
}

/// Locates the street address, falling back to the neighbourhood alone.
pub async fn locate(
    geocoder: &dyn Geocoder,
    logradouro: &str,
    bairro: &str,
) -> FlowResult<Coordinates> {
    let full_address = format!("{logradouro}, {bairro}, {CITY}");
    if let Some(coords) = geocoder.geocode(&full_address).await? {
        return Ok(coords);
    }
    warn!("Could not geocode address {full_address}. Falling back to neighborhood.");
    let neighbourhood = format!("{bairro}, {CITY}");
    geocoder
        .geocode(&neighbourhood)
        .await?
        .ok_or_else(|| FlowError::payload("geocoding", format!("no match for {neighbourhood}")))
}

fn is_transient(err: &FlowError) -> bool {
    matches!(err, FlowError::Http(_) | FlowError::Api { .. })
}

/// [`locate`] with `retry.max_retries` extra attempts on geocoder errors.
async fn locate_with_retry(
    geocoder: &dyn Geocoder,
    logradouro: &str,
    bairro: &str,
    retry: &BackoffPolicy,
) -> FlowResult<Coordinates> {
    let mut retries = 0;
    loop {
        match locate(geocoder, logradouro, bairro).await {
            Err(err) if is_transient(&err) && retries < retry.max_retries => {
                warn!("Geocoding failed ({err}); retrying.");
                tokio::time::sleep(retry.delay_for(retries)).await;
                retries += 1;
            }
            result => return result,
        }
    }
}

/// Turns one infopref entry into a [`Realizacao`].
///
/// Missing keys and malformed numbers fail immediately; geocoder errors are
/// retried with `retry`.
pub async fn transform_entry(
    entry: &Map<String, Value>,
    geocoder: &dyn Geocoder,
    retry: &BackoffPolicy,
) -> FlowResult<Realizacao> {
    if let Some(key) = REQUIRED_KEYS.iter().find(|key| !entry.contains_key(**key)) {
        return Err(FlowError::payload(
            "infopref",
            format!("key {key} not found in entry"),
        ));
    }
    let cariocas_atendidos = parse_count(&entry["populacao_beneficiada"])?;
    let investimento = parse_amount(&entry["investimento"])?;
    let bairro = text(entry, "bairro");
    let coords = locate_with_retry(geocoder, &text(entry, "logradouro"), &bairro, retry).await?;

    let nome = text(entry, "titulo");
    let realizacao = Realizacao {
        id: to_snake_case(&nome),
        image_folder: to_snake_case(&nome),
        nome,
        descricao: entry["descricao_projeto"].clone(),
        data_inicio: entry["inicio_projeto"].clone(),
        data_fim: entry["entrega_projeto"].clone(),
        cariocas_atendidos,
        investimento,
        coords,
        id_bairro: to_snake_case(&bairro),
        id_status: to_snake_case(&text(entry, "status")),
        id_tipo: WORK_KIND.to_string(),
        id_orgao: to_snake_case(&text(entry, "orgao_extenso")),
        id_programa: to_snake_case(&text(entry, "programa")),
        id_tema: to_snake_case(&text(entry, "tema")),
    };
    info!("Transformed realizacao {}.", realizacao.id);
    Ok(realizacao)
}
