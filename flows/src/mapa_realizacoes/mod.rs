//! Public works map ("Mapa de Realizações").
//!
//! Work items from the infopref API are geocoded and written to the Firestore
//! collections the map reads: `realizacao` plus its agency, program and theme
//! links. Neighbourhoods, statuses and agencies are curated by hand and must
//! already exist.

pub mod firestore;
pub mod geocode;
pub mod infopref;
pub mod transform;
pub mod upload;

use std::time::Duration;

use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream;
use tracing::info;

use crate::config::MapaRealizacoesConfig;
use crate::error::FlowResult;
use crate::flow::FlowContext;
use crate::flow::FlowReport;
use crate::registry::FlowKind;
use crate::retry::BackoffPolicy;
use firestore::DocumentStore;
use geocode::Geocoder;
use transform::Realizacao;

/// Retry for one entry's geocoding: three more attempts five seconds apart.
pub fn default_geocoding_retry() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(5), 1.0, 3)
}

pub async fn run(
    ctx: &FlowContext,
    config: &MapaRealizacoesConfig,
    geocoder: &dyn Geocoder,
    documents: &dyn DocumentStore,
) -> FlowResult<FlowReport> {
    let url = ctx.secrets.get_secret(&config.infopref_url_secret_name)?;
    let token = ctx.secrets.get_secret(&config.infopref_token_secret_name)?;
    let entries = infopref::fetch_realizacoes(&ctx.http, &url, &token).await?;

    let retry = default_geocoding_retry();
    let realizacoes: Vec<Realizacao> = stream::iter(entries.iter())
        .map(|entry| transform::transform_entry(entry, geocoder, &retry))
        .buffered(config.parallelism.max(1))
        .try_collect()
        .await?;
    info!("Transformed {} realizacoes.", realizacoes.len());

    let summary = upload::upload_realizacoes(documents, &realizacoes, config.batch_limit).await?;

    let mut report = FlowReport::new(FlowKind::MapaRealizacoes);
    report.rows = summary.realizacoes;
    Ok(report)
}
