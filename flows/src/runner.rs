use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use tracing::info;
use tracing::warn;

use crate::config::FlowsConfig;
use crate::error::FlowResult;
use crate::flooding;
use crate::flooding::classify::GeminiVisionClient;
use crate::flooding::snapshot::HttpSnapshotSource;
use crate::flow::FlowContext;
use crate::flow::FlowReport;
use crate::gcp::GcpAuthTokens;
use crate::gcp::GcpRestClient;
use crate::healthcheck;
use crate::iam::BatchPolicyFetcher;
use crate::lgpd;
use crate::mapa_realizacoes;
use crate::mapa_realizacoes::firestore::DocumentStore;
use crate::mapa_realizacoes::firestore::FirestoreRestClient;
use crate::mapa_realizacoes::firestore::MemoryDocumentStore;
use crate::mapa_realizacoes::geocode::GoogleMapsGeocoder;
use crate::registry::FlowKind;
use crate::registry::SCHEDULE_TIMEZONE;
use crate::secrets::EnvSecretStore;
use crate::secrets::SecretStore;
use crate::sink::GcsUploader;
use crate::sink::PartitionWriter;
use crate::state::MemoryStateStore;
use crate::state::SqliteStateStore;
use crate::state::StateStore;
use crate::telemetry::record_flow_run;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Keep state in memory and files local.
    pub dry_run: bool,
}

/// Wires real clients from a [`FlowsConfig`] and runs flows once.
pub struct FlowRunner {
    config: FlowsConfig,
    options: RunOptions,
    secrets: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for FlowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRunner")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl FlowRunner {
    pub fn new(config: FlowsConfig, options: RunOptions) -> Self {
        Self {
            config,
            options,
            secrets: Arc::new(EnvSecretStore),
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    fn open_state(&self) -> FlowResult<Arc<dyn StateStore>> {
        if self.options.dry_run {
            return Ok(Arc::new(MemoryStateStore::new()));
        }
        Ok(Arc::new(SqliteStateStore::open(&self.config.state_path)?))
    }

    async fn gcp_client(&self) -> FlowResult<Arc<GcpRestClient>> {
        let tokens = GcpAuthTokens::from_config(&self.config.gcp, self.secrets.as_ref()).await?;
        Ok(Arc::new(GcpRestClient::new(
            Arc::new(tokens),
            self.config.gcp.clone(),
        )?))
    }

    /// `uploads` is false for flows that never load rows.
    async fn context(
        &self,
        gcp: Option<Arc<GcpRestClient>>,
        uploads: bool,
    ) -> FlowResult<FlowContext> {
        let bucket = self.config.gcs_bucket.as_ref().filter(|_| uploads);
        let uploader = match (bucket, self.options.dry_run) {
            (Some(bucket), false) => {
                let client = match gcp {
                    Some(client) => client,
                    None => self.gcp_client().await?,
                };
                Some(GcsUploader::new(client, bucket.clone()))
            }
            (Some(_), true) => {
                info!("Dry run: staged files stay local.");
                None
            }
            (None, _) => None,
        };
        Ok(FlowContext {
            state: self.open_state()?,
            secrets: self.secrets.clone(),
            writer: PartitionWriter::new(self.config.output_dir.clone()),
            uploader,
            http: reqwest::Client::new(),
        })
    }

    /// Runs `kind` once and records its telemetry.
    pub async fn run(&self, kind: FlowKind) -> FlowResult<FlowReport> {
        let started = Instant::now();
        let result = self.run_inner(kind).await;
        let elapsed: Duration = started.elapsed();
        match &result {
            Ok(report) => record_flow_run(kind, elapsed, true, report.rows),
            Err(err) => {
                warn!("Flow {kind} failed: {err}");
                record_flow_run(kind, elapsed, false, 0);
            }
        }
        result
    }

    async fn run_inner(&self, kind: FlowKind) -> FlowResult<FlowReport> {
        let now = Utc::now();
        let today = now.with_timezone(&SCHEDULE_TIMEZONE).date_naive();
        match kind {
            FlowKind::TablesBindings => {
                let gcp = self.gcp_client().await?;
                let ctx = self.context(Some(gcp.clone()), true).await?;
                let settings = &self.config.tables_bindings;
                let fetcher = BatchPolicyFetcher::new(gcp.clone())
                    .with_backoff(self.config.backoff)
                    .with_batch_size(settings.batch_size);
                lgpd::tables_bindings::run(&ctx, gcp.as_ref(), &fetcher, settings, today).await
            }
            FlowKind::AuditLog => {
                let gcp = self.gcp_client().await?;
                let ctx = self.context(Some(gcp.clone()), true).await?;
                lgpd::auditlog::run(
                    &ctx,
                    gcp.as_ref(),
                    gcp.as_ref(),
                    &self.config.auditlog,
                    now.naive_utc(),
                )
                .await
            }
            FlowKind::Metadata => {
                let ctx = self.context(None, true).await?;
                lgpd::metadata::run(&ctx, &self.config.metadata, today).await
            }
            FlowKind::FloodingDetection => {
                let ctx = self.context(None, true).await?;
                let settings = &self.config.flooding;
                let api_key = ctx.secrets.get_secret(&settings.vision.api_key_secret_name)?;
                let vision =
                    GeminiVisionClient::new(ctx.http.clone(), api_key, settings.vision.clone());
                let snapshots = HttpSnapshotSource::new(ctx.http.clone());
                flooding::run(&ctx, settings, &snapshots, &vision, now).await
            }
            FlowKind::Healthcheck => {
                let ctx = self.context(None, false).await?;
                healthcheck::run(&ctx, &self.config.healthcheck).await
            }
            FlowKind::MapaRealizacoes => {
                let ctx = self.context(None, false).await?;
                let settings = &self.config.mapa_realizacoes;
                let api_key = ctx.secrets.get_secret(&settings.gmaps_key_secret_name)?;
                let geocoder =
                    GoogleMapsGeocoder::new(ctx.http.clone(), &settings.geocoding_url, api_key);
                let documents: Box<dyn DocumentStore> = if self.options.dry_run {
                    info!("Dry run: documents are kept in memory.");
                    Box::new(MemoryDocumentStore::new())
                } else {
                    Box::new(FirestoreRestClient::from_secret(
                        ctx.http.clone(),
                        &settings.firestore_url,
                        &settings.firestore_credentials_secret_name,
                        ctx.secrets.as_ref(),
                    )?)
                };
                mapa_realizacoes::run(&ctx, settings, &geocoder, documents.as_ref()).await
            }
        }
    }
}
