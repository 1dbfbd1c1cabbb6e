use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::AssetClient;
use super::AssetError;
use super::MAX_NAMES_PER_BATCH;
use super::TableBinding;
use super::flatten_response;
use crate::error::FlowError;
use crate::error::FlowResult;
use crate::retry::BackoffPolicy;
use crate::telemetry::record_batch_recovery;

/// Fetches effective IAM bindings in bounded batches.
///
/// Quota errors are retried on the same batch with exponential backoff. A
/// not-found error splits the batch in half and retries each half on its own,
/// so one deleted table only drops its own bindings. A lone missing resource is
/// skipped.
#[derive(Clone)]
pub struct BatchPolicyFetcher {
    client: Arc<dyn AssetClient>,
    backoff: BackoffPolicy,
    batch_size: usize,
}

impl std::fmt::Debug for BatchPolicyFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPolicyFetcher")
            .field("client", &"<AssetClient>")
            .field("backoff", &self.backoff)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl BatchPolicyFetcher {
    pub fn new(client: Arc<dyn AssetClient>) -> Self {
        Self {
            client,
            backoff: BackoffPolicy::default(),
            batch_size: MAX_NAMES_PER_BATCH,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Values outside `1..=MAX_NAMES_PER_BATCH` are clamped.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_NAMES_PER_BATCH);
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fetches every name, `batch_size` names per request.
    pub async fn fetch_all(&self, scope: &str, names: &[String]) -> FlowResult<Vec<TableBinding>> {
        let batches: Vec<&[String]> = names.chunks(self.batch_size).collect();
        let total = batches.len();
        let mut rows = Vec::new();
        for (index, batch) in batches.into_iter().enumerate() {
            info!(
                "Getting IAM policies for batch {}/{total} (scope={scope}).",
                index + 1
            );
            rows.extend(self.fetch(scope, batch).await?);
        }
        Ok(rows)
    }

    /// Fetches one batch, recovering from quota and not-found failures.
    pub fn fetch<'a>(
        &'a self,
        scope: &'a str,
        names: &'a [String],
    ) -> BoxFuture<'a, FlowResult<Vec<TableBinding>>> {
        async move {
            if names.is_empty() {
                return Ok(Vec::new());
            }

            let mut retries = 0u32;
            loop {
                let outcome = self
                    .client
                    .batch_get_effective_iam_policies(scope, names)
                    .await;
                match outcome {
                    Ok(response) => return flatten_response(&response),
                    Err(AssetError::Quota(message)) => {
                        if self.backoff.max_retries == 0 {
                            return Err(FlowError::QuotaExhausted { attempts: 1 });
                        }
                        let delay = self.backoff.delay_for(retries);
                        warn!(
                            "Reached API quota ({message}). Retrying in {:.1} seconds.",
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        retries += 1;
                        if retries >= self.backoff.max_retries {
                            record_batch_recovery(scope, "quota_exhausted", names.len());
                            return Err(FlowError::QuotaExhausted { attempts: retries });
                        }
                    }
                    Err(AssetError::NotFound(message)) => {
                        if let [name] = names {
                            warn!("Resource {name} not found ({message}). Skipping.");
                            record_batch_recovery(scope, "not_found_skipped", 1);
                            return Ok(Vec::new());
                        }
                        record_batch_recovery(scope, "split", names.len());
                        let size = names.len();
                        debug!("Some resources were not found. Splitting {size} names.");
                        let (left, right) = names.split_at(names.len() / 2);
                        let mut rows = self.fetch(scope, left).await?;
                        rows.extend(self.fetch(scope, right).await?);
                        return Ok(rows);
                    }
                    Err(AssetError::Other(err)) => return Err(err),
                }
            }
        }
        .boxed()
    }
}
