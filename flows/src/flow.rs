use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::FlowResult;
use crate::registry::FlowKind;
use crate::secrets::SecretStore;
use crate::sink::GcsUploader;
use crate::sink::PartitionWriter;
use crate::sink::StagedFile;
use crate::sink::TableTarget;
use crate::state::StateStore;

/// Outcome of one flow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowReport {
    pub flow: FlowKind,
    pub rows: usize,
    /// Files or objects written, local paths or `gs://` URIs.
    pub outputs: Vec<String>,
}

impl FlowReport {
    pub fn new(flow: FlowKind) -> Self {
        Self {
            flow,
            rows: 0,
            outputs: Vec::new(),
        }
    }
}

/// Shared services handed to every flow.
#[derive(Clone)]
pub struct FlowContext {
    pub state: Arc<dyn StateStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub writer: PartitionWriter,
    /// `None` keeps staged files local.
    pub uploader: Option<GcsUploader>,
    pub http: reqwest::Client,
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("writer", &self.writer)
            .field("uploader", &self.uploader)
            .finish_non_exhaustive()
    }
}

impl FlowContext {
    /// Stages `rows` by partition and uploads them when an uploader is set.
    /// Returns the written locations.
    pub async fn load<T, F>(
        &self,
        target: &TableTarget,
        rows: &[T],
        partition_of: F,
    ) -> FlowResult<Vec<String>>
    where
        T: Serialize,
        F: Fn(&T) -> NaiveDate,
    {
        let staged = self.writer.write_partitions(target, rows, partition_of)?;
        match &self.uploader {
            Some(uploader) => uploader.upload(target, &staged).await,
            None => Ok(staged.iter().map(local_output).collect()),
        }
    }
}

fn local_output(file: &StagedFile) -> String {
    file.path.display().to_string()
}
