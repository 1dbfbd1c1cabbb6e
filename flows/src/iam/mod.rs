//! Effective IAM policy bindings for BigQuery tables.
//!
//! The asset API answers for at most [`MAX_NAMES_PER_BATCH`] resources per call
//! and rejects the whole call when a single name is unknown. [`BatchPolicyFetcher`]
//! hides both limits behind one call that returns flattened [`TableBinding`] rows.

mod fetcher;

pub use fetcher::BatchPolicyFetcher;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::FlowError;
use crate::error::FlowResult;

/// Maximum number of resource names accepted by one batch request.
pub const MAX_NAMES_PER_BATCH: usize = 20;

const BIGQUERY_TABLE_PREFIX: &str = "//bigquery.googleapis.com/projects/";

/// One role-to-member binding that applies to a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableBinding {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub attached_resource: String,
    pub role: String,
    pub member: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPolicyResponse {
    #[serde(default)]
    pub policy_results: Vec<PolicyResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResult {
    pub full_resource_name: String,
    #[serde(default)]
    pub policies: Vec<PolicyInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyInfo {
    pub attached_resource: String,
    #[serde(default)]
    pub policy: Policy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Failure modes of a batch call that the fetcher reacts to.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// Rate limit or quota precondition; the same batch may succeed later.
    #[error("asset API quota exhausted: {0}")]
    Quota(String),

    /// At least one name in the batch does not exist (anymore).
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] FlowError),
}

#[async_trait]
pub trait AssetClient: Send + Sync {
    async fn batch_get_effective_iam_policies(
        &self,
        scope: &str,
        names: &[String],
    ) -> Result<BatchPolicyResponse, AssetError>;
}

/// Splits `//bigquery.googleapis.com/projects/{p}/datasets/{d}/tables/{t}` into
/// `(p, d, t)`.
pub fn parse_table_name(full_name: &str) -> FlowResult<(String, String, String)> {
    let invalid = || FlowError::InvalidResourceName(full_name.to_string());
    let rest = full_name.strip_prefix(BIGQUERY_TABLE_PREFIX).ok_or_else(invalid)?;
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [project, "datasets", dataset, "tables", table, ..]
            if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
        {
            Ok((
                (*project).to_string(),
                (*dataset).to_string(),
                (*table).to_string(),
            ))
        }
        _ => Err(invalid()),
    }
}

pub fn table_resource_name(project_id: &str, dataset_id: &str, table_id: &str) -> String {
    format!("{BIGQUERY_TABLE_PREFIX}{project_id}/datasets/{dataset_id}/tables/{table_id}")
}

/// Cross product of every binding member found in `response`.
pub fn flatten_response(response: &BatchPolicyResponse) -> FlowResult<Vec<TableBinding>> {
    let mut rows = Vec::new();
    for result in &response.policy_results {
        let (project_id, dataset_id, table_id) = parse_table_name(&result.full_resource_name)?;
        for info in &result.policies {
            for binding in &info.policy.bindings {
                for member in &binding.members {
                    rows.push(TableBinding {
                        project_id: project_id.clone(),
                        dataset_id: dataset_id.clone(),
                        table_id: table_id.clone(),
                        attached_resource: info.attached_resource.clone(),
                        role: binding.role.clone(),
                        member: member.clone(),
                    });
                }
            }
        }
    }
    Ok(rows)
}
