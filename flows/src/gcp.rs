//! Google Cloud REST access.
//!
//! [`GcpRestClient`] speaks the JSON APIs the flows need (Cloud Asset,
//! Resource Manager, BigQuery, Cloud Logging and Cloud Storage) with a
//! bearer token from an [`AccessTokenSource`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use url::Url;

use crate::config::GcpConfig;
use crate::error::FlowError;
use crate::error::FlowResult;
use crate::iam::AssetClient;
use crate::iam::AssetError;
use crate::iam::BatchPolicyResponse;
use crate::iam::table_resource_name;
use crate::secrets::SecretStore;
use crate::secrets::decode_service_account;
use crate::sink::ObjectStore;

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const LOG_ENTRIES_PAGE_SIZE: u32 = 1000;

#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> FlowResult<String>;
}

/// Tokens from `gcp_auth`, either discovered from the environment or built
/// from an explicit service account key.
pub struct GcpAuthTokens {
    provider: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for GcpAuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpAuthTokens").finish_non_exhaustive()
    }
}

impl GcpAuthTokens {
    pub async fn discover() -> FlowResult<Self> {
        let provider = gcp_auth::provider()
            .await
            .map_err(|err| FlowError::Auth(format!("failed to initialize GCP auth: {err}")))?;
        Ok(Self { provider })
    }

    pub fn from_service_account_json(json: &str) -> FlowResult<Self> {
        let account = gcp_auth::CustomServiceAccount::from_json(json)
            .map_err(|err| FlowError::Auth(format!("invalid service account key: {err}")))?;
        Ok(Self {
            provider: Arc::new(account),
        })
    }

    /// Uses the base64 key named by `credentials_secret_name` when set, and
    /// application default credentials otherwise.
    pub async fn from_config(config: &GcpConfig, secrets: &dyn SecretStore) -> FlowResult<Self> {
        match &config.credentials_secret_name {
            Some(name) => {
                let secret = secrets.get_secret(name)?;
                let (json, info) = decode_service_account(name, &secret)?;
                info!("Authenticating as {}.", info.client_email);
                Self::from_service_account_json(&json)
            }
            None => Self::discover().await,
        }
    }
}

#[async_trait]
impl AccessTokenSource for GcpAuthTokens {
    async fn access_token(&self) -> FlowResult<String> {
        let token = self
            .provider
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .map_err(|err| FlowError::Auth(format!("failed to get GCP access token: {err}")))?;
        Ok(token.as_str().to_string())
    }
}

/// A fixed bearer token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self) -> FlowResult<String> {
        Ok(self.0.clone())
    }
}

#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn list_projects(&self) -> FlowResult<Vec<String>>;

    /// Full resource names of every table in `project_id`.
    async fn list_tables(&self, project_id: &str) -> FlowResult<Vec<String>>;
}

#[async_trait]
pub trait AuditLogSource: Send + Sync {
    async fn list_entries(&self, project_id: &str, filter: &str) -> FlowResult<Vec<Value>>;
}

/// Google API error envelope.
#[derive(Debug, Deserialize)]
struct GoogleErrorResponse {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ApiFailure {
    pub status: u16,
    pub reason: String,
    pub message: String,
}

impl ApiFailure {
    pub(crate) fn parse(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<GoogleErrorResponse>(body) {
            Ok(parsed) => Self {
                status: status.as_u16(),
                reason: parsed.error.status,
                message: parsed.error.message,
            },
            Err(_) => Self {
                status: status.as_u16(),
                reason: String::new(),
                message: body.to_string(),
            },
        }
    }

    pub(crate) fn into_error(self, service: &'static str) -> FlowError {
        let message = if self.reason.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.reason)
        };
        FlowError::Api {
            service,
            status: self.status,
            message,
        }
    }

    pub(crate) fn into_asset_error(self) -> AssetError {
        match (self.status, self.reason.as_str()) {
            (404, _) | (_, "NOT_FOUND") => AssetError::NotFound(self.message),
            (429, _) | (_, "RESOURCE_EXHAUSTED") | (_, "FAILED_PRECONDITION") => {
                AssetError::Quota(self.message)
            }
            _ => AssetError::Other(self.into_error("cloudasset")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectsPage {
    #[serde(default)]
    projects: Vec<ProjectEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectEntry {
    project_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetsPage {
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetEntry {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TablesPage {
    #[serde(default)]
    tables: Vec<TableEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableEntry {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListEntriesRequest<'a> {
    resource_names: Vec<String>,
    filter: &'a str,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntriesPage {
    #[serde(default)]
    entries: Vec<Value>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectsPage {
    #[serde(default)]
    items: Vec<ObjectEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
}

/// Non-empty page tokens continue a listing.
fn next_token(token: Option<String>) -> Option<String> {
    token.filter(|token| !token.is_empty())
}

pub struct GcpRestClient {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    endpoints: GcpConfig,
}

impl std::fmt::Debug for GcpRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpRestClient")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl GcpRestClient {
    pub fn new(tokens: Arc<dyn AccessTokenSource>, endpoints: GcpConfig) -> FlowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_http(http, tokens, endpoints))
    }

    pub fn with_http(
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        endpoints: GcpConfig,
    ) -> Self {
        Self {
            http,
            tokens,
            endpoints,
        }
    }

    fn url(base: &str, path: &str) -> FlowResult<Url> {
        let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
        Url::parse(&joined)
            .map_err(|err| FlowError::Config(format!("invalid URL `{joined}`: {err}")))
    }

    fn objects_url(&self, bucket: &str) -> FlowResult<Url> {
        Self::url(&self.endpoints.storage_url, &format!("storage/v1/b/{bucket}/o"))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        service: &'static str,
        url: Url,
        query: &[(&str, String)],
    ) -> FlowResult<T> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiFailure::parse(status, &body).into_error(service));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl AssetClient for GcpRestClient {
    async fn batch_get_effective_iam_policies(
        &self,
        scope: &str,
        names: &[String],
    ) -> Result<BatchPolicyResponse, AssetError> {
        let url = Self::url(
            &self.endpoints.asset_api_url,
            &format!("v1/{scope}/effectiveIamPolicies:batchGet"),
        )?;
        let query: Vec<(&str, &str)> = names.iter().map(|name| ("names", name.as_str())).collect();
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(FlowError::from)?;
        let status = response.status();
        let body = response.text().await.map_err(FlowError::from)?;
        if !status.is_success() {
            return Err(ApiFailure::parse(status, &body).into_asset_error());
        }
        serde_json::from_str(&body).map_err(|err| AssetError::Other(err.into()))
    }
}

#[async_trait]
impl ProjectCatalog for GcpRestClient {
    async fn list_projects(&self) -> FlowResult<Vec<String>> {
        let url = Self::url(&self.endpoints.resource_manager_url, "v1/projects")?;
        let mut projects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let query: Vec<(&str, String)> =
                page_token.iter().map(|t| ("pageToken", t.clone())).collect();
            let page: ProjectsPage = self
                .get_json("cloudresourcemanager", url.clone(), &query)
                .await?;
            for project in page.projects {
                debug!("Found project {}.", project.project_id);
                projects.push(project.project_id);
            }
            page_token = next_token(page.next_page_token);
            if page_token.is_none() {
                break;
            }
        }
        info!("Found {} projects.", projects.len());
        Ok(projects)
    }

    async fn list_tables(&self, project_id: &str) -> FlowResult<Vec<String>> {
        let datasets_url = Self::url(
            &self.endpoints.bigquery_url,
            &format!("bigquery/v2/projects/{project_id}/datasets"),
        )?;
        let mut dataset_ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let query: Vec<(&str, String)> =
                page_token.iter().map(|t| ("pageToken", t.clone())).collect();
            let page: DatasetsPage = self
                .get_json("bigquery", datasets_url.clone(), &query)
                .await?;
            dataset_ids.extend(
                page.datasets
                    .into_iter()
                    .map(|dataset| dataset.dataset_reference.dataset_id),
            );
            page_token = next_token(page.next_page_token);
            if page_token.is_none() {
                break;
            }
        }

        let mut tables = Vec::new();
        for dataset_id in dataset_ids {
            let tables_url = Self::url(
                &self.endpoints.bigquery_url,
                &format!("bigquery/v2/projects/{project_id}/datasets/{dataset_id}/tables"),
            )?;
            let mut page_token: Option<String> = None;
            loop {
                let query: Vec<(&str, String)> =
                    page_token.iter().map(|t| ("pageToken", t.clone())).collect();
                let page: TablesPage = self
                    .get_json("bigquery", tables_url.clone(), &query)
                    .await?;
                tables.extend(page.tables.into_iter().map(|table| {
                    let reference = table.table_reference;
                    table_resource_name(
                        &reference.project_id,
                        &reference.dataset_id,
                        &reference.table_id,
                    )
                }));
                page_token = next_token(page.next_page_token);
                if page_token.is_none() {
                    break;
                }
            }
        }
        Ok(tables)
    }
}

#[async_trait]
impl AuditLogSource for GcpRestClient {
    async fn list_entries(&self, project_id: &str, filter: &str) -> FlowResult<Vec<Value>> {
        let url = Self::url(&self.endpoints.logging_url, "v2/entries:list")?;
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let request = ListEntriesRequest {
                resource_names: vec![format!("projects/{project_id}")],
                filter,
                page_size: LOG_ENTRIES_PAGE_SIZE,
                page_token: page_token.take(),
            };
            let token = self.tokens.access_token().await?;
            let response = self
                .http
                .post(url.clone())
                .bearer_auth(token)
                .json(&request)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(ApiFailure::parse(status, &body).into_error("logging"));
            }
            let page: EntriesPage = serde_json::from_str(&body)?;
            entries.extend(page.entries);
            page_token = next_token(page.next_page_token);
            if page_token.is_none() {
                break;
            }
        }
        info!("Found {} entries", entries.len());
        Ok(entries)
    }
}

#[async_trait]
impl ObjectStore for GcpRestClient {
    async fn put_object(
        &self,
        bucket: &str,
        object_name: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> FlowResult<()> {
        let url = Self::url(
            &self.endpoints.storage_url,
            &format!("upload/storage/v1/b/{bucket}/o"),
        )?;
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .query(&[("uploadType", "media"), ("name", object_name)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(ApiFailure::parse(status, &body).into_error("storage"));
        }
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> FlowResult<Vec<String>> {
        let url = self.objects_url(bucket)?;
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("prefix", prefix.to_string())];
            query.extend(page_token.iter().map(|t| ("pageToken", t.clone())));
            let page: ObjectsPage = self.get_json("storage", url.clone(), &query).await?;
            names.extend(page.items.into_iter().map(|object| object.name));
            page_token = next_token(page.next_page_token);
            if page_token.is_none() {
                break;
            }
        }
        debug!("Found {} objects under gs://{bucket}/{prefix}.", names.len());
        Ok(names)
    }

    async fn delete_object(&self, bucket: &str, object_name: &str) -> FlowResult<()> {
        let mut url = self.objects_url(bucket)?;
        url.path_segments_mut()
            .map_err(|()| {
                FlowError::Config(format!(
                    "cannot append an object name to `{}`",
                    self.endpoints.storage_url
                ))
            })?
            .push(object_name);
        let token = self.tokens.access_token().await?;
        let response = self.http.delete(url).bearer_auth(token).send().await?;
        let status = response.status();
        // Already gone.
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await?;
            return Err(ApiFailure::parse(status, &body).into_error("storage"));
        }
        Ok(())
    }
}
