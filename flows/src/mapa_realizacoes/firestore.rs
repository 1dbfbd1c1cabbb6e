//! Document store access for the public works map.
//!
//! The map reads Firestore collections directly, so documents are written
//! with the Firestore REST API in batched commits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;

use super::geocode::Coordinates;
use crate::error::FlowError;
use crate::error::FlowResult;
use crate::gcp::AccessTokenSource;
use crate::gcp::ApiFailure;
use crate::gcp::GcpAuthTokens;
use crate::secrets::SecretStore;
use crate::secrets::decode_service_account;

/// Firestore rejects commits with more writes than this.
pub const MAX_BATCH_WRITES: usize = 500;

/// Writes per commit, kept below [`MAX_BATCH_WRITES`].
pub const DEFAULT_BATCH_LIMIT: usize = 450;

const LIST_PAGE_SIZE: u32 = 300;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    GeoPoint(Coordinates),
    Array(Vec<FieldValue>),
    Map(Fields),
}

pub type Fields = BTreeMap<String, FieldValue>;

impl FieldValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(flag) => FieldValue::Boolean(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => FieldValue::Integer(integer),
                None => FieldValue::Double(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => FieldValue::String(text.clone()),
            Value::Array(items) => FieldValue::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(object) => FieldValue::Map(
                object
                    .iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// The typed `Value` message of the REST API.
    pub fn to_rest(&self) -> Value {
        match self {
            FieldValue::Null => json!({"nullValue": null}),
            FieldValue::Boolean(flag) => json!({"booleanValue": flag}),
            FieldValue::Integer(integer) => json!({"integerValue": integer.to_string()}),
            FieldValue::Double(double) => json!({"doubleValue": double}),
            FieldValue::String(text) => json!({"stringValue": text}),
            FieldValue::GeoPoint(point) => json!({
                "geoPointValue": {"latitude": point.latitude, "longitude": point.longitude}
            }),
            FieldValue::Array(items) => json!({
                "arrayValue": {"values": items.iter().map(Self::to_rest).collect::<Vec<_>>()}
            }),
            FieldValue::Map(fields) => json!({"mapValue": {"fields": fields_to_rest(fields)}}),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

fn fields_to_rest(fields: &Fields) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), value.to_rest()))
        .collect()
}

/// Full replacement of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub collection: String,
    pub document_id: String,
    pub fields: Fields,
}

impl DocumentWrite {
    pub fn new(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        fields: Fields,
    ) -> Self {
        Self {
            collection: collection.into(),
            document_id: document_id.into(),
            fields,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Ids of every document in `collection`.
    async fn document_ids(&self, collection: &str) -> FlowResult<Vec<String>>;

    /// Applies `writes` atomically.
    async fn commit(&self, writes: &[DocumentWrite]) -> FlowResult<()>;
}

/// Groups writes into commits of at most `limit` documents.
pub struct WriteBatcher<'a> {
    store: &'a dyn DocumentStore,
    limit: usize,
    pending: Vec<DocumentWrite>,
    written: usize,
    commits: usize,
}

impl std::fmt::Debug for WriteBatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatcher")
            .field("limit", &self.limit)
            .field("pending", &self.pending.len())
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl<'a> WriteBatcher<'a> {
    /// `limit` is clamped to `1..=MAX_BATCH_WRITES`.
    pub fn new(store: &'a dyn DocumentStore, limit: usize) -> Self {
        Self {
            store,
            limit: limit.clamp(1, MAX_BATCH_WRITES),
            pending: Vec::new(),
            written: 0,
            commits: 0,
        }
    }

    /// Queues `write`, committing as soon as the batch is full.
    pub async fn set(&mut self, write: DocumentWrite) -> FlowResult<()> {
        self.pending.push(write);
        if self.pending.len() >= self.limit {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> FlowResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.store.commit(&self.pending).await?;
        self.written += self.pending.len();
        self.commits += 1;
        debug!("Committed {} writes.", self.pending.len());
        self.pending.clear();
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentsPage {
    #[serde(default)]
    documents: Vec<DocumentName>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentName {
    name: String,
}

/// Firestore over REST, authenticated with a service account key.
pub struct FirestoreRestClient {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    base_url: String,
    project_id: String,
}

impl std::fmt::Debug for FirestoreRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirestoreRestClient")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl FirestoreRestClient {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        base_url: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.into(),
            project_id: project_id.into(),
        }
    }

    /// Builds a client from the base64 service account key in `secret_name`;
    /// the key's project owns the database.
    pub fn from_secret(
        http: reqwest::Client,
        base_url: &str,
        secret_name: &str,
        secrets: &dyn SecretStore,
    ) -> FlowResult<Self> {
        let secret = secrets.get_secret(secret_name)?;
        let (json, account) = decode_service_account(secret_name, &secret)?;
        let project_id = account
            .project_id
            .ok_or_else(|| FlowError::invalid_secret(secret_name, "key has no project_id"))?;
        info!("Writing to Firestore of project {project_id} as {}.", account.client_email);
        let tokens = GcpAuthTokens::from_service_account_json(&json)?;
        Ok(Self::new(http, Arc::new(tokens), base_url, project_id))
    }

    fn documents_root(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project_id)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn check(response: reqwest::Response) -> FlowResult<String> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiFailure::parse(status, &body).into_error("firestore"));
        }
        Ok(body)
    }
}

#[async_trait]
impl DocumentStore for FirestoreRestClient {
    async fn document_ids(&self, collection: &str) -> FlowResult<Vec<String>> {
        let url = self.endpoint(&format!("{}/{collection}", self.documents_root()));
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("pageSize", LIST_PAGE_SIZE.to_string()),
                ("mask.fieldPaths", "__name__".to_string()),
            ];
            query.extend(page_token.take().map(|token| ("pageToken", token)));
            let token = self.tokens.access_token().await?;
            let response = self
                .http
                .get(&url)
                .bearer_auth(token)
                .query(&query)
                .send()
                .await?;
            let page: DocumentsPage = serde_json::from_str(&Self::check(response).await?)?;
            ids.extend(page.documents.into_iter().filter_map(|document| {
                document.name.rsplit('/').next().map(str::to_string)
            }));
            page_token = page.next_page_token.filter(|token| !token.is_empty());
            if page_token.is_none() {
                break;
            }
        }
        debug!("Collection {collection} has {} documents.", ids.len());
        Ok(ids)
    }

    async fn commit(&self, writes: &[DocumentWrite]) -> FlowResult<()> {
        let root = self.documents_root();
        let body = json!({
            "writes": writes
                .iter()
                .map(|write| json!({
                    "update": {
                        "name": format!("{root}/{}/{}", write.collection, write.document_id),
                        "fields": fields_to_rest(&write.fields),
                    }
                }))
                .collect::<Vec<_>>()
        });
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(self.endpoint(&format!("{root}:commit")))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Documents kept in memory, for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<BTreeMap<String, BTreeMap<String, Fields>>>,
    commit_sizes: Mutex<Vec<usize>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `collection` with empty documents named `ids`.
    pub fn with_ids(self, collection: &str, ids: &[&str]) -> Self {
        if let Ok(mut collections) = self.collections.lock() {
            let documents = collections.entry(collection.to_string()).or_default();
            for id in ids {
                documents.insert((*id).to_string(), Fields::new());
            }
        }
        self
    }

    pub fn document(&self, collection: &str, id: &str) -> FlowResult<Option<Fields>> {
        let collections = self.collections.lock().map_err(|_| FlowError::StatePoisoned)?;
        Ok(collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    /// Number of writes in each commit, in order.
    pub fn commit_sizes(&self) -> FlowResult<Vec<usize>> {
        let sizes = self.commit_sizes.lock().map_err(|_| FlowError::StatePoisoned)?;
        Ok(sizes.clone())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn document_ids(&self, collection: &str) -> FlowResult<Vec<String>> {
        let collections = self.collections.lock().map_err(|_| FlowError::StatePoisoned)?;
        Ok(collections
            .get(collection)
            .map(|documents| documents.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, writes: &[DocumentWrite]) -> FlowResult<()> {
        if writes.len() > MAX_BATCH_WRITES {
            return Err(FlowError::payload(
                "firestore",
                format!("{} writes exceed the commit limit", writes.len()),
            ));
        }
        let mut collections = self.collections.lock().map_err(|_| FlowError::StatePoisoned)?;
        for write in writes {
            collections
                .entry(write.collection.clone())
                .or_default()
                .insert(write.document_id.clone(), write.fields.clone());
        }
        self.commit_sizes
            .lock()
            .map_err(|_| FlowError::StatePoisoned)?
            .push(writes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(id: usize) -> DocumentWrite {
        DocumentWrite::new("realizacao", format!("obra_{id}"), Fields::new())
    }

    #[test]
    fn encodes_typed_rest_values() {
        let fields: Fields = [
            ("cariocas_atendidos".to_string(), FieldValue::Integer(1200)),
            ("investimento".to_string(), FieldValue::Double(2.5)),
            ("data_fim".to_string(), FieldValue::Null),
            (
                "coords".to_string(),
                FieldValue::GeoPoint(Coordinates {
                    latitude: -22.9,
                    longitude: -43.2,
                }),
            ),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            Value::Object(fields_to_rest(&fields)),
            json!({
                "cariocas_atendidos": {"integerValue": "1200"},
                "coords": {"geoPointValue": {"latitude": -22.9, "longitude": -43.2}},
                "data_fim": {"nullValue": null},
                "investimento": {"doubleValue": 2.5}
            })
        );
    }

    #[test]
    fn json_numbers_keep_their_kind() {
        assert_eq!(FieldValue::from_json(&json!(3)), FieldValue::Integer(3));
        assert_eq!(FieldValue::from_json(&json!(3.5)), FieldValue::Double(3.5));
        assert_eq!(
            FieldValue::from_json(&json!({"a": [true]})),
            FieldValue::Map(
                [("a".to_string(), FieldValue::Array(vec![FieldValue::Boolean(true)]))]
                    .into_iter()
                    .collect()
            )
        );
    }

    #[tokio::test]
    async fn batcher_commits_at_the_limit() {
        let store = MemoryDocumentStore::new();
        let mut batcher = WriteBatcher::new(&store, DEFAULT_BATCH_LIMIT);
        for id in 0..1000 {
            batcher.set(write(id)).await.unwrap();
        }
        batcher.flush().await.unwrap();

        assert_eq!(store.commit_sizes().unwrap(), vec![450, 450, 100]);
        assert_eq!(batcher.written(), 1000);
        assert_eq!(batcher.commits(), 3);
    }

    #[tokio::test]
    async fn batcher_limit_never_exceeds_the_commit_cap() {
        let store = MemoryDocumentStore::new();
        let mut batcher = WriteBatcher::new(&store, 10_000);
        for id in 0..501 {
            batcher.set(write(id)).await.unwrap();
        }
        batcher.flush().await.unwrap();
        assert_eq!(store.commit_sizes().unwrap(), vec![500, 1]);
    }

    #[tokio::test]
    async fn empty_flush_commits_nothing() {
        let store = MemoryDocumentStore::new();
        let mut batcher = WriteBatcher::new(&store, 0);
        batcher.flush().await.unwrap();
        assert!(store.commit_sizes().unwrap().is_empty());
    }
}
