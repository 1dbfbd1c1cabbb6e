//! History of IAM permission grants, read from Cloud Audit Logs.
//!
//! Each run covers `(last execution, now]`. The upper bound is persisted only
//! after the rows were loaded, so a failed run is retried over the same window.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::Utc;
use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::AuditLogConfig;
use crate::error::FlowError;
use crate::error::FlowResult;
use crate::flow::FlowContext;
use crate::flow::FlowReport;
use crate::gcp::AuditLogSource;
use crate::gcp::ProjectCatalog;
use crate::registry::FlowKind;
use crate::state::StateStore;

const FILTER_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const STORED_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditLogRow {
    #[serde(skip)]
    pub data_particao: NaiveDate,
    pub timestamp: String,
    pub principal: Option<String>,
    pub resource: Option<String>,
    pub role: Option<String>,
    pub member: String,
}

/// Start of the very first window.
pub fn default_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

pub fn build_filter(start: NaiveDateTime, end: NaiveDateTime) -> String {
    format!(
        "log_id(\"cloudaudit.googleapis.com/activity\") \
         AND protoPayload.methodName:\"SetIamPolicy\" \
         AND timestamp>=\"{}\" AND timestamp<=\"{}\"",
        start.format(FILTER_TIMESTAMP_FORMAT),
        end.format(FILTER_TIMESTAMP_FORMAT)
    )
}

pub fn last_execution(store: &dyn StateStore, key: &str) -> FlowResult<Option<NaiveDateTime>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(Some)
        .map_err(|err| {
            FlowError::payload("state store", format!("bad timestamp `{raw}` at {key}: {err}"))
        })
}

pub fn set_last_execution(
    store: &dyn StateStore,
    key: &str,
    value: NaiveDateTime,
) -> FlowResult<()> {
    store.set(key, &value.format(STORED_TIMESTAMP_FORMAT).to_string())
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Flattens `protoPayload.response.bindings[].members[]` of every entry.
///
/// Entries without a response (failed or denied calls) contribute no rows.
pub fn parse_entries(entries: &[Value]) -> FlowResult<Vec<AuditLogRow>> {
    let mut rows = Vec::new();
    for entry in entries {
        let Some(bindings) = entry
            .pointer("/protoPayload/response/bindings")
            .and_then(Value::as_array)
        else {
            continue;
        };
        let raw_timestamp = str_at(entry, "/timestamp")
            .ok_or_else(|| FlowError::payload("logging", "log entry without timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(raw_timestamp)
            .map_err(|err| {
                FlowError::payload("logging", format!("bad timestamp `{raw_timestamp}`: {err}"))
            })?
            .with_timezone(&Utc);
        let principal = str_at(entry, "/protoPayload/authenticationInfo/principalEmail");
        let resource = str_at(entry, "/protoPayload/resourceName");

        for binding in bindings {
            let role = str_at(binding, "/role");
            let members = binding
                .get("members")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for member in members.iter().filter_map(Value::as_str) {
                rows.push(AuditLogRow {
                    data_particao: timestamp.date_naive(),
                    timestamp: timestamp.format(FILTER_TIMESTAMP_FORMAT).to_string(),
                    principal: principal.map(str::to_string),
                    resource: resource.map(str::to_string),
                    role: role.map(str::to_string),
                    member: member.to_string(),
                });
            }
        }
    }
    Ok(rows)
}

pub async fn run(
    ctx: &FlowContext,
    catalog: &dyn ProjectCatalog,
    logs: &dyn AuditLogSource,
    config: &AuditLogConfig,
    now: NaiveDateTime,
) -> FlowResult<FlowReport> {
    let start = last_execution(ctx.state.as_ref(), &config.last_execution_key)?
        .unwrap_or_else(default_start);
    let filter = build_filter(start, now);
    info!("Filter: {filter}");

    let projects = catalog.list_projects().await?;
    let per_project: Vec<Vec<AuditLogRow>> = stream::iter(projects.iter())
        .map(|project_id| {
            let filter = filter.as_str();
            async move {
                let entries = logs.list_entries(project_id, filter).await?;
                parse_entries(&entries)
            }
        })
        .buffered(config.parallelism.max(1))
        .try_collect()
        .await?;
    let rows: Vec<AuditLogRow> = per_project.into_iter().flatten().collect();

    let outputs = ctx
        .load(&config.target, &rows, |row| row.data_particao)
        .await?;
    set_last_execution(ctx.state.as_ref(), &config.last_execution_key, now)?;

    Ok(FlowReport {
        flow: FlowKind::AuditLog,
        rows: rows.len(),
        outputs,
    })
}
