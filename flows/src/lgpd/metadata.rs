use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::info;

use crate::config::MetadataConfig;
use crate::error::FlowError;
use crate::error::FlowResult;
use crate::flow::FlowContext;
use crate::flow::FlowReport;
use crate::registry::FlowKind;

const SOURCE: &str = "metadata API";

/// One column of one table, with the table's descriptive fields repeated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnMetadata {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub table_title: String,
    pub table_short_description: String,
    pub table_long_description: String,
    pub table_update_frequency: String,
    pub table_temporal_coverage: String,
    pub table_data_owner: String,
    pub table_publisher_name: String,
    pub table_publisher_email: String,
    pub column_name: String,
    pub column_description: String,
    pub column_type: String,
}

fn object<'a>(value: &'a Value, what: &str) -> FlowResult<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| FlowError::payload(SOURCE, format!("expected {what} to be an object")))
}

fn array<'a>(map: &'a Map<String, Value>, key: &str) -> FlowResult<&'a Vec<Value>> {
    map.get(key)
        .ok_or_else(|| FlowError::payload(SOURCE, format!("missing key `{key}`")))?
        .as_array()
        .ok_or_else(|| FlowError::payload(SOURCE, format!("`{key}` is not a list")))
}

/// Reads a text field; `null` becomes an empty string, numbers are rendered.
fn text(map: &Map<String, Value>, key: &str) -> FlowResult<String> {
    match map.get(key) {
        None => Err(FlowError::payload(SOURCE, format!("missing key `{key}`"))),
        Some(Value::Null) => Ok(String::new()),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(other) => Ok(other.to_string()),
    }
}

pub fn parse_metadata(body: &Value) -> FlowResult<Vec<ColumnMetadata>> {
    let root = object(body, "the response")?;
    let mut rows = Vec::new();
    for project in array(root, "results")? {
        let project = object(project, "a project")?;
        let project_id = text(project, "name")?;
        for dataset in array(project, "datasets")? {
            let dataset = object(dataset, "a dataset")?;
            let dataset_id = text(dataset, "name")?;
            for table in array(dataset, "tables")? {
                let table = object(table, "a table")?;
                let template = ColumnMetadata {
                    project_id: project_id.clone(),
                    dataset_id: dataset_id.clone(),
                    table_id: text(table, "name")?,
                    table_title: text(table, "title")?,
                    table_short_description: text(table, "short_description")?,
                    table_long_description: text(table, "long_description")?,
                    table_update_frequency: text(table, "update_frequency")?,
                    table_temporal_coverage: text(table, "temporal_coverage")?,
                    table_data_owner: text(table, "data_owner")?,
                    table_publisher_name: text(table, "publisher_name")?,
                    table_publisher_email: text(table, "publisher_email")?,
                    ..ColumnMetadata::default()
                };
                for column in array(table, "columns")? {
                    let column = object(column, "a column")?;
                    rows.push(ColumnMetadata {
                        column_name: text(column, "name")?,
                        column_description: text(column, "description")?,
                        column_type: text(column, "type")?,
                        ..template.clone()
                    });
                }
            }
        }
    }
    Ok(rows)
}

pub async fn fetch_metadata(http: &reqwest::Client, url: &str) -> FlowResult<Vec<ColumnMetadata>> {
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FlowError::Api {
            service: "metadata",
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }
    let body: Value = response.json().await?;
    parse_metadata(&body)
}

pub async fn run(
    ctx: &FlowContext,
    config: &MetadataConfig,
    today: NaiveDate,
) -> FlowResult<FlowReport> {
    let rows = fetch_metadata(&ctx.http, &config.api_url).await?;
    info!("Got metadata for {} columns.", rows.len());
    let outputs = ctx.load(&config.target, &rows, |_| today).await?;
    Ok(FlowReport {
        flow: FlowKind::Metadata,
        rows: rows.len(),
        outputs,
    })
}
