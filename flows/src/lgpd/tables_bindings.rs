use chrono::NaiveDate;
use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream;
use tracing::info;

use crate::config::TablesBindingsConfig;
use crate::error::FlowResult;
use crate::flow::FlowContext;
use crate::flow::FlowReport;
use crate::gcp::ProjectCatalog;
use crate::iam::BatchPolicyFetcher;
use crate::iam::TableBinding;
use crate::registry::FlowKind;

/// Bindings of every table in `project_id`.
pub async fn project_table_bindings(
    catalog: &dyn ProjectCatalog,
    fetcher: &BatchPolicyFetcher,
    project_id: &str,
) -> FlowResult<Vec<TableBinding>> {
    let tables = catalog.list_tables(project_id).await?;
    info!("Found {} tables in project {project_id}.", tables.len());
    if tables.is_empty() {
        info!("No IAM policies found for project {project_id}.");
        return Ok(Vec::new());
    }
    let scope = format!("projects/{project_id}");
    let bindings = fetcher.fetch_all(&scope, &tables).await?;
    info!("Found {} IAM policies for project {project_id}.", bindings.len());
    Ok(bindings)
}

/// Dumps the effective IAM bindings of every table in every visible project.
pub async fn run(
    ctx: &FlowContext,
    catalog: &dyn ProjectCatalog,
    fetcher: &BatchPolicyFetcher,
    config: &TablesBindingsConfig,
    today: NaiveDate,
) -> FlowResult<FlowReport> {
    let projects = catalog.list_projects().await?;
    let per_project: Vec<Vec<TableBinding>> = stream::iter(projects.iter())
        .map(|project_id| project_table_bindings(catalog, fetcher, project_id))
        .buffered(config.parallelism.max(1))
        .try_collect()
        .await?;

    info!("Merging {} project results.", per_project.len());
    let bindings: Vec<TableBinding> = per_project.into_iter().flatten().collect();

    let outputs = ctx.load(&config.target, &bindings, |_| today).await?;
    Ok(FlowReport {
        flow: FlowKind::TablesBindings,
        rows: bindings.len(),
        outputs,
    })
}
