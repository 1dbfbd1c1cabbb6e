use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pipelines_flows::BackoffPolicy;
use pipelines_flows::BatchPolicyFetcher;
use pipelines_flows::FlowContext;
use pipelines_flows::FlowError;
use pipelines_flows::FlowKind;
use pipelines_flows::FlowResult;
use pipelines_flows::FlowsConfig;
use pipelines_flows::gcp::ProjectCatalog;
use pipelines_flows::iam::AssetClient;
use pipelines_flows::iam::AssetError;
use pipelines_flows::iam::BatchPolicyResponse;
use pipelines_flows::iam::Binding;
use pipelines_flows::iam::Policy;
use pipelines_flows::iam::PolicyInfo;
use pipelines_flows::iam::PolicyResult;
use pipelines_flows::iam::TableBinding;
use pipelines_flows::iam::table_resource_name;
use pipelines_flows::lgpd::tables_bindings;
use pipelines_flows::secrets::StaticSecretStore;
use pipelines_flows::sink::PartitionWriter;
use pipelines_flows::state::MemoryStateStore;
use pretty_assertions::assert_eq;

const SCOPE: &str = "projects/rj-escritorio";

/// In-memory asset API: tables in `missing` do not exist, and the first
/// `quota_failures` calls are rejected for quota.
#[derive(Default)]
struct FakeAssetApi {
    missing: HashSet<String>,
    quota_failures: usize,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeAssetApi {
    fn with_missing(names: &[&str]) -> Self {
        Self {
            missing: names.iter().map(|name| table(name)).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

fn table(id: &str) -> String {
    table_resource_name("rj-escritorio", "gestao", id)
}

fn tables(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| table(id)).collect()
}

fn policy_for(name: &str) -> PolicyResult {
    PolicyResult {
        full_resource_name: name.to_string(),
        policies: vec![PolicyInfo {
            attached_resource: "//cloudresourcemanager.googleapis.com/projects/rj-escritorio"
                .to_string(),
            policy: Policy {
                bindings: vec![Binding {
                    role: "roles/bigquery.dataViewer".to_string(),
                    members: vec![format!("user:{}@rio", name.rsplit('/').next().unwrap())],
                }],
            },
        }],
    }
}

#[async_trait]
impl AssetClient for FakeAssetApi {
    async fn batch_get_effective_iam_policies(
        &self,
        scope: &str,
        names: &[String],
    ) -> Result<BatchPolicyResponse, AssetError> {
        assert_eq!(scope, SCOPE);
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(names.to_vec());
            calls.len()
        };
        if call_index <= self.quota_failures {
            return Err(AssetError::Quota("RESOURCE_EXHAUSTED".to_string()));
        }
        if let Some(name) = names.iter().find(|name| self.missing.contains(*name)) {
            return Err(AssetError::NotFound(format!("{name} not found")));
        }
        Ok(BatchPolicyResponse {
            policy_results: names.iter().map(|name| policy_for(name)).collect(),
        })
    }
}

fn members(rows: &[TableBinding]) -> Vec<String> {
    rows.iter().map(|row| row.member.clone()).collect()
}

/// Paused-clock timers fire on millisecond ticks.
fn assert_elapsed(started: tokio::time::Instant, expected: Duration) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(10),
        "slept {elapsed:?}, expected {expected:?}"
    );
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), 2.0, 5)
}

#[tokio::test]
async fn splits_around_a_missing_table() {
    let api = Arc::new(FakeAssetApi::with_missing(&["b"]));
    let fetcher = BatchPolicyFetcher::new(api.clone()).with_backoff(fast_backoff());

    let rows = fetcher.fetch(SCOPE, &tables(&["a", "b", "c"])).await.unwrap();

    assert_eq!(members(&rows), vec!["user:a@rio", "user:c@rio"]);
    assert_eq!(
        api.calls(),
        vec![
            tables(&["a", "b", "c"]),
            tables(&["a"]),
            tables(&["b", "c"]),
            tables(&["b"]),
            tables(&["c"]),
        ]
    );
}

#[tokio::test]
async fn batch_results_match_per_table_fetches() {
    let ids = ["t1", "t2", "t3", "t4", "t5", "t6", "t7"];
    let api = Arc::new(FakeAssetApi::with_missing(&["t2", "t6"]));
    let fetcher = BatchPolicyFetcher::new(api.clone());

    let batched: HashSet<TableBinding> = fetcher
        .fetch(SCOPE, &tables(&ids))
        .await
        .unwrap()
        .into_iter()
        .collect();

    let mut individually = HashSet::new();
    for id in ids {
        individually.extend(fetcher.fetch(SCOPE, &tables(&[id])).await.unwrap());
    }
    assert_eq!(batched, individually);
    assert_eq!(batched.len(), ids.len() - 2);
}

#[tokio::test]
async fn a_single_missing_table_yields_nothing() {
    let api = Arc::new(FakeAssetApi::with_missing(&["gone"]));
    let fetcher = BatchPolicyFetcher::new(api);
    let rows = fetcher.fetch(SCOPE, &tables(&["gone"])).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test(start_paused = true)]
async fn persistent_quota_gives_up_after_max_retries() {
    let api = Arc::new(FakeAssetApi {
        quota_failures: usize::MAX,
        ..FakeAssetApi::default()
    });
    let backoff = fast_backoff();
    let fetcher = BatchPolicyFetcher::new(api.clone()).with_backoff(backoff);

    let started = tokio::time::Instant::now();
    let err = fetcher.fetch(SCOPE, &tables(&["a"])).await.unwrap_err();

    assert!(matches!(err, FlowError::QuotaExhausted { attempts: 5 }), "{err:?}");
    assert_eq!(api.calls().len(), 5);
    // 1 + 2 + 4 + 8 + 16 seconds.
    assert_elapsed(started, Duration::from_secs(31));
    assert_eq!(backoff.total_delay(), Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn one_quota_error_retries_after_the_base_delay() {
    let api = Arc::new(FakeAssetApi {
        quota_failures: 1,
        ..FakeAssetApi::default()
    });
    let fetcher = BatchPolicyFetcher::new(api.clone()).with_backoff(fast_backoff());

    let started = tokio::time::Instant::now();
    let rows = fetcher.fetch(SCOPE, &tables(&["a", "b"])).await.unwrap();

    assert_eq!(members(&rows), vec!["user:a@rio", "user:b@rio"]);
    assert_eq!(api.calls().len(), 2);
    assert_elapsed(started, Duration::from_secs(1));
}

#[tokio::test]
async fn zero_retries_fails_on_first_quota_error() {
    let api = Arc::new(FakeAssetApi {
        quota_failures: usize::MAX,
        ..FakeAssetApi::default()
    });
    let fetcher = BatchPolicyFetcher::new(api.clone())
        .with_backoff(BackoffPolicy::new(Duration::from_secs(1), 2.0, 0));

    let err = fetcher.fetch(SCOPE, &tables(&["a"])).await.unwrap_err();
    assert!(matches!(err, FlowError::QuotaExhausted { attempts: 1 }));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn other_errors_propagate_unchanged() {
    struct Broken;

    #[async_trait]
    impl AssetClient for Broken {
        async fn batch_get_effective_iam_policies(
            &self,
            _scope: &str,
            _names: &[String],
        ) -> Result<BatchPolicyResponse, AssetError> {
            Err(AssetError::Other(FlowError::Api {
                service: "cloudasset",
                status: 403,
                message: "denied".to_string(),
            }))
        }
    }

    let fetcher = BatchPolicyFetcher::new(Arc::new(Broken));
    let err = fetcher.fetch(SCOPE, &tables(&["a", "b"])).await.unwrap_err();
    assert!(matches!(err, FlowError::Api { status: 403, .. }));
}

#[tokio::test]
async fn fetch_all_chunks_at_the_api_limit() {
    let ids: Vec<String> = (0..45).map(|i| format!("t{i:02}")).collect();
    let names: Vec<String> = ids.iter().map(|id| table(id)).collect();
    let api = Arc::new(FakeAssetApi::default());
    let fetcher = BatchPolicyFetcher::new(api.clone()).with_batch_size(100);

    let rows = fetcher.fetch_all(SCOPE, &names).await.unwrap();

    assert_eq!(fetcher.batch_size(), 20);
    let sizes: Vec<usize> = api.calls().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![20, 20, 5]);
    assert_eq!(rows.len(), 45);
    assert_eq!(rows[44].table_id, "t44");
}

/// `rj-vazio` has no tables; `rj-escritorio` has `a`, `b` and `c`.
struct TwoProjects;

#[async_trait]
impl ProjectCatalog for TwoProjects {
    async fn list_projects(&self) -> FlowResult<Vec<String>> {
        Ok(vec!["rj-vazio".to_string(), "rj-escritorio".to_string()])
    }

    async fn list_tables(&self, project_id: &str) -> FlowResult<Vec<String>> {
        match project_id {
            "rj-escritorio" => Ok(tables(&["a", "b", "c"])),
            _ => Ok(Vec::new()),
        }
    }
}

#[tokio::test]
async fn empty_project_skips_the_asset_api() {
    let api = Arc::new(FakeAssetApi::default());
    let fetcher = BatchPolicyFetcher::new(api.clone());

    let rows = tables_bindings::project_table_bindings(&TwoProjects, &fetcher, "rj-vazio")
        .await
        .unwrap();

    assert!(rows.is_empty());
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn tables_bindings_flow_stages_every_project() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = FlowContext {
        state: Arc::new(MemoryStateStore::new()),
        secrets: Arc::new(StaticSecretStore::new()),
        writer: PartitionWriter::new(dir.path().join("out")),
        uploader: None,
        http: reqwest::Client::new(),
    };
    let config = FlowsConfig::default_in(dir.path().to_path_buf()).tables_bindings;
    // The fake rejects any scope other than `projects/rj-escritorio`.
    let api = Arc::new(FakeAssetApi::with_missing(&["b"]));
    let fetcher = BatchPolicyFetcher::new(api.clone()).with_backoff(fast_backoff());
    let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

    let report = tables_bindings::run(&ctx, &TwoProjects, &fetcher, &config, today)
        .await
        .unwrap();

    assert_eq!(report.flow, FlowKind::TablesBindings);
    assert_eq!(report.rows, 2);
    assert_eq!(api.calls()[0], tables(&["a", "b", "c"]));
    assert_eq!(report.outputs.len(), 1);
    assert!(
        report.outputs[0].contains("datalake_gestao/tables_bindings/data_particao=2024-06-01/")
    );
    let staged = std::fs::read_to_string(&report.outputs[0]).unwrap();
    let attached = "//cloudresourcemanager.googleapis.com/projects/rj-escritorio";
    assert_eq!(
        staged,
        format!(
            "project_id,dataset_id,table_id,attached_resource,role,member\n\
             rj-escritorio,gestao,a,{attached},roles/bigquery.dataViewer,user:a@rio\n\
             rj-escritorio,gestao,c,{attached},roles/bigquery.dataViewer,user:c@rio\n"
        )
    );
}
