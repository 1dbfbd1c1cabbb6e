use std::sync::Arc;

use chrono::NaiveDate;
use pipelines_flows::FlowError;
use pipelines_flows::config::GcpConfig;
use pipelines_flows::gcp::AuditLogSource;
use pipelines_flows::gcp::GcpRestClient;
use pipelines_flows::gcp::ProjectCatalog;
use pipelines_flows::gcp::StaticToken;
use pipelines_flows::iam::AssetClient;
use pipelines_flows::iam::AssetError;
use pipelines_flows::iam::table_resource_name;
use pipelines_flows::sink::DumpMode;
use pipelines_flows::sink::GcsUploader;
use pipelines_flows::sink::ObjectStore;
use pipelines_flows::sink::PartitionWriter;
use pipelines_flows::sink::TableTarget;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::body_string;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::query_param;
use wiremock::matchers::query_param_is_missing;

fn client(server: &MockServer) -> GcpRestClient {
    let base = server.uri();
    GcpRestClient::with_http(
        reqwest::Client::new(),
        Arc::new(StaticToken("test-token".to_string())),
        GcpConfig {
            credentials_secret_name: None,
            asset_api_url: base.clone(),
            resource_manager_url: base.clone(),
            bigquery_url: base.clone(),
            logging_url: base.clone(),
            storage_url: base,
        },
    )
}

#[tokio::test]
async fn batch_get_sends_every_name_and_parses_policies() {
    let server = MockServer::start().await;
    let name = table_resource_name("p", "d", "t");
    Mock::given(method("GET"))
        .and(path("/v1/projects/p/effectiveIamPolicies:batchGet"))
        .and(query_param("names", name.as_str()))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "policyResults": [{
                "fullResourceName": name,
                "policies": [{
                    "attachedResource": name,
                    "policy": {"bindings": [{"role": "roles/owner", "members": ["user:a@rio"]}]}
                }]
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server)
        .batch_get_effective_iam_policies("projects/p", std::slice::from_ref(&name))
        .await
        .unwrap();
    assert_eq!(response.policy_results.len(), 1);
    assert_eq!(response.policy_results[0].policies[0].policy.bindings[0].role, "roles/owner");
}

#[tokio::test]
async fn batch_get_classifies_google_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/projects/missing/effectiveIamPolicies:batchGet"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": 404, "message": "Table not found", "status": "NOT_FOUND"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/projects/busy/effectiveIamPolicies:batchGet"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": 400, "message": "Quota", "status": "FAILED_PRECONDITION"}
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let names = vec![table_resource_name("p", "d", "t")];
    let missing = client
        .batch_get_effective_iam_policies("projects/missing", &names)
        .await
        .unwrap_err();
    assert!(matches!(missing, AssetError::NotFound(message) if message == "Table not found"));

    let busy = client
        .batch_get_effective_iam_policies("projects/busy", &names)
        .await
        .unwrap_err();
    assert!(matches!(busy, AssetError::Quota(_)));
}

#[tokio::test]
async fn list_projects_follows_page_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/projects"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "projects": [{"projectId": "rj-a"}, {"projectId": "rj-b"}],
            "nextPageToken": "page-2"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/projects"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "projects": [{"projectId": "rj-c"}]
        })))
        .mount(&server)
        .await;

    let projects = client(&server).list_projects().await.unwrap();
    assert_eq!(projects, vec!["rj-a", "rj-b", "rj-c"]);
}

#[tokio::test]
async fn list_tables_walks_datasets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects/rj/datasets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datasets": [
                {"datasetReference": {"projectId": "rj", "datasetId": "d1"}},
                {"datasetReference": {"projectId": "rj", "datasetId": "d2"}}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects/rj/datasets/d1/tables"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tables": [{"tableReference": {"projectId": "rj", "datasetId": "d1", "tableId": "t1"}}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects/rj/datasets/d2/tables"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let tables = client(&server).list_tables("rj").await.unwrap();
    assert_eq!(tables, vec![table_resource_name("rj", "d1", "t1")]);
}

#[tokio::test]
async fn list_entries_posts_the_filter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/entries:list"))
        .and(body_partial_json(json!({
            "resourceNames": ["projects/rj"],
            "filter": "timestamp>=\"x\""
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [{"timestamp": "2024-01-01T00:00:00Z"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let entries = client(&server)
        .list_entries("rj", "timestamp>=\"x\"")
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn api_errors_keep_status_and_reason() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/projects"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "message": "denied", "status": "PERMISSION_DENIED"}
        })))
        .mount(&server)
        .await;

    let err = client(&server).list_projects().await.unwrap_err();
    match err {
        FlowError::Api {
            service,
            status,
            message,
        } => {
            assert_eq!(service, "cloudresourcemanager");
            assert_eq!(status, 403);
            assert_eq!(message, "denied (PERMISSION_DENIED)");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn uploads_objects_as_media() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/bucket/o"))
        .and(query_param("uploadType", "media"))
        .and(query_param("name", "staging/d/t/data_particao=2024-01-01/f.csv"))
        .and(header("content-type", "text/csv"))
        .and(body_string("a,b\n1,2\n"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "x"})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .put_object(
            "bucket",
            "staging/d/t/data_particao=2024-01-01/f.csv",
            b"a,b\n1,2\n".to_vec(),
            "text/csv",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn overwrite_upload_deletes_previous_staging_objects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bucket/o"))
        .and(query_param("prefix", "staging/d/t/"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"name": "staging/d/t/old-1.csv"}],
            "nextPageToken": "next"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bucket/o"))
        .and(query_param("pageToken", "next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"name": "staging/d/t/old-2.csv"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/storage/v1/b/bucket/o/staging%2Fd%2Ft%2Fold-1.csv"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/storage/v1/b/bucket/o/staging%2Fd%2Ft%2Fold-2.csv"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/bucket/o"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "x"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let target = TableTarget::new("d", "t").with_dump_mode(DumpMode::Overwrite);
    let staged = PartitionWriter::new(dir.path())
        .write(
            &target,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            &[("a", "b")],
        )
        .unwrap()
        .unwrap();
    let uploader = GcsUploader::new(Arc::new(client(&server)), "bucket");

    let uris = uploader
        .upload(&target, std::slice::from_ref(&staged))
        .await
        .unwrap();
    assert_eq!(uris, vec![format!("gs://bucket/staging/{}", staged.object_name)]);
}
