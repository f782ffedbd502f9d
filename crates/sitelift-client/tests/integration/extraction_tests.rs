use sitelift_client::{DispatcherConfig, RequestDispatcher};
use sitelift_core::error::AppError;
use sitelift_core::job::{ExtractionFlags, ExtractionRequest, JobStatus, JobStep};
use sitelift_core::orchestrator::ExtractionOrchestrator;
use sitelift_core::testutil::{MockSource, test_asset};
use sitelift_core::traits::StaticTokenStore;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::init_tracing;

fn orchestrator(server: &MockServer) -> ExtractionOrchestrator<RequestDispatcher<StaticTokenStore>> {
    let config = DispatcherConfig::new(&format!("{}/api", server.uri())).unwrap();
    let dispatcher = RequestDispatcher::new(config, StaticTokenStore::new("tok")).unwrap();
    ExtractionOrchestrator::new(dispatcher)
}

async fn mount_create(server: &MockServer, id: &str) {
    Mock::given(method("POST"))
        .and(path("/api/extractions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": id})))
        .mount(server)
        .await;
}

async fn mount_steps(server: &MockServer, id: &str) {
    Mock::given(method("POST"))
        .and(path_regex(format!("^/api/extractions/{id}/.+$")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(server)
        .await;
}

async fn request_paths(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect()
}

#[tokio::test]
async fn full_extraction_over_http() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_create(&server, "job-7").await;
    mount_steps(&server, "job-7").await;

    let orchestrator = orchestrator(&server);
    let request = ExtractionRequest::new("https://example.com", "Example")
        .with_flags(ExtractionFlags::all());
    let source = MockSource::new().with_assets(vec![test_asset("a.png"), test_asset("b.png")]);

    let job = orchestrator.run(&request, &source).await?;

    assert_eq!(job.id, "job-7");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.has_completed(JobStep::ResponsiveVariants));
    assert!(job.has_completed(JobStep::Complete));
    assert_eq!(job.uploaded_assets.len(), 2);

    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| {
        r.headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer tok")
    }));

    let paths = request_paths(&server).await;
    assert_eq!(paths[0], "/api/extractions");
    assert_eq!(paths[1], "/api/extractions/job-7/structure");
    assert_eq!(paths.last().unwrap(), "/api/extractions/job-7/complete");
    assert_eq!(
        paths
            .iter()
            .filter(|p| p.as_str() == "/api/extractions/job-7/assets/upload")
            .count(),
        2
    );

    let create: serde_json::Value = serde_json::from_slice(&requests[0].body)?;
    assert_eq!(create["url"], "https://example.com");
    assert_eq!(create["title"], "Example");
    assert!(create["timestamp"].as_i64().unwrap() > 0);

    assert_eq!(
        orchestrator.job("job-7").unwrap().status,
        JobStatus::Completed
    );
    Ok(())
}

#[tokio::test]
async fn design_rejected_by_server_skips_variants() {
    init_tracing();
    let server = MockServer::start().await;
    mount_create(&server, "job-8").await;
    Mock::given(method("POST"))
        .and(path("/api/extractions/job-8/design"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({"error": "boom"})))
        .mount(&server)
        .await;
    mount_steps(&server, "job-8").await;

    let orchestrator = orchestrator(&server);
    let flags = ExtractionFlags {
        design: true,
        responsive: true,
        ..ExtractionFlags::default()
    };
    let request = ExtractionRequest::new("https://example.com", "Example").with_flags(flags);

    let err = orchestrator.run(&request, &MockSource::new()).await.unwrap_err();

    match &err {
        AppError::JobStepFailed { job_id, step, .. } => {
            assert_eq!(job_id.as_deref(), Some("job-8"));
            assert_eq!(*step, JobStep::Design);
        }
        other => panic!("expected JobStepFailed, got {other:?}"),
    }
    assert_eq!(err.status(), Some(500));

    let paths = request_paths(&server).await;
    assert!(paths.contains(&"/api/extractions/job-8/structure".to_string()));
    assert!(paths.contains(&"/api/extractions/job-8/responsive".to_string()));
    assert!(paths.contains(&"/api/extractions/job-8/responsive/css".to_string()));
    assert!(!paths.iter().any(|p| p.ends_with("/responsive/variants")));
    assert!(!paths.iter().any(|p| p.ends_with("/complete")));

    let job = orchestrator.job("job-8").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.steps_skipped.contains(&JobStep::ResponsiveVariants));
}

#[tokio::test]
async fn unauthorized_create_stops_before_any_step() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/extractions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired token"))
        .mount(&server)
        .await;

    let orchestrator = orchestrator(&server);
    let request = ExtractionRequest::new("https://example.com", "Example");

    let err = orchestrator.run(&request, &MockSource::new()).await.unwrap_err();

    assert!(matches!(
        err,
        AppError::JobStepFailed {
            job_id: None,
            step: JobStep::Create,
            ..
        }
    ));
    assert_eq!(err.status(), Some(401));
    assert_eq!(request_paths(&server).await, vec!["/api/extractions"]);
    assert!(orchestrator.jobs().is_empty());
}
