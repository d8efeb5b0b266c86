use async_trait::async_trait;
use cds_retrieve::{Client, CredentialResolver, Credentials, Error, JobRequest, Sleeper};
use mockito::{Matcher, Mock, Server};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const DATASET: &str = "reanalysis-era5-pressure-levels-monthly-means";
const JOB_PATH: &str = "/retrieve/v1/jobs/job-1";

#[derive(Default, Clone)]
struct RecordingSleeper {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
    }
}

/// Cancels the retrieval the first time the poll loop goes to sleep, then never wakes up.
struct CancellingSleeper {
    cancel: CancellationToken,
}

#[async_trait]
impl Sleeper for CancellingSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.cancel.cancel();
        std::future::pending::<()>().await;
    }
}

fn era5_request() -> JobRequest {
    JobRequest::from_value(
        DATASET,
        json!({
            "data_format": "grib",
            "product_type": "monthly_averaged_reanalysis",
            "variable": "divergence",
            "pressure_level": "1",
            "year": "2020",
            "month": "06",
            "area": [90, -180, -90, 180],
            "time": "00:00"
        }),
    )
    .unwrap()
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|s| Duration::from_secs(*s)).collect()
}

async fn mock_submit(server: &mut Server, dataset: &str) -> Mock {
    let location = format!("{}{}", server.url(), JOB_PATH);
    server
        .mock(
            "POST",
            format!("/retrieve/v1/processes/{}/execute", dataset).as_str(),
        )
        .match_header("private-token", "test-key")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_header("location", &location)
        .with_body(r#"{"status": "accepted", "jobID": "job-1"}"#)
        .create_async()
        .await
}

async fn mock_status(server: &mut Server, status: &str, hits: usize) -> Mock {
    server
        .mock("GET", JOB_PATH)
        .match_header("private-token", "test-key")
        .with_header("content-type", "application/json")
        .with_body(json!({"status": status, "jobID": "job-1"}).to_string())
        .expect(hits)
        .create_async()
        .await
}

async fn mock_results(server: &mut Server) -> Mock {
    let href = format!("{}/download/era5.grib", server.url());
    mock_results_at(server, &href).await
}

async fn mock_results_at(server: &mut Server, href: &str) -> Mock {
    server
        .mock("GET", format!("{}/results", JOB_PATH).as_str())
        .with_header("content-type", "application/json")
        .with_body(
            json!({"asset": {"value": {
                "href": href,
                "file:size": 14,
                "type": "application/x-grib"
            }}})
            .to_string(),
        )
        .create_async()
        .await
}

async fn mock_download(server: &mut Server) -> Mock {
    server
        .mock("GET", "/download/era5.grib")
        .with_body("GRIB0123456789")
        .create_async()
        .await
}

fn client(sleeper: impl Sleeper + 'static) -> Client {
    Client::new().unwrap().with_progress(false).with_sleeper(sleeper)
}

fn credentials(server: &Server) -> Credentials {
    Credentials::new(server.url(), "test-key")
}

#[tokio::test]
async fn test_successful_job_downloads_result() {
    let mut server = Server::new_async().await;
    let submit = mock_submit(&mut server, DATASET).await;
    let running = mock_status(&mut server, "running", 5).await;
    let done = mock_status(&mut server, "successful", 1).await;
    let results = mock_results(&mut server).await;
    let download = mock_download(&mut server).await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("era5.grib");
    let sleeper = RecordingSleeper::default();

    let status = client(sleeper.clone())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &target,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    submit.assert_async().await;
    running.assert_async().await;
    done.assert_async().await;
    results.assert_async().await;
    download.assert_async().await;

    assert_eq!(status["status"], "successful");
    assert_eq!(std::fs::read(&target).unwrap(), b"GRIB0123456789");
    assert_eq!(sleeper.waits(), secs(&[1, 2, 4, 8, 16]));
}

#[tokio::test]
async fn test_request_body_is_forwarded_verbatim() {
    let mut server = Server::new_async().await;
    let location = format!("{}{}", server.url(), JOB_PATH);
    let submit = server
        .mock(
            "POST",
            format!("/retrieve/v1/processes/{}/execute", DATASET).as_str(),
        )
        .match_body(Matcher::Json(json!({"inputs": era5_request().parameters})))
        .with_status(201)
        .with_header("location", &location)
        .with_body(r#"{"status": "accepted"}"#)
        .create_async()
        .await;
    let _done = mock_status(&mut server, "successful", 1).await;
    let _results = mock_results(&mut server).await;
    let _download = mock_download(&mut server).await;

    let dir = tempdir().unwrap();
    client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &dir.path().join("out.grib"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    submit.assert_async().await;
}

#[tokio::test]
async fn test_backoff_is_capped_at_ten_minutes() {
    let mut server = Server::new_async().await;
    let _submit = mock_submit(&mut server, DATASET).await;
    let _running = mock_status(&mut server, "running", 4).await;
    let _done = mock_status(&mut server, "successful", 1).await;
    let _results = mock_results(&mut server).await;
    let _download = mock_download(&mut server).await;

    let dir = tempdir().unwrap();
    let sleeper = RecordingSleeper::default();
    client(sleeper.clone())
        .with_initial_wait(Duration::from_secs(200))
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &dir.path().join("out.grib"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(sleeper.waits(), secs(&[200, 400, 600, 600]));
}

#[tokio::test]
async fn test_unknown_dataset_is_invalid_request() {
    let mut server = Server::new_async().await;
    let submit = server
        .mock("POST", "/retrieve/v1/processes/bad-dataset/execute")
        .with_status(404)
        .with_body(r#"{"title": "process bad-dataset not found"}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("unreachable");
    let request = JobRequest::from_value("bad-dataset", json!({"a": "bad"})).unwrap();
    let err = client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &request,
            &target,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    submit.assert_async().await;
    match &err {
        Error::InvalidRequest {
            dataset, status, ..
        } => {
            assert_eq!(dataset, "bad-dataset");
            assert_eq!(*status, 404);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!target.exists());
}

#[tokio::test]
async fn test_bad_parameters_at_submit_are_invalid_request() {
    let mut server = Server::new_async().await;
    let _submit = server
        .mock(
            "POST",
            "/retrieve/v1/processes/reanalysis-era5-single-levels/execute",
        )
        .with_status(400)
        .with_body(r#"{"title": "invalid request", "detail": "unknown input badRequest"}"#)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let request = JobRequest::from_value(
        "reanalysis-era5-single-levels",
        json!({"badRequest": "is", "a": "bad", "re": "quest"}),
    )
    .unwrap();
    let err = client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &request,
            &dir.path().join("unreachable"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidRequest { status: 400, .. }));
    let msg = err.to_string();
    assert!(msg.contains("badRequest"));
    assert!(msg.contains("unknown input badRequest"));
}

#[tokio::test]
async fn test_bad_parameters_at_poll_are_invalid_request() {
    let mut server = Server::new_async().await;
    let _submit = mock_submit(&mut server, DATASET).await;
    let _poll = server
        .mock("GET", JOB_PATH)
        .with_status(400)
        .with_body(r#"{"detail": "invalid combination of year and month"}"#)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("era5.grib");
    let err = client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &target,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidRequest { status: 400, .. }));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_failed_job_skips_download() {
    let mut server = Server::new_async().await;
    let _submit = mock_submit(&mut server, DATASET).await;
    let _running = mock_status(&mut server, "running", 2).await;
    let _failed = mock_status(&mut server, "failed", 1).await;
    let results = server
        .mock("GET", Matcher::Regex(r"/results$".to_string()))
        .expect(0)
        .create_async()
        .await;
    let download = server
        .mock("GET", "/download/era5.grib")
        .expect(0)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("era5.grib");
    let err = client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &target,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match &err {
        Error::RemoteJobFailed { dataset, payload } => {
            assert_eq!(dataset, DATASET);
            assert_eq!(payload["status"], "failed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("cds.climate.copernicus.eu/requests"));
    results.assert_async().await;
    download.assert_async().await;
    assert!(!target.exists());
}

#[tokio::test]
async fn test_submit_server_error_is_not_retried() {
    let mut server = Server::new_async().await;
    let submit = server
        .mock(
            "POST",
            format!("/retrieve/v1/processes/{}/execute", DATASET).as_str(),
        )
        .with_status(502)
        .expect(1)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let err = client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &dir.path().join("era5.grib"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    submit.assert_async().await;
    assert!(matches!(err, Error::UnexpectedHttp { status: 502, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_missing_job_location_is_malformed() {
    let mut server = Server::new_async().await;
    let _submit = server
        .mock(
            "POST",
            format!("/retrieve/v1/processes/{}/execute", DATASET).as_str(),
        )
        .with_status(201)
        .with_body(r#"{"status": "accepted"}"#)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let err = client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &dir.path().join("era5.grib"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MalformedResponse { .. }));
}

#[tokio::test]
async fn test_malformed_asset_is_fatal() {
    let mut server = Server::new_async().await;
    let _submit = mock_submit(&mut server, DATASET).await;
    let _done = mock_status(&mut server, "successful", 1).await;
    let _results = server
        .mock("GET", format!("{}/results", JOB_PATH).as_str())
        .with_body(r#"{"asset": {"value": {}}}"#)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("era5.grib");
    let err = client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &target,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MalformedResponse { .. }));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_cancellation_during_backoff() {
    let mut server = Server::new_async().await;
    let _submit = mock_submit(&mut server, DATASET).await;
    let running = mock_status(&mut server, "running", 1).await;

    let cancel = CancellationToken::new();
    let dir = tempdir().unwrap();
    let target = dir.path().join("era5.grib");
    let err = client(CancellingSleeper {
        cancel: cancel.clone(),
    })
    .retrieve(&credentials(&server), &era5_request(), &target, &cancel)
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    running.assert_async().await;
    assert!(!target.exists());
}

#[tokio::test]
async fn test_existing_destination_is_overwritten() {
    let mut server = Server::new_async().await;
    let _submit = mock_submit(&mut server, DATASET).await;
    let _done = mock_status(&mut server, "successful", 1).await;
    let _results = mock_results(&mut server).await;
    let _download = mock_download(&mut server).await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("era5.grib");
    std::fs::write(&target, "stale content from an earlier run, longer than the new one").unwrap();

    client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &target,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&target).unwrap(), "GRIB0123456789");
}

/// Serves one download that sends its headers and a few bytes, then stalls. `cancel` is
/// triggered shortly after the partial body went out.
async fn stalling_download(cancel: CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 4096];
        let _ = socket.read(&mut request).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1024\r\n\r\nGRIB")
            .await
            .unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        std::future::pending::<()>().await;
    });
    format!("http://{}/download/era5.grib", addr)
}

#[tokio::test]
async fn test_cancellation_while_download_stalls() {
    let mut server = Server::new_async().await;
    let _submit = mock_submit(&mut server, DATASET).await;
    let _done = mock_status(&mut server, "successful", 1).await;

    let cancel = CancellationToken::new();
    let href = stalling_download(cancel.clone()).await;
    let _results = mock_results_at(&mut server, &href).await;

    let dir = tempdir().unwrap();
    let started = std::time::Instant::now();
    let err = client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &dir.path().join("era5.grib"),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_root_relative_job_location() {
    let mut server = Server::new_async().await;
    let _submit = server
        .mock(
            "POST",
            format!("/retrieve/v1/processes/{}/execute", DATASET).as_str(),
        )
        .with_status(201)
        .with_header("location", JOB_PATH)
        .with_body(r#"{"status": "accepted"}"#)
        .create_async()
        .await;
    let done = mock_status(&mut server, "successful", 1).await;
    let _results = mock_results(&mut server).await;
    let _download = mock_download(&mut server).await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("era5.grib");
    client(RecordingSleeper::default())
        .retrieve(
            &credentials(&server),
            &era5_request(),
            &target,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    done.assert_async().await;
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "GRIB0123456789");
}

fn resolver_for(server: &Server) -> CredentialResolver {
    CredentialResolver::from_env()
        .with_env(|_: &str| None)
        .with_config_files(vec![])
        .with_url(server.url())
        .with_key("test-key")
}

#[tokio::test]
async fn test_top_level_retrieve_resolves_and_downloads() {
    let mut server = Server::new_async().await;
    let submit = mock_submit(&mut server, DATASET).await;
    let _done = mock_status(&mut server, "successful", 1).await;
    let _results = mock_results(&mut server).await;
    let _download = mock_download(&mut server).await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("era5.grib");
    let status = cds_retrieve::retrieve_with(
        &resolver_for(&server),
        &client(RecordingSleeper::default()),
        DATASET,
        era5_request().parameters,
        &target,
    )
    .await
    .unwrap();

    submit.assert_async().await;
    assert_eq!(status["status"], "successful");
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "GRIB0123456789");
}

#[tokio::test]
async fn test_top_level_retrieve_without_credentials_sends_nothing() {
    let mut server = Server::new_async().await;
    let submit = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let resolver = CredentialResolver::from_env()
        .with_env(|_: &str| None)
        .with_config_files(vec![dir.path().join(".cdsapirc")]);
    let err = cds_retrieve::retrieve_with(
        &resolver,
        &client(RecordingSleeper::default()),
        DATASET,
        era5_request().parameters,
        &dir.path().join("era5.grib"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::MissingCredentials { .. }));
    submit.assert_async().await;
}
