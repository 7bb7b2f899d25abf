//! HttpTransport against a local axum server with range support

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use model_depot::config::HttpConfig;
use model_depot::download::{
    CancelSignal, FetchOutcome, FetchRequest, HttpTransport, ProgressFn, ResumeData, Transport,
    partial_path_for,
};
use model_depot::DepotError;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Clone)]
struct Fixture {
    body: Arc<Vec<u8>>,
    ranges: bool,
    seen_ranges: Arc<Mutex<Vec<Option<String>>>>,
}

async fn serve_model(State(fixture): State<Fixture>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    fixture.seen_ranges.lock().unwrap().push(range.clone());

    let start = range
        .as_deref()
        .filter(|_| fixture.ranges)
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok());

    match start {
        Some(start) if start < fixture.body.len() => {
            let content_range = format!(
                "bytes {}-{}/{}",
                start,
                fixture.body.len() - 1,
                fixture.body.len()
            );
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_RANGE, content_range),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                fixture.body[start..].to_vec(),
            )
                .into_response()
        }
        _ if fixture.ranges => (
            StatusCode::OK,
            [(header::ACCEPT_RANGES, "bytes")],
            fixture.body.to_vec(),
        )
            .into_response(),
        _ => (StatusCode::OK, fixture.body.to_vec()).into_response(),
    }
}

async fn spawn_server(fixture: Fixture) -> String {
    let app = Router::new()
        .route("/models/yolo11n.zip", get(serve_model))
        .route("/missing.zip", get(|| async { StatusCode::NOT_FOUND }))
        .with_state(fixture);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn fixture(len: usize, ranges: bool) -> Fixture {
    Fixture {
        body: Arc::new((0..len).map(|i| (i % 251) as u8).collect()),
        ranges,
        seen_ranges: Arc::new(Mutex::new(Vec::new())),
    }
}

fn recording_progress() -> (ProgressFn, Arc<Mutex<Vec<(u64, Option<u64>)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: ProgressFn = Arc::new(move |written, total| {
        sink.lock().unwrap().push((written, total));
    });
    (progress, seen)
}

fn transport() -> HttpTransport {
    HttpTransport::new(&HttpConfig::default()).unwrap()
}

#[tokio::test]
async fn test_full_download() {
    let fixture = fixture(64 * 1024, true);
    let base = spawn_server(fixture.clone()).await;
    let temp = TempDir::new().unwrap();
    let destination = temp.path().join("downloads/yolo11n.zip");
    let (progress, seen) = recording_progress();

    let outcome = transport()
        .fetch(
            FetchRequest {
                url: format!("{}/models/yolo11n.zip", base),
                destination: destination.clone(),
                resume: None,
            },
            progress,
            CancelSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FetchOutcome::Completed {
            path: destination.clone(),
            bytes: 64 * 1024
        }
    );
    assert_eq!(std::fs::read(&destination).unwrap(), *fixture.body);
    assert!(!partial_path_for(&destination).exists());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&(0, Some(64 * 1024))));
    assert_eq!(seen.last(), Some(&(64 * 1024, Some(64 * 1024))));
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(fixture.seen_ranges.lock().unwrap().as_slice(), &[None]);
}

#[tokio::test]
async fn test_resume_sends_range_and_appends() {
    let fixture = fixture(10_000, true);
    let base = spawn_server(fixture.clone()).await;
    let temp = TempDir::new().unwrap();
    let destination = temp.path().join("yolo11n.zip");

    let partial = temp.path().join("old.part");
    std::fs::write(&partial, &fixture.body[..4000]).unwrap();
    let (progress, seen) = recording_progress();

    let outcome = transport()
        .fetch(
            FetchRequest {
                url: format!("{}/models/yolo11n.zip", base),
                destination: destination.clone(),
                resume: Some(ResumeData::new(partial.clone(), 4000, Some(10_000))),
            },
            progress,
            CancelSignal::new(),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, FetchOutcome::Completed { bytes: 10_000, .. }));
    assert_eq!(std::fs::read(&destination).unwrap(), *fixture.body);
    assert!(!partial.exists());
    assert_eq!(
        fixture.seen_ranges.lock().unwrap().as_slice(),
        &[Some("bytes=4000-".to_string())]
    );
    assert_eq!(seen.lock().unwrap().first(), Some(&(4000, Some(10_000))));
}

#[tokio::test]
async fn test_resume_restarts_when_server_ignores_range() {
    let fixture = fixture(10_000, false);
    let base = spawn_server(fixture.clone()).await;
    let temp = TempDir::new().unwrap();
    let destination = temp.path().join("yolo11n.zip");

    let partial = temp.path().join("old.part");
    std::fs::write(&partial, &fixture.body[..4000]).unwrap();
    let (progress, _) = recording_progress();

    let outcome = transport()
        .fetch(
            FetchRequest {
                url: format!("{}/models/yolo11n.zip", base),
                destination: destination.clone(),
                resume: Some(ResumeData::new(partial, 4000, Some(10_000))),
            },
            progress,
            CancelSignal::new(),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, FetchOutcome::Completed { bytes: 10_000, .. }));
    assert_eq!(std::fs::read(&destination).unwrap(), *fixture.body);
}

#[tokio::test]
async fn test_http_error_status_is_network_failure() {
    let base = spawn_server(fixture(16, true)).await;
    let temp = TempDir::new().unwrap();
    let (progress, _) = recording_progress();

    let err = transport()
        .fetch(
            FetchRequest {
                url: format!("{}/missing.zip", base),
                destination: temp.path().join("missing.zip"),
                resume: None,
            },
            progress,
            CancelSignal::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DepotError::Network(_)));
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_cancel_before_response_discards() {
    let base = spawn_server(fixture(16, true)).await;
    let temp = TempDir::new().unwrap();
    let destination = temp.path().join("yolo11n.zip");
    let (progress, _) = recording_progress();

    let cancel = CancelSignal::new();
    cancel.cancel();

    let outcome = transport()
        .fetch(
            FetchRequest {
                url: format!("{}/models/yolo11n.zip", base),
                destination: destination.clone(),
                resume: None,
            },
            progress,
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(outcome, FetchOutcome::Cancelled { resume: None });
    assert!(!destination.exists());
    assert!(!partial_path_for(&destination).exists());
}

#[tokio::test]
async fn test_resume_truncates_partial_past_offset() {
    let fixture = fixture(10_000, true);
    let base = spawn_server(fixture.clone()).await;
    let temp = TempDir::new().unwrap();
    let destination = temp.path().join("yolo11n.zip");

    // Only the first 4000 bytes were acknowledged; the tail is stale
    let partial = temp.path().join("old.part");
    let mut stale = fixture.body[..4000].to_vec();
    stale.extend_from_slice(&[0xAA; 1500]);
    std::fs::write(&partial, &stale).unwrap();
    let (progress, _) = recording_progress();

    let outcome = transport()
        .fetch(
            FetchRequest {
                url: format!("{}/models/yolo11n.zip", base),
                destination: destination.clone(),
                resume: Some(ResumeData::new(partial, 4000, Some(10_000))),
            },
            progress,
            CancelSignal::new(),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, FetchOutcome::Completed { bytes: 10_000, .. }));
    assert_eq!(std::fs::read(&destination).unwrap(), *fixture.body);
    assert_eq!(
        fixture.seen_ranges.lock().unwrap().as_slice(),
        &[Some("bytes=4000-".to_string())]
    );
}
