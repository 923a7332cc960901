//! Offline HTTP downloads against a local ranged origin.

mod common;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use common::TestServer;
use common::fixtures::seeded_bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stowage_metadata::repos::DownloadTaskRepo;
use tokio::sync::watch;
use uuid::Uuid;

/// A ranged origin that records every request it answers.
struct Origin {
    blob: Bytes,
    /// `(method, Range header)` in arrival order.
    requests: Mutex<Vec<(Method, Option<String>)>>,
    /// Ranged GETs starting at or past this offset stall halfway until released.
    stall_from: Option<u64>,
    released: watch::Sender<bool>,
}

impl Origin {
    fn new(blob: Bytes) -> Arc<Self> {
        Self::stalling(blob, None)
    }

    fn stalling(blob: Bytes, stall_from: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            blob,
            requests: Mutex::new(Vec::new()),
            stall_from,
            released: watch::channel(false).0,
        })
    }

    fn release(&self) {
        self.released.send_replace(true);
    }

    fn gets(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(method, _)| *method == Method::GET)
            .map(|(_, range)| range.clone())
            .collect()
    }
}

fn range_start(range: &str) -> u64 {
    range
        .strip_prefix("bytes=")
        .and_then(|spec| spec.split_once('-'))
        .and_then(|(first, _)| first.parse().ok())
        .unwrap()
}

/// Serve the blob with single-range support, the way a CDN would.
async fn serve_blob(State(origin): State<Arc<Origin>>, method: Method, headers: HeaderMap) -> Response {
    let raw_range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    origin
        .requests
        .lock()
        .unwrap()
        .push((method.clone(), raw_range.clone()));

    let blob = origin.blob.clone();
    let size = blob.len() as u64;
    let requested = raw_range
        .as_deref()
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|spec| spec.split_once('-'))
        .and_then(|(first, last)| {
            let first: u64 = first.parse().ok()?;
            let last: u64 = if last.is_empty() {
                size - 1
            } else {
                last.parse().ok()?
            };
            (first <= last && last < size).then_some((first, last))
        });

    let (status, body, range) = match requested {
        Some((first, last)) => (
            StatusCode::PARTIAL_CONTENT,
            blob.slice(first as usize..=last as usize),
            Some(format!("bytes {first}-{last}/{size}")),
        ),
        None => (StatusCode::OK, blob, None),
    };
    let len = body.len();

    let stall = method == Method::GET
        && !*origin.released.borrow()
        && matches!((requested, origin.stall_from), (Some((first, _)), Some(from)) if first >= from);
    let body = if stall {
        let (head, tail) = (body.slice(..len / 2), body.slice(len / 2..));
        let mut released = origin.released.subscribe();
        let rest = futures::stream::once(async move {
            let _ = released.wait_for(|r| *r).await;
            tail
        });
        Body::from_stream(
            futures::stream::iter([head])
                .chain(rest)
                .map(Ok::<_, Infallible>),
        )
    } else {
        Body::from(body)
    };

    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    if let Some(range) = range {
        headers.insert(CONTENT_RANGE, HeaderValue::from_str(&range).unwrap());
    }
    response
}

async fn spawn_origin(origin: Arc<Origin>) -> SocketAddr {
    let app = Router::new()
        .route("/files/dataset.bin", get(serve_blob))
        .with_state(origin);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn submit(server: &TestServer, user: Uuid, origin: SocketAddr) -> String {
    let (status, task) = server
        .json(
            "POST",
            "/v1/downloads",
            Some(user),
            Some(json!({
                "source": format!("http://{origin}/files/dataset.bin"),
                "virtual_path": "/inbox",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{task}");
    task["task_id"].as_str().unwrap().to_string()
}

async fn read_content(server: &TestServer, user: Uuid, task: &Value) -> Bytes {
    let file_id = task["file_id"].as_str().unwrap();
    let read = server
        .send(
            "GET",
            &format!("/v1/files/{file_id}/content"),
            Some(user),
            &[],
            Body::empty(),
        )
        .await;
    assert_eq!(read.status, StatusCode::OK);
    read.body
}

async fn wait_for_terminal(server: &TestServer, user: Uuid, task_id: &str) -> Value {
    for _ in 0..500 {
        let (status, task) = server
            .json("GET", &format!("/v1/downloads/{task_id}"), Some(user), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        if task["state"] == "finished" || task["state"] == "failed" {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("download {task_id} never reached a terminal state");
}

#[tokio::test]
async fn test_segmented_download_is_ingested() {
    let server = TestServer::with_config(|config| {
        config.download.chunk_size = 16 * 1024;
        config.download.max_concurrent = 4;
    })
    .await;
    let alice = server.create_user("alice", None).await;
    let blob = seeded_bytes(99, 100_000);
    let origin = spawn_origin(Origin::new(blob.clone())).await;

    let (status, task) = server
        .json(
            "POST",
            "/v1/downloads",
            Some(alice),
            Some(json!({
                "source": format!("http://{origin}/files/dataset.bin"),
                "virtual_path": "/inbox",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{task}");
    assert_eq!(task["kind"], "http");
    let task_id = task["task_id"].as_str().unwrap().to_string();

    let done = wait_for_terminal(&server, alice, &task_id).await;
    assert_eq!(done["state"], "finished", "{done}");
    assert_eq!(done["file_name"], "dataset.bin");
    assert_eq!(done["file_size"], 100_000);
    assert_eq!(done["supports_range"], true);

    let file_id = done["file_id"].as_str().unwrap();
    let read = server
        .send(
            "GET",
            &format!("/v1/files/{file_id}/content"),
            Some(alice),
            &[],
            Body::empty(),
        )
        .await;
    assert_eq!(read.status, StatusCode::OK);
    assert_eq!(read.body, blob);

    let (_, listed) = server.json("GET", "/v1/downloads", Some(alice), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unreachable_source_fails_the_task() {
    let server = TestServer::with_config(|config| {
        config.download.max_retries = 0;
        config.download.timeout_sec = 2;
    })
    .await;
    let alice = server.create_user("alice", None).await;

    // Bind then drop to get a port nothing listens on.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let (status, task) = server
        .json(
            "POST",
            "/v1/downloads",
            Some(alice),
            Some(json!({
                "source": format!("http://{addr}/missing.bin"),
                "virtual_path": "/",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = task["task_id"].as_str().unwrap().to_string();

    let done = wait_for_terminal(&server, alice, &task_id).await;
    assert_eq!(done["state"], "failed");
    assert!(done["error"].as_str().is_some());
    assert!(done["file_id"].is_null());
}

#[tokio::test]
async fn test_downloads_are_private_to_their_owner() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;
    let bob = server.create_user("bob", None).await;
    let origin = spawn_origin(Origin::new(seeded_bytes(1, 512))).await;

    let (_, task) = server
        .json(
            "POST",
            "/v1/downloads",
            Some(alice),
            Some(json!({
                "source": format!("http://{origin}/files/dataset.bin"),
                "virtual_path": "/",
            })),
        )
        .await;
    let task_id = task["task_id"].as_str().unwrap().to_string();

    let (status, _) = server
        .json("GET", &format!("/v1/downloads/{task_id}"), Some(bob), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listed) = server.json("GET", "/v1/downloads", Some(bob), None).await;
    assert_eq!(listed, json!([]));

    wait_for_terminal(&server, alice, &task_id).await;
}

#[tokio::test]
async fn test_unsupported_source_is_rejected() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;

    let (status, body) = server
        .json(
            "POST",
            "/v1/downloads",
            Some(alice),
            Some(json!({ "source": "ftp://example.com/file", "virtual_path": "/" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
}

async fn watermark(server: &TestServer, task_id: &str) -> Option<u64> {
    let id = Uuid::parse_str(task_id).unwrap();
    let row = server.metadata().get_download_task(id).await.unwrap()?;
    let scratch = PathBuf::from(row.local_path?);
    let text = tokio::fs::read_to_string(scratch.join("dataset.bin.part"))
        .await
        .ok()?;
    text.trim().parse().ok()
}

#[tokio::test]
async fn test_paused_download_resumes_from_its_watermark() {
    let server = TestServer::with_config(|config| {
        config.download.chunk_size = 10_000;
        config.download.max_concurrent = 1;
    })
    .await;
    let alice = server.create_user("alice", None).await;
    let blob = seeded_bytes(7, 50_000);
    let origin = Origin::stalling(blob.clone(), Some(20_000));
    let addr = spawn_origin(origin.clone()).await;
    let task_id = submit(&server, alice, addr).await;

    // The first two segments land; the third stalls mid-body.
    let mut reached = false;
    for _ in 0..500 {
        let stalled = origin
            .gets()
            .iter()
            .flatten()
            .any(|range| range_start(range) >= 20_000);
        if stalled && watermark(&server, &task_id).await == Some(20_000) {
            reached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reached, "download never stalled past the watermark");

    let (status, paused) = server
        .json("POST", &format!("/v1/downloads/{task_id}/pause"), Some(alice), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{paused}");
    assert_eq!(paused["state"], "paused");

    let id = Uuid::parse_str(&task_id).unwrap();
    let supervisor = server.state.downloads.supervisor().clone();
    for _ in 0..500 {
        if !supervisor.is_registered(id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!supervisor.is_registered(id), "paused run never stopped");
    assert_eq!(watermark(&server, &task_id).await, Some(20_000));

    let before_resume = origin.gets().len();
    origin.release();
    let (status, resumed) = server
        .json("POST", &format!("/v1/downloads/{task_id}/resume"), Some(alice), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{resumed}");

    let done = wait_for_terminal(&server, alice, &task_id).await;
    assert_eq!(done["state"], "finished", "{done}");

    let after: Vec<String> = origin.gets()[before_resume..]
        .iter()
        .map(|range| range.clone().expect("resumed requests are ranged"))
        .collect();
    assert_eq!(after.first().map(String::as_str), Some("bytes=20000-29999"));
    assert!(
        after.iter().all(|range| range_start(range) >= 20_000),
        "resume refetched bytes below the watermark: {after:?}"
    );
    assert_eq!(read_content(&server, alice, &done).await, blob);
}

#[tokio::test]
async fn test_single_segment_sources_stream_without_ranges() {
    let server = TestServer::with_config(|config| {
        config.download.chunk_size = 10_000;
    })
    .await;
    let alice = server.create_user("alice", None).await;
    let blob = seeded_bytes(3, 4_000);
    let origin = Origin::new(blob.clone());
    let addr = spawn_origin(origin.clone()).await;
    let task_id = submit(&server, alice, addr).await;

    let done = wait_for_terminal(&server, alice, &task_id).await;
    assert_eq!(done["state"], "finished", "{done}");
    assert_eq!(origin.gets(), vec![None]);
    assert_eq!(read_content(&server, alice, &done).await, blob);
}
