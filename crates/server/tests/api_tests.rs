//! Integration tests for HTTP API endpoints.

mod common;

use axum::body::Body;
use axum::http::StatusCode;
use common::TestServer;
use common::fixtures::{md5_hex, precheck_body, seeded_bytes};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    // Health is unauthenticated for load balancers and probes
    let (status, body) = server.json("GET", "/v1/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["disks"], 1);
}

#[tokio::test]
async fn test_requests_without_gateway_token_are_rejected() {
    let server = TestServer::new().await;

    let (status, body) = server.json("GET", "/v1/users/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_wrong_gateway_token_is_rejected() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;

    let response = server
        .send(
            "GET",
            "/v1/users/me",
            None,
            &[
                ("Authorization", "Bearer not-the-gateway"),
                ("x-stowage-user", &alice.to_string()),
            ],
            Body::empty(),
        )
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_me_reports_quota() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", Some(1 << 20)).await;

    let (status, body) = server.json("GET", "/v1/users/me", Some(alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");
    assert_eq!(body["space"], 1 << 20);
    assert_eq!(body["free_space"], 1 << 20);
    assert_eq!(body["has_file_passphrase"], false);
}

#[tokio::test]
async fn test_upload_then_read_full_and_ranged() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;
    let data = seeded_bytes(7, 100_000);

    let stored = server.upload(alice, &data, "notes.bin", "/docs").await;
    assert_eq!(stored["deduplicated"], false);
    let file_id = stored["file_id"].as_str().unwrap().to_string();

    let full = server
        .send(
            "GET",
            &format!("/v1/files/{file_id}/content"),
            Some(alice),
            &[],
            Body::empty(),
        )
        .await;
    assert_eq!(full.status, StatusCode::OK);
    assert_eq!(full.headers["accept-ranges"], "bytes");
    assert_eq!(full.body, data);

    let ranged = server
        .send(
            "GET",
            &format!("/v1/files/{file_id}/content"),
            Some(alice),
            &[("Range", "bytes=10-19")],
            Body::empty(),
        )
        .await;
    assert_eq!(ranged.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(ranged.headers["content-range"], "bytes 10-19/100000");
    assert_eq!(ranged.body, data.slice(10..20));

    let beyond = server
        .send(
            "GET",
            &format!("/v1/files/{file_id}/content"),
            Some(alice),
            &[("Range", "bytes=200000-")],
            Body::empty(),
        )
        .await;
    assert_eq!(beyond.status, StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_second_owner_gets_instant_upload() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;
    let bob = server.create_user("bob", None).await;
    let data = seeded_bytes(11, 50_000);

    let first = server.upload(alice, &data, "a.bin", "/").await;
    let second = server.upload(bob, &data, "b.bin", "/").await;

    assert_eq!(second["status"], "instant_uploaded");
    assert_eq!(second["file_id"], first["file_id"]);

    // Bob's copy is readable through his own link
    let file_id = second["file_id"].as_str().unwrap();
    let read = server
        .send(
            "GET",
            &format!("/v1/files/{file_id}/content"),
            Some(bob),
            &[],
            Body::empty(),
        )
        .await;
    assert_eq!(read.status, StatusCode::OK);
    assert_eq!(read.body, data);
}

#[tokio::test]
async fn test_reading_someone_elses_file_is_refused() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;
    let mallory = server.create_user("mallory", None).await;
    let stored = server
        .upload(alice, &seeded_bytes(3, 4096), "private.bin", "/")
        .await;
    let file_id = stored["file_id"].as_str().unwrap();

    let response = server
        .send(
            "GET",
            &format!("/v1/files/{file_id}/content"),
            Some(mallory),
            &[],
            Body::empty(),
        )
        .await;
    assert!(
        response.status == StatusCode::FORBIDDEN || response.status == StatusCode::NOT_FOUND,
        "got {}",
        response.status
    );
}

#[tokio::test]
async fn test_corrupt_chunk_is_rejected_and_can_be_resent() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;
    let data = seeded_bytes(5, 8192);

    let precheck = serde_json::to_value(precheck_body(&data, "c.bin", "/")).unwrap();
    let (status, ticket) = server
        .json("POST", "/v1/uploads/precheck", Some(alice), Some(precheck))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ticket["status"], "ticket");
    let upload_id = ticket["precheck_id"].as_str().unwrap().to_string();
    let uri = format!("/v1/uploads/{upload_id}/chunks/0");

    let wrong = md5_hex(b"something else");
    let response = server
        .send(
            "PUT",
            &uri,
            Some(alice),
            &[("x-total-chunks", "1"), ("content-md5", wrong.as_str())],
            Body::from(data.clone()),
        )
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.json()["code"], "chunk_corrupt");

    let (status, progress) = server
        .json("GET", &format!("/v1/uploads/{upload_id}"), Some(alice), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["uploaded_chunks"], 0);

    let right = md5_hex(&data);
    let response = server
        .send(
            "PUT",
            &uri,
            Some(alice),
            &[("x-total-chunks", "1"), ("content-md5", right.as_str())],
            Body::from(data.clone()),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["uploaded_chunks"], 1);
}

#[tokio::test]
async fn test_precheck_resumes_a_live_task() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;
    let data = seeded_bytes(9, 2048);
    let precheck = serde_json::to_value(precheck_body(&data, "r.bin", "/")).unwrap();

    let (_, first) = server
        .json("POST", "/v1/uploads/precheck", Some(alice), Some(precheck.clone()))
        .await;
    let upload_id = first["precheck_id"].as_str().unwrap().to_string();
    let md5 = md5_hex(&data);
    server
        .send(
            "PUT",
            &format!("/v1/uploads/{upload_id}/chunks/0"),
            Some(alice),
            &[("x-total-chunks", "1"), ("content-md5", md5.as_str())],
            Body::from(data.clone()),
        )
        .await;

    let (status, second) = server
        .json("POST", "/v1/uploads/precheck", Some(alice), Some(precheck))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["precheck_id"], first["precheck_id"]);
    assert_eq!(second["received"], json!([0]));
}

#[tokio::test]
async fn test_aborted_upload_is_gone() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;
    let data = seeded_bytes(13, 1024);
    let precheck = serde_json::to_value(precheck_body(&data, "x.bin", "/")).unwrap();

    let (_, ticket) = server
        .json("POST", "/v1/uploads/precheck", Some(alice), Some(precheck))
        .await;
    let upload_id = ticket["precheck_id"].as_str().unwrap().to_string();

    let response = server
        .send(
            "DELETE",
            &format!("/v1/uploads/{upload_id}"),
            Some(alice),
            &[],
            Body::empty(),
        )
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    let (status, _) = server
        .json(
            "POST",
            &format!("/v1/uploads/{upload_id}/finalize"),
            Some(alice),
            None,
        )
        .await;
    assert!(status.is_client_error(), "got {status}");
}

#[tokio::test]
async fn test_precheck_beyond_quota_is_refused() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", Some(1000)).await;
    let data = seeded_bytes(1, 4000);
    let precheck = serde_json::to_value(precheck_body(&data, "big.bin", "/")).unwrap();

    let (status, body) = server
        .json("POST", "/v1/uploads/precheck", Some(alice), Some(precheck))
        .await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(body["code"], "quota_exceeded");
}

#[tokio::test]
async fn test_encrypted_file_needs_a_play_token() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;
    let data = seeded_bytes(21, 30_000);

    let (status, _) = server
        .json(
            "PUT",
            "/v1/users/me/passphrase",
            Some(alice),
            Some(json!({ "passphrase": "open sesame" })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let stored = server
        .upload_with(
            alice,
            &data,
            "secret.bin",
            "/vault",
            Some(json!({ "encrypt": true, "passphrase": "open sesame" })),
        )
        .await;
    let file_id = stored["file_id"].as_str().unwrap().to_string();
    let content_uri = format!("/v1/files/{file_id}/content");

    let refused = server
        .send("GET", &content_uri, Some(alice), &[], Body::empty())
        .await;
    assert_eq!(refused.status, StatusCode::FORBIDDEN);

    let (status, _) = server
        .json(
            "POST",
            &format!("/v1/files/{file_id}/play-token"),
            Some(alice),
            Some(json!({ "passphrase": "wrong" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, token) = server
        .json(
            "POST",
            &format!("/v1/files/{file_id}/play-token"),
            Some(alice),
            Some(json!({ "passphrase": "open sesame" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let token = token["token"].as_str().unwrap();

    let full = server
        .send(
            "GET",
            &format!("{content_uri}?token={token}"),
            Some(alice),
            &[],
            Body::empty(),
        )
        .await;
    assert_eq!(full.status, StatusCode::OK);
    assert_eq!(full.body, data);

    let ranged = server
        .send(
            "GET",
            &content_uri,
            Some(alice),
            &[("Range", "bytes=17-4116"), ("x-play-token", token)],
            Body::empty(),
        )
        .await;
    assert_eq!(ranged.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(ranged.headers["content-range"], "bytes 17-4116/30000");
    assert_eq!(ranged.body, data.slice(17..4117));
}

#[tokio::test]
async fn test_unknown_download_action_is_a_bad_request() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice", None).await;

    let (status, _) = server
        .json(
            "POST",
            &format!("/v1/downloads/{}/explode", Uuid::new_v4()),
            Some(alice),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_endpoint_is_exposed_when_enabled() {
    let server = TestServer::new().await;
    stowage_server::metrics::register_metrics();

    let response = server
        .send("GET", "/metrics", None, &[], Body::empty())
        .await;
    assert_eq!(response.status, StatusCode::OK);
}
