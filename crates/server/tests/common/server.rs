//! Server test utilities.

use super::fixtures::{md5_hex, precheck_body, split_into_chunks};
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_metadata::{MetadataStore, SqliteStore};
use stowage_server::disks::DiskSet;
use stowage_server::download::torrent;
use stowage_server::users::UserService;
use stowage_server::{AppState, bootstrap, create_router};
use stowage_storage::FsSpaceProbe;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

/// Raw gateway secret whose hash `AppConfig::for_testing` carries.
pub const GATEWAY_TOKEN: &str = "test-gateway-token";

/// Cheap bcrypt cost so user and share setup stays fast.
const TEST_BCRYPT_COST: u32 = 4;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

/// A buffered response.
#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: bytes::Bytes,
}

#[allow(dead_code)]
impl TestResponse {
    pub fn json(&self) -> Value {
        if self.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&self.body).unwrap_or(Value::Null)
        }
    }
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary disks.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"), None)
                .await
                .expect("Failed to create metadata store"),
        );
        bootstrap::ensure_default_group(metadata.as_ref())
            .await
            .expect("Failed to create default group");
        let specs = bootstrap::register_disks(metadata.as_ref(), &config)
            .await
            .expect("Failed to register disks");
        let disks = Arc::new(
            DiskSet::new(specs, Arc::new(FsSpaceProbe), &config.file.temp_dir)
                .expect("Failed to open disks"),
        );

        let users = Arc::new(UserService::with_cost(metadata.clone(), TEST_BCRYPT_COST));
        let torrents = torrent::default_client(&temp_dir.path().join("torrent"));
        let state = AppState::with_parts(config, metadata, disks, users, torrents)
            .expect("Failed to build state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Create a user in the default group; `None` means unlimited space.
    pub async fn create_user(&self, name: &str, space: Option<u64>) -> Uuid {
        self.state
            .users
            .create_user(name, Some(space.unwrap_or(0)))
            .await
            .expect("Failed to create user")
            .user_id
    }

    /// Send a request as `user` through the gateway.
    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        user: Option<Uuid>,
        headers: &[(&str, &str)],
        body: Body,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder
                .header("Authorization", format!("Bearer {GATEWAY_TOKEN}"))
                .header(stowage_server::auth::USER_HEADER, user.to_string());
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = builder.body(body).unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Send a JSON request as `user` and parse the JSON reply.
    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        user: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let (headers, body): (&[(&str, &str)], Body) = match body {
            Some(v) => (
                &[("Content-Type", "application/json")],
                Body::from(serde_json::to_vec(&v).unwrap()),
            ),
            None => (&[], Body::empty()),
        };
        let response = self.send(method, uri, user, headers, body).await;
        (response.status, response.json())
    }

    /// Run precheck, chunk intake and finalize for `data`; returns the finalize body.
    pub async fn upload(&self, user: Uuid, data: &[u8], filename: &str, virtual_path: &str) -> Value {
        self.upload_with(user, data, filename, virtual_path, None).await
    }

    /// As [`TestServer::upload`], with explicit finalize options.
    pub async fn upload_with(
        &self,
        user: Uuid,
        data: &[u8],
        filename: &str,
        virtual_path: &str,
        finalize: Option<Value>,
    ) -> Value {
        let precheck = serde_json::to_value(precheck_body(data, filename, virtual_path)).unwrap();
        let (status, ticket) = self
            .json("POST", "/v1/uploads/precheck", Some(user), Some(precheck))
            .await;
        assert_eq!(status, StatusCode::OK, "precheck failed: {ticket}");
        if ticket["status"] == "instant_uploaded" {
            return ticket;
        }

        let upload_id = ticket["precheck_id"].as_str().unwrap().to_string();
        let chunk_size = ticket["chunk_size"].as_u64().unwrap() as usize;
        let total = ticket["total_chunks"].as_u64().unwrap();
        let chunks = if data.is_empty() {
            vec![bytes::Bytes::new()]
        } else {
            split_into_chunks(data, chunk_size)
        };
        assert_eq!(chunks.len() as u64, total);

        let total = total.to_string();
        for (index, chunk) in chunks.iter().enumerate() {
            let md5 = md5_hex(chunk);
            let response = self
                .send(
                    "PUT",
                    &format!("/v1/uploads/{upload_id}/chunks/{index}"),
                    Some(user),
                    &[("x-total-chunks", total.as_str()), ("content-md5", md5.as_str())],
                    Body::from(chunk.clone()),
                )
                .await;
            assert_eq!(response.status, StatusCode::OK, "chunk {index}: {}", response.json());
        }

        let (status, stored) = self
            .json(
                "POST",
                &format!("/v1/uploads/{upload_id}/finalize"),
                Some(user),
                finalize,
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "finalize failed: {stored}");
        stored
    }
}
