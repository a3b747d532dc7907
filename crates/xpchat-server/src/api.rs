use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, Method},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use xpchat_shared::constants::{APP_NAME, WS_PATH};
use xpchat_shared::{ChatId, UserId};
use xpchat_store::{
    CallRecord, Chat, ChatType, Database, Message, NewUser, ParticipantRole, RowStore,
    SqliteStore, User,
};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::uploads::UploadStore;
use crate::ws::ws_upgrade;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub registry: ConnectionRegistry,
    pub router: Arc<MessageRouter>,
    pub uploads: Arc<UploadStore>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<SqliteStore>,
        uploads: UploadStore,
        rate_limiter: RateLimiter,
        config: ServerConfig,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let rows: Arc<dyn RowStore> = store.clone();
        let router = Arc::new(MessageRouter::new(rows, registry.clone()));
        Self {
            store,
            registry,
            router,
            uploads: Arc::new(uploads),
            rate_limiter,
            config: Arc::new(config),
        }
    }

    #[cfg(test)]
    pub async fn for_tests(upload_dir: &std::path::Path) -> Self {
        let config = ServerConfig {
            upload_path: upload_dir.to_path_buf(),
            max_upload_size: 1024,
            ..ServerConfig::default()
        };
        let uploads = UploadStore::new(config.upload_path.clone(), config.max_upload_size)
            .await
            .unwrap();
        let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
        Self::new(store, uploads, RateLimiter::new(1000.0, 1000.0), config)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/{id}", get(get_user))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route("/api/messages/{chat_id}", get(list_messages))
        .route("/api/calls/{user_id}", get(list_calls))
        .route("/api/upload", post(upload))
        .route("/uploads/{file_ref}", get(download))
        .layer(DefaultBodyLimit::max(state.config.max_upload_size + 64 * 1024))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route(WS_PATH, get(ws_upgrade))
        .merge(api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run a closure against the database on the blocking pool.
async fn with_db<T, F>(state: &AppState, f: F) -> Result<T, ServerError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> xpchat_store::Result<T> + Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || store.with(f))
        .await
        .map_err(|e| ServerError::Internal(format!("Database task failed: {e}")))?
        .map_err(ServerError::from)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: &'static str,
    version: &'static str,
    online_users: usize,
    max_upload_size: usize,
}

#[derive(Deserialize)]
struct CreateUserRequest {
    id: Option<UserId>,
    username: String,
    avatar: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatsQuery {
    user_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChatRequest {
    name: Option<String>,
    #[serde(rename = "type", default)]
    chat_type: ChatType,
    created_by: Option<UserId>,
    #[serde(default)]
    participants: Vec<UserId>,
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

impl PageQuery {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_ref: String,
    file_name: String,
    file_size: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: APP_NAME,
        version: env!("CARGO_PKG_VERSION"),
        online_users: state.registry.online_count().await,
        max_upload_size: state.uploads.max_size(),
    })
}

async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<User>>, ServerError> {
    Ok(Json(with_db(&state, |db| db.list_users()).await?))
}

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<User>, ServerError> {
    let username = req.username.trim().to_string();
    if username.is_empty() {
        return Err(ServerError::BadRequest("username is required".into()));
    }
    let new_user = NewUser {
        id: req.id.unwrap_or_else(UserId::generate),
        username,
        avatar: req.avatar,
    };

    let user = with_db(&state, move |db| {
        if db.get_user_by_id(&new_user.id)?.is_some() {
            return Err(xpchat_store::StoreError::Conflict(format!(
                "user {} already exists",
                new_user.id
            )));
        }
        db.create_user(&new_user)
    })
    .await?;

    info!(user = %user.id, name = %user.username, "User created via API");
    Ok(Json(user))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ServerError> {
    let id = UserId::new(id);
    let lookup = id.clone();
    with_db(&state, move |db| db.get_user_by_id(&lookup))
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("user {id}")))
}

async fn list_chats(
    State(state): State<AppState>,
    Query(query): Query<ChatsQuery>,
) -> Result<Json<Vec<Chat>>, ServerError> {
    let chats = with_db(&state, move |db| db.get_user_chats(&query.user_id)).await?;
    Ok(Json(chats))
}

async fn create_chat(
    State(state): State<AppState>,
    Json(req): Json<CreateChatRequest>,
) -> Result<Json<Chat>, ServerError> {
    if req.participants.is_empty() && req.created_by.is_none() {
        return Err(ServerError::BadRequest("a chat needs participants".into()));
    }

    let chat = with_db(&state, move |db| {
        let chat = db.create_chat(
            ChatId::new(Uuid::new_v4().to_string()),
            req.name,
            req.chat_type,
            req.created_by.as_ref(),
        )?;
        if let Some(creator) = &req.created_by {
            db.add_chat_participant(&chat.id, creator, ParticipantRole::Admin)?;
        }
        for user in req.participants.iter().filter(|u| Some(*u) != req.created_by.as_ref()) {
            db.add_chat_participant(&chat.id, user, ParticipantRole::Member)?;
        }
        Ok(chat)
    })
    .await?;

    info!(chat = %chat.id, kind = chat.chat_type.as_str(), "Chat created");
    Ok(Json(chat))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let chat_id = ChatId::new(chat_id);
    let (limit, offset) = (page.limit(), page.offset.unwrap_or(0));
    let messages =
        with_db(&state, move |db| db.get_messages_for_chat(&chat_id, limit, offset)).await?;
    Ok(Json(messages))
}

async fn list_calls(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<CallRecord>>, ServerError> {
    let user_id = UserId::new(user_id);
    let limit = page.limit();
    let calls = with_db(&state, move |db| db.call_history(&user_id, limit)).await?;
    Ok(Json(calls))
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let stored = state.uploads.store(&data, &file_name).await?;
        info!(file_ref = %stored.file_ref, size = stored.file_size, "File uploaded");

        return Ok(Json(UploadResponse {
            file_ref: stored.file_ref,
            file_name: stored.file_name,
            file_size: stored.file_size,
        }));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn download(
    State(state): State<AppState>,
    Path(file_ref): Path<String>,
) -> Result<Response, ServerError> {
    let data = state.uploads.get(&file_ref).await?;
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(data))
        .map_err(|e| ServerError::Internal(e.to_string()))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = build_router(AppState::for_tests(dir.path()).await);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn user_crud() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = build_router(AppState::for_tests(dir.path()).await);

        let created = app
            .clone()
            .oneshot(post_json(
                "/api/users",
                serde_json::json!({ "id": "alice", "username": "Alice" }),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);

        let duplicate = app
            .clone()
            .oneshot(post_json(
                "/api/users",
                serde_json::json!({ "id": "alice", "username": "Alice" }),
            ))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let fetched = app
            .clone()
            .oneshot(Request::get("/api/users/alice").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(fetched).await["username"], "Alice");

        let missing = app
            .oneshot(Request::get("/api/users/nobody").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_creation_and_listing() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = build_router(AppState::for_tests(dir.path()).await);

        for (id, name) in [("alice", "Alice"), ("bob", "Bob")] {
            app.clone()
                .oneshot(post_json(
                    "/api/users",
                    serde_json::json!({ "id": id, "username": name }),
                ))
                .await
                .unwrap();
        }

        let created = app
            .clone()
            .oneshot(post_json(
                "/api/chats",
                serde_json::json!({
                    "name": "Pair",
                    "type": "personal",
                    "createdBy": "alice",
                    "participants": ["alice", "bob"]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);
        let chat = body_json(created).await;

        let listed = app
            .oneshot(
                Request::get("/api/chats?userId=bob")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let chats = body_json(listed).await;
        assert_eq!(chats.as_array().unwrap().len(), 1);
        assert_eq!(chats[0]["id"], chat["id"]);
    }

    #[tokio::test]
    async fn upload_round_trip_and_size_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = build_router(AppState::for_tests(dir.path()).await);

        let boundary = "XPCHATBOUNDARY";
        let multipart = |payload: &str| {
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"note.txt\"\r\n\
                 Content-Type: text/plain\r\n\r\n{payload}\r\n--{boundary}--\r\n"
            )
        };
        let request = |body: String| {
            Request::post("/api/upload")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap()
        };

        let response = app.clone().oneshot(request(multipart("hello"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let uploaded = body_json(response).await;
        assert_eq!(uploaded["fileName"], "note.txt");
        assert_eq!(uploaded["fileSize"], 5);

        let file_ref = uploaded["fileRef"].as_str().unwrap();
        let fetched = app
            .clone()
            .oneshot(
                Request::get(format!("/uploads/{file_ref}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(fetched.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");

        let too_big = app
            .oneshot(request(multipart(&"x".repeat(2048))))
            .await
            .unwrap();
        assert_eq!(too_big.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
