use std::any::Any;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error};

use crate::broker::{BrokerSending, Statistics};
use crate::persistence::{Metadata, PendingStore, StoreError};
use crate::protocol::Payload;

pub const MAX_REQUEST_BODY_BYTES: usize = 4 * 1024;
pub const JSON_MEDIA_TYPE: &str = "application/json";

/// An API error, sent back as `{"error":<label>,"message":<text>}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    #[serde(rename = "error")]
    pub label: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Payload>,
}

impl ApiError {
    fn new(status: StatusCode, label: &'static str, message: &'static str) -> Self {
        Self {
            status,
            label,
            message,
            extra: None,
        }
    }

    fn with_extra(mut self, extra: Option<Payload>) -> Self {
        self.extra = extra;
        self
    }

    fn no_content_length() -> Self {
        Self::new(
            StatusCode::LENGTH_REQUIRED,
            "invalid-request",
            "A Content-Length must be provided",
        )
    }

    fn body_empty() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-request", "Request body empty")
    }

    fn body_too_large() -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid-request",
            "Request body too large",
        )
    }

    fn wrong_content_type() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "invalid-request",
            "Wrong content type, should be application/json",
        )
    }

    fn wrong_method() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "invalid-request",
            "Wrong request method, should be POST",
        )
    }

    fn malformed_json() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-request", "Malformed JSON Object")
    }

    fn could_not_read_body() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "io-error", "Could not read request body")
    }

    fn missing_id() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-request", "Missing id field")
    }

    fn missing_data() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-request", "Missing data field")
    }

    fn invalid_expiration() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-request", "Invalid expiration date")
    }

    fn past_expiration() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-request", "Past expiration date")
    }

    fn unknown_channel() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unknown-channel", "Unknown channel")
    }

    fn unknown_token() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unknown-token", "Unknown token")
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized")
    }

    fn unknown() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "Unknown error")
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "INTERNAL SERVER ERROR",
        )
    }

    fn could_not_store() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "Could not store notification",
        )
    }

    fn could_not_resolve_token() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "Could not resolve token",
        )
    }

    fn could_not_make_token() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "Could not make token",
        )
    }

    fn too_many_pending() -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "too-many-pending",
            "Too many pending notifications for this application",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(&self)).into_response()
    }
}

/// `POST /broadcast` body.
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub expire_on: String,
    pub data: Option<Payload>,
}

/// `POST /notify` body.
#[derive(Debug, Deserialize)]
pub struct UnicastRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default, rename = "userid")]
    pub user_id: String,
    #[serde(default, rename = "deviceid")]
    pub device_id: String,
    #[serde(default, rename = "appid")]
    pub app_id: String,
    #[serde(default)]
    pub expire_on: String,
    pub data: Option<Payload>,
    /// Clears the app's pending notifications first.
    #[serde(default)]
    pub clear_pending: bool,
    /// Replaces the app's pending notifications carrying the same tag.
    #[serde(default)]
    pub replace_tag: String,
}

/// `POST /register` body.
#[derive(Debug, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default, rename = "deviceid")]
    pub device_id: String,
    #[serde(default, rename = "appid")]
    pub app_id: String,
}

/// Basic auth credentials guarding `/stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsAuth {
    pub user: String,
    pub password: String,
}

/// What the API handlers work with.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn PendingStore>,
    pub broker: Arc<dyn BrokerSending>,
    pub stats: Arc<Statistics>,
    pub max_notifications_per_app: usize,
    /// Device listener addresses handed out by `/delivery-hosts`.
    pub delivery_hosts: Vec<String>,
    pub delivery_domain: String,
    /// `None` leaves `/stats` open.
    pub stats_auth: Option<StatsAuth>,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn PendingStore>,
        broker: Arc<dyn BrokerSending>,
        stats: Arc<Statistics>,
        max_notifications_per_app: usize,
    ) -> Self {
        Self {
            store,
            broker,
            stats,
            max_notifications_per_app,
            delivery_hosts: Vec::new(),
            delivery_domain: String::new(),
            stats_auth: None,
        }
    }
}

/// Routes of the API. A panicking handler answers 500 with an `internal`
/// error.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/broadcast", any(handle_broadcast))
        .route("/notify", any(handle_unicast))
        .route("/register", any(handle_register))
        .route("/delivery-hosts", get(handle_delivery_hosts))
        .route("/stats", get(handle_stats))
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_to_500))
}

fn panic_to_500(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("serving http: {detail}");
    ApiError::internal().into_response()
}

/// Serves the API on `listener` until the future is dropped.
pub async fn serve_api(listener: tokio::net::TcpListener, state: ApiState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(json!({ "ok": true })))
}

fn check_request_as_post(request: &Request) -> Result<(), ApiError> {
    if request.method() != Method::POST {
        return Err(ApiError::wrong_method());
    }
    let content_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .ok_or_else(ApiError::no_content_length)?
        .to_str()
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(ApiError::no_content_length)?;
    if content_length == 0 {
        return Err(ApiError::body_empty());
    }
    if content_length > MAX_REQUEST_BODY_BYTES {
        return Err(ApiError::body_too_large());
    }
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if content_type != Some(JSON_MEDIA_TYPE) {
        return Err(ApiError::wrong_content_type());
    }
    Ok(())
}

/// Checks that the request is a well-formed JSON POST and parses its body.
async fn read_json<T: DeserializeOwned>(request: Request) -> Result<T, ApiError> {
    check_request_as_post(&request)?;
    let body = to_bytes(request.into_body(), MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|_| ApiError::could_not_read_body())?;
    serde_json::from_slice(&body).map_err(|_| ApiError::malformed_json())
}

fn check_cast_common(data: &Option<Payload>, expire_on: &str) -> Result<DateTime<Utc>, ApiError> {
    if data.is_none() {
        return Err(ApiError::missing_data());
    }
    let expire = DateTime::parse_from_rfc3339(expire_on)
        .map_err(|_| ApiError::invalid_expiration())?
        .with_timezone(&Utc);
    if expire < Utc::now() {
        return Err(ApiError::past_expiration());
    }
    Ok(expire)
}

async fn handle_broadcast(State(state): State<ApiState>, request: Request) -> ApiResult {
    let bcast: BroadcastRequest = read_json(request).await?;
    let expire = check_cast_common(&bcast.data, &bcast.expire_on)?;
    let chan_id = state
        .store
        .get_internal_channel_id(&bcast.channel)
        .map_err(|e| match e {
            StoreError::UnknownChannel => ApiError::unknown_channel(),
            _ => ApiError::unknown(),
        })?;
    let data = bcast.data.ok_or_else(ApiError::missing_data)?;
    if let Err(e) = state.store.append_to_channel(&chan_id, data, expire) {
        error!("could not store notification: {e}");
        return Err(ApiError::could_not_store());
    }
    debug!("broadcast on {chan_id} expiring {expire}");
    state.broker.broadcast(chan_id).await;
    ok()
}

fn check_unicast(ucast: &UnicastRequest) -> Result<DateTime<Utc>, ApiError> {
    if ucast.app_id.is_empty() {
        return Err(ApiError::missing_id());
    }
    if ucast.token.is_empty() && (ucast.user_id.is_empty() || ucast.device_id.is_empty()) {
        return Err(ApiError::missing_id());
    }
    check_cast_common(&ucast.data, &ucast.expire_on)
}

/// Message ids are base64 encoded random UUIDs.
fn generate_msg_id() -> String {
    base64::engine::general_purpose::STANDARD.encode(uuid::Uuid::new_v4().as_bytes())
}

async fn handle_unicast(State(state): State<ApiState>, request: Request) -> ApiResult {
    let ucast: UnicastRequest = read_json(request).await?;
    let expire = check_unicast(&ucast)?;
    let store = &state.store;
    let chan_id = store
        .get_internal_channel_id_from_token(
            &ucast.token,
            &ucast.app_id,
            &ucast.user_id,
            &ucast.device_id,
        )
        .map_err(|e| match e {
            StoreError::UnknownToken => ApiError::unknown_token(),
            StoreError::Unauthorized => ApiError::unauthorized(),
            e => {
                error!("could not resolve token: {e}");
                ApiError::could_not_resolve_token()
            }
        })?;

    let (_, notifications, meta) = store.get_channel_unfiltered(&chan_id).map_err(|e| {
        error!("could not peek at notifications: {e}");
        ApiError::could_not_store()
    })?;
    let now = Utc::now();
    let mut expired = 0;
    let mut replaceable = 0;
    let mut for_app = 0;
    let mut last = None;
    for (notification, meta) in notifications.into_iter().zip(&meta) {
        if meta.is_expired(now) {
            expired += 1;
            continue;
        }
        if notification.app_id == ucast.app_id {
            if !ucast.replace_tag.is_empty() && ucast.replace_tag == meta.replace_tag {
                replaceable += 1;
                continue;
            }
            for_app += 1;
        }
        last = Some(notification);
    }

    let scrub_criteria = if ucast.clear_pending {
        Some((ucast.app_id.as_str(), None))
    } else if for_app >= state.max_notifications_per_app {
        return Err(ApiError::too_many_pending().with_extra(last.map(|n| n.payload)));
    } else if replaceable > 0 {
        Some((ucast.app_id.as_str(), Some(ucast.replace_tag.as_str())))
    } else {
        None
    };
    if expired > 0 || scrub_criteria.is_some() {
        let (app_id, replace_tag) = scrub_criteria.unzip();
        if let Err(e) = store.scrub(&chan_id, app_id, replace_tag.flatten()) {
            error!("could not scrub channel: {e}");
            return Err(ApiError::could_not_store());
        }
    }

    let msg_id = generate_msg_id();
    let meta = Metadata {
        expiration: Some(expire),
        replace_tag: ucast.replace_tag,
    };
    let data = ucast.data.ok_or_else(ApiError::missing_data)?;
    if let Err(e) = store.append_to_unicast_channel(&chan_id, &ucast.app_id, data, &msg_id, meta) {
        error!("could not store notification: {e}");
        return Err(ApiError::could_not_store());
    }
    debug!("unicast {msg_id} for {} on {chan_id}", ucast.app_id);
    state.broker.unicast(&[chan_id]).await;
    ok()
}

async fn handle_register(State(state): State<ApiState>, request: Request) -> ApiResult {
    let reg: RegistrationRequest = read_json(request).await?;
    if reg.device_id.is_empty() || reg.app_id.is_empty() {
        return Err(ApiError::missing_id());
    }
    let token = state
        .store
        .register(&reg.device_id, &reg.app_id)
        .map_err(|e| {
            error!("could not make a token: {e}");
            ApiError::could_not_make_token()
        })?;
    Ok(Json(json!({ "ok": true, "token": token })))
}

async fn handle_delivery_hosts(State(state): State<ApiState>) -> Response {
    let body = json!({
        "hosts": state.delivery_hosts,
        "domain": state.delivery_domain,
    });
    ([(header::CACHE_CONTROL, "no-cache")], Json(body)).into_response()
}

/// Whether the `Authorization` header carries the expected basic auth.
fn basic_auth_matches(request: &Request, auth: &StatsAuth) -> bool {
    let Some(encoded) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    pair.split_once(':')
        .is_some_and(|(user, password)| user == auth.user && password == auth.password)
}

async fn handle_stats(State(state): State<ApiState>, request: Request) -> Response {
    if let Some(auth) = &state.stats_auth {
        if !basic_auth_matches(&request, auth) {
            return (
                [(header::WWW_AUTHENTICATE, r#"Basic realm="Restricted""#)],
                ApiError::unauthorized(),
            )
                .into_response();
        }
    }
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Json(state.stats.report()),
    )
        .into_response()
}
