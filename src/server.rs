use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};

use crate::config::{Config, CorsConfig};
use crate::error::WifiError;
use crate::orchestrator::AccessPointKind;
use crate::workflow::{Connectivity, ForgetReport, ScanMode};

/// Every request is serialized through this lock, so transitions never interleave.
pub type AppState = Arc<Mutex<Connectivity>>;

struct ApiError(WifiError);

impl From<WifiError> for ApiError {
    fn from(e: WifiError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WifiError::HardwareUnavailable | WifiError::InterfaceNotFound(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            WifiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            WifiError::NotFound(_) => StatusCode::NOT_FOUND,
            WifiError::ModeConflict { .. } => StatusCode::CONFLICT,
            WifiError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(json!({ "success": false, "message": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Runs a workflow call on its own task. Hyper drops the handler future when
/// the client goes away, which is routine once an access point is suspended;
/// the spawned task still finishes the transition and releases the lock.
async fn detached<T, F>(work: F) -> Result<T, ApiError>
where
    F: Future<Output = crate::error::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result.map_err(ApiError),
        Err(e) => Err(ApiError(WifiError::Task(e.to_string()))),
    }
}

fn ok(message: impl Into<String>, mut data: Value) -> Json<Value> {
    if let Value::Object(map) = &mut data {
        map.insert("success".to_string(), Value::Bool(true));
        map.insert("message".to_string(), Value::String(message.into()));
    }
    Json(data)
}

#[derive(Debug, Deserialize)]
pub struct ListNetworksQuery {
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub force_scan: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub ssid: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForgetRequest {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub bssid: Option<String>,
}

/// Toggle body; the UI sends the flag as a string.
#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub value: String,
}

impl ToggleRequest {
    pub fn enabled(&self) -> bool {
        self.value.trim().eq_ignore_ascii_case("true")
    }
}

pub fn router(state: AppState, config: &Config) -> Router {
    let ui = &config.server.ui_directory;

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/list-networks", get(list_networks))
        .route("/list-connected", get(list_connected))
        .route("/list-saved", get(list_saved))
        .route("/scan-status", get(scan_status))
        .route("/connect", post(connect))
        .route("/forget", post(forget))
        .route("/forget-all", post(forget_all))
        .route("/set-wifi-direct", post(set_wifi_direct))
        .route("/set-wifi-connect", post(set_wifi_connect))
        .route("/get-wifi-direct", get(get_wifi_direct))
        .route("/get-wifi-connect", get(get_wifi_connect))
        .route_service("/", ServeFile::new(ui.join("index.html")))
        .nest_service("/ui", ServeDir::new(ui))
        .with_state(state);

    if let Some(cors) = cors_layer(&config.cors) {
        app = app.layer(cors);
    }
    app
}

fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }

    let origin = if config.origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", o);
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

pub async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let connectivity = Connectivity::from_config(Arc::clone(&config));
    let state: AppState = Arc::new(Mutex::new(connectivity));

    // Requests queue on the lock until recovery has finished.
    let recovery = Arc::clone(&state);
    tokio::spawn(async move {
        let mode = recovery.lock().await.startup().await;
        info!("Startup recovery finished in {:?}", mode);
    });

    let app = router(Arc::clone(&state), &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    state.lock().await.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health(State(state): State<AppState>) -> ApiResult {
    state.lock().await.health().await?;
    Ok(ok("WiFi API is running", json!({ "status": "healthy" })))
}

async fn list_networks(
    State(state): State<AppState>,
    Query(query): Query<ListNetworksQuery>,
) -> ApiResult {
    let mode = ScanMode::from_flags(query.use_cache, query.force_scan);
    let report = detached(async move { state.lock().await.scan(mode).await }).await?;
    Ok(ok(
        format!("Found {} network(s)", report.networks.len()),
        json!(report),
    ))
}

async fn list_connected(State(state): State<AppState>) -> ApiResult {
    let connected = state.lock().await.list_connected().await?;
    let message = match &connected {
        Some(network) => format!("Connected to {}", network.ssid),
        None => "Not connected".to_string(),
    };
    Ok(ok(message, json!({ "connected": connected })))
}

async fn list_saved(State(state): State<AppState>) -> ApiResult {
    let saved = state.lock().await.list_saved().await?;
    Ok(ok(
        format!("{} saved network(s)", saved.len()),
        json!({ "saved_networks": saved }),
    ))
}

async fn scan_status(State(state): State<AppState>) -> ApiResult {
    let status = state.lock().await.scan_status().await?;
    Ok(ok("Scan status", json!(status)))
}

async fn connect(State(state): State<AppState>, Json(request): Json<ConnectRequest>) -> ApiResult {
    let ConnectRequest { ssid, passphrase } = request;
    let network = detached(async move {
        state
            .lock()
            .await
            .connect(&ssid, passphrase.as_deref())
            .await
    })
    .await?;
    Ok(ok(
        format!("Connected to {}", network.ssid),
        json!({ "connected": network }),
    ))
}

fn forget_response(report: ForgetReport, message: String) -> Json<Value> {
    let success = report.is_complete();
    let mut body = ok(message, json!(report));
    body.0["success"] = Value::Bool(success);
    body
}

async fn forget(State(state): State<AppState>, Json(request): Json<ForgetRequest>) -> ApiResult {
    let ForgetRequest { ssid, bssid } = request;
    let report = detached(async move {
        state
            .lock()
            .await
            .forget(ssid.as_deref(), bssid.as_deref())
            .await
    })
    .await?;
    let message = if report.is_complete() {
        format!("Forgot {} network(s)", report.deleted.len())
    } else {
        format!(
            "Forgot {} network(s), failed to forget: {}",
            report.deleted.len(),
            failed_names(&report)
        )
    };
    Ok(forget_response(report, message))
}

async fn forget_all(State(state): State<AppState>) -> ApiResult {
    let report = detached(async move { state.lock().await.forget_all().await }).await?;
    let message = if report.deleted.is_empty() && report.is_complete() {
        "No saved networks to forget".to_string()
    } else if report.is_complete() {
        format!("Successfully forgot {} networks", report.deleted.len())
    } else {
        format!(
            "Forgot {} networks. Failed to forget: {}",
            report.deleted.len(),
            failed_names(&report)
        )
    };
    Ok(forget_response(report, message))
}

fn failed_names(report: &ForgetReport) -> String {
    report
        .failed
        .iter()
        .map(|f| f.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn set_access_point(state: AppState, kind: AccessPointKind, request: ToggleRequest) -> ApiResult {
    let enabled = request.enabled();
    let value = detached(async move { state.lock().await.set_access_point(kind, enabled).await })
        .await?;
    let message = format!(
        "{} access point {}",
        kind,
        if value { "enabled" } else { "disabled" }
    );
    Ok(ok(message, json!({ "value": value })))
}

async fn set_wifi_direct(State(state): State<AppState>, Json(request): Json<ToggleRequest>) -> ApiResult {
    set_access_point(state, AccessPointKind::Direct, request).await
}

async fn set_wifi_connect(State(state): State<AppState>, Json(request): Json<ToggleRequest>) -> ApiResult {
    set_access_point(state, AccessPointKind::Connect, request).await
}

async fn access_point_status(state: AppState, kind: AccessPointKind) -> ApiResult {
    let value = state.lock().await.access_point_status(kind).await?;
    let message = format!("{} access point is {}", kind, if value { "active" } else { "inactive" });
    Ok(ok(message, json!({ "value": value })))
}

async fn get_wifi_direct(State(state): State<AppState>) -> ApiResult {
    access_point_status(state, AccessPointKind::Direct).await
}

async fn get_wifi_connect(State(state): State<AppState>) -> ApiResult {
    access_point_status(state, AccessPointKind::Connect).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_accepts_any_case_of_true() {
        let parse = |v: &str| ToggleRequest { value: v.to_string() }.enabled();
        assert!(parse("true"));
        assert!(parse("TRUE "));
        assert!(!parse("false"));
        assert!(!parse("yes"));
    }

    #[test]
    fn list_networks_defaults_to_cache() {
        let query: ListNetworksQuery = serde_json::from_str("{}").unwrap();
        assert!(query.use_cache);
        assert!(!query.force_scan);
    }

    #[test]
    fn success_fields_are_merged_into_payload() {
        let Json(body) = ok("done", json!({ "value": true }));
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "done");
        assert_eq!(body["value"], true);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let status = |e: WifiError| ApiError(e).into_response().status();
        assert_eq!(status(WifiError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(WifiError::InvalidRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(WifiError::HardwareUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(WifiError::ModeConflict {
                requested: AccessPointKind::Direct,
                active: AccessPointKind::Connect,
            }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn disabled_cors_adds_no_layer() {
        let config = CorsConfig {
            enabled: false,
            origins: vec!["*".to_string()],
        };
        assert!(cors_layer(&config).is_none());
    }
}
