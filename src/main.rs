use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use feedrelay::core::types::{
    resolve_page_url, ErrorResponse, StartRequest, StartResponse, StatusResponse, StopResponse,
};
use feedrelay::session::{SessionConfig, SessionHandle};
use feedrelay::AppState;

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

fn port_from_env() -> Option<u16> {
    for k in ["FEEDRELAY_PORT", "PORT"] {
        if let Ok(v) = std::env::var(k) {
            if let Ok(p) = v.trim().parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting feedrelay control server");

    // Shared HTTP client — vision calls and frame uploads. Per-request
    // timeouts are set where they matter; this is the transport default.
    let http_timeout = env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let connect_timeout = env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(http_timeout))
        .connect_timeout(Duration::from_secs(connect_timeout))
        .build()?;

    let state = Arc::new(AppState::new(http_client));

    let app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let port: u16 = parse_port_from_args().or_else(port_from_env).unwrap_or(5000);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PORT/FEEDRELAY_PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("feedrelay listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
            _ = async {
                if let Some(ref mut s) = sigint {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    // Release the browser before the process exits.
    let handle = state.session.lock().await.take();
    if let Some(session) = handle {
        info!("shutdown: stopping active session {}", session.id);
        session.stop().await;
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "feedrelay",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// `POST /start` — launch a session. Refuses with 409 while one is active;
/// a finished (stopped/failed) handle in the slot is silently replaced.
async fn start_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, (StatusCode, Json<ErrorResponse>)> {
    let page_url = resolve_page_url(&req).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: e.to_string() }),
        )
    })?;

    let interval_sec = req
        .interval_sec
        .filter(|&s| s > 0)
        .unwrap_or_else(|| state.config.resolve_default_interval_sec());

    let upload_url = req
        .upload_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .or_else(|| state.config.resolve_default_upload_url())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "no upload_url in request and no default configured".to_string(),
                }),
            )
        })?;

    let mut slot = state.session.lock().await;
    if let Some(existing) = slot.as_ref() {
        if existing.is_active() {
            warn!("start refused: session {} still active", existing.id);
            return Err((
                StatusCode::CONFLICT,
                Json(ErrorResponse {
                    error: "a session is already active".to_string(),
                }),
            ));
        }
    }

    let handle = SessionHandle::spawn(
        state.http_client.clone(),
        Arc::clone(&state.config),
        SessionConfig {
            page_url: page_url.clone(),
            capture_interval: Duration::from_secs(interval_sec),
            upload_url,
        },
    );
    *slot = Some(handle);

    Ok(Json(StartResponse {
        page_url,
        interval_sec,
    }))
}

/// `POST /stop` — idempotent: stopping with no session is a success.
async fn stop_handler(State(state): State<Arc<AppState>>) -> Json<StopResponse> {
    let handle = state.session.lock().await.take();
    match handle {
        Some(session) => {
            session.stop().await;
            Json(StopResponse { stopped: true })
        }
        None => Json(StopResponse { stopped: false }),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let slot = state.session.lock().await;
    match slot.as_ref() {
        Some(session) => Json(session.status()),
        None => Json(StatusResponse {
            running: false,
            page_url: None,
            interval_sec: None,
            state: None,
            solve_attempts: None,
            started_at: None,
        }),
    }
}
