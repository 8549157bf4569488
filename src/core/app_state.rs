use std::sync::Arc;

/// Shared state behind the control surface.
///
/// The session slot is the single-owner home for the active session handle —
/// there is no module-level singleton. At most one session may hold the
/// browser at a time; `start` refuses while the slot holds an active handle.
#[derive(Clone)]
pub struct AppState {
    pub http_client: reqwest::Client,
    pub config: Arc<crate::core::config::RelayConfig>,
    pub session: Arc<tokio::sync::Mutex<Option<crate::session::SessionHandle>>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("vision_enabled", &self.config.vision.resolve_api_key().is_some())
            .finish()
    }
}

impl AppState {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            config: Arc::new(crate::core::config::load_relay_config()),
            session: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }
}
