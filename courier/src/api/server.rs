//! API server setup and configuration.

use axum::Router;
use axum::extract::Request;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::config::{env_bool, env_parse, env_string};
use crate::database::DbPool;
use crate::database::repositories::{SqlxPreferenceRepository, SqlxRecipientDirectory};
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::notification::{EventIngest, NotificationService};
use crate::presence::{DirectMessenger, PresenceService};
use crate::utils::{SharedClock, system_clock};

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Request body size limit in bytes
    pub body_limit: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8085,
            enable_cors: true,
            body_limit: 1024 * 1024,
        }
    }
}

impl ApiServerConfig {
    /// Load API server config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `COURIER_API_BIND` (e.g. "127.0.0.1")
    /// - `COURIER_API_PORT` (e.g. "8080")
    /// - `COURIER_API_CORS` (`true`/`false`)
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(bind_address) = env_string("COURIER_API_BIND") {
            config.bind_address = bind_address;
        }

        match env_parse::<u16>("COURIER_API_PORT") {
            Ok(Some(port)) => config.port = port,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring COURIER_API_PORT"),
        }

        if let Some(enable_cors) = env_bool("COURIER_API_CORS") {
            config.enable_cors = enable_cors;
        }

        config
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid API address: {e}")))
    }
}

/// Shared application state.
///
/// Every service is optional so routers can be exercised with only the
/// pieces a test needs; handlers answer 503 for missing ones.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub clock: SharedClock,
    pub pool: Option<DbPool>,
    pub ingest: Option<Arc<EventIngest>>,
    pub notification_service: Option<Arc<NotificationService>>,
    pub presence_service: Option<Arc<PresenceService>>,
    pub messenger: Option<Arc<DirectMessenger>>,
    pub preferences: Option<Arc<SqlxPreferenceRepository>>,
    pub directory: Option<Arc<SqlxRecipientDirectory>>,
    /// Logging configuration for dynamic log level changes
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    /// Create a new application state without services (for testing).
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            clock: system_clock(),
            pool: None,
            ingest: None,
            notification_service: None,
            presence_service: None,
            messenger: None,
            preferences: None,
            directory: None,
            logging_config: None,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_pool(mut self, pool: DbPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_ingest(mut self, ingest: Arc<EventIngest>) -> Self {
        self.ingest = Some(ingest);
        self
    }

    pub fn with_notification_service(mut self, service: Arc<NotificationService>) -> Self {
        self.notification_service = Some(service);
        self
    }

    pub fn with_presence(
        mut self,
        presence: Arc<PresenceService>,
        messenger: Arc<DirectMessenger>,
    ) -> Self {
        self.presence_service = Some(presence);
        self.messenger = Some(messenger);
        self
    }

    pub fn with_user_settings(
        mut self,
        preferences: Arc<SqlxPreferenceRepository>,
        directory: Arc<SqlxRecipientDirectory>,
    ) -> Self {
        self.preferences = Some(preferences);
        self.directory = Some(directory);
        self
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self::with_state(config, AppState::new())
    }

    pub fn with_state(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone())
            .layer(axum::extract::DefaultBodyLimit::max(self.config.body_limit));

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        // Health probes and the socket upgrade stay out of the request log.
        router = router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    if is_quiet_path(req.uri().path()) {
                        Span::none()
                    } else {
                        let mut make_span =
                            tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                        use tower_http::trace::MakeSpan;
                        make_span.make_span(req)
                    }
                })
                .on_request(|req: &Request, span: &Span| {
                    if span.is_disabled() || is_quiet_path(req.uri().path()) {
                        return;
                    }
                    let mut on_request =
                        tower_http::trace::DefaultOnRequest::new().level(tracing::Level::INFO);
                    use tower_http::trace::OnRequest;
                    on_request.on_request(req, span);
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                        if span.is_disabled() {
                            return;
                        }
                        let on_response =
                            tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO);
                        use tower_http::trace::OnResponse;
                        on_response.on_response(res, latency, span);
                    },
                )
                .on_failure(
                    |class: tower_http::classify::ServerErrorsFailureClass,
                     latency: Duration,
                     span: &Span| {
                        if span.is_disabled() {
                            return;
                        }
                        let mut on_failure =
                            tower_http::trace::DefaultOnFailure::new().level(tracing::Level::ERROR);
                        use tower_http::trace::OnFailure;
                        on_failure.on_failure(class, latency, span);
                    },
                ),
        );
        router
    }

    /// Serve until the cancel token fires.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

fn is_quiet_path(path: &str) -> bool {
    path.starts_with("/health") || path == "/ws"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ApiServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 8085);
        assert!(config.enable_cors);
        assert_eq!(config.socket_addr().unwrap().port(), 8085);
    }

    #[test]
    fn test_bad_bind_address_is_config_error() {
        let config = ApiServerConfig {
            bind_address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.socket_addr(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_quiet_paths() {
        assert!(is_quiet_path("/health/live"));
        assert!(is_quiet_path("/ws"));
        assert!(!is_quiet_path("/api/events"));
    }

    #[test]
    fn test_server_creation() {
        let server = ApiServer::new(ApiServerConfig::default());
        assert!(!server.cancel_token().is_cancelled());
        server.shutdown();
        assert!(server.cancel_token().is_cancelled());
    }
}
