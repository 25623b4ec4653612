//! Inbound HTTP surface of the video insight service
//!
//! One webhook endpoint receives every platform event; a health endpoint
//! answers liveness probes. State wiring lives here so integration tests
//! can assemble the router around fake collaborators.

mod config;
mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use insight_artifacts::ArtifactManager;
use insight_events::DedupCache;
use insight_notify::{ChatConfig, ChatNotifier, Notifier};
use insight_orchestrator::{JobOrchestrator, JobPolicy};
use insight_pipeline::{
    AnalysisConfig, BitableConfig, BitableStore, CommandExtractor, HttpMediaFetcher, PipelineDeps,
    SpeechTranscriber, TranscriberConfig, VisionAnalysisClient,
};
use insight_session::SessionStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::AppConfig;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub dedup: Arc<Mutex<DedupCache>>,
    pub orchestrator: JobOrchestrator,
    pub notifier: Arc<dyn Notifier>,
    pub artifacts: ArtifactManager,
    pub verification_token: String,
}

impl AppState {
    /// Wire the production collaborators from configuration.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let sessions = SessionStore::new();
        let artifacts = ArtifactManager::new();
        let notifier: Arc<dyn Notifier> = Arc::new(ChatNotifier::new(ChatConfig {
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            domain: config.domain.clone(),
        }));

        let deps = PipelineDeps {
            table: Arc::new(BitableStore::new(BitableConfig {
                domain: config.domain.clone(),
                app_id: config.app_id.clone(),
                app_secret: config.app_secret.clone(),
            })),
            fetcher: Arc::new(HttpMediaFetcher::new()),
            extractor: Arc::new(CommandExtractor::new(config.ffmpeg_path.clone())),
            transcriber: Arc::new(SpeechTranscriber::new(TranscriberConfig {
                endpoint: config.asr_endpoint.clone(),
                api_key: config.asr_api_key.clone(),
                model: config.asr_model.clone(),
            })),
            analyzer: Arc::new(VisionAnalysisClient::new(AnalysisConfig {
                endpoint: config.analysis_endpoint.clone(),
                api_key: config.analysis_api_key.clone(),
                model: config.analysis_model.clone(),
            })),
        };

        let policy = JobPolicy {
            work_root: config.work_root.clone(),
            ..JobPolicy::default()
        };
        let orchestrator = JobOrchestrator::new(
            sessions.clone(),
            artifacts.clone(),
            notifier.clone(),
            deps,
            policy,
        );

        Self {
            sessions,
            dedup: Arc::new(Mutex::new(DedupCache::default())),
            orchestrator,
            notifier,
            artifacts,
            verification_token: config.verification_token.clone(),
        }
    }
}

/// Build the router with all endpoints.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/webhook/event", post(handlers::webhook_event))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn start_server(addr: &str, state: AppState) -> Result<(), std::io::Error> {
    tracing::info!("starting webhook server on {addr}");
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
