use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::media::{MediaClient, MediaPolicy};
use crate::prober::ProbeSettings;
use crate::session::SessionStore;
use crate::tags::{HeuristicClassifier, TagService};
use crate::upstream::BooruClient;

pub mod handlers;
pub mod models;

/// Everything the handlers share.
pub struct AppState {
    pub booru: BooruClient,
    pub tags: TagService,
    pub media: MediaClient,
    pub sessions: SessionStore,
    pub probe_settings: ProbeSettings,
    pub site_url: String,
}

impl AppState {
    pub fn from_config(config: &Config) -> anyhow::Result<AppState> {
        let booru = BooruClient::from_config(config)?;
        let tags = TagService::new(
            config.tag_api_url.clone(),
            &config.user_agent,
            config.tag_lookup_timeout,
            Arc::new(HeuristicClassifier),
        )?;
        let media = MediaClient::new(
            MediaPolicy::new(config.allowed_media_hosts.clone()),
            &config.site_url,
            &config.user_agent,
            config.request_timeout,
        )?;
        Ok(AppState {
            booru,
            tags,
            media,
            sessions: SessionStore::new(),
            probe_settings: ProbeSettings {
                page_size: config.page_size,
                max_pages: config.max_pages,
                strategy: config.count_strategy,
            },
            site_url: config.site_url.clone(),
        })
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/posts", get(handlers::list_posts_handler))
        .route("/api/posts/count", get(handlers::count_handler))
        .route("/api/posts/:id", get(handlers::post_detail_handler))
        .route("/api/tags", get(handlers::tags_handler))
        .route("/api/proxy", get(handlers::proxy_handler))
        .route("/api/download", get(handlers::download_handler))
        .route("/api/sessions", post(handlers::create_session_handler))
        .route(
            "/api/sessions/:id",
            get(handlers::get_session_handler)
                .patch(handlers::update_session_handler)
                .delete(handlers::delete_session_handler),
        )
        .route("/api/sessions/:id/count", get(handlers::session_count_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}
