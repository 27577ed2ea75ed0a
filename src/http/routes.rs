use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Telephony signaling webhooks
        .route("/telephony/voice", post(handlers::voice_webhook))
        .route("/telephony/status", post(handlers::status_webhook))
        .route("/telephony/conference", post(handlers::conference_webhook))
        // Per-call media frame channel
        .route("/media/:participant_id", get(handlers::media_channel))
        // Screener / host controls
        .route("/participants", get(handlers::list_participants))
        .route("/participants/:id", get(handlers::get_participant))
        .route("/participants/:id/pickup", post(handlers::pick_up))
        .route("/participants/:id/approve", post(handlers::approve))
        .route("/participants/:id/rescreen", post(handlers::rescreen))
        .route("/participants/:id/onair", post(handlers::put_on_air))
        .route("/participants/:id/hold", post(handlers::put_on_hold))
        .route("/participants/:id/complete", post(handlers::complete))
        .route("/participants/:id/reject", post(handlers::reject))
        // Episodes
        .route("/episodes/start", post(handlers::start_episode))
        .route("/episodes/end", post(handlers::end_episode))
        // Mixer
        .route("/mixer/sources/:id/volume", post(handlers::set_volume))
        .route("/mixer/sources/:id/mute", post(handlers::set_muted))
        .route("/mixer/levels", get(handlers::levels))
        .route("/mixer/assets/play", post(handlers::play_asset))
        .route("/mixer/recording/start", post(handlers::start_recording))
        .route("/mixer/recording/stop", post(handlers::stop_recording))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
