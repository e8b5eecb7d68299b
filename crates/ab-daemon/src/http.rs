//! Health and trigger endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;

use crate::bot::GitopsBot;

pub fn router(bot: Arc<GitopsBot>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trigger", post(trigger))
        .with_state(bot)
}

async fn health() -> &'static str {
    "ok"
}

/// Enqueue a coalesced tick and return immediately.
async fn trigger(State(bot): State<Arc<GitopsBot>>) -> (StatusCode, &'static str) {
    bot.trigger_now();
    (StatusCode::ACCEPTED, "triggered async")
}
