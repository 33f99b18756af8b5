use axum::Router;

pub mod jobs;
pub mod system;

/// Router for every job endpoint.
pub fn router() -> Router {
    Router::new().nest("/jobs", jobs::router())
}
