use crate::models::AppState;
use axum::Router;

pub mod broadcast_routes;
pub mod home_routes;
pub mod import_routes;
pub mod patient_routes;
pub mod settings_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", patient_routes::router())
        .nest("/api/v1", import_routes::router())
        .nest("/api/v1", broadcast_routes::router())
        .nest("/api/v1", settings_routes::router())
        .merge(home_routes::router())
        .with_state(state)
}
