use axum::routing::{get, post};
use axum::Router;

pub mod audit;
pub mod envelope;
pub mod identity;
pub mod keys;

use crate::ServiceState;

pub fn router(state: ServiceState) -> Router<ServiceState> {
    Router::new()
        .route("/keys", get(keys::handler))
        .route("/keys/rotate", post(keys::rotate_handler))
        .route("/envelope", post(envelope::handler))
        .route("/audit", get(audit::handler))
        .nest("/identity", identity::router(state.clone()))
        .with_state(state)
}
