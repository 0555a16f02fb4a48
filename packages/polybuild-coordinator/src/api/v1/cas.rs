use axum::{
    Router,
    routing::{get, head, put},
};

use crate::api::State;

pub mod check;
pub mod read;
pub mod write;

pub fn router() -> Router<State> {
    Router::new()
        .route("/{id}", head(check::handle))
        .route("/{id}", get(read::handle))
        .route("/{id}", put(write::handle))
}
