//! REST API

pub mod models;
pub mod routes;

pub use routes::{create_api_routes, AppState};
