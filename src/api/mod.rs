//! HTTP surface: a single `POST /predict` route.
//!
//! The router is composable: `predict_router()` returns a `Router` that can
//! be mounted on any axum server instance. `server` owns the listener.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;

pub use error::ApiError;
pub use router::predict_router;
pub use server::{serve, start_server_on, PredictServer, ServerError};
