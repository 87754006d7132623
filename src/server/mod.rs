//! HTTP/WebSocket API
//!
//! Thin surface over the runtime: REST for the commanded operations, a
//! WebSocket stream for telegrams. Handlers never touch core state directly —
//! reads go through the concurrent address map and the telegram ring,
//! mutations through the command handle.

mod routes;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tower_http::cors::CorsLayer;

use crate::bus::AddressBus;
use crate::scheduler::RuntimeHandle;
use crate::types::Error;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub handle: RuntimeHandle,
    pub bus: Arc<AddressBus>,
    /// User block modules live here; file management happens in the API
    /// layer, the runtime only gets the reload call.
    pub custom_blocks_dir: PathBuf,
}

/// Structured error body: a stable kind tag plus a human message.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::InUse(_) | Error::AlreadyBound(_) => StatusCode::CONFLICT,
            Error::AmbiguousOutput(_) => StatusCode::CONFLICT,
            Error::TypeCoercion(_)
            | Error::InvalidAddress(_)
            | Error::UnknownType(_)
            | Error::UnknownPort(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router.
pub fn router(state: AppState) -> axum::Router {
    routes::router()
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shutdown future resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
