use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::sse::Event as SseEvent};

use crate::app::services::{self, AppServices};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Server-sent stream of committed engine events.
pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    services::engine_sse_stream(services)
}
