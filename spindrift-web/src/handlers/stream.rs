//! Streaming endpoint: 200/206 responses backed by a stream reader.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::Response;
use spindrift_core::StreamError;
use spindrift_core::streaming::media;

use super::range::{extract_range_header, parse_range, validate_range_bounds};
use crate::server::AppState;

/// Serves the selected file, honoring an optional single byte range.
///
/// A ranged GET answers `206 Partial Content` with `Content-Range`; anything
/// else answers `200`. The body streams out of a [`spindrift_core::StreamReader`],
/// so playback starts while the swarm is still downloading. HEAD answers
/// from metadata alone and never constructs a reader.
///
/// # Errors
///
/// - `StatusCode::RANGE_NOT_SATISFIABLE` - If the range starts past the file end
pub async fn stream_file(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response<Body>, StatusCode> {
    let file = state.engine.selected_file();
    let requested = extract_range_header(&headers).and_then(|h| parse_range(&h, file.length));

    let (status, range, content_range) = match requested {
        Some((start, end)) => {
            let (start, end) = validate_range_bounds(start, end, file.length)
                .ok_or(StatusCode::RANGE_NOT_SATISFIABLE)?;
            (
                StatusCode::PARTIAL_CONTENT,
                Some((start, end)),
                Some(format!("bytes {start}-{end}/{}", file.length)),
            )
        }
        None => (StatusCode::OK, None, None),
    };
    let content_length = match range {
        Some((start, end)) => end - start + 1,
        None => file.length,
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, media::content_type(&file.name))
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONTENT_LENGTH, content_length);
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    if method == Method::HEAD {
        return builder
            .body(Body::empty())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
    }

    let reader = state.engine.open_stream(range).map_err(|err| match err {
        StreamError::InvalidRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    })?;

    tracing::debug!(
        "streaming {} bytes of {:?} ({})",
        content_length,
        file.name,
        status
    );
    builder
        .body(Body::from_stream(reader.into_stream()))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
