//! HTTP Range header handling for media streaming
//!
//! Implements the single-range subset of RFC 7233 that media players
//! actually send: `bytes=start-end`, `bytes=start-`, and `bytes=-suffix`.

use axum::http::HeaderMap;

/// Extracts the `Range` header value, if present and valid UTF-8.
pub fn extract_range_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("range")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Parses a single byte range against a file of `total_size` bytes.
///
/// Returns the inclusive `(start, end)` pair, or `None` when the header is
/// not a byte-range spec or does not parse; callers then serve the full
/// file, matching how browsers treat an ignored Range header.
pub fn parse_range(range: &str, total_size: u64) -> Option<(u64, u64)> {
    let spec = range.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: the last N bytes.
        let suffix: u64 = end_str.parse().ok()?;
        if suffix == 0 || total_size == 0 {
            return None;
        }
        let start = total_size.saturating_sub(suffix);
        return Some((start, total_size - 1));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        total_size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    Some((start, end))
}

/// Clamps a parsed range to the file and rejects unsatisfiable starts.
///
/// Returns the safe inclusive range, or `None` when the start lies past the
/// end of the file (HTTP 416 territory).
pub fn validate_range_bounds(start: u64, end: u64, total_size: u64) -> Option<(u64, u64)> {
    if total_size == 0 || start >= total_size || start > end {
        return None;
    }
    Some((start, end.min(total_size - 1)))
}
