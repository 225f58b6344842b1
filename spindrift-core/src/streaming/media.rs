//! Media-format knowledge used by prioritization and the HTTP layer.

/// Formats whose trailing bytes are not useful seek/duration metadata.
///
/// Most containers place duration and seek tables in the last bytes of the
/// file, so fetching the final piece early lets players report duration
/// immediately. AVI keeps its index unreliable for progressive playback, so
/// its trailing piece gets no special treatment.
const TRAILING_METADATA_UNRELIABLE: &[&str] = &["avi"];

/// Lower-cased extension of a file name, if any.
fn extension(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Whether the trailing piece of this file should skip early prioritization.
pub fn trailing_metadata_unreliable(name: &str) -> bool {
    extension(name)
        .map(|ext| TRAILING_METADATA_UNRELIABLE.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// MIME type for a file name, by extension.
pub fn content_type(name: &str) -> &'static str {
    match extension(name).as_deref() {
        Some("mp4") => "video/mp4",
        Some("m4v") => "video/x-m4v",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("flv") => "video/x-flv",
        Some("wmv") => "video/x-ms-wmv",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        Some("aac") => "audio/aac",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        _ => "application/octet-stream",
    }
}
