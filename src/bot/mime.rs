//! MIME type to file extension lookup.

use std::collections::HashMap;

/// Fallback for types we know nothing about.
pub const DEFAULT_EXTENSION: &str = ".bin";

/// Known types, canonical extension first.
const TYPES: &[(&str, &[&str])] = &[
    ("image/jpeg", &[".jpg", ".jpeg", ".jpe", ".jfif"]),
    ("image/png", &[".png"]),
    ("image/gif", &[".gif"]),
    ("image/webp", &[".webp"]),
    ("image/bmp", &[".bmp"]),
    ("image/tiff", &[".tiff", ".tif"]),
    ("image/heic", &[".heic"]),
    ("image/avif", &[".avif"]),
    ("image/svg+xml", &[".svg"]),
    ("video/mp4", &[".mp4", ".m4v"]),
    ("video/3gpp", &[".3gp"]),
    ("video/webm", &[".webm"]),
    ("audio/ogg", &[".ogg", ".opus", ".oga"]),
    ("audio/mpeg", &[".mp3"]),
    ("audio/mp4", &[".m4a"]),
    ("audio/aac", &[".aac"]),
    ("application/pdf", &[".pdf"]),
    ("application/zip", &[".zip"]),
    ("application/json", &[".json"]),
    ("text/plain", &[".txt"]),
];

lazy_static::lazy_static! {
    static ref BY_TYPE: HashMap<&'static str, &'static [&'static str]> =
        TYPES.iter().copied().collect();
}

/// Lowercase essence of a MIME type, without parameters.
fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

/// All known extensions for `mime`, sorted. Empty for unknown types.
pub fn extensions_by_type(mime: &str) -> Vec<&'static str> {
    let mut exts = BY_TYPE
        .get(essence(mime).as_str())
        .map(|exts| exts.to_vec())
        .unwrap_or_default();
    exts.sort_unstable();
    exts
}

/// Extension used when saving a file of type `mime`.
pub fn preferred_extension(mime: &str) -> &'static str {
    BY_TYPE
        .get(essence(mime).as_str())
        .and_then(|exts| exts.first().copied())
        .unwrap_or(DEFAULT_EXTENSION)
}
