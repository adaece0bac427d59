//! Text normalization shared by every ingestion path (spec §4.D).

use std::sync::LazyLock;

use regex::Regex;

static DATA_IMAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<data:image/[^>]+>").unwrap());
static DATA_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)data:image/[^\s)<>"']+"#).unwrap());

/// Trims text and normalizes line endings to LF. Empty or whitespace-only
/// input normalizes to an empty string.
pub fn normalize_text(value: &str) -> String {
    let stripped = value.trim();
    if stripped.is_empty() {
        return String::new();
    }
    stripped.replace("\r\n", "\n").replace('\r', "\n")
}

/// Scrubs embedded base64 image data out of text before it is persisted or
/// sent to the indexing engine.
pub fn sanitize_text(value: &str) -> String {
    let sanitized = DATA_IMAGE_TAG.replace_all(value, "<image data removed>");
    DATA_IMAGE.replace_all(&sanitized, "[image data removed]").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_crlf_and_trims() {
        assert_eq!(normalize_text("  hi\r\nthere\r  "), "hi\nthere");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn sanitize_strips_data_image_uris() {
        let input = "see data:image/png;base64,AAAA here";
        assert_eq!(sanitize_text(input), "see [image data removed] here");
    }
}
