//! Format-specific text extraction, keyed by lowercased file extension
//! (spec §4.H). Unsupported extensions are the caller's concern to skip.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported extension: {0}")]
    Unsupported(String),
    #[error("failed to parse document: {0}")]
    Decode(String),
}

pub const SUPPORTED_EXTENSIONS: &[&str] = &[".txt", ".md", ".docx", ".pdf"];

pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext)
}

fn read_plain_text(data: &[u8]) -> String {
    String::from_utf8(data.to_vec()).unwrap_or_else(|_| String::from_utf8_lossy(data).into_owned())
}

fn read_docx(data: &[u8]) -> Result<String, ParseError> {
    let docx = docx_rs::read_docx(data).map_err(|e| ParseError::Decode(e.to_string()))?;
    let mut parts = Vec::new();
    for child in docx.document.children {
        if let docx_rs::DocumentChild::Paragraph(paragraph) = child {
            let mut text = String::new();
            for run_child in paragraph.children {
                if let docx_rs::ParagraphChild::Run(run) = run_child {
                    for run_content in run.children {
                        if let docx_rs::RunChild::Text(t) = run_content {
                            text.push_str(&t.text);
                        }
                    }
                }
            }
            parts.push(text);
        }
    }
    Ok(parts.join("\n"))
}

fn read_pdf(data: &[u8]) -> Result<String, ParseError> {
    pdf_extract::extract_text_from_mem(data).map_err(|e| ParseError::Decode(e.to_string()))
}

/// Extracts plain text from `data` based on `ext` (a lowercased extension
/// including the leading dot, e.g. `.pdf`).
pub fn parse_by_extension(ext: &str, data: &[u8]) -> Result<String, ParseError> {
    match ext {
        ".txt" | ".md" => Ok(read_plain_text(data)),
        ".docx" => read_docx(data),
        ".pdf" => read_pdf(data),
        other => Err(ParseError::Unsupported(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_round_trips_utf8() {
        let text = parse_by_extension(".txt", "hello world".as_bytes()).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn plain_text_falls_back_to_lossy_decode() {
        let data = vec![0xFF, 0xFE, b'h', b'i'];
        let text = parse_by_extension(".md", &data).unwrap();
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        assert!(matches!(parse_by_extension(".zip", b""), Err(ParseError::Unsupported(_))));
    }

    #[test]
    fn is_supported_extension_matches_the_four_formats() {
        assert!(is_supported_extension(".txt"));
        assert!(is_supported_extension(".pdf"));
        assert!(!is_supported_extension(".csv"));
    }
}
