// Content extraction adapters. HTML goes through the readability
// transform; local documents go through a pluggable parser seam.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};

use driftnet_common::{content_hash, DriftnetError, Result};

/// How much structure to strip from a fetched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Readability main-content extraction. The default for web sources.
    Auto,
    /// Whole-body text, no boilerplate removal.
    Raw,
}

/// Output of the HTML adapter: cleaned text, a display title, and the
/// stable hash of the cleaned text (the dedup key for web extractions).
#[derive(Debug, Clone)]
pub struct ExtractedContent {
    pub title: String,
    pub text: String,
    pub content_hash: String,
}

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));
static H1_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").expect("valid regex"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

pub struct HtmlExtractor;

impl HtmlExtractor {
    pub fn extract(&self, bytes: &[u8], url: Option<&str>, mode: ExtractMode) -> ExtractedContent {
        let text = match mode {
            ExtractMode::Auto => {
                let parsed_url = url.and_then(|u| url::Url::parse(u).ok());
                let config = TransformConfig {
                    readability: true,
                    main_content: true,
                    return_format: ReturnFormat::Markdown,
                    filter_images: true,
                    filter_svg: true,
                    clean_html: true,
                };
                let input = TransformInput {
                    url: parsed_url.as_ref(),
                    content: bytes,
                    screenshot_bytes: None,
                    encoding: None,
                    selector_config: None,
                    ignore_tags: None,
                };
                transform_content_input(input, &config)
            }
            ExtractMode::Raw => String::from_utf8_lossy(bytes).into_owned(),
        };
        let text = text.trim().to_string();

        let html = String::from_utf8_lossy(bytes);
        let title = sniff_title(&html)
            .or_else(|| first_line(&text))
            .unwrap_or_default();

        let content_hash = content_hash(&text);
        ExtractedContent {
            title,
            text,
            content_hash,
        }
    }
}

/// Pull a display title out of raw HTML: `<title>` first, then the first
/// `<h1>`.
fn sniff_title(html: &str) -> Option<String> {
    for re in [&*TITLE_RE, &*H1_RE] {
        if let Some(cap) = re.captures(html) {
            let inner = TAG_RE.replace_all(&cap[1], " ");
            let cleaned = inner.split_whitespace().collect::<Vec<_>>().join(" ");
            if !cleaned.is_empty() {
                return Some(truncate(&cleaned, 200));
            }
        }
    }
    None
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| truncate(l.trim_start_matches('#').trim(), 200))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

// --- Local documents ---

/// Result of parsing a local document: title, raw text, detected format.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub title: String,
    pub text: String,
    pub format: String,
}

/// Black-box seam for document formats. The engine hands over a path and
/// gets text back; format internals live behind this trait.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument>;
}

/// Default parser: reads the file as text. Title is the first non-empty
/// line, format is the lowercased extension.
pub struct PlainTextParser;

#[async_trait]
impl DocumentParser for PlainTextParser {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            DriftnetError::Fetch {
                status: 0,
                message: format!("cannot read document {}: {e}", path.display()),
            }
        })?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let title = first_line(&text)
            .unwrap_or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
        let format = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "txt".to_string());
        Ok(ParsedDocument { title, text, format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_title_tag_over_h1() {
        let html = "<html><head><title>Page Title</title></head><body><h1>Header</h1></body></html>";
        assert_eq!(sniff_title(html).as_deref(), Some("Page Title"));
    }

    #[test]
    fn falls_back_to_h1() {
        let html = "<html><body><h1>Quantum computing breakthrough</h1><p>body</p></body></html>";
        assert_eq!(
            sniff_title(html).as_deref(),
            Some("Quantum computing breakthrough")
        );
    }

    #[test]
    fn raw_mode_passes_text_through() {
        let extracted = HtmlExtractor.extract(b"plain text body", None, ExtractMode::Raw);
        assert_eq!(extracted.text, "plain text body");
        assert_eq!(extracted.content_hash, content_hash("plain text body"));
    }

    #[test]
    fn auto_mode_strips_markup() {
        let html = b"<html><body><h1>Breaking</h1><p>Something happened downtown.</p></body></html>";
        let extracted = HtmlExtractor.extract(html, Some("https://example.com/a"), ExtractMode::Auto);
        assert!(extracted.text.contains("Something happened downtown"));
        assert!(!extracted.text.contains("<p>"));
        assert_eq!(extracted.title, "Breaking");
    }

    #[tokio::test]
    async fn plain_text_parser_reads_title_and_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        tokio::fs::write(&path, "# Weekly notes\n\nBody of the notes.")
            .await
            .unwrap();

        let parsed = PlainTextParser.parse(&path).await.unwrap();
        assert_eq!(parsed.title, "Weekly notes");
        assert_eq!(parsed.format, "md");
        assert!(parsed.text.contains("Body of the notes."));
    }

    #[tokio::test]
    async fn missing_document_is_a_fetch_error() {
        let err = PlainTextParser
            .parse(Path::new("/nonexistent/file.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.fetch_status(), 0);
    }
}
