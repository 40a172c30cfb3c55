use url::Url;

use crate::error::{DriftnetError, Result};

/// Canonicalize a source URL for use as a stable identity key.
///
/// http/https URLs get: lowercased scheme and host (the parser's doing),
/// fragment stripped, one trailing slash trimmed from the path, and query
/// parameters percent-encoded and sorted by key then value. The scheme is
/// never rewritten; http and https are distinct resources.
///
/// Any other scheme (including synthetic ones like `question://<id>`) and
/// bare relative paths (document sources) pass through unchanged.
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DriftnetError::InvalidInput("empty URL".into()));
    }

    let mut parsed = match Url::parse(trimmed) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => u,
        Ok(_) => return Ok(trimmed.to_string()),
        // A bare path like `reports/q3.pdf` is a document source identity.
        Err(url::ParseError::RelativeUrlWithoutBase) => return Ok(trimmed.to_string()),
        Err(e) => return Err(DriftnetError::InvalidInput(format!("invalid URL: {e}"))),
    };

    if parsed.host_str().is_none() {
        return Err(DriftnetError::InvalidInput("URL has no host".into()));
    }

    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        pairs.sort();
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        parsed.set_query(Some(&encoded));
    }

    let path = parsed.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed_path = path[..path.len() - 1].to_string();
        parsed.set_path(&trimmed_path);
    }

    Ok(parsed.to_string())
}
