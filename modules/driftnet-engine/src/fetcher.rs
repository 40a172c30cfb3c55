// Conditional HTTP fetching with redirect-time SSRF revalidation.
//
// Redirects are never delegated to the client: the loop below validates
// every hop against the injected guard before following it, which is the
// only way a fetch-time SSRF check can see intermediate targets.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION, USER_AGENT};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use driftnet_common::{content_hash, Config, DriftnetError, Result, UrlGuard};

const MAX_REDIRECTS: usize = 5;

/// Inputs for one conditional GET. Previous-response metadata comes from the
/// source record and short-circuits unchanged content.
#[derive(Debug, Default, Clone)]
pub struct FetchParams<'a> {
    pub url: &'a str,
    pub etag: Option<&'a str>,
    pub last_modified: Option<&'a str>,
    pub previous_hash: Option<&'a str>,
    /// Per-source override; the fetcher default applies when None.
    pub user_agent: Option<&'a str>,
    /// Extra request headers (api sources), already interpolated.
    pub headers: Vec<(String, String)>,
}

impl<'a> FetchParams<'a> {
    pub fn bare(url: &'a str) -> Self {
        Self {
            url,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// 304, or the body hashed to the previous content hash.
    NotModified { http_status: u16 },
    Fetched(FetchedBody),
}

#[derive(Debug)]
pub struct FetchedBody {
    pub body: Vec<u8>,
    pub http_status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: String,
    /// Where the body actually came from, after redirects.
    pub final_url: String,
    /// First 301/308 target seen, so the caller can migrate the stored URL.
    pub permanent_redirect: Option<String>,
}

pub struct Fetcher {
    client: reqwest::Client,
    guard: Arc<dyn UrlGuard>,
    max_body_bytes: usize,
    default_user_agent: String,
}

impl Fetcher {
    pub fn new(config: &Config, guard: Arc<dyn UrlGuard>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_millis(config.fetch_timeout_ms))
            .build()
            .map_err(|e| DriftnetError::InvalidInput(format!("http client: {e}")))?;
        Ok(Self {
            client,
            guard,
            max_body_bytes: config.max_body_bytes,
            default_user_agent: config.user_agent.clone(),
        })
    }

    /// Conditional GET. Every hop, including the first, goes through the
    /// guard; at most 5 redirects are followed.
    pub async fn fetch(&self, params: FetchParams<'_>) -> Result<FetchOutcome> {
        let mut url = Url::parse(params.url)
            .map_err(|e| DriftnetError::InvalidInput(format!("invalid URL: {e}")))?;
        self.guard.check(&url)?;

        let user_agent = params.user_agent.unwrap_or(&self.default_user_agent);
        let mut permanent_redirect: Option<String> = None;

        for _hop in 0..=MAX_REDIRECTS {
            let mut request = self
                .client
                .get(url.clone())
                .header(USER_AGENT, user_agent);
            if let Some(etag) = params.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = params.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
            for (name, value) in &params.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::NotModified {
                    http_status: status.as_u16(),
                });
            }

            if matches!(status.as_u16(), 301 | 302 | 307 | 308) {
                let target = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| DriftnetError::Fetch {
                        status: status.as_u16(),
                        message: "redirect without a Location header".into(),
                    })?;
                let next = url.join(target).map_err(|e| DriftnetError::Fetch {
                    status: status.as_u16(),
                    message: format!("redirect to unparseable target '{target}': {e}"),
                })?;
                self.guard.check(&next).map_err(|e| DriftnetError::Fetch {
                    status: status.as_u16(),
                    message: format!("redirect to {next} refused: {e}"),
                })?;
                if matches!(status.as_u16(), 301 | 308) && permanent_redirect.is_none() {
                    permanent_redirect = Some(next.to_string());
                }
                debug!(from = %url, to = %next, status = status.as_u16(), "Following redirect");
                url = next;
                continue;
            }

            if !status.is_success() {
                return Err(DriftnetError::Fetch {
                    status: status.as_u16(),
                    message: format!("HTTP {status}"),
                });
            }

            let etag = header_string(&response, ETAG);
            let last_modified = header_string(&response, LAST_MODIFIED);
            let body = self.read_capped(response).await?;
            let hash = content_hash(&String::from_utf8_lossy(&body));

            if params.previous_hash == Some(hash.as_str()) {
                return Ok(FetchOutcome::NotModified {
                    http_status: status.as_u16(),
                });
            }

            return Ok(FetchOutcome::Fetched(FetchedBody {
                body,
                http_status: status.as_u16(),
                etag,
                last_modified,
                content_hash: hash,
                final_url: url.to_string(),
                permanent_redirect,
            }));
        }

        Err(DriftnetError::Fetch {
            status: 301,
            message: format!("redirect chain exceeded {MAX_REDIRECTS} hops; redirect to {url} abandoned"),
        })
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>> {
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(DriftnetError::Fetch {
                    status: 200,
                    message: format!("body exceeds {} byte cap", self.max_body_bytes),
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn transport_error(e: reqwest::Error) -> DriftnetError {
    let message = if e.is_timeout() {
        format!("request timed out: {e}")
    } else {
        format!("transport failure: {e}")
    };
    DriftnetError::Fetch { status: 0, message }
}
