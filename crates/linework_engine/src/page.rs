use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use engine_logging::engine_debug;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use scraper::{Html, Selector};
use serde::Serialize;

use crate::decode::decode_body;
use crate::retry::ExternalOperation;
use crate::types::{FailureKind, OperationError};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    pub allowed_content_types: Vec<String>,
    /// Keep the decoded document in each [`PageRecord`].
    pub dump_html: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            redirect_limit: 5,
            max_bytes: 5 * 1024 * 1024,
            allowed_content_types: vec![
                "text/html".to_string(),
                "application/xhtml+xml".to_string(),
            ],
            dump_html: false,
        }
    }
}

/// HTTP client owned by one worker, with the redirect count of its last
/// request.
pub struct HttpSession {
    client: reqwest::Client,
    redirects: Arc<AtomicUsize>,
}

/// One fetched page. Displays as a crawl result line: the requested URL, a
/// tab, then the JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    #[serde(skip)]
    pub url: String,
    pub final_url: String,
    pub redirect_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

impl fmt::Display for PageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}\t{}", self.url, json)
    }
}

/// Fetches the URL named by each record.
#[derive(Debug, Clone, Default)]
pub struct PageFetchOperation {
    settings: FetchSettings,
}

impl PageFetchOperation {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    fn is_content_type_allowed(&self, content_type: &str) -> bool {
        let ct = content_type.split(';').next().unwrap_or(content_type).trim();
        self.settings
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ct))
    }

    fn too_large(&self, actual: u64) -> OperationError {
        OperationError::new(
            FailureKind::TooLarge {
                max_bytes: self.settings.max_bytes,
                actual: Some(actual),
            },
            "response too large",
        )
    }
}

#[async_trait::async_trait]
impl ExternalOperation for PageFetchOperation {
    type Session = HttpSession;
    type Output = PageRecord;

    async fn open_session(&self) -> Result<HttpSession, OperationError> {
        let redirects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&redirects);
        let redirect_limit = self.settings.redirect_limit;
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            let count = attempt.previous().len();
            counter.store(count, Ordering::Relaxed);
            if count >= redirect_limit {
                attempt.error("redirect limit exceeded")
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .timeout(self.settings.request_timeout)
            .redirect(policy)
            .build()
            .map_err(|err| OperationError::new(FailureKind::Session, err.to_string()))?;
        Ok(HttpSession { client, redirects })
    }

    async fn execute(
        &self,
        session: &mut HttpSession,
        payload: &[u8],
    ) -> Result<PageRecord, OperationError> {
        let line = std::str::from_utf8(payload)
            .map_err(|err| OperationError::new(FailureKind::InvalidUrl, err.to_string()))?;
        let url = line.split('\t').next().unwrap_or(line).trim();
        let parsed = reqwest::Url::parse(url)
            .map_err(|err| OperationError::new(FailureKind::InvalidUrl, err.to_string()))?;

        session.redirects.store(0, Ordering::Relaxed);
        let response = session
            .client
            .get(parsed)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(OperationError::new(
                FailureKind::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        if let Some(content_len) = response.content_length() {
            if content_len > self.settings.max_bytes {
                return Err(self.too_large(content_len));
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        if let Some(ct) = content_type.as_deref() {
            if !self.is_content_type_allowed(ct) {
                return Err(OperationError::new(
                    FailureKind::UnsupportedContentType {
                        content_type: ct.to_string(),
                    },
                    "unsupported content type",
                ));
            }
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = bytes.len() as u64 + chunk.len() as u64;
            if next_len > self.settings.max_bytes {
                return Err(self.too_large(next_len));
            }
            bytes.extend_from_slice(&chunk);
        }

        let decoded = decode_body(&bytes, content_type.as_deref()).map_err(|err| {
            OperationError::new(
                FailureKind::Decode {
                    encoding: err.encoding.clone(),
                },
                err.to_string(),
            )
        })?;
        engine_debug!(
            "Fetched page url={} final_url={} bytes={} encoding={}",
            url,
            final_url,
            bytes.len(),
            decoded.encoding
        );

        let title = document_title(&decoded.text);
        Ok(PageRecord {
            url: url.to_string(),
            final_url,
            redirect_count: session.redirects.load(Ordering::Relaxed),
            title,
            html: self.settings.dump_html.then_some(decoded.text),
        })
    }
}

fn document_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    doc.select(&selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn map_reqwest_error(err: reqwest::Error) -> OperationError {
    if err.is_timeout() {
        return OperationError::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_redirect() {
        return OperationError::new(FailureKind::RedirectLimitExceeded, err.to_string());
    }
    OperationError::new(FailureKind::Network, err.to_string())
}
