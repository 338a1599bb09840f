//! Shared HTTP fetching with error classification.
//!
//! Every adapter goes through [`HttpFetcher`] so that timeouts, rate limits and
//! bot challenges are reported the same way regardless of source format.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use regwatch_shared::{RegwatchError, Result, TransientKind};

/// User-Agent string for source requests.
const USER_AGENT: &str = concat!("regwatch/", env!("CARGO_PKG_VERSION"));

/// Body fragments served by common anti-bot interstitials.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf-challenge",
    "challenge-platform",
    "just a moment...",
    "attention required!",
    "please enable javascript and cookies",
    "g-recaptcha",
    "h-captcha",
    "ddos-guard",
];

/// Only the head of the body is scanned for challenge markers.
const CHALLENGE_SCAN_BYTES: usize = 16 * 1024;

/// HTTP client shared by all adapters.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| {
                RegwatchError::transient(
                    TransientKind::Network,
                    format!("failed to build HTTP client: {e}"),
                )
            })?;
        Ok(Self { client })
    }

    /// GET `url` and return the body, classifying every failure.
    ///
    /// `timeout` bounds this single request; the adapter harness bounds the whole call.
    pub async fn get_text(&self, source: &str, url: &str, timeout: Duration) -> Result<String> {
        debug!(source, url, "fetching");

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_request_error(source, url, &e))?;

        let status = response.status();
        if let Some(err) = classify_status(source, url, status) {
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_request_error(source, url, &e))?;

        if looks_like_challenge(&body) {
            return Err(RegwatchError::transient(
                TransientKind::BotChallenge,
                format!("{source}: bot challenge served for {url}"),
            ));
        }

        Ok(body)
    }
}

fn classify_request_error(source: &str, url: &str, e: &reqwest::Error) -> RegwatchError {
    if e.is_timeout() {
        RegwatchError::timeout(format!("{source}: {url} timed out"))
    } else if e.is_connect() || e.is_request() {
        RegwatchError::transient(TransientKind::Network, format!("{source}: {url}: {e}"))
    } else {
        RegwatchError::adapter(source, format!("{url}: {e}"))
    }
}

/// Map an HTTP status onto the error taxonomy. `None` means success.
pub fn classify_status(source: &str, url: &str, status: StatusCode) -> Option<RegwatchError> {
    if status.is_success() {
        return None;
    }
    let err = match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => RegwatchError::transient(
            TransientKind::RateLimited,
            format!("{source}: {url}: HTTP {status}"),
        ),
        StatusCode::FORBIDDEN => RegwatchError::transient(
            TransientKind::BotChallenge,
            format!("{source}: {url}: HTTP {status}"),
        ),
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
            RegwatchError::timeout(format!("{source}: {url}: HTTP {status}"))
        }
        _ => RegwatchError::adapter(source, format!("{url}: HTTP {status}")),
    };
    Some(err)
}

/// Whether a 2xx body is actually an anti-bot interstitial.
pub fn looks_like_challenge(body: &str) -> bool {
    let mut end = body.len().min(CHALLENGE_SCAN_BYTES);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let head = body[..end].to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| head.contains(m))
}
