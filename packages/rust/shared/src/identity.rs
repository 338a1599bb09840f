//! Canonical identity keys and content fingerprints.
//!
//! Two candidates with the same identity are the same announcement. The
//! fingerprint decides whether a re-seen announcement actually changed.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{RegwatchError, Result};

/// Query parameters that only carry tracking data.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "mc_cid", "mc_eid", "_ga", "_hsenc", "_hsmi", "ref",
];

/// Prefix of content-hash identities, to keep them apart from URL identities.
pub const CONTENT_HASH_PREFIX: &str = "hash:";

/// Hex-encoded SHA-256 of `input`.
pub fn sha256_hex(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

/// Canonical form of an announcement URL.
///
/// Lowercases scheme, host and path, drops the fragment, default port,
/// trailing slash and tracking parameters, and sorts the remaining query.
pub fn canonicalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let mut url = Url::parse(trimmed)
        .map_err(|e| RegwatchError::validation(format!("invalid url '{trimmed}': {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(RegwatchError::validation(format!(
            "unsupported url scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(RegwatchError::validation(format!("url '{trimmed}' has no host")));
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    let path = url.path().to_ascii_lowercase();
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    url.set_path(path);

    // The url crate already lowercases the scheme and host and elides default ports.
    let mut canonical = url.to_string();
    if url.path() == "/" && url.query().is_none() {
        canonical = canonical.trim_end_matches('/').to_string();
    }
    Ok(canonical)
}

/// Identity for sources whose URLs are unstable: a hash of authority, headline and date.
pub fn content_hash_identity(
    authority: &str,
    headline: &str,
    published_date: Option<DateTime<Utc>>,
) -> String {
    let date = published_date.map(|d| d.to_rfc3339()).unwrap_or_default();
    let key = format!(
        "{}|{}|{}",
        authority.trim().to_ascii_uppercase(),
        normalize_text(headline),
        date
    );
    format!("{CONTENT_HASH_PREFIX}{}", sha256_hex(key.as_bytes()))
}

/// Fingerprint of the mutable content of a record.
pub fn fingerprint(
    headline: &str,
    summary: Option<&str>,
    published_date: Option<DateTime<Utc>>,
) -> String {
    let date = published_date.map(|d| d.to_rfc3339()).unwrap_or_default();
    let key = format!(
        "{}\n{}\n{}",
        normalize_text(headline),
        normalize_text(summary.unwrap_or_default()),
        date
    );
    sha256_hex(key.as_bytes())
}

/// Collapse whitespace runs and trim.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
