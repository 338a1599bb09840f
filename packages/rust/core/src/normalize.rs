//! Candidate validation and normalization.
//!
//! Everything downstream of this stage reads typed fields only; the raw
//! payload is consulted here and nowhere else.

use serde_json::Value;

use regwatch_shared::{
    CandidateRecord, IdentityStrategy, NormalizedRecord, Priority, RegwatchError, Result,
    SourceConfig, canonical_sectors, canonicalize_url, content_hash_identity,
    identity::normalize_text,
};
use regwatch_sources::parse_date;

/// Validate a candidate and turn it into a [`NormalizedRecord`].
///
/// Fails with a validation error (never retried) when the headline or URL is
/// unusable. Payload fields win over source-level defaults.
pub fn normalize(candidate: &CandidateRecord, source: &SourceConfig) -> Result<NormalizedRecord> {
    let headline = normalize_text(&candidate.headline);
    if headline.is_empty() {
        return Err(RegwatchError::validation(format!(
            "{}: candidate has an empty headline",
            source.code
        )));
    }
    if candidate.url.trim().is_empty() {
        return Err(RegwatchError::validation(format!(
            "{}: candidate '{headline}' has no url",
            source.code
        )));
    }
    let url = canonicalize_url(&candidate.url)?;

    let authority = match candidate.authority.trim() {
        "" => source.code.clone(),
        a => a.to_string(),
    };

    let identity = match source.identity {
        IdentityStrategy::Url => url.clone(),
        IdentityStrategy::ContentHash => {
            content_hash_identity(&authority, &headline, candidate.published_date)
        }
    };

    let payload = &candidate.raw_payload;
    let summary = payload
        .get("summary")
        .and_then(Value::as_str)
        .map(normalize_text)
        .filter(|s| !s.is_empty());

    let country = payload
        .get("country")
        .and_then(Value::as_str)
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .or_else(|| source.country.clone());

    let payload_sectors = string_list(payload.get("sectors"));
    let sectors = if payload_sectors.is_empty() {
        canonical_sectors(&source.sectors)
    } else {
        canonical_sectors(&payload_sectors)
    };

    let priority = payload.get("priority").map(Priority::from_raw).unwrap_or_default();

    let deadline = payload
        .get("deadline")
        .and_then(Value::as_str)
        .and_then(parse_date);

    Ok(NormalizedRecord {
        identity,
        headline,
        url,
        authority,
        published_date: candidate.published_date,
        summary,
        country,
        sectors: sectors.into_iter().collect(),
        priority,
        deadline,
    })
}

/// A JSON array of strings, or one comma/semicolon separated string.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use regwatch_shared::SourceKind;

    fn source() -> SourceConfig {
        let mut s = SourceConfig::new("FCA", SourceKind::Feed, vec!["https://fca.org.uk/rss".into()]);
        s.country = Some("UK".into());
        s.sectors = vec!["Banks".into()];
        s
    }

    #[test]
    fn fills_defaults_from_source() {
        let c = CandidateRecord::new(
            "  Policy   statement PS24/1 ",
            "https://www.fca.org.uk/news/PS24-1/?utm_source=rss#top",
            "FCA",
            None,
        );
        let r = normalize(&c, &source()).unwrap();
        assert_eq!(r.headline, "Policy statement PS24/1");
        assert_eq!(r.identity, r.url);
        assert!(!r.url.contains("utm_source"));
        assert_eq!(r.country.as_deref(), Some("UK"));
        assert_eq!(r.sectors, vec!["banking".to_string()]);
        assert_eq!(r.priority, Priority::Normal);
    }

    #[test]
    fn payload_overrides_source() {
        let c = CandidateRecord::new("Crypto rules", "https://fca.org.uk/c", "", None)
            .with_field("country", "ie")
            .with_field("sectors", "crypto assets; payments")
            .with_field("priority", "urgent")
            .with_field("summary", " New\n regime ")
            .with_field("deadline", "2025-03-31");
        let r = normalize(&c, &source()).unwrap();
        assert_eq!(r.authority, "FCA");
        assert_eq!(r.country.as_deref(), Some("IE"));
        assert_eq!(r.sectors, vec!["crypto".to_string(), "payments".to_string()]);
        assert_eq!(r.priority, Priority::High);
        assert_eq!(r.summary.as_deref(), Some("New regime"));
        assert_eq!(r.deadline, Some(Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap()));
    }

    #[test]
    fn rejects_missing_url_and_headline() {
        let no_url = CandidateRecord::new("Headline", "  ", "FCA", None);
        assert!(matches!(
            normalize(&no_url, &source()),
            Err(RegwatchError::Validation { .. })
        ));

        let no_headline = CandidateRecord::new(" ", "https://fca.org.uk/x", "FCA", None);
        assert!(matches!(
            normalize(&no_headline, &source()),
            Err(RegwatchError::Validation { .. })
        ));

        let relative = CandidateRecord::new("Headline", "/news/x", "FCA", None);
        assert!(normalize(&relative, &source()).is_err());
    }

    #[test]
    fn content_hash_identity_ignores_url_churn() {
        let mut src = source();
        src.identity = IdentityStrategy::ContentHash;
        let date = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let a = CandidateRecord::new("Notice 12", "https://x.gov/n?session=1", "FCA", date);
        let b = CandidateRecord::new("Notice  12", "https://x.gov/n?session=2", "FCA", date);
        let ra = normalize(&a, &src).unwrap();
        let rb = normalize(&b, &src).unwrap();
        assert_eq!(ra.identity, rb.identity);
        assert!(ra.identity.starts_with("hash:"));
        assert_ne!(ra.url, rb.url);
    }
}
