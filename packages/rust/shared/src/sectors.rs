//! Canonical sector vocabulary.
//!
//! Sources and profiles use free-form sector labels. Scoring compares sets,
//! so both sides are mapped onto one vocabulary first.

use std::collections::BTreeSet;

/// The canonical sector tags.
pub const SECTORS: &[&str] = &[
    "banking",
    "insurance",
    "asset_management",
    "payments",
    "crypto",
    "consumer_credit",
    "pensions",
    "capital_markets",
    "fintech",
    "general",
];

/// Map a free-form label to its canonical tag.
///
/// Unknown labels are kept, lowercased with non-alphanumerics folded to `_`.
pub fn canonical_sector(label: &str) -> Option<String> {
    let key: String = label
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let key = key
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if key.is_empty() {
        return None;
    }

    let canonical = match key.as_str() {
        "bank" | "banks" | "banking" | "retail_banking" | "credit_institutions" => "banking",
        "insurance" | "insurers" | "insurer" | "reinsurance" => "insurance",
        "asset_management" | "asset_managers" | "investment_management" | "funds"
        | "fund_management" | "wealth_management" => "asset_management",
        "payments" | "payment_services" | "e_money" | "emoney" | "payment" => "payments",
        "crypto" | "cryptoassets" | "crypto_assets" | "digital_assets" | "virtual_assets" => {
            "crypto"
        }
        "consumer_credit" | "lending" | "credit" | "mortgages" => "consumer_credit",
        "pensions" | "pension" | "retirement" => "pensions",
        "capital_markets" | "securities" | "markets" | "trading" | "investment_banking" => {
            "capital_markets"
        }
        "fintech" | "regtech" => "fintech",
        "general" | "all" | "cross_sector" => "general",
        other => return Some(other.to_string()),
    };
    Some(canonical.to_string())
}

/// Canonicalize and deduplicate a list of labels.
pub fn canonical_sectors<I, S>(labels: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    labels
        .into_iter()
        .filter_map(|l| canonical_sector(l.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_synonyms() {
        assert_eq!(canonical_sector("Banks").as_deref(), Some("banking"));
        assert_eq!(canonical_sector("Crypto-assets").as_deref(), Some("crypto"));
        assert_eq!(canonical_sector(" Asset Managers ").as_deref(), Some("asset_management"));
    }

    #[test]
    fn keeps_unknown_labels_normalized() {
        assert_eq!(canonical_sector("Energy Trading Firms").as_deref(), Some("energy_trading_firms"));
        assert_eq!(canonical_sector("  "), None);
    }

    #[test]
    fn set_dedupes() {
        let set = canonical_sectors(["bank", "Banking", "insurers"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("banking"));
        assert!(set.contains("insurance"));
    }
}
