//! # Ignore Filter
//!
//! Per-sender ticker suppression. The list lives in a JSON file shaped as
//! `{"<sender>": ["<ticker>", ...]}` and is read when a session opens, so
//! edits take effect for new connections without a restart.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::store::{read_json, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    /// Sender to lowercased tickers.
    rules: HashMap<String, HashSet<String>>,
}

impl IgnoreList {
    pub fn new(rules: HashMap<String, Vec<String>>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(sender, tickers)| {
                let tickers = tickers.iter().map(|t| t.to_lowercase()).collect();
                (sender, tickers)
            })
            .collect();
        Self { rules }
    }

    /// Loads the list from `path`. A missing file is an empty list.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let rules: Option<HashMap<String, Vec<String>>> = read_json(path).await?;
        Ok(rules.map(Self::new).unwrap_or_default())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of senders with at least one rule.
    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

/// True when `sender` has `ticker` on its list. Tickers compare
/// case-insensitively; senders exactly.
pub fn should_ignore(sender: &str, ticker: &str, list: &IgnoreList) -> bool {
    list.rules
        .get(sender)
        .is_some_and(|tickers| tickers.contains(&ticker.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(pairs: &[(&str, &[&str])]) -> IgnoreList {
        IgnoreList::new(
            pairs
                .iter()
                .map(|(s, ts)| (s.to_string(), ts.iter().map(|t| t.to_string()).collect()))
                .collect(),
        )
    }

    #[test]
    fn test_ticker_match_is_case_insensitive() {
        let rules = list(&[("bob", &["aapl"])]);
        assert!(should_ignore("bob", "AAPL", &rules));
        assert!(should_ignore("bob", "aApL", &rules));
        assert!(!should_ignore("bob", "MSFT", &rules));
    }

    #[test]
    fn test_rules_are_per_sender() {
        let rules = list(&[("bob", &["AAPL"])]);
        assert!(!should_ignore("alice", "AAPL", &rules));
        assert!(!should_ignore("Bob", "AAPL", &rules));
        assert!(!should_ignore("bob", "AAPL", &IgnoreList::default()));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ignore_list.json");

        assert!(IgnoreList::load(&path).await.unwrap().is_empty());

        std::fs::write(&path, r#"{"bob": ["TSLA", "nvda"], "amy": []}"#).unwrap();
        let loaded = IgnoreList::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(should_ignore("bob", "NVDA", &loaded));
        assert!(!should_ignore("amy", "NVDA", &loaded));

        std::fs::write(&path, r#"["not", "a", "map"]"#).unwrap();
        assert!(IgnoreList::load(&path).await.is_err());
    }
}
