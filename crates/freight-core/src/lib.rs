//! Core domain model for freight profile batch runs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "freight-core";

/// Result label written for items the service accepted.
pub const RESULT_SUCCESS: &str = "success";
/// Result label written for items the service rejected.
pub const RESULT_FAILURE: &str = "failure";

/// One template row: a price range and the profile its listings move to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketSpec {
    pub price_min: String,
    pub price_max: String,
    pub profile_name: String,
}

impl BracketSpec {
    pub fn new(
        price_min: impl Into<String>,
        price_max: impl Into<String>,
        profile_name: impl Into<String>,
    ) -> Self {
        Self {
            price_min: price_min.into(),
            price_max: price_max.into(),
            profile_name: profile_name.into(),
        }
    }

    pub fn range_label(&self) -> String {
        format!("{}-{}", self.price_min, self.price_max)
    }

    /// Deterministic per-bracket file name: `{min}-{max}>{profile}.csv`.
    pub fn file_name(&self) -> String {
        format!("{}>{}.csv", self.range_label(), self.profile_name)
    }
}

/// Profile display name -> remote profile id, fetched once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileCatalog {
    profiles: BTreeMap<String, String>,
}

impl ProfileCatalog {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            profiles: pairs
                .into_iter()
                .map(|(name, id)| (name.into(), id.into()))
                .collect(),
        }
    }

    pub fn resolve(&self, profile_name: &str) -> Option<&str> {
        self.profiles.get(profile_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

/// One catalog listing as persisted in a bracket file.
///
/// Column names match the remote service's field names so files stay
/// readable next to the seller console export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "itemSn")]
    pub item_sn: String,
    pub name: String,
    #[serde(rename = "qualityName")]
    pub quality_name: String,
    pub quality: String,
    pub price: String,
    #[serde(rename = "realPrice")]
    pub real_price: String,
    #[serde(rename = "mouldId")]
    pub profile_id: String,
    #[serde(rename = "mouldName")]
    pub profile_name: String,
    pub weight: String,
    #[serde(default)]
    pub result: String,
}

impl ListingRecord {
    /// The mutation endpoint only accepts integer ids.
    pub fn numeric_item_id(&self) -> Option<i64> {
        self.item_id.trim().parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgressLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for ProgressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Orchestrator states. `Done` and `Stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Idle,
    Validating,
    Authenticating,
    ResolvingProfiles,
    Retrieving,
    Mutating,
    Summarizing,
    Done,
    Stopped,
}

impl RunPhase {
    /// Phases where a stop request is honored.
    pub fn is_interruptible(self) -> bool {
        matches!(self, Self::Retrieving | Self::Mutating)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BracketSummary {
    pub range: String,
    pub profile_name: String,
    pub item_count: usize,
    pub success_count: usize,
    pub fail_count: usize,
}

impl BracketSummary {
    pub fn for_bracket(bracket: &BracketSpec) -> Self {
        Self {
            range: bracket.range_label(),
            profile_name: bracket.profile_name.clone(),
            item_count: 0,
            success_count: 0,
            fail_count: 0,
        }
    }
}

/// Aggregate run counters, built across both phases and persisted once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub account: String,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub stopped: bool,
    pub success_count: usize,
    pub fail_count: usize,
    pub brackets: Vec<BracketSummary>,
}

impl RunSummary {
    pub fn start(account: impl Into<String>, started_at: DateTime<Local>) -> Self {
        Self {
            account: account.into(),
            started_at,
            finished_at: None,
            stopped: false,
            success_count: 0,
            fail_count: 0,
            brackets: Vec::new(),
        }
    }

    pub fn record_outcomes(&mut self, bracket_index: usize, succeeded: usize, failed: usize) {
        self.success_count += succeeded;
        self.fail_count += failed;
        if let Some(entry) = self.brackets.get_mut(bracket_index) {
            entry.success_count += succeeded;
            entry.fail_count += failed;
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Local>, stopped: bool) {
        self.finished_at = Some(finished_at);
        self.stopped = stopped;
    }

    /// Whole seconds between start and finish; zero while unfinished.
    pub fn elapsed_secs(&self) -> i64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_seconds().max(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bracket_file_name_is_deterministic() {
        let bracket = BracketSpec::new("0", "50", "Standard");
        assert_eq!(bracket.file_name(), "0-50>Standard.csv");
        assert_eq!(bracket.file_name(), BracketSpec::new("0", "50", "Standard").file_name());
        assert_eq!(bracket.range_label(), "0-50");
    }

    #[test]
    fn numeric_item_id_rejects_non_integers() {
        let mut record = ListingRecord {
            item_id: " 8873035567 ".into(),
            ..Default::default()
        };
        assert_eq!(record.numeric_item_id(), Some(8_873_035_567));
        record.item_id = "abc".into();
        assert_eq!(record.numeric_item_id(), None);
    }

    #[test]
    fn summary_counters_roll_up_per_bracket() {
        let start = Local.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let mut summary = RunSummary::start("shop", start);
        summary.brackets.push(BracketSummary::for_bracket(&BracketSpec::new("0", "50", "A")));
        summary.record_outcomes(0, 3, 1);
        summary.record_outcomes(7, 2, 0);
        summary.finish(start + chrono::Duration::seconds(95), false);

        assert_eq!(summary.success_count, 5);
        assert_eq!(summary.fail_count, 1);
        assert_eq!(summary.brackets[0].success_count, 3);
        assert_eq!(summary.elapsed_secs(), 95);
    }

    #[test]
    fn only_retrieval_and_mutation_are_interruptible() {
        assert!(RunPhase::Retrieving.is_interruptible());
        assert!(RunPhase::Mutating.is_interruptible());
        assert!(!RunPhase::Validating.is_interruptible());
        assert!(!RunPhase::Stopped.is_interruptible());
    }
}
