//! Search criteria sent to the platform and row filters applied locally.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cases::CaseRecord;
use crate::config::{PlatformConfig, WalkConfig};

/// Date format the platform's search form expects.
pub const PLATFORM_DATE_FORMAT: &str = "%m/%d/%Y";

/// What to search for and which listed rows to keep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    /// Saved alert whose hits are listed.
    pub alert_name: Option<String>,
    pub first_participant_only: bool,
    /// Natures of suit to keep; empty keeps every row.
    pub allowed_natures: Vec<String>,
    /// Keep only rows whose complaint column starts with "free".
    pub require_free_complaint: bool,
}

impl SearchFilters {
    /// Filters for a single filing day with nothing excluded.
    #[must_use]
    pub fn for_day(day: NaiveDate) -> Self {
        Self {
            date_from: day,
            date_to: day,
            alert_name: None,
            first_participant_only: false,
            allowed_natures: Vec::new(),
            require_free_complaint: false,
        }
    }

    /// Filters from configuration; missing dates default to today.
    #[must_use]
    pub fn from_config(
        platform: &PlatformConfig,
        walk: &WalkConfig,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Self {
        let today = Local::now().date_naive();
        let date_to = date_to.unwrap_or(today);
        Self {
            date_from: date_from.unwrap_or(date_to),
            date_to,
            alert_name: platform.alert_name.clone(),
            first_participant_only: walk.first_participant_only,
            allowed_natures: walk
                .allowed_natures
                .iter()
                .map(|n| normalize(n))
                .filter(|n| !n.is_empty())
                .collect(),
            require_free_complaint: walk.require_free_complaint,
        }
    }

    /// Appends the search criteria to the results URL.
    pub fn apply_to(&self, url: &mut Url) {
        let mut query = url.query_pairs_mut();
        if let Some(alert) = &self.alert_name {
            query.append_pair("alert", alert);
        }
        query.append_pair("from", &format_date(self.date_from));
        query.append_pair("to", &format_date(self.date_to));
        if self.first_participant_only {
            query.append_pair("firstParticipant", "true");
        }
    }

    /// Whether a listed row passes the local filters.
    #[must_use]
    pub fn accepts(&self, record: &CaseRecord) -> bool {
        if self.require_free_complaint
            && !record
                .complaint_label
                .trim()
                .to_lowercase()
                .starts_with("free")
        {
            return false;
        }
        self.allowed_natures.is_empty()
            || self
                .allowed_natures
                .contains(&normalize(&record.nature_of_suit))
    }

    /// `to` date rendered for file names (`MM_DD_YYYY`).
    #[must_use]
    pub fn snapshot_label(&self) -> String {
        format_date(self.date_to).replace('/', "_")
    }
}

/// Renders a date the way the platform expects it.
#[must_use]
pub fn format_date(date: NaiveDate) -> String {
    date.format(PLATFORM_DATE_FORMAT).to_string()
}

/// Parses `MM/DD/YYYY` or ISO `YYYY-MM-DD`.
///
/// # Errors
///
/// Returns a message naming the accepted formats.
pub fn parse_date(input: &str) -> Result<NaiveDate, String> {
    let input = input.trim();
    NaiveDate::parse_from_str(input, PLATFORM_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(input, "%Y-%m-%d"))
        .map_err(|_| format!("invalid date '{input}': expected MM/DD/YYYY or YYYY-MM-DD"))
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
