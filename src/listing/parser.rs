//! Result-table extraction.
//!
//! The platform renders search results as `<table ln-table>` whose body rows
//! (minus the `filter-row` header controls) hold one case each. The next page
//! is reached through the element carrying the `ln-pagination-next` class.
//! Extraction is regex-based and never fails: rows that cannot yield a case id
//! are counted as malformed, and a page without the table has no rows.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::cases::CaseRecord;

/// Compiles a pattern literal for a `LazyLock` static.
#[allow(clippy::expect_used)]
pub(crate) fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex pattern must compile")
}

static RESULTS_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?is)<table\b[^>]*\bln-table\b[^>]*>(.*?)</table>")
});
static TBODY: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<tbody\b[^>]*>(.*?)</tbody>"));
static ROW: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<tr\b([^>]*)>(.*?)</tr>"));
static CELL: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<td\b[^>]*>(.*?)</td>"));
static TAG: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?s)<[^>]*>"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"\s+"));
static ANCHOR_HREF: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']*)["']"#)
});
static ATTR_HREF: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?is)\bhref\s*=\s*["']([^"']*)["']"#));
static FILTER_ROW: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)\bclass\s*=\s*["'][^"']*\bfilter-row\b"#)
});
static NEXT_CONTROL: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?is)<(?:a|button)\b([^>]*\bln-pagination-next\b[^>]*)>")
});
static DISABLED: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)\bdisabled\b|\baria-disabled\s*=\s*["']true["']"#)
});

/// Column positions within a result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub court: usize,
    pub docket_number: usize,
    pub defendant: usize,
    pub case_name: usize,
    pub nature_of_suit: usize,
    pub cause: usize,
    pub complaint: usize,
    pub date_hit: usize,
    pub date_filed: usize,
}

impl Default for ColumnLayout {
    /// The first two columns are the selection checkbox and row actions.
    fn default() -> Self {
        Self {
            court: 2,
            docket_number: 3,
            defendant: 4,
            case_name: 5,
            nature_of_suit: 6,
            cause: 7,
            complaint: 8,
            date_hit: 9,
            date_filed: 10,
        }
    }
}

impl ColumnLayout {
    fn min_cells(&self) -> usize {
        [
            self.court,
            self.docket_number,
            self.defendant,
            self.case_name,
            self.nature_of_suit,
            self.cause,
            self.complaint,
            self.date_hit,
            self.date_filed,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1
    }
}

/// Everything extracted from one results page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Well-formed rows in page order.
    pub rows: Vec<CaseRecord>,
    /// Rows skipped for lacking a court or docket number.
    pub malformed: usize,
    /// Target of an enabled next-page control.
    pub next_page: Option<Url>,
}

/// Narrow seam between the walker and the platform's markup.
pub trait ListingParser: Send + Sync {
    /// Extracts rows and the next-page link. Must not fail; unusable input
    /// yields an empty page.
    fn parse_page(&self, html: &str, page_url: &Url) -> ParsedPage;
}

/// [`ListingParser`] for the platform's `ln-table` result grid.
#[derive(Debug, Clone, Default)]
pub struct HtmlTableParser {
    layout: ColumnLayout,
}

impl HtmlTableParser {
    #[must_use]
    pub fn new(layout: ColumnLayout) -> Self {
        Self { layout }
    }

    fn parse_row(&self, cells: &[&str], page_url: &Url) -> Option<CaseRecord> {
        if cells.len() < self.layout.min_cells() {
            return None;
        }
        let text = |index: usize| cell_text(cells[index]);

        let court = text(self.layout.court);
        let docket_number = text(self.layout.docket_number);
        if court.is_empty() || docket_number.is_empty() {
            return None;
        }

        let listing_url = first_link(cells[self.layout.case_name], page_url)
            .map_or_else(|| page_url.to_string(), |u| u.to_string());
        let complaint_link =
            first_link(cells[self.layout.complaint], page_url).map(|u| u.to_string());

        Some(CaseRecord {
            case_id: CaseRecord::make_id(&court, &docket_number),
            case_title: text(self.layout.case_name),
            filing_date: text(self.layout.date_filed),
            jurisdiction: court,
            listing_url,
            document_url: None,
            complaint_link,
            docket_number,
            defendant: text(self.layout.defendant),
            nature_of_suit: text(self.layout.nature_of_suit),
            cause: text(self.layout.cause),
            complaint_label: text(self.layout.complaint).to_lowercase(),
            date_hit: text(self.layout.date_hit),
        })
    }
}

impl ListingParser for HtmlTableParser {
    fn parse_page(&self, html: &str, page_url: &Url) -> ParsedPage {
        let Some(table) = RESULTS_TABLE.captures(html).and_then(|c| c.get(1)) else {
            debug!(url = %page_url, "no results table on page");
            return ParsedPage::default();
        };
        let body = TBODY
            .captures(table.as_str())
            .and_then(|c| c.get(1))
            .map_or(table.as_str(), |m| m.as_str());

        let mut parsed = ParsedPage::default();
        for row in ROW.captures_iter(body) {
            let attrs = row.get(1).map_or("", |m| m.as_str());
            if FILTER_ROW.is_match(attrs) {
                continue;
            }
            let inner = row.get(2).map_or("", |m| m.as_str());
            let cells: Vec<&str> = CELL
                .captures_iter(inner)
                .filter_map(|c| c.get(1).map(|m| m.as_str()))
                .collect();
            // Header rows use <th> only.
            if cells.is_empty() {
                continue;
            }
            match self.parse_row(&cells, page_url) {
                Some(record) => parsed.rows.push(record),
                None => {
                    warn!(url = %page_url, cells = cells.len(), "skipping malformed result row");
                    parsed.malformed += 1;
                }
            }
        }

        parsed.next_page = next_page_link(html, page_url);
        parsed
    }
}

/// Target of the first enabled `ln-pagination-next` control, if any.
fn next_page_link(html: &str, page_url: &Url) -> Option<Url> {
    let attrs = NEXT_CONTROL.captures(html)?.get(1)?.as_str();
    if DISABLED.is_match(attrs) {
        return None;
    }
    let href = ATTR_HREF.captures(attrs)?.get(1)?.as_str();
    resolve(href, page_url)
}

fn first_link(fragment: &str, page_url: &Url) -> Option<Url> {
    let href = ANCHOR_HREF.captures(fragment)?.get(1)?.as_str();
    resolve(href, page_url)
}

fn resolve(href: &str, base: &Url) -> Option<Url> {
    let href = decode_entities(href.trim());
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    base.join(&href).ok()
}

/// Visible text of a cell: tags stripped, entities decoded, whitespace collapsed.
#[must_use]
pub fn cell_text(fragment: &str) -> String {
    let stripped = TAG.replace_all(fragment, " ");
    let decoded = decode_entities(&stripped);
    WHITESPACE.replace_all(decoded.trim(), " ").into_owned()
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}
