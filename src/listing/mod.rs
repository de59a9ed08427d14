//! Paginated walk over the platform's case-search results.
//!
//! A [`Walk`] is a lazy, single-use sequence: each call to [`Walk::next`]
//! returns a buffered row or loads the next results page. The walk ends when
//! a page yields no rows not already seen in this walk, when there is no
//! enabled next-page control, or when the page budget is spent. None of these
//! is an error.

mod filters;
mod parser;

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use filters::{PLATFORM_DATE_FORMAT, SearchFilters, format_date, parse_date};
pub use parser::{ColumnLayout, HtmlTableParser, ListingParser, ParsedPage, cell_text};
pub(crate) use parser::compile_static_regex;

use crate::cases::CaseRecord;
use crate::config::{ConfigError, PlatformConfig, WalkConfig};
use crate::session::{AuthError, RetrievalError, SessionManager};

/// The walk stopped before its natural end.
#[derive(Debug, Error)]
pub enum WalkError {
    /// Re-login failed while loading a page.
    #[error("session lost while loading results page {page}: {source}")]
    Auth {
        page: u32,
        #[source]
        source: AuthError,
    },

    /// A page kept failing to load.
    #[error("results page {page} failed after {attempts} attempt(s): {source}")]
    PageLoad {
        page: u32,
        attempts: u32,
        #[source]
        source: RetrievalError,
    },
}

/// Counters gathered while walking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WalkStats {
    /// Pages loaded successfully.
    pub pages: u32,
    /// Rows yielded to the caller.
    pub yielded: usize,
    /// Rows without a usable case id.
    pub malformed: usize,
    /// Well-formed rows rejected by [`SearchFilters::accepts`].
    pub filtered_out: usize,
    /// Rows whose case id already appeared earlier in this walk.
    pub repeated: usize,
}

/// Everything a walk produced, including the error that ended it early.
#[derive(Debug)]
pub struct WalkOutcome {
    pub records: Vec<CaseRecord>,
    pub stats: WalkStats,
    pub error: Option<WalkError>,
}

/// Starts walks against the configured results page.
pub struct ListingWalker {
    search_url: Url,
    max_pages: u32,
    parser: Box<dyn ListingParser>,
}

impl std::fmt::Debug for ListingWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListingWalker")
            .field("search_url", &self.search_url.as_str())
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}

impl ListingWalker {
    #[must_use]
    pub fn new(search_url: Url, max_pages: u32) -> Self {
        Self {
            search_url,
            max_pages,
            parser: Box::new(HtmlTableParser::default()),
        }
    }

    /// Walker for `platform.search_path` with the configured page budget.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the search URL cannot be built.
    pub fn from_config(platform: &PlatformConfig, walk: &WalkConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(platform.join(&platform.search_path)?, walk.max_pages))
    }

    /// Replaces the row extractor.
    #[must_use]
    pub fn with_parser(mut self, parser: Box<dyn ListingParser>) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Begins a walk. No request is made until the first [`Walk::next`].
    pub fn walk<'a>(
        &'a self,
        session: &'a mut SessionManager,
        filters: &SearchFilters,
    ) -> Walk<'a> {
        let mut first = self.search_url.clone();
        filters.apply_to(&mut first);
        Walk {
            session,
            parser: self.parser.as_ref(),
            filters: filters.clone(),
            max_pages: self.max_pages,
            next_url: Some(first),
            buffered: VecDeque::new(),
            seen: HashSet::new(),
            stats: WalkStats::default(),
            finished: false,
        }
    }
}

/// A walk in progress. Not restartable: once it ends it stays ended.
pub struct Walk<'a> {
    session: &'a mut SessionManager,
    parser: &'a dyn ListingParser,
    filters: SearchFilters,
    max_pages: u32,
    next_url: Option<Url>,
    buffered: VecDeque<CaseRecord>,
    seen: HashSet<String>,
    stats: WalkStats,
    finished: bool,
}

impl Walk<'_> {
    /// Next kept row, `Ok(None)` once the walk is over.
    ///
    /// # Errors
    ///
    /// Returns [`WalkError`] when a page cannot be loaded; rows yielded
    /// before the error stay valid and later calls return `Ok(None)`.
    pub async fn next(&mut self) -> Result<Option<CaseRecord>, WalkError> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                self.stats.yielded += 1;
                return Ok(Some(record));
            }
            if self.finished {
                return Ok(None);
            }
            let Some(url) = self.next_url.take() else {
                debug!(pages = self.stats.pages, "no next-page marker, walk complete");
                self.finished = true;
                return Ok(None);
            };
            if self.stats.pages >= self.max_pages {
                info!(max_pages = self.max_pages, "page budget reached, walk complete");
                self.finished = true;
                return Ok(None);
            }
            if let Err(e) = self.load_page(url).await {
                self.finished = true;
                return Err(e);
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    /// Runs the walk to the end, keeping rows gathered before any error.
    pub async fn drain(mut self) -> WalkOutcome {
        let mut records = Vec::new();
        let error = loop {
            match self.next().await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        WalkOutcome {
            records,
            stats: self.stats,
            error,
        }
    }

    #[instrument(skip(self, url), fields(page = self.stats.pages + 1, url = %url))]
    async fn load_page(&mut self, url: Url) -> Result<(), WalkError> {
        let page_number = self.stats.pages + 1;
        let retrieved = match self.session.get_with_retry(&url, |_| Ok(())).await {
            Ok(retrieved) => retrieved,
            Err(RetrievalError::Auth(source)) => {
                return Err(WalkError::Auth {
                    page: page_number,
                    source,
                });
            }
            Err(source) => {
                warn!(error = %source, "giving up on results page");
                return Err(WalkError::PageLoad {
                    page: page_number,
                    attempts: source.attempts(),
                    source,
                });
            }
        };
        self.stats.pages = page_number;

        let page = retrieved.page;
        let parsed = self.parser.parse_page(&page.text(), &page.url);
        self.stats.malformed += parsed.malformed;

        let mut new_rows = 0usize;
        for record in parsed.rows {
            if !self.seen.insert(record.case_id.clone()) {
                self.stats.repeated += 1;
                continue;
            }
            new_rows += 1;
            if self.filters.accepts(&record) {
                self.buffered.push_back(record);
            } else {
                debug!(case_id = %record.case_id, "row filtered out");
                self.stats.filtered_out += 1;
            }
        }
        info!(
            page = page_number,
            new_rows,
            kept = self.buffered.len(),
            malformed = parsed.malformed,
            "results page loaded"
        );

        if new_rows == 0 {
            debug!("page yielded no new rows, walk complete");
            self.finished = true;
            return Ok(());
        }

        self.next_url = parsed.next_page.filter(|next| *next != url);
        Ok(())
    }
}
