//! Shared fixtures for integration tests: a wiremock stand-in for the
//! case-research platform and a coordinator wired to temporary storage.

#![allow(dead_code)]

use std::sync::Arc;

use caseharvest_core::config::{PlatformConfig, WalkConfig};
use caseharvest_core::{
    CaseStore, ComplaintDownloader, Credentials, Database, DocumentStore, Ledger, ListingWalker,
    RetryPolicy, RunCoordinator, SearchFilters, SessionManager, SqliteLedger,
};
use chrono::NaiveDate;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate, Times};

pub const COURT: &str = "CA Superior";
pub const SEARCH_PATH: &str = "/alerts/results";
pub const LOGIN_HTML: &str =
    r#"<html><form action="/signin"><input id="userid" name="userid"></form></html>"#;

pub fn search_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 9).unwrap_or_default()
}

pub fn filters() -> SearchFilters {
    SearchFilters::for_day(search_day())
}

pub fn case_id(docket: &str) -> String {
    format!("{COURT}|{docket}")
}

pub fn pdf_bytes(docket: &str) -> Vec<u8> {
    format!("%PDF-1.7\ncomplaint for {docket}\n%%EOF").into_bytes()
}

pub fn html(body: impl Into<String>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.into(), "text/html; charset=utf-8")
}

/// One results page with a row per docket and an optional next-page link.
pub fn results_page(dockets: &[&str], next: Option<u32>) -> String {
    let rows: String = dockets
        .iter()
        .map(|d| {
            format!(
                r#"<tr class="ln-row"><td><input type="checkbox"></td><td></td>
                   <td>{COURT}</td><td>{d}</td><td>Acme Corp</td>
                   <td><a href="/cases/{d}">People v. Acme ({d})</a></td>
                   <td>Other Statutory Actions</td><td>Prop 65</td>
                   <td>Free</td><td>03/09/2026</td><td>03/06/2026</td></tr>"#
            )
        })
        .collect();
    let next = next.map_or(String::new(), |p| {
        format!(r#"<a class="ln-pagination-next" href="{SEARCH_PATH}?page={p}">Next</a>"#)
    });
    format!(
        r#"<html><table ln-table><thead><tr class="filter-row"><th>Court</th></tr></thead>
           <tbody>{rows}</tbody></table>{next}</html>"#
    )
}

/// Case detail page; `free` controls whether the complaint has a free copy.
pub fn case_page(docket: &str, free: bool) -> String {
    let link = if free {
        format!(
            r#"<a class="SS_ProceedingLink" data-action="ProceedingFree" href="/docs/{docket}.pdf">Free</a>"#
        )
    } else {
        r#"<a href="/purchase">$ Purchase</a>"#.to_string()
    };
    format!(
        r#"<html><table>
           <tr data-proceedingnumber="2"><td id="text_2">SUMMONS issued</td><td></td></tr>
           <tr data-proceedingnumber="1"><td id="text_1">COMPLAINT filed</td><td>{link}</td></tr>
           </table></html>"#
    )
}

/// The mock platform: login form, results pages, case pages and documents.
pub struct MockPlatform {
    pub server: MockServer,
}

impl MockPlatform {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/signin"))
            .respond_with(html(LOGIN_HTML))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/signin"))
            .respond_with(
                ResponseTemplate::new(303)
                    .insert_header("location", "/home")
                    .insert_header("set-cookie", "SESSIONID=s1; Path=/"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/home"))
            .respond_with(html("<html><h1>Alerts</h1></html>"))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn platform_config(&self) -> PlatformConfig {
        PlatformConfig {
            base_url: self.uri(),
            request_delay_ms: 0,
            ..PlatformConfig::default()
        }
    }

    /// First page when `page` is `None`, otherwise `?page=N`.
    pub async fn mount_results(&self, page: Option<u32>, body: String) {
        let mock = Mock::given(method("GET")).and(path(SEARCH_PATH));
        let mock = match page {
            Some(p) => mock.and(query_param("page", p.to_string())),
            None => mock.and(query_param("from", "03/09/2026")),
        };
        mock.respond_with(html(body)).mount(&self.server).await;
    }

    pub async fn mount_case(&self, docket: &str, free: bool, expected_hits: impl Into<Times>) {
        Mock::given(method("GET"))
            .and(path(format!("/cases/{docket}")))
            .respond_with(html(case_page(docket, free)))
            .expect(expected_hits)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_document(&self, docket: &str, expected_hits: impl Into<Times>) {
        Mock::given(method("GET"))
            .and(path(format!("/docs/{docket}.pdf")))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(pdf_bytes(docket), "application/pdf"),
            )
            .expect(expected_hits)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_document_status(&self, docket: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(format!("/docs/{docket}.pdf")))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received whose path starts with `prefix`.
    pub async fn hits(&self, prefix: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path().starts_with(prefix))
            .count()
    }
}

/// Durable state shared by consecutive runs.
pub struct Workspace {
    pub dir: TempDir,
    pub db: Database,
    pub store: DocumentStore,
    pub ledger: Arc<dyn Ledger>,
}

impl Workspace {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let db = Database::new(&dir.path().join("caseharvest.db"))
            .await
            .unwrap_or_else(|e| panic!("database: {e}"));
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::new(db.clone()));
        Self {
            dir,
            db,
            store: DocumentStore::in_memory(),
            ledger,
        }
    }

    pub fn cases(&self) -> CaseStore {
        CaseStore::new(self.db.clone())
    }

    /// A fresh coordinator (and so a fresh session) over this workspace.
    pub fn coordinator(&self, platform: &MockPlatform, retries: u32) -> RunCoordinator {
        let config = platform.platform_config();
        let credentials = Credentials {
            username: "clerk".into(),
            password: "s3cret".into(),
        };
        let policy = RetryPolicy::immediate(retries);
        let session = SessionManager::new(&config, credentials, policy.clone())
            .unwrap_or_else(|e| panic!("session: {e}"));
        let walker = ListingWalker::from_config(&config, &WalkConfig::default())
            .unwrap_or_else(|e| panic!("walker: {e}"));
        RunCoordinator::new(
            session,
            walker,
            Arc::clone(&self.ledger),
            ComplaintDownloader::new(self.store.clone(), policy),
            self.cases(),
        )
    }
}
