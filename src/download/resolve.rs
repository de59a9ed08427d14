//! Locating the complaint on a case detail page.
//!
//! Proceedings are `<tr data-proceedingnumber=..>` rows. The complaint is the
//! first such row whose `text_*` cell starts with "COMPLAINT" and which offers
//! a free copy through a `data-action="ProceedingFree"` link.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::listing::{cell_text, compile_static_regex};

static PROCEEDING_ROW: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?is)<tr\b[^>]*\bdata-proceedingnumber\b[^>]*>(.*?)</tr>")
});
static TEXT_CELL: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)<td\b[^>]*\bid\s*=\s*["']text_[^"']*["'][^>]*>(.*?)</td>"#)
});
static FREE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r#"(?is)<a\b([^>]*\bdata-action\s*=\s*["']ProceedingFree["'][^>]*)>(.*?)</a>"#,
    )
});
static HREF: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?is)\bhref\s*=\s*["']([^"']*)["']"#));

/// Leading bytes every accepted complaint must start with.
pub const PDF_MAGIC: &[u8] = b"%PDF";

/// URL of the free complaint document listed on a detail page.
#[must_use]
pub fn find_complaint_link(html: &str, page_url: &Url) -> Option<Url> {
    PROCEEDING_ROW
        .captures_iter(html)
        .filter_map(|row| row.get(1).map(|m| m.as_str()))
        .find_map(|row| {
            let text = TEXT_CELL.captures(row)?.get(1)?.as_str();
            if !cell_text(text).to_uppercase().starts_with("COMPLAINT") {
                return None;
            }
            free_link(row, page_url)
        })
}

fn free_link(row: &str, page_url: &Url) -> Option<Url> {
    FREE_LINK.captures_iter(row).find_map(|link| {
        let label = link.get(2).map_or("", |m| m.as_str());
        if !cell_text(label).to_lowercase().contains("free") {
            return None;
        }
        let attrs = link.get(1)?.as_str();
        let href = HREF.captures(attrs)?.get(1)?.as_str().replace("&amp;", "&");
        page_url.join(href.trim()).ok()
    })
}

/// True when `bytes` start with the PDF signature.
#[must_use]
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}
