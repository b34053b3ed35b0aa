//! Result-page and detail-page parsing.
//!
//! Parsing is defensive: a malformed row is skipped and counted, never
//! fatal for the page. Promoted agency rows and "Verifiziertes
//! Unternehmen" rows are dropped here, before filtering.

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use wgscout_common::{CrawlError, RawListing};

/// Parsed contents of one result page.
#[derive(Debug, Default)]
pub struct PageParse {
    pub listings: Vec<RawListing>,
    /// Rows that did not yield the mandatory fields.
    pub parse_failures: u32,
    /// Promoted/verified-business rows dropped on purpose.
    pub promoted_skipped: u32,
}

struct Selectors {
    row: Selector,
    link: Selector,
    user: Selector,
    rental_info: Selector,
    date_col: Selector,
    verified: Selector,
    main_column: Selector,
    description: Selector,
}

impl Selectors {
    fn new() -> Result<Self, CrawlError> {
        Ok(Self {
            row: css(r#"div[id^="liste-details-ad-"]"#)?,
            link: css("a[href]")?,
            user: css("span.ml5")?,
            rental_info: css("div.col-xs-11 span")?,
            date_col: css("div.col-xs-5.text-center")?,
            verified: css("a.label_verified")?,
            main_column: css("#main_column")?,
            description: css("#ad_description_text p, #ad_description_text h3")?,
        })
    }
}

fn css(selector: &str) -> Result<Selector, CrawlError> {
    Selector::parse(selector)
        .map_err(|_| CrawlError::SourceChanged(format!("bad selector: {selector}")))
}

/// Parse one search-result page into raw listings.
///
/// An empty row set with an intact page skeleton means the pagination is
/// exhausted; a missing skeleton means the source markup changed.
pub fn parse_result_page(html: &str) -> Result<PageParse, CrawlError> {
    let sels = Selectors::new()?;
    let doc = Html::parse_document(html);

    if doc.select(&sels.main_column).next().is_none() {
        return Err(CrawlError::SourceChanged(
            "result page missing #main_column".to_string(),
        ));
    }

    let price_re = compile_regex(r"(\d+)\s*€")?;
    let size_re = compile_regex(r"(\d+)\s*m²")?;

    let mut page = PageParse::default();

    for row in doc.select(&sels.row) {
        // Promoted rows from letting agencies embed extra markup in the
        // user name; verified-business rows carry their own badge.
        if row.select(&sels.verified).next().is_some() {
            page.promoted_skipped += 1;
            continue;
        }
        let user_raw = element_text(row.select(&sels.user).next());
        if user_raw.trim().contains('\n') {
            page.promoted_skipped += 1;
            continue;
        }

        match parse_row(&row, &sels, &price_re, &size_re) {
            Some(listing) => page.listings.push(listing),
            None => {
                debug!("skipping malformed listing row");
                page.parse_failures += 1;
            }
        }
    }

    Ok(page)
}

fn parse_row(
    row: &ElementRef,
    sels: &Selectors,
    price_re: &Regex,
    size_re: &Regex,
) -> Option<RawListing> {
    let listing_ref = row
        .select(&sels.link)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)?;

    let contact_name = element_text(row.select(&sels.user).next());
    let contact_name = contact_name.trim().to_string();
    if contact_name.is_empty() {
        return None;
    }

    // "2er WG | Berlin | Mitte" -> wg_type, then address parts most
    // specific last; the rendered address is "district, city".
    let info_text = element_text(row.select(&sels.rental_info).next());
    let parts: Vec<&str> = info_text
        .split(['|', '\n'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let wg_type = parts.first()?.to_string();
    let rest = &parts[1..];
    let address = rest
        .iter()
        .rev()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let district = rest.last().map(|d| d.to_string());

    let (rental_start, rental_end) = parse_date_range(&element_text(
        row.select(&sels.date_col).next(),
    ));

    let row_text: String = row.text().collect();
    let price_eur = price_re
        .captures(&row_text)
        .and_then(|c| c[1].parse().ok());
    let size_sqm = size_re
        .captures(&row_text)
        .and_then(|c| c[1].parse().ok());
    let online_since = row_text
        .split("Online:")
        .nth(1)
        .map(|s| s.lines().next().unwrap_or("").trim().to_string())
        .filter(|s| !s.is_empty());

    Some(RawListing {
        listing_ref,
        contact_name,
        address,
        wg_type,
        district,
        price_eur,
        size_sqm,
        rental_start,
        rental_end,
        online_since,
        detail_text: None,
    })
}

/// Extract the free-text description from a listing detail page.
pub fn parse_detail_text(html: &str) -> Result<Option<String>, CrawlError> {
    let sels = Selectors::new()?;
    let doc = Html::parse_document(html);

    let chunks: Vec<String> = doc
        .select(&sels.description)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if chunks.is_empty() {
        return Ok(None);
    }
    Ok(Some(chunks.join("\n\n")))
}

/// "01.05.2025 - 01.08.2025" -> (start, end); a single date means
/// open-ended ("unbefristet").
fn parse_date_range(text: &str) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let dates: Vec<NaiveDate> = text
        .split(['-', '\n'])
        .filter_map(|part| parse_date(part.trim()))
        .collect();
    match dates.as_slice() {
        [start, end, ..] => (Some(*start), Some(*end)),
        [start] => (Some(*start), None),
        [] => (None, None),
    }
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%d.%m.%Y").ok()
}

fn element_text(el: Option<ElementRef>) -> String {
    el.map(|e| e.text().collect::<String>()).unwrap_or_default()
}

fn compile_regex(pattern: &str) -> Result<Regex, CrawlError> {
    Regex::new(pattern).map_err(|_| CrawlError::SourceChanged(format!("bad pattern: {pattern}")))
}
