//! Discovery of monthly update links on the listing page.

use std::collections::HashSet;

use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

use crate::models::MonthlyLink;
use crate::text::collapse_whitespace;

const LINK_MARKER: &str = "policy updates";

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid month pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid link selector: {0}")]
    Selector(String),
}

pub struct ListingParser {
    anchor: Selector,
    month: Regex,
}

impl ListingParser {
    pub fn new() -> Result<Self, ListingError> {
        Ok(Self {
            anchor: Selector::parse("a[href]")
                .map_err(|e| ListingError::Selector(e.to_string()))?,
            month: Regex::new(r"(?i)Policy\s+Updates\W*([A-Za-z]+\s+\d{4})")?,
        })
    }

    /// Anchors whose text mentions "Policy Updates", in page order,
    /// resolved against `base` and deduplicated by URL.
    pub fn parse(&self, html: &str, base: &Url) -> Vec<MonthlyLink> {
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for anchor in document.select(&self.anchor) {
            let text = collapse_whitespace(&anchor.text().collect::<String>());
            if !text.to_lowercase().contains(LINK_MARKER) {
                continue;
            }
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Ok(url) = base.join(href.trim()) else {
                continue;
            };
            if !seen.insert(url.to_string()) {
                continue;
            }
            links.push(MonthlyLink {
                month_label: self.month_label(&text),
                url: url.to_string(),
                link_text: text,
            });
        }
        links
    }

    /// `"Policy Updates January 2025"` -> `"January 2025"`.
    pub fn month_label(&self, link_text: &str) -> String {
        if let Some(caps) = self.month.captures(link_text) {
            return collapse_whitespace(&caps[1]);
        }
        match link_text.to_ascii_lowercase().find(LINK_MARKER) {
            Some(i) => collapse_whitespace(
                &format!("{}{}", &link_text[..i], &link_text[i + LINK_MARKER.len()..]),
            ),
            _ => link_text.to_string(),
        }
    }
}
