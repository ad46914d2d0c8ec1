//! Titles for the policy links of a monthly update PDF.
//!
//! Each link gets the first title produced by, in order: the descriptive
//! slug of its URL, a numbered table cell on the same page, the words
//! printed next to the link, and finally [`UNKNOWN_TITLE`].

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;
use url::Url;

use crate::models::{BoundingBox, ExtractionLink, PageContent};
use crate::text::{collapse_whitespace, title_case};

pub const UNKNOWN_TITLE: &str = "Unknown Policy";

/// Vertical distance (user-space units) between a link and a nearby word.
pub const VERTICAL_TOLERANCE: f64 = 15.0;
/// Horizontal slack either side of a link box.
pub const HORIZONTAL_WINDOW: f64 = 100.0;

const MIN_CELL_LEN: usize = 5;
const MAX_CELL_LEN: usize = 100;

/// Document-kind segments that follow the policy number in URLs.
const KIND_SEGMENTS: &[&str] = &[
    "coveragepositioncriteria",
    "coveragepolicy",
    "coveragepolicies",
    "coverageposition",
    "medicalcoveragepolicy",
    "reimbursementpolicy",
    "clinicalguideline",
    "policy",
];

/// Table headers that look like titles but never are.
const BOILERPLATE_HEADERS: &[&str] = &[
    "policy title",
    "policy name",
    "policy number",
    "coverage policy",
    "comments",
    "effective date",
    "title (number)",
];

pub struct TitleResolver {
    file_name: Regex,
    numbered_cell: Regex,
}

impl TitleResolver {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            file_name: Regex::new(r"(?i)^[a-z]+[_-](\d{4})(?:[_-]([a-z0-9_-]+))?\.pdf$")?,
            numbered_cell: Regex::new(r"\(\d+\)")?,
        })
    }

    /// All policy links of a document, deduplicated by URL, in page order.
    pub fn resolve_document(&self, pages: &[PageContent]) -> Vec<ExtractionLink> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for page in pages {
            for link in self.resolve_page(page) {
                if seen.insert(link.url.clone()) {
                    links.push(link);
                }
            }
        }
        links
    }

    pub fn resolve_page(&self, page: &PageContent) -> Vec<ExtractionLink> {
        let mut used_cells: HashSet<String> = HashSet::new();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for annotation in &page.links {
            if !looks_like_pdf(&annotation.url) || !seen.insert(annotation.url.clone()) {
                continue;
            }
            let number = self.policy_number(&annotation.url);

            let title = self
                .title_from_url(&annotation.url)
                .or_else(|| self.title_from_tables(page, number.as_deref(), &mut used_cells))
                .or_else(|| title_from_nearby_words(page, &annotation.bbox))
                .unwrap_or_else(|| UNKNOWN_TITLE.to_string());

            let comments = number
                .as_deref()
                .and_then(|n| comments_for(page, n))
                .unwrap_or_default();

            debug!(url = %annotation.url, title = %title, "resolved link title");
            out.push(ExtractionLink {
                url: annotation.url.clone(),
                title,
                comments,
            });
        }
        out
    }

    /// Descriptive slug after the policy number, kind segment dropped.
    pub fn title_from_url(&self, url: &str) -> Option<String> {
        let name = file_name(url)?;
        let caps = self.file_name.captures(&name)?;
        let slug = caps.get(2)?.as_str();
        let words: Vec<&str> = slug
            .split(['_', '-'])
            .filter(|w| !w.is_empty())
            .skip_while(|w| KIND_SEGMENTS.contains(&w.to_ascii_lowercase().as_str()))
            .collect();
        let title = title_case(&words.join(" "));
        if title.is_empty() {
            None
        } else {
            Some(title)
        }
    }

    /// Four-digit policy number from the URL's file name.
    pub fn policy_number(&self, url: &str) -> Option<String> {
        let name = file_name(url)?;
        let caps = self.file_name.captures(&name)?;
        Some(caps[1].to_string())
    }

    fn title_from_tables(
        &self,
        page: &PageContent,
        number: Option<&str>,
        used: &mut HashSet<String>,
    ) -> Option<String> {
        let candidates: Vec<String> = page
            .tables
            .iter()
            .flatten()
            .flatten()
            .map(|cell| collapse_whitespace(cell))
            .filter(|cell| self.is_title_cell(cell))
            .collect();

        let chosen = number
            .and_then(|n| candidates.iter().find(|c| c.contains(n)))
            .or_else(|| candidates.iter().find(|c| !used.contains(*c)))?
            .clone();
        used.insert(chosen.clone());
        Some(chosen)
    }

    fn is_title_cell(&self, cell: &str) -> bool {
        let len = cell.chars().count();
        if !(MIN_CELL_LEN..=MAX_CELL_LEN).contains(&len) || !self.numbered_cell.is_match(cell) {
            return false;
        }
        let lower = cell.to_lowercase();
        !BOILERPLATE_HEADERS.iter().any(|h| lower.starts_with(h))
    }
}

/// Words within the vertical tolerance of the link and inside the
/// horizontal window, left to right.
pub fn title_from_nearby_words(page: &PageContent, bbox: &BoundingBox) -> Option<String> {
    let cy = bbox.center_y();
    let mut near: Vec<_> = page
        .words
        .iter()
        .filter(|w| {
            (w.bbox.center_y() - cy).abs() <= VERTICAL_TOLERANCE
                && w.bbox.x1 >= bbox.x0 - HORIZONTAL_WINDOW
                && w.bbox.x0 <= bbox.x1 + HORIZONTAL_WINDOW
        })
        .collect();
    near.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
    let joined = collapse_whitespace(
        &near
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" "),
    );
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Comments for the table row that mentions `number`.
///
/// Uses the column headed "Comments" when the table has one, else the
/// other cells of the row that do not mention the number.
fn comments_for(page: &PageContent, number: &str) -> Option<String> {
    for table in &page.tables {
        let comments_col = table.iter().find_map(|row| {
            row.iter()
                .position(|cell| cell.trim().eq_ignore_ascii_case("comments"))
        });
        let Some(row) = table
            .iter()
            .find(|row| row.iter().any(|cell| cell.contains(number)))
        else {
            continue;
        };
        let text = match comments_col {
            Some(idx) => row.get(idx).map(|c| collapse_whitespace(c)).unwrap_or_default(),
            None => row
                .iter()
                .filter(|cell| !cell.contains(number))
                .map(|cell| collapse_whitespace(cell))
                .filter(|cell| !cell.is_empty())
                .collect::<Vec<_>>()
                .join("; "),
        };
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

fn file_name(url: &str) -> Option<String> {
    match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .map(str::to_string),
        Err(_) => {
            let path = url.split(['?', '#']).next()?;
            path.rsplit('/').next().map(str::to_string)
        }
    }
}

fn looks_like_pdf(url: &str) -> bool {
    file_name(url)
        .map(|name| name.to_ascii_lowercase().ends_with(".pdf"))
        .unwrap_or(false)
}
