//! PDF text, table, and link extraction.
//!
//! Layout comes from walking each page's content stream with `lopdf`:
//! text-positioning operators are tracked so every shown string becomes
//! positioned words, words are grouped into lines, and lines with wide
//! horizontal gaps become table rows. Link annotations are read from the
//! page's `/Annots`.
//!
//! Plain document text prefers `pdf-extract` (better font decoding) and
//! falls back to the layout text when it fails or finds nothing. Only a
//! byte stream that cannot be parsed at all is an error; a page that
//! yields nothing just has empty collections.

use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, warn};

use policy_harvest_core::error::HarvestError;
use policy_harvest_core::models::{
    BoundingBox, LinkAnnotation, PageContent, PositionedWord, Table,
};

/// Average glyph width as a fraction of the font size.
const GLYPH_WIDTH_EM: f64 = 0.5;
/// Horizontal gap (user-space units) that separates table cells.
const CELL_GAP: f64 = 15.0;
/// Baseline difference still considered the same line.
const LINE_TOLERANCE: f64 = 3.0;
/// TJ adjustment (thousandths of an em) treated as a word space.
const TJ_SPACE_THRESHOLD: f64 = 200.0;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF decoding failed: {0}")]
    Decode(String),
}

impl From<ExtractError> for HarvestError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Decode(msg) => HarvestError::Decode(msg),
        }
    }
}

/// Layout of every page, in page order.
#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub pages: Vec<PageContent>,
}

impl ExtractedDocument {
    pub fn text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn link_count(&self) -> usize {
        self.pages.iter().map(|p| p.links.len()).sum()
    }
}

/// Per-page text, tables, and links.
pub fn extract_layout(bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
    let doc = Document::load_mem(bytes).map_err(|e| ExtractError::Decode(e.to_string()))?;
    let mut pages = Vec::new();
    for (number, page_id) in doc.get_pages() {
        pages.push(extract_page(&doc, number, page_id));
    }
    debug!(pages = pages.len(), "extracted layout");
    Ok(ExtractedDocument { pages })
}

/// Full document text: `pdf-extract` first, layout text as fallback.
pub fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let layout = extract_layout(bytes)?;
    Ok(text_with_fallback(bytes, &layout))
}

/// Text from `pdf-extract` when it yields any, else the layout text.
pub fn text_with_fallback(bytes: &[u8], layout: &ExtractedDocument) -> String {
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes));
    match extracted {
        Ok(Ok(text)) if !text.trim().is_empty() => text,
        Ok(Err(e)) => {
            debug!(error = %e, "pdf-extract failed, using layout text");
            layout.text()
        }
        Err(_) => {
            warn!("pdf-extract panicked, using layout text");
            layout.text()
        }
        Ok(Ok(_)) => layout.text(),
    }
}

fn extract_page(doc: &Document, number: u32, page_id: ObjectId) -> PageContent {
    let words = match page_words(doc, page_id) {
        Ok(words) => words,
        Err(e) => {
            warn!(page = number, error = %e, "could not decode page content");
            Vec::new()
        }
    };
    let lines = group_lines(&words);
    let text = lines
        .iter()
        .map(|line| line.cells.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let tables = detect_tables(&lines);
    let links = page_links(doc, page_id);

    PageContent {
        number,
        text,
        words,
        tables,
        links,
    }
}

// ============ Content stream ============

struct TextState {
    line_x: f64,
    line_y: f64,
    x: f64,
    y: f64,
    font_size: f64,
    scale: f64,
    leading: f64,
}

impl TextState {
    fn new() -> Self {
        Self {
            line_x: 0.0,
            line_y: 0.0,
            x: 0.0,
            y: 0.0,
            font_size: 12.0,
            scale: 1.0,
            leading: 0.0,
        }
    }

    fn size(&self) -> f64 {
        (self.font_size * self.scale).abs().max(1.0)
    }

    fn move_line(&mut self, tx: f64, ty: f64) {
        self.line_x += tx * self.scale;
        self.line_y += ty * self.scale;
        self.x = self.line_x;
        self.y = self.line_y;
    }

    fn next_line(&mut self) {
        self.move_line(0.0, -self.leading);
    }

    /// Emits one word per whitespace-separated token and advances the pen.
    fn show(&mut self, text: &str, out: &mut Vec<PositionedWord>) {
        let size = self.size();
        let glyph = size * GLYPH_WIDTH_EM;
        let mut offset = 0usize;
        let mut word = String::new();
        let mut word_start = 0usize;
        for c in text.chars() {
            if c.is_whitespace() {
                self.flush_word(&mut word, word_start, glyph, size, out);
            } else {
                if word.is_empty() {
                    word_start = offset;
                }
                word.push(c);
            }
            offset += 1;
        }
        self.flush_word(&mut word, word_start, glyph, size, out);
        self.x += offset as f64 * glyph;
    }

    fn flush_word(
        &self,
        word: &mut String,
        start: usize,
        glyph: f64,
        size: f64,
        out: &mut Vec<PositionedWord>,
    ) {
        if word.is_empty() {
            return;
        }
        let x0 = self.x + start as f64 * glyph;
        let x1 = x0 + word.chars().count() as f64 * glyph;
        out.push(PositionedWord {
            text: std::mem::take(word),
            bbox: BoundingBox::new(x0, self.y - 0.2 * size, x1, self.y + 0.8 * size),
        });
    }
}

fn page_words(doc: &Document, page_id: ObjectId) -> Result<Vec<PositionedWord>, lopdf::Error> {
    let data = doc.get_page_content(page_id)?;
    let content = Content::decode(&data)?;

    let mut words = Vec::new();
    let mut state = TextState::new();
    for op in &content.operations {
        let nums: Vec<f64> = op.operands.iter().filter_map(number).collect();
        match op.operator.as_str() {
            "BT" => state = TextState {
                font_size: state.font_size,
                leading: state.leading,
                ..TextState::new()
            },
            "Tf" => {
                if let Some(size) = nums.first() {
                    state.font_size = *size;
                }
            }
            "TL" => {
                if let Some(leading) = nums.first() {
                    state.leading = *leading;
                }
            }
            "Tm" if nums.len() == 6 => {
                state.scale = if nums[0].abs() > f64::EPSILON {
                    nums[0].abs()
                } else {
                    1.0
                };
                state.line_x = nums[4];
                state.line_y = nums[5];
                state.x = nums[4];
                state.y = nums[5];
            }
            "Td" if nums.len() == 2 => state.move_line(nums[0], nums[1]),
            "TD" if nums.len() == 2 => {
                state.leading = -nums[1];
                state.move_line(nums[0], nums[1]);
            }
            "T*" => state.next_line(),
            "Tj" => {
                if let Some(text) = op.operands.first().and_then(decode_string) {
                    state.show(&text, &mut words);
                }
            }
            "'" => {
                state.next_line();
                if let Some(text) = op.operands.first().and_then(decode_string) {
                    state.show(&text, &mut words);
                }
            }
            "\"" => {
                state.next_line();
                if let Some(text) = op.operands.get(2).and_then(decode_string) {
                    state.show(&text, &mut words);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    let mut text = String::new();
                    for item in items {
                        match item {
                            Object::String(..) => {
                                if let Some(s) = decode_string(item) {
                                    text.push_str(&s);
                                }
                            }
                            other => {
                                if number(other).is_some_and(|n| -n > TJ_SPACE_THRESHOLD) {
                                    text.push(' ');
                                }
                            }
                        }
                    }
                    state.show(&text, &mut words);
                }
            }
            _ => {}
        }
    }
    Ok(words)
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// UTF-16BE when the BOM is present, Latin-1 otherwise.
fn decode_string(obj: &Object) -> Option<String> {
    let Object::String(bytes, _) = obj else {
        return None;
    };
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).ok()
    } else {
        Some(bytes.iter().map(|&b| b as char).collect())
    }
}

// ============ Lines and tables ============

struct Line {
    cells: Vec<String>,
}

fn group_lines(words: &[PositionedWord]) -> Vec<Line> {
    let mut sorted: Vec<&PositionedWord> = words.iter().collect();
    sorted.sort_by(|a, b| {
        b.bbox
            .center_y()
            .total_cmp(&a.bbox.center_y())
            .then(a.bbox.x0.total_cmp(&b.bbox.x0))
    });

    let mut rows: Vec<Vec<&PositionedWord>> = Vec::new();
    for word in sorted {
        match rows.last_mut() {
            Some(row)
                if (row[0].bbox.center_y() - word.bbox.center_y()).abs() <= LINE_TOLERANCE =>
            {
                row.push(word)
            }
            _ => rows.push(vec![word]),
        }
    }

    rows.into_iter()
        .map(|mut row| {
            row.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
            let mut cells: Vec<String> = Vec::new();
            let mut prev_x1: Option<f64> = None;
            for word in row {
                match (prev_x1, cells.last_mut()) {
                    (Some(x1), Some(cell)) if word.bbox.x0 - x1 <= CELL_GAP => {
                        cell.push(' ');
                        cell.push_str(&word.text);
                    }
                    _ => cells.push(word.text.clone()),
                }
                prev_x1 = Some(word.bbox.x1);
            }
            Line { cells }
        })
        .collect()
}

/// Runs of at least two consecutive multi-cell lines.
fn detect_tables(lines: &[Line]) -> Vec<Table> {
    let mut tables = Vec::new();
    let mut current: Table = Vec::new();
    for line in lines {
        if line.cells.len() >= 2 {
            current.push(line.cells.clone());
        } else {
            if current.len() >= 2 {
                tables.push(std::mem::take(&mut current));
            }
            current.clear();
        }
    }
    if current.len() >= 2 {
        tables.push(current);
    }
    tables
}

// ============ Annotations ============

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn as_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, obj)? {
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn is_name(obj: Option<&Object>, expected: &[u8]) -> bool {
    matches!(obj, Some(Object::Name(name)) if name.as_slice() == expected)
}

fn page_links(doc: &Document, page_id: ObjectId) -> Vec<LinkAnnotation> {
    let Ok(page) = doc.get_dictionary(page_id) else {
        return Vec::new();
    };
    let Some(Object::Array(annots)) = page.get(b"Annots").ok().and_then(|a| resolve(doc, a))
    else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for annot in annots {
        let Some(dict) = as_dict(doc, annot) else {
            continue;
        };
        if !is_name(dict.get(b"Subtype").ok(), b"Link") {
            continue;
        }
        let Some(action) = dict.get(b"A").ok().and_then(|a| as_dict(doc, a)) else {
            continue;
        };
        if !is_name(action.get(b"S").ok().and_then(|s| resolve(doc, s)), b"URI") {
            continue;
        }
        let Some(url) = action
            .get(b"URI")
            .ok()
            .and_then(|u| resolve(doc, u))
            .and_then(decode_string)
        else {
            continue;
        };
        let rect: Vec<f64> = match dict.get(b"Rect").ok().and_then(|r| resolve(doc, r)) {
            Some(Object::Array(values)) => values.iter().filter_map(number).collect(),
            _ => Vec::new(),
        };
        let bbox = if rect.len() == 4 {
            BoundingBox::new(rect[0], rect[1], rect[2], rect[3])
        } else {
            BoundingBox::default()
        };
        links.push(LinkAnnotation {
            url: url.trim().to_string(),
            bbox,
        });
    }
    links
}
