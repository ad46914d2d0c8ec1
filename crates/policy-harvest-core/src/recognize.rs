//! Field recognition: plain policy text into a candidate [`PolicyBundle`].
//!
//! Every field is driven by an ordered list of rules compiled once in
//! [`FieldRecognizer::new`]. Within a list the first rule that produces a
//! usable value wins, so rules can be tested (and reordered) independently.
//!
//! | Field | Source |
//! |-------|--------|
//! | title | labelled lines, else a short first line, else a default |
//! | published date | labelled dates, bare dates, the month label, today |
//! | category | whole-word keywords in the comments, then the body |
//! | medical codes | CPT / HCPCS / ICD-10 patterns anywhere in the text |
//! | referenced documents | the "References" section only |
//! | document changes | the link's comments string only |

use std::collections::HashSet;

use chrono::{NaiveDate, Utc};
use regex::Regex;
use tracing::{debug, error};

use crate::error::HarvestError;
use crate::models::{
    ChangeType, CodeType, DocumentChange, DocumentType, MedicalCode, PolicyBundle, PolicyRecord,
    ReferencedDocument,
};
use crate::text::{collapse_whitespace, context_window, normalize_key};

pub const DEFAULT_TITLE: &str = "Medical Coverage Policy";
pub const DEFAULT_CATEGORY: &str = "Medical Policy";
/// Canonical location of individual policy PDFs on the source site.
pub const DEFAULT_POLICY_BASE: &str = "https://static.cigna.com/assets/chcp/pdf/coveragePolicies";

const MAX_FIRST_LINE_TITLE: usize = 120;
const CODE_CONTEXT_RADIUS: usize = 50;
const MIN_REFERENCE_LEN: usize = 20;
const MAX_REFERENCE_LEN: usize = 300;

const TITLE_LABELS: &[&str] = &[
    "Policy Title",
    "Coverage Policy",
    "Medical Coverage Policy",
    "Coverage Position",
    "Title",
    "Subject",
];

const MONTHS: &str =
    "January|February|March|April|May|June|July|August|September|October|November|December";

/// Everything the recognizer knows about a document besides its text.
#[derive(Debug, Clone, Default)]
pub struct RecognitionContext {
    pub source_url: String,
    /// `"January 2025"`-style label of the monthly update.
    pub month_label: Option<String>,
    /// Comments string from the monthly update table.
    pub comments: Option<String>,
}

impl RecognitionContext {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    pub fn with_month_label(mut self, label: Option<String>) -> Self {
        self.month_label = label;
        self
    }

    pub fn with_comments(mut self, comments: Option<String>) -> Self {
        self.comments = comments.filter(|c| !c.trim().is_empty());
        self
    }
}

struct DateRule {
    pattern: Regex,
    formats: &'static [&'static str],
}

struct ReferenceRule {
    pattern: Regex,
    document_type: DocumentType,
}

/// Compiled rule lists for every recognized field.
pub struct FieldRecognizer {
    policy_base: String,
    title_rules: Vec<Regex>,
    date_rules: Vec<DateRule>,
    category_rules: Vec<(Regex, &'static str)>,
    code_rules: Vec<(CodeType, Regex)>,
    section_start: Regex,
    section_end: Regex,
    policy_reference: Regex,
    keyword_rules: Vec<ReferenceRule>,
    numbered_item: Regex,
    boilerplate: Regex,
    change_rules: Vec<(Regex, ChangeType)>,
    section_mention: Regex,
}

impl FieldRecognizer {
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_policy_base(DEFAULT_POLICY_BASE)
    }

    /// Like [`new`](Self::new), but reconstructs referenced-policy URLs
    /// under `policy_base` instead of the default site.
    pub fn with_policy_base(policy_base: &str) -> Result<Self, regex::Error> {
        let title_rules = TITLE_LABELS
            .iter()
            .map(|label| {
                Regex::new(&format!(
                    r"(?im)^[ \t]*{}[ \t]*:[ \t]*(\S[^\n]*)$",
                    regex::escape(label)
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let slash = r"(\d{1,2}/\d{1,2}/\d{4})";
        let long = format!(r"((?:{MONTHS})\s+\d{{1,2}},\s*\d{{4}})");
        let iso = r"(\d{4}-\d{2}-\d{2})";
        const SLASH_FMT: &[&str] = &["%m/%d/%Y"];
        const LONG_FMT: &[&str] = &["%B %d, %Y"];
        const ISO_FMT: &[&str] = &["%Y-%m-%d"];

        let mut date_rules = Vec::new();
        for label in [r"effective\s+date", r"published(?:\s+date)?", r"\bdate"] {
            for (value, formats) in [(slash, SLASH_FMT), (long.as_str(), LONG_FMT), (iso, ISO_FMT)] {
                date_rules.push(DateRule {
                    pattern: Regex::new(&format!(r"(?i){label}\s*:?\s*{value}"))?,
                    formats,
                });
            }
        }
        for (value, formats) in [(slash, SLASH_FMT), (long.as_str(), LONG_FMT), (iso, ISO_FMT)] {
            date_rules.push(DateRule {
                pattern: Regex::new(&format!(r"\b{value}\b"))?,
                formats,
            });
        }

        let category_rules = vec![
            (Regex::new(r"(?i)\bnew\b")?, "New Policy"),
            (Regex::new(r"(?i)\b(?:updated|modified)\b")?, "Updated Policy"),
            (Regex::new(r"(?i)\bretired\b")?, "Retired Policy"),
        ];

        let code_rules = vec![
            (CodeType::Cpt, Regex::new(r"\b\d{5}\b")?),
            (CodeType::Hcpcs, Regex::new(r"\b[A-Z]\d{4}\b")?),
            (CodeType::Icd10, Regex::new(r"\b[A-Z]\d{2}(?:\.\d{1,4})?\b")?),
        ];

        let section_start = Regex::new(
            r"(?im)^[ \t]*(?:[IVX\d]+\.?[ \t]*)?(?:references|bibliography|works cited|citations|sources)[ \t]*:?[ \t]*$",
        )?;
        let section_end = Regex::new(
            r"(?im)^[ \t]*(?:[IVX\d]+\.?[ \t]*)?(?:revision details|revision history|policy history|appendix|coding information|background|coverage policy|overview|definitions|disclaimer|medicare coverage determinations|health equity considerations)[ \t]*:?[ \t]*$",
        )?;

        let policy_reference = Regex::new(r"(?i)\b(cpg|mm|ip|rp|cp)[_ \t-]?(\d{4})\b")?;

        let keyword_rules = vec![
            ReferenceRule {
                pattern: Regex::new(
                    r"(?i)\b(?:guidelines?|recommendations?|consensus statement|practice parameters?|position statement)\b",
                )?,
                document_type: DocumentType::ClinicalGuideline,
            },
            ReferenceRule {
                pattern: Regex::new(
                    r"(?i)\b(?:study|studies|trial|journal|systematic review|meta-analysis|et al)\b",
                )?,
                document_type: DocumentType::Research,
            },
            ReferenceRule {
                pattern: Regex::new(
                    r"\b(?:American|Association|Society|College|Academy|Institute|Agency|Centers for Medicare|CMS|FDA|World Health Organization)\b",
                )?,
                document_type: DocumentType::Organization,
            },
        ];

        let numbered_item = Regex::new(r"(?m)^[ \t]*\d{1,3}[.)][ \t]+(\S[^\n]*)$")?;
        let boilerplate = Regex::new(
            r"(?i)^(?:\s*(?:[-•*·]|\d{1,3}[.)]|see\b|available at:?|retrieved from:?|accessed(?: on| at)?:?))+\s*",
        )?;

        let change_rules = vec![
            (Regex::new(r"(?i)\b(?:added|new)\b")?, ChangeType::Added),
            (
                Regex::new(r"(?i)\b(?:removed|deleted|retired)\b")?,
                ChangeType::Removed,
            ),
            (
                Regex::new(r"(?i)\b(?:updated|modified|changed)\b")?,
                ChangeType::Modified,
            ),
        ];
        let section_mention = Regex::new(r"((?:[A-Z][A-Za-z&/-]*[ \t]+){1,5})[Ss]ection\b")?;

        Ok(Self {
            policy_base: policy_base.trim_end_matches('/').to_string(),
            title_rules,
            date_rules,
            category_rules,
            code_rules,
            section_start,
            section_end,
            policy_reference,
            keyword_rules,
            numbered_item,
            boilerplate,
            change_rules,
            section_mention,
        })
    }

    /// Builds a candidate bundle, or `None` when nothing could be recognized.
    ///
    /// Failures are logged with the source URL and never propagate.
    pub fn recognize(&self, text: &str, ctx: &RecognitionContext) -> Option<PolicyBundle> {
        match self.try_recognize(text, ctx) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                error!(url = %ctx.source_url, error = %e, "field recognition failed");
                None
            }
        }
    }

    fn try_recognize(
        &self,
        text: &str,
        ctx: &RecognitionContext,
    ) -> Result<PolicyBundle, HarvestError> {
        if text.trim().is_empty() {
            return Err(HarvestError::Recognition {
                url: ctx.source_url.clone(),
            });
        }

        let title = self.extract_title(text);
        let record = PolicyRecord {
            published_date: Some(self.extract_date(text, ctx.month_label.as_deref())),
            category: self.extract_category(text, ctx.comments.as_deref()),
            source_url: ctx.source_url.clone(),
            body_text: text.to_string(),
            month_label: ctx.month_label.clone(),
            title,
        };

        let document_changes = match ctx.comments.as_deref() {
            Some(comments) => self.extract_changes(comments, &record.title),
            None => Vec::new(),
        };

        let bundle = PolicyBundle {
            medical_codes: self.extract_codes(text),
            referenced_documents: self.extract_references(text),
            document_changes,
            record,
        };
        debug!(
            url = %ctx.source_url,
            codes = bundle.medical_codes.len(),
            references = bundle.referenced_documents.len(),
            changes = bundle.document_changes.len(),
            "recognized fields"
        );
        Ok(bundle)
    }

    pub fn extract_title(&self, text: &str) -> String {
        for rule in &self.title_rules {
            if let Some(caps) = rule.captures(text) {
                let title = collapse_whitespace(&caps[1]);
                if !title.is_empty() {
                    return title;
                }
            }
        }

        if let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
            if line.chars().count() <= MAX_FIRST_LINE_TITLE && line.chars().any(char::is_alphabetic)
            {
                return collapse_whitespace(line);
            }
        }

        DEFAULT_TITLE.to_string()
    }

    pub fn extract_date(&self, text: &str, month_label: Option<&str>) -> NaiveDate {
        for rule in &self.date_rules {
            for caps in rule.pattern.captures_iter(text) {
                let raw = collapse_whitespace(&caps[1]);
                if let Some(date) = parse_with(&raw, rule.formats) {
                    return date;
                }
            }
        }

        if let Some(date) = month_label.and_then(first_of_month) {
            return date;
        }

        Utc::now().date_naive()
    }

    pub fn extract_category(&self, text: &str, comments: Option<&str>) -> String {
        for source in comments.into_iter().chain(std::iter::once(text)) {
            for (pattern, category) in &self.category_rules {
                if pattern.is_match(source) {
                    return (*category).to_string();
                }
            }
        }
        DEFAULT_CATEGORY.to_string()
    }

    /// CPT, HCPCS, and ICD-10 codes with a ±50 character context.
    /// One entry per `(code, code_type)`, first occurrence wins.
    pub fn extract_codes(&self, text: &str) -> Vec<MedicalCode> {
        let mut seen = HashSet::new();
        let mut codes = Vec::new();
        for (code_type, pattern) in &self.code_rules {
            for m in pattern.find_iter(text) {
                if !seen.insert((m.as_str().to_string(), *code_type)) {
                    continue;
                }
                codes.push(MedicalCode {
                    code: m.as_str().to_string(),
                    code_type: *code_type,
                    description: context_window(text, m.start(), m.end(), CODE_CONTEXT_RADIUS),
                });
            }
        }
        codes
    }

    /// The body of the "References" section, up to the next known header.
    pub fn references_section<'t>(&self, text: &'t str) -> Option<&'t str> {
        let start = self.section_start.find(text)?.end();
        let rest = &text[start..];
        let end = self
            .section_end
            .find(rest)
            .map(|m| m.start())
            .unwrap_or(rest.len());
        Some(&rest[..end])
    }

    pub fn extract_references(&self, text: &str) -> Vec<ReferencedDocument> {
        let Some(section) = self.references_section(text) else {
            return Vec::new();
        };

        let mut keys = HashSet::new();
        let mut classified = HashSet::new();
        let mut docs = Vec::new();
        let mut push = |doc: ReferencedDocument, docs: &mut Vec<ReferencedDocument>| {
            let basis = doc.url.as_deref().unwrap_or(&doc.title);
            let key = format!("{}:{}", doc.document_type.as_str(), normalize_key(basis));
            if keys.insert(key) {
                docs.push(doc);
            }
        };

        // Policy numbers with a type prefix.
        for caps in self.policy_reference.captures_iter(section) {
            let prefix = caps[1].to_ascii_lowercase();
            let number = &caps[2];
            let (document_type, dir) = match prefix.as_str() {
                "mm" => (DocumentType::MedicalPolicy, "medical"),
                "cpg" => (DocumentType::ClinicalGuideline, "cpg"),
                "rp" => (DocumentType::ReimbursementPolicy, "reimbursement"),
                "ip" => (DocumentType::CoveragePolicy, "pharmacy"),
                _ => (DocumentType::CoveragePolicy, "medical"),
            };
            let m = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            let line = line_around(section, m.0, m.1);
            let title = self.clean_reference(line);
            let title = if title.chars().count() > MAX_REFERENCE_LEN || title.is_empty() {
                format!("{} {}", prefix.to_ascii_uppercase(), number)
            } else {
                title
            };
            classified.insert(normalize_key(&title));
            push(
                ReferencedDocument {
                    title,
                    url: Some(format!("{}/{}/{}_{}.pdf", self.policy_base, dir, prefix, number)),
                    document_type,
                },
                &mut docs,
            );
        }

        // Guideline, study, and organization mentions.
        for span in sentence_spans(section) {
            let title = self.clean_reference(span);
            if !reference_len_ok(&title) {
                continue;
            }
            if let Some(rule) = self.keyword_rules.iter().find(|r| r.pattern.is_match(&title)) {
                classified.insert(normalize_key(&title));
                push(
                    ReferencedDocument {
                        title,
                        url: None,
                        document_type: rule.document_type,
                    },
                    &mut docs,
                );
            }
        }

        // Whatever numbered items remain.
        for caps in self.numbered_item.captures_iter(section) {
            let title = self.clean_reference(&caps[1]);
            if !reference_len_ok(&title) || classified.contains(&normalize_key(&title)) {
                continue;
            }
            if sentence_spans(&title)
                .iter()
                .any(|s| classified.contains(&normalize_key(&self.clean_reference(s))))
            {
                continue;
            }
            push(
                ReferencedDocument {
                    title,
                    url: None,
                    document_type: DocumentType::GenericReference,
                },
                &mut docs,
            );
        }

        docs
    }

    fn clean_reference(&self, raw: &str) -> String {
        let collapsed = collapse_whitespace(raw);
        self.boilerplate.replace(&collapsed, "").trim().to_string()
    }

    /// One change per `;`-separated comment fragment.
    pub fn extract_changes(&self, comments: &str, document_title: &str) -> Vec<DocumentChange> {
        comments
            .split(';')
            .map(collapse_whitespace)
            .filter(|f| !f.is_empty())
            .map(|fragment| {
                let change_type = self
                    .change_rules
                    .iter()
                    .find(|(pattern, _)| pattern.is_match(&fragment))
                    .map(|(_, ct)| *ct)
                    .unwrap_or(ChangeType::Updated);
                DocumentChange {
                    document_title: document_title.to_string(),
                    change_type,
                    section_affected: self.section_affected(&fragment),
                    description: fragment,
                }
            })
            .collect()
    }

    fn section_affected(&self, fragment: &str) -> Option<String> {
        let caps = self.section_mention.captures(fragment)?;
        let words: Vec<&str> = caps[1]
            .split_whitespace()
            .skip_while(|w| {
                self.change_rules
                    .iter()
                    .any(|(pattern, _)| pattern.is_match(w))
            })
            .collect();
        if words.is_empty() {
            None
        } else {
            Some(words.join(" "))
        }
    }
}

fn parse_with(raw: &str, formats: &[&str]) -> Option<NaiveDate> {
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// `"January 2025"` -> 2025-01-01.
pub fn first_of_month(label: &str) -> Option<NaiveDate> {
    let label = collapse_whitespace(label);
    ["%d %B %Y", "%d %b %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&format!("1 {}", label), fmt).ok())
}

fn reference_len_ok(s: &str) -> bool {
    (MIN_REFERENCE_LEN..=MAX_REFERENCE_LEN).contains(&s.chars().count())
}

fn line_around(s: &str, start: usize, end: usize) -> &str {
    let lo = s[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let hi = s[end..].find('\n').map(|i| end + i).unwrap_or(s.len());
    &s[lo..hi]
}

/// Lines, further split after sentence-ending periods.
fn sentence_spans(section: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    for line in section.lines() {
        let mut rest = line;
        while let Some(idx) = rest.find(". ") {
            let (head, tail) = rest.split_at(idx + 1);
            if !head.trim().is_empty() {
                spans.push(head);
            }
            rest = tail;
        }
        if !rest.trim().is_empty() {
            spans.push(rest);
        }
    }
    spans
}
