//! Record validation and cleaning.
//!
//! [`validate`] never fails: hard problems (missing title or URL, malformed
//! URL) mark the result invalid, soft ones become warnings. The cleaned
//! copy is a fixed point, so validating it again changes nothing.

use serde::Serialize;
use url::Url;

use crate::models::{
    CodeType, DocumentChange, MedicalCode, PolicyBundle, PolicyRecord, ReferencedDocument,
    ValidationResult,
};
use crate::text::collapse_whitespace;

pub const MIN_TITLE_LEN: usize = 5;
pub const MAX_TITLE_LEN: usize = 500;
pub const MIN_BODY_LEN: usize = 50;
pub const MAX_BODY_LEN: usize = 50_000;

pub fn validate(bundle: &PolicyBundle) -> ValidationResult {
    let cleaned = clean_bundle(bundle);
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let record = &cleaned.record;

    if record.title.is_empty() {
        errors.push("Missing required field: title".to_string());
    }
    if record.source_url.is_empty() {
        errors.push("Missing required field: url".to_string());
    } else if !is_well_formed_url(&record.source_url) {
        errors.push(format!("Invalid URL format: {}", record.source_url));
    }

    let title_len = record.title.chars().count();
    if title_len > 0 && title_len < MIN_TITLE_LEN {
        warnings.push("Title seems too short".to_string());
    } else if title_len > MAX_TITLE_LEN {
        warnings.push("Title seems too long".to_string());
    }

    let body_len = record.body_text.chars().count();
    if body_len < MIN_BODY_LEN {
        warnings.push("Body content seems too short".to_string());
    } else if body_len > MAX_BODY_LEN {
        warnings.push("Body content seems too long".to_string());
    }

    for code in &cleaned.medical_codes {
        if !code_matches_type(&code.code, code.code_type) {
            warnings.push(format!(
                "Invalid {} code format: {}",
                code.code_type.as_str(),
                code.code
            ));
        }
    }

    for doc in &cleaned.referenced_documents {
        if let Some(url) = &doc.url {
            if !is_well_formed_url(url) {
                warnings.push(format!("Invalid document URL: {}", url));
            }
        }
        if doc.title.is_empty() {
            warnings.push("Referenced document missing title".to_string());
        }
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        cleaned,
    }
}

/// Absolute URL with a scheme and a host.
pub fn is_well_formed_url(s: &str) -> bool {
    Url::parse(s).map(|u| u.has_host()).unwrap_or(false)
}

/// An http(s) URL on `allowed_host` or one of its subdomains.
pub fn is_scrapable_url(s: &str, allowed_host: &str) -> bool {
    let Ok(url) = Url::parse(s) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    match url.host_str() {
        Some(host) => host == allowed_host || host.ends_with(&format!(".{}", allowed_host)),
        None => false,
    }
}

pub fn code_matches_type(code: &str, code_type: CodeType) -> bool {
    let b = code.as_bytes();
    match code_type {
        CodeType::Cpt => b.len() == 5 && b.iter().all(u8::is_ascii_digit),
        CodeType::Hcpcs => {
            b.len() == 5 && b[0].is_ascii_uppercase() && b[1..].iter().all(u8::is_ascii_digit)
        }
        CodeType::Icd10 => {
            if b.len() < 3 || !b[0].is_ascii_uppercase() || !b[1..3].iter().all(u8::is_ascii_digit)
            {
                return false;
            }
            match &b[3..] {
                [] => true,
                [b'.', rest @ ..] => {
                    (1..=4).contains(&rest.len()) && rest.iter().all(u8::is_ascii_digit)
                }
                _ => false,
            }
        }
    }
}

/// Tabs and newlines become spaces, other control characters are dropped,
/// then whitespace is collapsed.
pub fn clean_text(s: &str) -> String {
    let mapped: String = s
        .chars()
        .filter_map(|c| match c {
            '\t' | '\n' | '\r' => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();
    collapse_whitespace(&mapped)
}

fn clean_optional(s: &Option<String>) -> Option<String> {
    s.as_deref().map(clean_text).filter(|s| !s.is_empty())
}

fn clean_bundle(bundle: &PolicyBundle) -> PolicyBundle {
    let r = &bundle.record;
    PolicyBundle {
        record: PolicyRecord {
            title: clean_text(&r.title),
            source_url: clean_text(&r.source_url),
            published_date: r.published_date,
            category: clean_text(&r.category),
            body_text: clean_text(&r.body_text),
            month_label: clean_optional(&r.month_label),
        },
        medical_codes: bundle
            .medical_codes
            .iter()
            .map(|c| MedicalCode {
                code: clean_text(&c.code).to_uppercase(),
                code_type: c.code_type,
                description: clean_text(&c.description),
            })
            .collect(),
        referenced_documents: bundle
            .referenced_documents
            .iter()
            .map(|d| ReferencedDocument {
                title: clean_text(&d.title),
                url: clean_optional(&d.url),
                document_type: d.document_type,
            })
            .collect(),
        document_changes: bundle
            .document_changes
            .iter()
            .map(|c| DocumentChange {
                document_title: clean_text(&c.document_title),
                change_type: c.change_type,
                description: clean_text(&c.description),
                section_affected: clean_optional(&c.section_affected),
            })
            .collect(),
    }
}

/// Aggregate over many validation results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub total_errors: usize,
    pub total_warnings: usize,
    /// Percentage of valid results, 0 when `total` is 0.
    pub success_rate: f64,
}

impl ValidationSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a ValidationResult>) -> Self {
        let mut summary = ValidationSummary::default();
        for r in results {
            summary.record(r);
        }
        summary
    }

    /// Adds one result and refreshes the success rate.
    pub fn record(&mut self, result: &ValidationResult) {
        self.total += 1;
        if result.is_valid {
            self.valid += 1;
        } else {
            self.invalid += 1;
        }
        self.total_errors += result.errors.len();
        self.total_warnings += result.warnings.len();
        self.success_rate = self.valid as f64 / self.total as f64 * 100.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeType, DocumentType};

    fn bundle(title: &str, url: &str, body: &str) -> PolicyBundle {
        PolicyBundle::new(PolicyRecord {
            title: title.to_string(),
            source_url: url.to_string(),
            published_date: None,
            category: "Medical Policy".to_string(),
            body_text: body.to_string(),
            month_label: Some("January 2025".to_string()),
        })
    }

    const BODY: &str = "This policy describes coverage criteria for a dental procedure in detail.";

    #[test]
    fn short_title_is_a_warning_only() {
        let result = validate(&bundle("Abc", "https://static.example.com/a.pdf", BODY));
        assert!(result.is_valid);
        assert!(result.warnings.contains(&"Title seems too short".to_string()));
    }

    #[test]
    fn missing_title_is_invalid() {
        let result = validate(&bundle("  ", "https://static.example.com/a.pdf", BODY));
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["Missing required field: title"]);
    }

    #[test]
    fn malformed_url_is_invalid() {
        let result = validate(&bundle("Dental Implants", "not a url", BODY));
        assert!(!result.is_valid);
        assert!(result.errors[0].starts_with("Invalid URL format"));

        let missing = validate(&bundle("Dental Implants", "", BODY));
        assert_eq!(missing.errors, vec!["Missing required field: url"]);
    }

    #[test]
    fn short_body_warns() {
        let result = validate(&bundle("Dental Implants", "https://x.test/a.pdf", ""));
        assert!(result.is_valid);
        assert!(result
            .warnings
            .contains(&"Body content seems too short".to_string()));
    }

    #[test]
    fn code_and_reference_warnings() {
        let mut b = bundle("Dental Implants", "https://x.test/a.pdf", BODY);
        b.medical_codes.push(MedicalCode {
            code: "1234".into(),
            code_type: CodeType::Cpt,
            description: String::new(),
        });
        b.referenced_documents.push(ReferencedDocument {
            title: "".into(),
            url: Some("nope".into()),
            document_type: DocumentType::Research,
        });
        let result = validate(&b);
        assert!(result.is_valid);
        assert!(result
            .warnings
            .contains(&"Invalid CPT code format: 1234".to_string()));
        assert!(result
            .warnings
            .contains(&"Invalid document URL: nope".to_string()));
        assert!(result
            .warnings
            .contains(&"Referenced document missing title".to_string()));
    }

    #[test]
    fn cleaning_is_idempotent() {
        let mut b = bundle(
            "  Dental\tImplants\u{7}  ",
            " https://x.test/a.pdf\n",
            "line one\r\n\r\nline\u{0}two",
        );
        b.medical_codes.push(MedicalCode {
            code: " d6010 ".into(),
            code_type: CodeType::Hcpcs,
            description: "supply\n d6010".into(),
        });
        b.document_changes.push(DocumentChange {
            document_title: "Dental Implants".into(),
            change_type: ChangeType::Added,
            description: " added  codes ".into(),
            section_affected: Some("   ".into()),
        });

        let once = validate(&b).cleaned;
        let twice = validate(&once).cleaned;
        assert_eq!(once, twice);
        assert_eq!(once.record.title, "Dental Implants");
        assert_eq!(once.record.source_url, "https://x.test/a.pdf");
        assert_eq!(once.record.body_text, "line one linetwo");
        assert_eq!(once.medical_codes[0].code, "D6010");
        assert_eq!(once.document_changes[0].section_affected, None);
    }

    #[test]
    fn code_shapes() {
        assert!(code_matches_type("41874", CodeType::Cpt));
        assert!(!code_matches_type("4187A", CodeType::Cpt));
        assert!(code_matches_type("D6010", CodeType::Hcpcs));
        assert!(code_matches_type("K08", CodeType::Icd10));
        assert!(code_matches_type("K08.1012", CodeType::Icd10));
        assert!(!code_matches_type("K08.", CodeType::Icd10));
        assert!(!code_matches_type("K08.10123", CodeType::Icd10));
    }

    #[test]
    fn scrapable_urls() {
        assert!(is_scrapable_url(
            "https://static.cigna.com/assets/a.pdf",
            "cigna.com"
        ));
        assert!(!is_scrapable_url("https://evil.example/a.pdf", "cigna.com"));
        assert!(!is_scrapable_url("ftp://static.cigna.com/a.pdf", "cigna.com"));
    }

    #[test]
    fn summary_counts() {
        let ok = validate(&bundle("Dental Implants", "https://x.test/a.pdf", BODY));
        let bad = validate(&bundle("", "https://x.test/b.pdf", BODY));
        let summary = ValidationSummary::from_results([&ok, &bad]);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.valid, 1);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.success_rate, 50.0);
    }
}
