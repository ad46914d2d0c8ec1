//! Core data types shared by the extraction pipeline, the stores, and the
//! HTTP surface.
//!
//! A scraped policy document becomes a [`PolicyBundle`]: one
//! [`PolicyRecord`] plus the medical codes, referenced documents, and
//! change entries recognized in it. Bundles are validated and persisted as
//! a unit, keyed by `source_url`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One individual policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub title: String,
    /// Canonical URL of the policy PDF. Globally unique across the store.
    pub source_url: String,
    pub published_date: Option<NaiveDate>,
    pub category: String,
    pub body_text: String,
    /// Label of the monthly update the policy was discovered in, e.g. `"January 2025"`.
    pub month_label: Option<String>,
}

impl PolicyRecord {
    /// SHA-256 of the body text, hex encoded.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.body_text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Billing code family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CodeType {
    Cpt,
    Hcpcs,
    Icd10,
}

impl CodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeType::Cpt => "CPT",
            CodeType::Hcpcs => "HCPCS",
            CodeType::Icd10 => "ICD10",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CPT" => Some(CodeType::Cpt),
            "HCPCS" => Some(CodeType::Hcpcs),
            "ICD10" | "ICD-10" => Some(CodeType::Icd10),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalCode {
    pub code: String,
    pub code_type: CodeType,
    /// Text surrounding the code in the source document.
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    MedicalPolicy,
    ClinicalGuideline,
    ReimbursementPolicy,
    CoveragePolicy,
    Research,
    Organization,
    GenericReference,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::MedicalPolicy => "medical_policy",
            DocumentType::ClinicalGuideline => "clinical_guideline",
            DocumentType::ReimbursementPolicy => "reimbursement_policy",
            DocumentType::CoveragePolicy => "coverage_policy",
            DocumentType::Research => "research",
            DocumentType::Organization => "organization",
            DocumentType::GenericReference => "generic_reference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "medical_policy" => DocumentType::MedicalPolicy,
            "clinical_guideline" => DocumentType::ClinicalGuideline,
            "reimbursement_policy" => DocumentType::ReimbursementPolicy,
            "coverage_policy" => DocumentType::CoveragePolicy,
            "research" => DocumentType::Research,
            "organization" => DocumentType::Organization,
            "generic_reference" => DocumentType::GenericReference,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedDocument {
    pub title: String,
    pub url: Option<String>,
    pub document_type: DocumentType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
    Updated,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Removed => "removed",
            ChangeType::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub document_title: String,
    pub change_type: ChangeType,
    pub description: String,
    pub section_affected: Option<String>,
}

/// A policy record together with everything recognized inside it.
///
/// Children never outlive their record: stores persist the whole bundle in
/// one transaction or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub record: PolicyRecord,
    pub medical_codes: Vec<MedicalCode>,
    pub referenced_documents: Vec<ReferencedDocument>,
    pub document_changes: Vec<DocumentChange>,
}

impl PolicyBundle {
    pub fn new(record: PolicyRecord) -> Self {
        Self {
            record,
            medical_codes: Vec::new(),
            referenced_documents: Vec::new(),
            document_changes: Vec::new(),
        }
    }
}

/// A policy link found in a monthly update PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionLink {
    pub url: String,
    pub title: String,
    /// Free text from the "Comments" column of the update table. May be empty.
    pub comments: String,
}

/// One monthly update discovered on the listing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyLink {
    pub month_label: String,
    pub url: String,
    pub link_text: String,
}

// ============ Page layout ============

/// Axis-aligned box in PDF user space (origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn center_y(&self) -> f64 {
        (self.y0 + self.y1) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionedWord {
    pub text: String,
    pub bbox: BoundingBox,
}

/// A `/Link` annotation with a URI action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkAnnotation {
    pub url: String,
    pub bbox: BoundingBox,
}

/// Ordered rows of ordered cell strings.
pub type Table = Vec<Vec<String>>;

/// Everything the extractor recovered from one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    /// 1-based page number.
    pub number: u32,
    pub text: String,
    pub words: Vec<PositionedWord>,
    pub tables: Vec<Table>,
    pub links: Vec<LinkAnnotation>,
}

// ============ Validation ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub cleaned: PolicyBundle,
}

// ============ Task progress ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Started,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// `started -> processing* -> {completed | failed}`. Terminal states are final.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Started => next != TaskStatus::Started,
            TaskStatus::Processing => next != TaskStatus::Started,
            TaskStatus::Completed | TaskStatus::Failed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Started => "started",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub items_processed: u64,
    pub items_total: u64,
    pub current_item_label: String,
    pub start_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TaskProgress {
    pub fn percent(&self) -> f64 {
        if self.items_total == 0 {
            return if self.status == TaskStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.items_processed as f64 / self.items_total as f64 * 100.0).min(100.0)
    }
}

// ============ Resources ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub available_memory_gb: f64,
    pub disk_percent: f64,
    pub process_memory_mb: f64,
    pub timestamp: DateTime<Utc>,
}

// ============ Operational logs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
    Skipped,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
            LogStatus::Skipped => "skipped",
        }
    }
}

/// One row of the scraping log: the outcome of a single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeLog {
    pub url: String,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub records_scraped: u32,
    pub execution_time_secs: f64,
    pub timestamp: DateTime<Utc>,
}

impl ScrapeLog {
    pub fn success(url: &str, records: u32, secs: f64) -> Self {
        Self {
            url: url.to_string(),
            status: LogStatus::Success,
            error_message: None,
            records_scraped: records,
            execution_time_secs: secs,
            timestamp: Utc::now(),
        }
    }

    pub fn error(url: &str, message: impl Into<String>, secs: f64) -> Self {
        Self {
            url: url.to_string(),
            status: LogStatus::Error,
            error_message: Some(message.into()),
            records_scraped: 0,
            execution_time_secs: secs,
            timestamp: Utc::now(),
        }
    }

    pub fn skipped(url: &str, reason: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            status: LogStatus::Skipped,
            error_message: Some(reason.into()),
            records_scraped: 0,
            execution_time_secs: 0.0,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use TaskStatus::*;
        assert!(Started.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Started.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Started));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn code_type_serializes_uppercase() {
        let json = serde_json::to_string(&CodeType::Icd10).unwrap();
        assert_eq!(json, "\"ICD10\"");
        assert_eq!(CodeType::parse("hcpcs"), Some(CodeType::Hcpcs));
    }

    #[test]
    fn bounding_box_normalizes_corners() {
        let b = BoundingBox::new(10.0, 20.0, 0.0, 5.0);
        assert_eq!(b.x0, 0.0);
        assert_eq!(b.y1, 20.0);
        assert_eq!(b.center_y(), 12.5);
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let rec = PolicyRecord {
            title: "T".into(),
            source_url: "https://x/a.pdf".into(),
            published_date: None,
            category: "Medical Policy".into(),
            body_text: "abc".into(),
            month_label: None,
        };
        assert_eq!(
            rec.content_hash(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
