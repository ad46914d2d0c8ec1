//! Error taxonomy for the extraction pipeline.
//!
//! Each variant is a per-document failure: the pipeline logs it, records a
//! scraping-log row, and moves on to the next document. Duplicate inserts are
//! not errors (see [`InsertOutcome`](crate::store::InsertOutcome)) and
//! soft-bound violations surface as validation warnings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// The document bytes could not be parsed as a PDF.
    #[error("failed to decode document: {0}")]
    Decode(String),

    /// Fetching a document failed or timed out.
    #[error("failed to fetch {url}: {message}")]
    Network { url: String, message: String },

    /// The recognizer could not build a record from the document text.
    #[error("could not recognize fields in {url}")]
    Recognition { url: String },

    /// The candidate record failed hard validation.
    #[error("invalid record for {url}: {}", errors.join("; "))]
    Validation { url: String, errors: Vec<String> },
}

impl HarvestError {
    /// Short machine-readable kind, used in logs and the scraping-log table.
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::Decode(_) => "decode",
            HarvestError::Network { .. } => "network",
            HarvestError::Recognition { .. } => "recognition",
            HarvestError::Validation { .. } => "validation",
        }
    }
}
