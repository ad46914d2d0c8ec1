//! From PDF bytes to validated policy bundles.
//!
//! [`DocumentExtractor`] ties the text extractor to the link resolver (for
//! monthly update PDFs) and to the recognizer and validator (for individual
//! policy PDFs). It does no I/O beyond parsing the bytes it is given, so the
//! CLI uses it offline and the pipeline calls it from blocking tasks.

use anyhow::Result;
use tracing::{debug, warn};

use policy_harvest_core::error::HarvestError;
use policy_harvest_core::models::{ExtractionLink, PolicyBundle, ValidationResult};
use policy_harvest_core::recognize::{FieldRecognizer, RecognitionContext};
use policy_harvest_core::resolve::{TitleResolver, UNKNOWN_TITLE};
use policy_harvest_core::validate::validate;

use crate::extract;

pub struct DocumentExtractor {
    recognizer: FieldRecognizer,
    resolver: TitleResolver,
}

impl DocumentExtractor {
    pub fn new(policy_base: &str) -> Result<Self> {
        Ok(Self {
            recognizer: FieldRecognizer::with_policy_base(policy_base)?,
            resolver: TitleResolver::new()?,
        })
    }

    /// Titled policy links of a monthly update PDF.
    pub fn links(&self, bytes: &[u8]) -> Result<Vec<ExtractionLink>, HarvestError> {
        let layout = extract::extract_layout(bytes)?;
        let links = self.resolver.resolve_document(&layout.pages);
        debug!(
            pages = layout.pages.len(),
            annotations = layout.link_count(),
            policy_links = links.len(),
            "resolved monthly links"
        );
        Ok(links)
    }

    /// Recognizes and validates one policy document's text. A resolved link
    /// title replaces the recognized one. Only a failed recognition is an
    /// error; an invalid record comes back as an invalid result.
    pub fn validate_text(
        &self,
        text: &str,
        ctx: &RecognitionContext,
        link_title: Option<&str>,
    ) -> Result<ValidationResult, HarvestError> {
        let mut bundle =
            self.recognizer
                .recognize(text, ctx)
                .ok_or_else(|| HarvestError::Recognition {
                    url: ctx.source_url.clone(),
                })?;

        if let Some(title) = link_title.filter(|t| !t.trim().is_empty() && *t != UNKNOWN_TITLE) {
            bundle.record.title = title.to_string();
        }

        let result = validate(&bundle);
        for warning in &result.warnings {
            warn!(url = %ctx.source_url, warning = %warning, "validation warning");
        }
        Ok(result)
    }

    /// [`validate_text`](Self::validate_text) with invalid records turned
    /// into errors.
    pub fn bundle_from_text(
        &self,
        text: &str,
        ctx: &RecognitionContext,
        link_title: Option<&str>,
    ) -> Result<PolicyBundle, HarvestError> {
        let result = self.validate_text(text, ctx, link_title)?;
        if !result.is_valid {
            return Err(HarvestError::Validation {
                url: ctx.source_url.clone(),
                errors: result.errors,
            });
        }
        Ok(result.cleaned)
    }

    /// Text, recognition and validation for one policy PDF. Any failure is
    /// logged and yields an empty list.
    pub fn extract_from_document(
        &self,
        bytes: &[u8],
        ctx: &RecognitionContext,
    ) -> Vec<PolicyBundle> {
        let text = match extract::extract_text(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!(url = %ctx.source_url, error = %e, "document extraction failed");
                return Vec::new();
            }
        };
        match self.bundle_from_text(&text, ctx, None) {
            Ok(bundle) => vec![bundle],
            Err(e) => {
                warn!(url = %ctx.source_url, kind = e.kind(), error = %e, "document rejected");
                Vec::new()
            }
        }
    }
}
