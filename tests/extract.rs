//! Layout extraction and link titles on hand-built PDFs.

mod common;

use policy_harvest::document::DocumentExtractor;
use policy_harvest::extract;
use policy_harvest_core::error::HarvestError;
use policy_harvest_core::recognize::{RecognitionContext, DEFAULT_POLICY_BASE};
use policy_harvest_core::resolve::UNKNOWN_TITLE;

use common::{build_pdf, monthly_update_pdf, policy_pdf, TestPage};

const BASE: &str = "https://static.cigna.com/assets/chcp/pdf/coveragePolicies/medical";

fn extractor() -> DocumentExtractor {
    DocumentExtractor::new(DEFAULT_POLICY_BASE).unwrap()
}

#[test]
fn slug_titles_from_link_only_pdf() {
    let pdf = monthly_update_pdf(&[
        format!("{BASE}/mm_0586_coveragepositioncriteria_alveoloplasty.pdf"),
        format!("{BASE}/mm_0579_coveragepositioncriteria_cervical_plexus_block.pdf"),
        format!("{BASE}/mm_0585_coveragepositioncriteria_dental_implants.pdf"),
    ]);
    let links = extractor().links(&pdf).unwrap();
    let titles: Vec<&str> = links.iter().map(|l| l.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Alveoloplasty", "Cervical Plexus Block", "Dental Implants"]
    );
}

#[test]
fn table_cell_titles_and_comments() {
    let page = TestPage::default()
        .text(50.0, 700.0, "Policy Title (Number)")
        .text(300.0, 700.0, "Comments")
        .text(50.0, 680.0, "Dental Implants (0585)")
        .text(300.0, 680.0, "New policy")
        .link(&format!("{BASE}/mm_0585.pdf"), [50.0, 678.0, 200.0, 692.0]);
    let pdf = build_pdf(&[page]);

    let layout = extract::extract_layout(&pdf).unwrap();
    assert_eq!(layout.pages.len(), 1);
    assert_eq!(layout.pages[0].tables.len(), 1);
    assert_eq!(layout.link_count(), 1);

    let links = extractor().links(&pdf).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].title, "Dental Implants (0585)");
    assert_eq!(links[0].comments, "New policy");
}

#[test]
fn nearby_words_then_unknown_title() {
    let page = TestPage::default()
        .text(50.0, 600.0, "Genetic Testing Overview")
        .link("https://example.org/docs/overview.pdf", [50.0, 598.0, 250.0, 612.0])
        .link("https://example.org/docs/blank.pdf", [50.0, 200.0, 250.0, 212.0])
        .link("https://example.org/docs/index.html", [50.0, 400.0, 250.0, 412.0]);
    let links = extractor().links(&build_pdf(&[page])).unwrap();

    assert_eq!(links.len(), 2);
    assert_eq!(links[0].title, "Genetic Testing Overview");
    assert_eq!(links[1].title, UNKNOWN_TITLE);
}

#[test]
fn links_across_pages_are_deduplicated() {
    let url = format!("{BASE}/mm_0586_coveragepositioncriteria_alveoloplasty.pdf");
    let page = TestPage::default().link(&url, [50.0, 700.0, 200.0, 712.0]);
    let pdf = build_pdf(&[page.clone(), page]);
    assert_eq!(extract::extract_layout(&pdf).unwrap().pages.len(), 2);
    assert_eq!(extractor().links(&pdf).unwrap().len(), 1);
}

#[test]
fn policy_text_is_extracted() {
    let pdf = policy_pdf("Dental Implants", "01/01/2025", "21248");
    let text = extract::extract_text(&pdf).unwrap();
    assert!(text.contains("Dental Implants"));
    assert!(text.contains("21248"));
}

#[test]
fn policy_document_to_bundle() {
    let pdf = policy_pdf("Dental Implants", "03/01/2025", "21248");
    let ctx = RecognitionContext::new(format!("{BASE}/mm_0585.pdf"))
        .with_month_label(Some("March 2025".to_string()));
    let bundles = extractor().extract_from_document(&pdf, &ctx);

    assert_eq!(bundles.len(), 1);
    let record = &bundles[0].record;
    assert_eq!(record.title, "Dental Implants");
    assert_eq!(record.source_url, format!("{BASE}/mm_0585.pdf"));
    assert_eq!(record.month_label.as_deref(), Some("March 2025"));
    assert!(bundles[0].medical_codes.iter().any(|c| c.code == "21248"));
}

#[test]
fn blank_document_is_rejected() {
    let pdf = build_pdf(&[TestPage::default()]);
    let ctx = RecognitionContext::new(format!("{BASE}/mm_0001.pdf"));
    assert!(extractor().extract_from_document(&pdf, &ctx).is_empty());
}

#[test]
fn garbage_bytes_fail_to_decode() {
    let err = extractor().links(b"this is not a pdf").unwrap_err();
    assert!(matches!(err, HarvestError::Decode(_)));
    assert!(extract::extract_text(b"not a pdf either").is_err());
}
