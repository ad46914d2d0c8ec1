//! Shared fixtures: hand-built PDFs and a local HTTP server that stands in
//! for the policy site.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};

/// One page of a test PDF: text lines at `(x, y)` and URI link annotations
/// with their rectangles.
#[derive(Default, Clone)]
pub struct TestPage {
    pub lines: Vec<(f64, f64, String)>,
    pub links: Vec<(String, [f64; 4])>,
}

impl TestPage {
    pub fn text(mut self, x: f64, y: f64, text: &str) -> Self {
        self.lines.push((x, y, text.to_string()));
        self
    }

    pub fn link(mut self, url: &str, rect: [f64; 4]) -> Self {
        self.links.push((url.to_string(), rect));
        self
    }
}

fn escape_pdf_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)")
}

/// Writes numbered objects, an xref table with exact byte offsets, and a
/// trailer whose root is object 1.
fn assemble(objects: &[String]) -> Vec<u8> {
    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref_at = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_at
        )
        .as_bytes(),
    );
    out
}

/// A PDF with Helvetica text and link annotations.
///
/// Objects: 1 catalog, 2 page tree, 3 font, then per page the page, its
/// content stream, and one object per annotation.
pub fn build_pdf(pages: &[TestPage]) -> Vec<u8> {
    let mut page_bodies = Vec::new();
    let mut kids = Vec::new();
    let mut next = 4;
    for page in pages {
        let page_id = next;
        let content_id = next + 1;
        let annot_ids: Vec<usize> = (0..page.links.len()).map(|i| next + 2 + i).collect();
        next += 2 + page.links.len();
        kids.push(format!("{} 0 R", page_id));

        let mut content = String::from("BT\n/F1 12 Tf\n");
        for (x, y, text) in &page.lines {
            content.push_str(&format!(
                "1 0 0 1 {} {} Tm\n({}) Tj\n",
                x,
                y,
                escape_pdf_string(text)
            ));
        }
        content.push_str("ET");

        let annots = if annot_ids.is_empty() {
            String::new()
        } else {
            format!(
                " /Annots [{}]",
                annot_ids
                    .iter()
                    .map(|id| format!("{} 0 R", id))
                    .collect::<Vec<_>>()
                    .join(" ")
            )
        };
        let mut bodies = vec![
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 3 0 R >> >>{} >>",
                content_id, annots
            ),
            format!(
                "<< /Length {} >>\nstream\n{}\nendstream",
                content.len(),
                content
            ),
        ];
        for (url, rect) in &page.links {
            bodies.push(format!(
                "<< /Type /Annot /Subtype /Link /Rect [{} {} {} {}] /Border [0 0 0] /A << /S /URI /URI ({}) >> >>",
                rect[0],
                rect[1],
                rect[2],
                rect[3],
                escape_pdf_string(url)
            ));
        }
        page_bodies.extend(bodies);
    }

    let mut objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids.join(" "),
            pages.len()
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];
    objects.extend(page_bodies);
    assemble(&objects)
}

/// A monthly update PDF: one linked line per URL, top to bottom.
pub fn monthly_update_pdf(urls: &[String]) -> Vec<u8> {
    let mut page = TestPage::default().text(50.0, 750.0, "Policy Updates");
    for (i, url) in urls.iter().enumerate() {
        let y = 700.0 - 20.0 * i as f64;
        page = page.link(url, [50.0, y - 2.0, 300.0, y + 10.0]);
    }
    build_pdf(&[page])
}

/// A single-page policy document with a labelled title, an effective date,
/// and one procedure code.
pub fn policy_pdf(title: &str, effective: &str, code: &str) -> Vec<u8> {
    let page = TestPage::default()
        .text(50.0, 740.0, &format!("Policy Title: {}", title))
        .text(50.0, 720.0, &format!("Effective Date: {}", effective))
        .text(50.0, 690.0, "This policy describes medical necessity criteria.")
        .text(50.0, 670.0, &format!("Procedure code {} is covered when criteria are met.", code));
    build_pdf(&[page])
}

// ============ Fixture site ============

type Files = Arc<HashMap<String, Vec<u8>>>;

async fn serve_file(State(files): State<Files>, uri: Uri) -> Response {
    match files.get(uri.path()) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serves `files` (path -> body) on an already bound listener. Unknown
/// paths return 404.
pub fn serve_listener(listener: tokio::net::TcpListener, files: HashMap<String, Vec<u8>>) {
    let app = Router::new()
        .fallback(serve_file)
        .with_state(Arc::new(files));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

/// Binds an ephemeral local port. The address is known before the files
/// that embed it are built.
pub async fn bind_local() -> (tokio::net::TcpListener, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub async fn serve_site(files: HashMap<String, Vec<u8>>) -> SocketAddr {
    let (listener, addr) = bind_local().await;
    serve_listener(listener, files);
    addr
}

// ============ CLI ============

/// Path to the `harvest` binary built alongside the test executable.
pub fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("harvest");
    path
}
