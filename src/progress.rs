//! Scrape progress reporting for the CLI.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts. The
//! pipeline emits events as it discovers months and after each document.

use std::io::Write;

use policy_harvest_core::models::TaskProgress;

#[derive(Clone, Debug)]
pub enum ScrapeProgressEvent {
    /// Fetching and parsing the listing page. Month count unknown.
    Discovering { source: String },
    /// Starting a monthly update PDF.
    Month {
        label: String,
        index: usize,
        total: usize,
        links: usize,
    },
    /// Tracker state after a document finished.
    Task(TaskProgress),
}

pub trait ScrapeProgressReporter: Send + Sync {
    fn report(&self, event: ScrapeProgressEvent);
}

/// Human-friendly progress: "scrape  12 / 40 documents  30.0%  Dental Implants".
pub struct StderrProgress;

impl ScrapeProgressReporter for StderrProgress {
    fn report(&self, event: ScrapeProgressEvent) {
        let line = match &event {
            ScrapeProgressEvent::Discovering { source } => {
                format!("scrape  discovering {}...\n", source)
            }
            ScrapeProgressEvent::Month {
                label,
                index,
                total,
                links,
            } => format!(
                "scrape  month {} / {}  {}  {} policy links\n",
                index + 1,
                total,
                label,
                format_number(*links as u64)
            ),
            ScrapeProgressEvent::Task(p) => format!(
                "scrape  {} / {} documents  {:.1}%  {}\n",
                format_number(p.items_processed),
                format_number(p.items_total),
                p.percent(),
                p.current_item_label
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ScrapeProgressReporter for JsonProgress {
    fn report(&self, event: ScrapeProgressEvent) {
        let obj = match &event {
            ScrapeProgressEvent::Discovering { source } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "source": source
            }),
            ScrapeProgressEvent::Month {
                label,
                index,
                total,
                links,
            } => serde_json::json!({
                "event": "progress",
                "phase": "month",
                "month": label,
                "index": index,
                "total": total,
                "links": links
            }),
            ScrapeProgressEvent::Task(p) => serde_json::json!({
                "event": "progress",
                "phase": "documents",
                "task": p
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

pub struct NoProgress;

impl ScrapeProgressReporter for NoProgress {
    fn report(&self, _event: ScrapeProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ScrapeProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
