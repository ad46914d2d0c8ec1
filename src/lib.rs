//! # Policy Harvest
//!
//! Scrapes monthly insurance policy-update PDFs, recognizes structured
//! fields in each referenced policy document, and stores validated records
//! in SQLite, with task progress exposed through a CLI and an HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Listing  │──▶│ Monthly PDF │──▶│ Policy PDFs  │──▶│  SQLite  │
//! │  (HTML)  │   │ links+titles│   │ recognize +  │   │ records  │
//! └──────────┘   └────────────┘   │ validate     │   └──────────┘
//!                                  └──────┬───────┘
//!                        progress ◀───────┤ throttle
//!                     (memory/Redis)      ▼
//!                                  ┌──────────────┐
//!                                  │ CLI / HTTP   │
//!                                  └──────────────┘
//! ```
//!
//! Pure logic (models, recognizer, validator, resolver, tracker, throttle)
//! lives in `policy-harvest-core`; this crate adds the I/O.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`extract`] | PDF text, table, and link extraction |
//! | [`document`] | Bytes to validated bundles |
//! | [`fetch`] | HTTP client and responsiveness probe |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite record store |
//! | [`redis_progress`] | Redis progress store |
//! | [`sampler`] | `/proc` resource sampling |
//! | [`services`] | Wiring from configuration |
//! | [`pipeline`] | Scrape orchestration and worker pool |
//! | [`tasks`] | Cancellation handles |
//! | [`monitor_loop`] | Periodic resource monitor |
//! | [`progress`] | CLI progress reporting |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP task API |

pub mod commands;
pub mod config;
pub mod db;
pub mod document;
pub mod extract;
pub mod fetch;
pub mod logging;
pub mod migrate;
pub mod monitor_loop;
pub mod pipeline;
pub mod progress;
pub mod redis_progress;
pub mod sampler;
pub mod server;
pub mod services;
pub mod sqlite_store;
pub mod tasks;
