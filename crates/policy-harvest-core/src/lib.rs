//! # Policy Harvest Core
//!
//! Runtime-agnostic logic for Policy Harvest: data models, field
//! recognition, validation, link-title resolution, listing discovery,
//! progress tracking, resource throttling, and the store abstractions.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Anything
//! that touches the outside world (sampling `/proc`, Redis, SQLite, the
//! network) is injected through the traits in [`store`], [`throttle`], and
//! [`clock`].

pub mod clock;
pub mod error;
pub mod listing;
pub mod models;
pub mod recognize;
pub mod resolve;
pub mod store;
pub mod text;
pub mod throttle;
pub mod tracker;
pub mod validate;
