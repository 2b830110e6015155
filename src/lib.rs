//! caecod - immutable HTTP responses out of a precomputed dataset
//!
//! a dataset is a directory of four sealed files (`idx`, `data`, `names`,
//! `hash`) sharing one uuid. payloads are complete response tails (a header
//! block terminated by a blank line, then the body); the index is a minimum
//! perfect hash over the request paths, so a lookup is one hash evaluation
//! plus two dereferences into memory-mapped regions.
//!
//! the two builders produce that layout from a tab-separated manifest of
//! files-with-headers or from an MBTiles-shaped tile store; the server
//! memory-maps the result and answers `GET`/`HEAD` over it until told to
//! stop.

pub mod builder;
pub mod config;
pub mod db;
pub mod error;
pub mod mapped;
pub mod phash;
pub mod server;
pub mod tiles;
pub mod types;

pub use db::Database;
pub use error::{CaecodError, Result};
