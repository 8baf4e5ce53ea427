//! TestRunner Common Library
//!
//! Shared data model for the TestRunner service: test definitions as they
//! arrive over HTTP, and the run status records tracked while they execute.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// TestRunner version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Generate a fresh run identifier
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Map a test case id onto a filesystem-safe file stem
pub fn file_stem(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "test".to_string()
    } else {
        cleaned.to_string()
    }
}
