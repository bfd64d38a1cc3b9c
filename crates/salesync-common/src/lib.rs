//! Salesync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Salesync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Checksums**: canonical content hashing for idempotent writes
//! - **Logging**: subscriber bootstrap shared by every binary
//! - **Types**: marketplace sources and inclusive date windows
//!
//! # Example
//!
//! ```no_run
//! use salesync_common::checksum::content_hash;
//! use serde_json::json;
//!
//! let a = content_hash(&json!({"qty": 2, "price": 100}));
//! let b = content_hash(&json!({"price": 100, "qty": 2}));
//! assert_eq!(a, b);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{DateWindow, SourceId};
