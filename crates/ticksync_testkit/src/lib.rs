//! # TickSync Testkit
//!
//! Test utilities for TickSync.
//!
//! This crate provides:
//! - A test center fixture with a healthcare model set
//! - Seeded clinic scenarios
//! - Property-based generators using proptest
//! - A multi-device integration harness driving real clients
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ticksync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn devices_converge() {
//!     let mut harness = IntegrationHarness::new();
//!     harness.write("tablet", put_change("notes", "n1", json!({"text": "hi"})));
//!     harness.sync_all().await;
//!     harness.assert_converged("notes");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
