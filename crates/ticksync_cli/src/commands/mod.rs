//! CLI command implementations.

pub mod config;
pub mod inspect;
pub mod lookup;
pub mod simulate;
