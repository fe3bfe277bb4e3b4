//! Foundation module - Core utilities and types
//!
//! - Typed handles and bindless index tables
//! - Logging utilities

pub mod collections;
pub mod logging;
