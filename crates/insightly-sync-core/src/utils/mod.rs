//! Utility functions for string formatting and manipulation.

pub mod format;

pub use format::{clean_text, elide_middle, redact};
