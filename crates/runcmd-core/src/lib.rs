//! Foundational low-level utilities shared across the run-command handler crates.
//!
//! Provides atomic file-write helpers used by status and marker persistence, bounded
//! readers for captured script output, and time helpers for status timestamps.

pub mod atomic_io;
pub mod output_files;
pub mod time_utils;

pub use atomic_io::{write_bytes_atomic, write_text_atomic};
pub use output_files::{read_from_offset, tail_file};
pub use time_utils::{current_unix_timestamp_ms, utc_timestamp};
