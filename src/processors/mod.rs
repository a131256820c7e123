//! Subtitle text processing: cleaning, deduplication and prompts

pub mod cleaner;
pub mod dedup;
pub mod prompt;
