//! Batch line planning: pass-through detection, header extraction and deduplication

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::BatchLineRecord;

/// Line-oriented subtitle format of a batch input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    /// Every non-blank line is content
    #[default]
    Plain,
    /// SubRip: index and timing lines are metadata
    Srt,
    /// Advanced SubStation: only `Dialogue:` lines carry text
    Ass,
}

impl SubtitleFormat {
    /// Guess the format from a file name
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.ends_with(".ass") || lower.ends_with(".ssa") {
            SubtitleFormat::Ass
        } else if lower.ends_with(".srt") {
            SubtitleFormat::Srt
        } else {
            SubtitleFormat::Plain
        }
    }

    pub fn is_structured(self) -> bool {
        self != SubtitleFormat::Plain
    }
}

fn srt_index() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+$").expect("valid index regex"))
}

fn srt_timing() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{2}:\d{2}:\d{2}.*\d{2}:\d{2}:\d{2}").expect("valid timing regex")
    })
}

/// Split an ASS `Dialogue:` line after its ninth comma into (header, text)
pub fn split_ass_dialogue(line: &str) -> Option<(&str, &str)> {
    let (idx, _) = line.match_indices(',').nth(8)?;
    Some((&line[..=idx], &line[idx + 1..]))
}

/// The `Name` field of an ASS dialogue line, if present and non-empty
pub fn ass_actor(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("Dialogue:")?;
    let name = rest.split(',').nth(4)?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Whether a raw line must be sent for translation at all
pub fn needs_translation(line: &str, format: SubtitleFormat) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    match format {
        SubtitleFormat::Plain => true,
        SubtitleFormat::Ass => trimmed.starts_with("Dialogue:"),
        SubtitleFormat::Srt => !srt_index().is_match(trimmed) && !srt_timing().is_match(trimmed),
    }
}

/// Result of planning a batch: what passes through and what goes upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupPlan {
    /// Output so far; `None` marks a line still waiting for translation
    pub output: Vec<Option<String>>,
    /// Lines queued for translation, in input order
    pub records: Vec<BatchLineRecord>,
    /// Distinct contents in first-seen order
    pub unique_contents: Vec<String>,
}

impl DedupPlan {
    /// Plan a batch.
    ///
    /// `completed` holds earlier progress by index; entries that are `Some`
    /// are kept as they are. A missing or shorter vector counts as no progress.
    pub fn build(lines: &[String], format: SubtitleFormat, completed: &[Option<String>]) -> Self {
        let mut output = Vec::with_capacity(lines.len());
        let mut records = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            if let Some(Some(done)) = completed.get(index) {
                output.push(Some(done.clone()));
                continue;
            }
            if !needs_translation(line, format) {
                output.push(Some(line.clone()));
                continue;
            }

            let (header, content) = match format {
                SubtitleFormat::Ass => split_ass_dialogue(line).unwrap_or(("", line.as_str())),
                _ => ("", line.as_str()),
            };
            let content = content.trim();

            if content.is_empty() {
                output.push(Some(line.clone()));
                continue;
            }

            records.push(BatchLineRecord {
                index,
                header: header.to_string(),
                content: content.to_string(),
                original_line: line.clone(),
            });
            output.push(None);
        }

        let unique_contents = {
            let mut seen = HashSet::new();
            records
                .iter()
                .filter(|r| seen.insert(r.content.as_str()))
                .map(|r| r.content.clone())
                .collect()
        };

        Self {
            output,
            records,
            unique_contents,
        }
    }

    pub fn pending(&self) -> usize {
        self.output.iter().filter(|l| l.is_none()).count()
    }

    /// Apply translations for the consecutive slice `chunk` of unique contents.
    ///
    /// Every record whose content is in the chunk is rebuilt as
    /// `header + translation`, duplicates included. Returns the number of
    /// lines filled.
    pub fn apply(&mut self, chunk: &[String], translations: &[String]) -> Result<usize> {
        if chunk.len() != translations.len() {
            return Err(TranslationError::BatchAlignment {
                sent: chunk.len(),
                received: translations.len(),
            });
        }

        let map: HashMap<&str, &str> = chunk
            .iter()
            .map(String::as_str)
            .zip(translations.iter().map(String::as_str))
            .collect();

        let mut filled = 0;
        for record in &self.records {
            if let Some(translated) = map.get(record.content.as_str()) {
                if self.output[record.index].is_none() {
                    self.output[record.index] = Some(format!("{}{}", record.header, translated));
                    filled += 1;
                }
            }
        }
        Ok(filled)
    }
}
