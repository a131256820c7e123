//! Post-processing of raw model output for subtitle lines

use std::sync::OnceLock;

use regex::Regex;

use crate::processors::dedup::split_ass_dialogue;

/// Turns raw model output into a displayable line
pub trait TextCleaner: Send + Sync + std::fmt::Debug {
    fn clean(&self, text: &str) -> String;
}

/// Default cleaner for subtitle output.
///
/// Italic tags are removed, commas and the section mark `။` are dropped
/// outside `{...}` override blocks, and an ASS `Dialogue:` header is left
/// untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubtitleCleaner;

impl TextCleaner for SubtitleCleaner {
    fn clean(&self, text: &str) -> String {
        post_process(text)
    }
}

fn italic_tags() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\\i[01]?\}").expect("valid italic regex"))
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

fn newline_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\\N\s*").expect("valid newline-tag regex"))
}

fn trailing_dot() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([^A-Za-z0-9_])\.$").expect("valid trailing-dot regex"))
}

fn code_fence_open() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^```(?:ass|text)?\s*[\r\n]+").expect("valid fence regex"))
}

fn code_fence_close() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\r\n]+```\s*$").expect("valid fence regex"))
}

fn clean_content(text: &str) -> String {
    let without_italics = italic_tags().replace_all(text, "");
    let mut result = String::with_capacity(without_italics.len());
    let mut depth = 0usize;

    for ch in without_italics.chars() {
        match ch {
            '{' => {
                depth += 1;
                result.push(ch);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                result.push(ch);
            }
            ',' | '။' if depth == 0 => {}
            _ => result.push(ch),
        }
    }
    result
}

/// Strip punctuation and italics, keeping an ASS header intact
pub fn clean_text(text: &str) -> String {
    if text.trim_start().starts_with("Dialogue:") {
        return match split_ass_dialogue(text) {
            Some((header, content)) => format!("{}{}", header, clean_content(content)),
            None => text.to_string(),
        };
    }
    clean_content(text)
}

/// Full cleanup of a single output line
pub fn post_process(text: &str) -> String {
    let cleaned = clean_text(text);
    let collapsed = whitespace_runs().replace_all(&cleaned, " ");
    let tagged = newline_tag().replace_all(&collapsed, "\\N");
    let trimmed = tagged.trim();
    trailing_dot().replace(trimmed, "$1").into_owned()
}

/// Split a raw reply into cleaned lines.
///
/// Markdown fences are removed and a single trailing blank line is dropped.
pub fn process_raw_response(raw: &str, cleaner: &dyn TextCleaner) -> Vec<String> {
    let unfenced = code_fence_open().replace(raw, "");
    let unfenced = code_fence_close().replace(&unfenced, "");

    let mut lines: Vec<&str> = unfenced.split('\n').collect();
    if lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    lines.into_iter().map(|line| cleaner.clean(line)).collect()
}
