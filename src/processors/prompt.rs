//! Prompt construction for single-line and batch requests

use crate::core::models::TranslationContext;
use crate::processors::dedup::ass_actor;

/// Few-shot examples carried into batch prompts
const BATCH_EXAMPLE_LIMIT: usize = 5;

/// System instruction for the subtitle translator persona
pub fn system_instruction(target_language: &str) -> String {
    format!(
        "You are a subtitle localizer translating film and series dialogue into natural, \
spoken {target_language}.\n\
For every line: analyse the scene, interpret the subtext, then translate meaning rather than words.\n\
Rules:\n\
- ASS input keeps its \"Dialogue:\" header, timestamps and styles; translate only the Text field.\n\
- Keep positioning tags such as {{\\pos(x,y)}}, {{\\fad(t1,t2)}} and \\N exactly; drop italic tags.\n\
- Keep personal names in their original spelling, in Title Case.\n\
- Do not add commas or sentence-final punctuation.\n\
- Return only the translated lines, never your analysis."
    )
}

/// Prompt for a single line or short passage
pub fn single_prompt(text: &str, context: &TranslationContext, target_language: &str) -> String {
    let speaker = if context.speaker.is_empty() {
        ass_actor(text).unwrap_or("Unknown")
    } else {
        context.speaker.as_str()
    };

    let mut prompt = format!(
        "\n[INPUT]\n{text}\n\n[CONTEXT]\n\
- Source: {source}\n\
- Spkr: {speaker}\n\
- Listener: {listener}\n\
- Tone: {tone}\n\
- Scene: {scene}\n\
- Glossary/Terms: {glossary}\n",
        source = or_default(&context.movie_title, "Unknown"),
        listener = or_default(&context.listener, "Unknown"),
        tone = context.tone,
        scene = or_default(&context.scene_description, "None"),
        glossary = context.glossary_text().unwrap_or_else(|| "None".to_string()),
    );

    if !context.few_shot_examples.is_empty() {
        let examples = context
            .few_shot_examples
            .iter()
            .map(|ex| format!("Input: {}\nOutput: {}", ex.original, ex.translated))
            .collect::<Vec<_>>()
            .join("\n---\n");
        prompt.push_str(&format!(
            "\n[LEARNED PATTERNS (STRICTLY FOLLOW THIS STYLE)]\n\
The user has provided previous corrections. Mimic this style exactly:\n{examples}\n"
        ));
    }

    prompt.push_str(&format!(
        "\n[TASK]\nTranslate to spoken {target_language}.\n\
1. Meaning over literal. Natural flow.\n\
2. Terminology: \"{}\".\n\
3. Names: keep original, Title Case.\n\
4. Format: maintain ASS tags. Remove italics. No punctuation.\n",
        or_default(&context.movie_title, "this show"),
    ));

    prompt
}

/// Prompt for a chunk of unique batch lines
pub fn batch_prompt(
    unique_lines: &[String],
    context: &TranslationContext,
    target_language: &str,
) -> String {
    let count = unique_lines.len();
    let mut prompt = format!(
        "[BATCH INPUT - {count} unique lines]\n{}\n\n",
        unique_lines.join("\n")
    );

    if !context.few_shot_examples.is_empty() {
        let start = context.few_shot_examples.len().saturating_sub(BATCH_EXAMPLE_LIMIT);
        let refs = context.few_shot_examples[start..]
            .iter()
            .map(|ex| format!("Original: {} -> Translated: {}", ex.original, ex.translated))
            .collect::<Vec<_>>()
            .join("\n");
        prompt.push_str(&format!("[LEARNED STYLE REFERENCES]\n{refs}\n\n"));
    }

    prompt.push_str(&format!(
        "\n[INSTRUCTIONS]\nTranslate to spoken {target_language}.\n\
- Source Material: {}\n\
- Context: {}\n\
- Scene: {}\n\
- Glossary: {}\n\
- CRITICAL: Maintain strict line-by-line correspondence. Output exactly {count} lines.\n\
- NAMES: Keep original names. Force Title Case (e.g. \"JOHN\" -> \"John\").\n\
- FORMAT: Keep formatting tags like {{\\an8}} or \\N in their relative positions.\n\
- Clean italics/punctuation.\n",
        or_default(&context.movie_title, "General"),
        context.tone,
        or_default(&context.scene_description, "General"),
        context.glossary_text().unwrap_or_else(|| "None".to_string()),
    ));

    prompt
}

fn or_default<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::Tone;

    #[test]
    fn test_single_prompt_uses_ass_actor_as_fallback_speaker() {
        let ctx = TranslationContext::new("Night Shift").with_tone(Tone::Rough);
        let prompt = single_prompt(
            "Dialogue: 0,0:00:01.00,0:00:02.00,Default,Mina,0,0,0,,Run",
            &ctx,
            "Burmese",
        );
        assert!(prompt.contains("- Spkr: Mina"));
        assert!(prompt.contains("- Tone: Rough"));
        assert!(prompt.contains("- Glossary/Terms: None"));
        assert!(!prompt.contains("LEARNED PATTERNS"));
    }

    #[test]
    fn test_batch_prompt_keeps_last_five_examples() {
        let mut ctx = TranslationContext::new("Show");
        for i in 0..7 {
            ctx = ctx.with_example(format!("o{i}"), format!("t{i}"));
        }
        let prompt = batch_prompt(&["a".to_string(), "b".to_string()], &ctx, "Burmese");
        assert!(prompt.starts_with("[BATCH INPUT - 2 unique lines]\na\nb"));
        assert!(prompt.contains("Output exactly 2 lines"));
        assert!(!prompt.contains("Original: o1 "));
        assert!(prompt.contains("Original: o2 -> Translated: t2"));
        assert!(prompt.contains("Original: o6 -> Translated: t6"));
    }
}
