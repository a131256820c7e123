//! Tier selection from request shape

use crate::core::models::{Tier, TranslationContext};

/// Characters above which a request goes to the high-capability tier
const LONG_TEXT_CHARS: usize = 200;

/// Pick the execution tier for a request.
///
/// Glossaries, few-shot examples, long text and multi-line text all need the
/// stronger model; short single lines go to the fast one.
pub fn select(text: &str, context: &TranslationContext) -> Tier {
    if !context.glossary().is_empty() || !context.few_shot_examples.is_empty() {
        return Tier::Pro;
    }

    if text.chars().count() > LONG_TEXT_CHARS || text.contains('\n') {
        return Tier::Pro;
    }

    Tier::Fast
}
