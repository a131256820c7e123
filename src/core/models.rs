//! Core data models for translation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution tier for model selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Low-latency model for short single lines
    Fast,
    /// High-capability model for long or context-rich input
    Pro,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Fast => write!(f, "fast"),
            Tier::Pro => write!(f, "pro"),
        }
    }
}

/// How the caller wants the model picked
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum ModelChoice {
    /// Let the selector decide from the request shape
    #[default]
    Auto,
    /// Use the configured model of a tier
    Tier(Tier),
    /// Use a model by id
    Named(String),
}

impl std::str::FromStr for ModelChoice {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "" | "auto" => ModelChoice::Auto,
            "fast" => ModelChoice::Tier(Tier::Fast),
            "pro" => ModelChoice::Tier(Tier::Pro),
            _ => ModelChoice::Named(s.to_string()),
        })
    }
}

/// Translation model profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub tier: Tier,
    /// Request the upstream's extended reasoning mode
    pub high_reasoning: bool,
    pub enabled: bool,
}

impl Model {
    /// Check if model serves the given tier
    pub fn is_compatible(&self, tier: Tier) -> bool {
        self.tier == tier && self.enabled
    }
}

/// Dialogue tone hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Tone {
    #[default]
    Auto,
    Casual,
    Formal,
    Aggressive,
    Rough,
    Intimate,
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tone::Auto => "Auto",
            Tone::Casual => "Casual",
            Tone::Formal => "Formal",
            Tone::Aggressive => "Aggressive",
            Tone::Rough => "Rough",
            Tone::Intimate => "Intimate",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Tone::Auto),
            "casual" => Ok(Tone::Casual),
            "formal" => Ok(Tone::Formal),
            "aggressive" => Ok(Tone::Aggressive),
            "rough" => Ok(Tone::Rough),
            "intimate" => Ok(Tone::Intimate),
            other => Err(format!("unknown tone: {}", other)),
        }
    }
}

/// A glossary term and its required rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub term: String,
    pub definition: String,
}

/// A user correction fed back as a style example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub original: String,
    pub translated: String,
}

/// Per-request scene context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationContext {
    pub movie_title: String,
    pub speaker: String,
    pub listener: String,
    pub tone: Tone,
    pub scene_description: String,
    glossary: Vec<GlossaryEntry>,
    pub few_shot_examples: Vec<FewShotExample>,
}

impl TranslationContext {
    pub fn new(movie_title: impl Into<String>) -> Self {
        Self {
            movie_title: movie_title.into(),
            ..Default::default()
        }
    }

    pub fn with_speakers(mut self, speaker: impl Into<String>, listener: impl Into<String>) -> Self {
        self.speaker = speaker.into();
        self.listener = listener.into();
        self
    }

    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tone = tone;
        self
    }

    pub fn with_scene(mut self, scene: impl Into<String>) -> Self {
        self.scene_description = scene.into();
        self
    }

    /// Add a glossary term; the first definition of a term wins
    pub fn with_term(mut self, term: impl Into<String>, definition: impl Into<String>) -> Self {
        self.add_term(term, definition);
        self
    }

    pub fn with_example(mut self, original: impl Into<String>, translated: impl Into<String>) -> Self {
        self.few_shot_examples.push(FewShotExample {
            original: original.into(),
            translated: translated.into(),
        });
        self
    }

    /// Insert a glossary term unless it is already present
    pub fn add_term(&mut self, term: impl Into<String>, definition: impl Into<String>) -> bool {
        let term = term.into();
        if self.glossary.iter().any(|e| e.term == term) {
            return false;
        }
        self.glossary.push(GlossaryEntry {
            term,
            definition: definition.into(),
        });
        true
    }

    pub fn glossary(&self) -> &[GlossaryEntry] {
        &self.glossary
    }

    /// Glossary rendered for prompts, `None` when empty
    pub fn glossary_text(&self) -> Option<String> {
        if self.glossary.is_empty() {
            return None;
        }
        Some(
            self.glossary
                .iter()
                .map(|e| format!("{} = {}", e.term, e.definition))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Harm categories the upstream filters on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmCategory {
    HarmCategoryHateSpeech,
    HarmCategorySexuallyExplicit,
    HarmCategoryDangerousContent,
    HarmCategoryHarassment,
}

/// Block thresholds for upstream safety filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmBlockThreshold {
    BlockOnlyHigh,
    BlockMediumAndAbove,
    BlockNone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmBlockThreshold,
}

/// Generation parameters sent with every call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub safety_settings: Vec<SafetySetting>,
    pub high_reasoning: bool,
}

impl GenerationConfig {
    /// Subtitle defaults: low temperature, permissive safety for drama and action scenes
    pub fn for_model(model: &Model) -> Self {
        let safety_settings = [
            HarmCategory::HarmCategoryHateSpeech,
            HarmCategory::HarmCategorySexuallyExplicit,
            HarmCategory::HarmCategoryDangerousContent,
            HarmCategory::HarmCategoryHarassment,
        ]
        .into_iter()
        .map(|category| SafetySetting {
            category,
            threshold: HarmBlockThreshold::BlockOnlyHigh,
        })
        .collect();

        Self {
            temperature: 0.3,
            max_output_tokens: 8192,
            safety_settings,
            high_reasoning: model.high_reasoning,
        }
    }

    /// One-token request used by health checks
    pub fn health_check() -> Self {
        Self {
            temperature: 0.0,
            max_output_tokens: 1,
            safety_settings: vec![],
            high_reasoning: false,
        }
    }
}

/// Request handed to the upstream backend
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub prompt: String,
    pub config: GenerationConfig,
}

/// Complete upstream reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub text: String,
    /// Exact token count when the upstream reports usage
    pub total_tokens: Option<u64>,
}

/// Translation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResult {
    pub translation: String,
    pub tokens_used: u64,
    pub model_used: String,
    pub cached: bool,
}

/// Persisted daily token budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReservoir {
    pub capacity: u64,
    pub remaining: u64,
    /// Milliseconds since the Unix epoch
    pub last_refill: i64,
    #[serde(default)]
    pub total_consumed: u64,
}

impl TokenReservoir {
    pub fn full(capacity: u64, now_ms: i64) -> Self {
        Self {
            capacity,
            remaining: capacity,
            last_refill: now_ms,
            total_consumed: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Less than a tenth of the capacity left
    pub fn is_low(&self) -> bool {
        self.remaining < self.capacity / 10
    }
}

/// One translatable batch line after header extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLineRecord {
    pub index: usize,
    /// Structural prefix kept verbatim, possibly empty
    pub header: String,
    pub content: String,
    pub original_line: String,
}
