//! CLI command definitions and handlers

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::OrchestratorConfig;
use crate::core::models::{ModelChoice, Tone, TranslationContext};
use crate::core::orchestrator::{BatchOutcome, BatchRequest, Orchestrator};
use crate::core::store::{clear_progress, load_progress, progress_key_for_lines};
use crate::processors::dedup::SubtitleFormat;

/// Translation context shared by the translating commands
#[derive(Args, Debug, Clone, Default)]
pub struct ContextArgs {
    /// Movie or series title
    #[arg(long, default_value = "")]
    pub movie: String,

    /// Who is speaking
    #[arg(long, default_value = "")]
    pub speaker: String,

    /// Who is being addressed
    #[arg(long, default_value = "")]
    pub listener: String,

    /// Tone hint (auto, casual, formal, aggressive, rough, intimate)
    #[arg(long, default_value = "auto")]
    pub tone: Tone,

    /// Scene description
    #[arg(long, default_value = "")]
    pub scene: String,

    /// Glossary entries as `term=definition`, repeatable
    #[arg(short, long = "term")]
    pub terms: Vec<String>,

    /// Model: auto, fast, pro or a model id
    #[arg(short, long, default_value = "auto")]
    pub model: String,
}

impl ContextArgs {
    pub fn context(&self) -> TranslationContext {
        let mut context = TranslationContext::new(self.movie.clone())
            .with_speakers(self.speaker.clone(), self.listener.clone())
            .with_tone(self.tone)
            .with_scene(self.scene.clone());

        for entry in &self.terms {
            match entry.split_once('=') {
                Some((term, definition)) => {
                    if !context.add_term(term.trim(), definition.trim()) {
                        warn!("Duplicate glossary term ignored: {}", term.trim());
                    }
                }
                None => warn!("Glossary entry without '=' ignored: {}", entry),
            }
        }
        context
    }

    pub fn model_choice(&self) -> ModelChoice {
        self.model.parse().unwrap_or_default()
    }
}

/// Commands for Dialogue Translator
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Translate a single line
    Line {
        /// Text to translate
        text: String,

        #[command(flatten)]
        context: ContextArgs,
    },

    /// Translate a single line, printing chunks as they arrive
    Stream {
        /// Text to translate
        text: String,

        #[command(flatten)]
        context: ContextArgs,
    },

    /// Translate a subtitle or text file in deduplicated batches
    File {
        /// Input file (.srt, .ass, .ssa or plain text)
        #[arg(short, long)]
        file: PathBuf,

        /// Output file (default: `[MM] <name>` next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Ignore saved progress and start over
        #[arg(long)]
        fresh: bool,

        #[command(flatten)]
        context: ContextArgs,
    },

    /// Start HTTP API server
    Server {
        /// Bind address (default: 0.0.0.0)
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Listen port (default: 8000)
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },

    /// Check upstream connectivity
    Health {
        /// Check this model id instead of the fast tier
        #[arg(short, long, conflicts_with = "all")]
        model: Option<String>,

        /// Check every enabled model in turn
        #[arg(long)]
        all: bool,
    },

    /// Show the daily token reservoir
    Reservoir,
}

/// Handle single-line translation command
pub async fn handle_line(
    config: OrchestratorConfig,
    text: String,
    args: ContextArgs,
) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let result = orchestrator
        .translate(&text, &args.context(), &args.model_choice())
        .await?;

    info!(
        "Translated with {} ({} tokens, cached: {})",
        result.model_used, result.tokens_used, result.cached
    );
    println!("{}", result.translation);

    Ok(())
}

/// Handle streaming translation command
pub async fn handle_stream(
    config: OrchestratorConfig,
    text: String,
    args: ContextArgs,
) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let mut chunks = orchestrator.translate_stream(&text, &args.context(), &args.model_choice());

    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        write!(stdout, "{}", chunk)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    Ok(())
}

/// Where a translated file is written by default
pub fn default_output_path(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.txt".to_string());
    input.with_file_name(format!("[MM] {}", name))
}

/// Line terminator style of a text document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineLayout {
    pub ending: &'static str,
    pub trailing_newline: bool,
}

impl LineLayout {
    /// Split `content` into lines, remembering how they were terminated.
    ///
    /// A document containing any `\r\n` is written back with `\r\n`.
    pub fn split(content: &str) -> (Vec<String>, Self) {
        let ending = if content.contains("\r\n") { "\r\n" } else { "\n" };
        let layout = Self {
            ending,
            trailing_newline: content.ends_with('\n'),
        };
        (content.lines().map(str::to_string).collect(), layout)
    }

    pub fn join(&self, lines: &[String]) -> String {
        let mut out = lines.join(self.ending);
        if self.trailing_newline && !lines.is_empty() {
            out.push_str(self.ending);
        }
        out
    }
}

/// Handle file batch translation command
pub async fn handle_file(
    config: OrchestratorConfig,
    file: PathBuf,
    output: Option<PathBuf>,
    fresh: bool,
    args: ContextArgs,
) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let orchestrator = Orchestrator::from_config(config)?;
    let store = orchestrator.store();

    let content = tokio::fs::read_to_string(&file).await?;
    let (lines, layout) = LineLayout::split(&content);
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let key = progress_key_for_lines(&name, &lines);
    let output = output.unwrap_or_else(|| default_output_path(&file));

    let completed = if fresh {
        clear_progress(store.as_ref(), &key);
        Vec::new()
    } else {
        match load_progress(store.as_ref(), &key, lines.len()) {
            Some(progress) => {
                println!("⏯  Resuming: {} lines already translated", progress.completed());
                progress.lines
            }
            None => Vec::new(),
        }
    };

    info!("Starting file translation");
    info!("Input: {}", file.display());
    info!("Output: {}", output.display());

    let request = BatchRequest {
        lines: lines.clone(),
        context: args.context(),
        format: SubtitleFormat::from_file_name(&name),
        model: args.model_choice(),
        completed,
        progress_key: Some(key.clone()),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current request");
                cancel.cancel();
            }
        })
    };

    let pb = ProgressBar::new(lines.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("=>-"),
    );

    let report = orchestrator
        .translate_batch_with(request, &cancel, |event| {
            pb.set_position(event.completed_lines as u64);
            if event.waiting_for_quota {
                pb.set_message(format!("Quota hit, cooling down (chunk size {})", event.chunk_size));
            } else {
                pb.set_message(format!("Chunk {}", event.chunk));
            }
        })
        .await;
    ctrl_c.abort();

    let duration = start_time.elapsed();
    match &report.outcome {
        BatchOutcome::Completed => {
            pb.finish_with_message("Completed");
            tokio::fs::write(&output, layout.join(&report.merged(&lines))).await?;
            clear_progress(store.as_ref(), &key);

            println!("\n✅ Translation completed!");
            println!("   Lines: {}", report.total_lines);
            println!("   Unique sent: {}", report.unique_contents);
            println!("   Output: {}", output.display());
            println!("   Time: {:?}", duration);
        }
        BatchOutcome::Cancelled => {
            pb.abandon_with_message("Cancelled");
            println!(
                "\n⏸  Stopped at {}/{} lines. Run again to resume.",
                report.completed_lines, report.total_lines
            );
        }
        BatchOutcome::Halted(e) => {
            pb.abandon_with_message("Failed");
            eprintln!("Error translating {}: {}", file.display(), e);
            println!(
                "\n⚠️  Progress saved at {}/{} lines. Run again to resume.",
                report.completed_lines, report.total_lines
            );
        }
    }

    info!(
        "Completed: {}/{} lines in {:?}",
        report.completed_lines, report.total_lines, duration
    );

    Ok(())
}

/// Handle server command
pub async fn handle_server(
    config: OrchestratorConfig,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    use crate::server::api::run_server;

    info!("Starting HTTP server on {}:{}", host, port);
    println!("🚀 Server starting on http://{}:{}", host, port);

    run_server(config, host, port).await?;

    Ok(())
}

/// Handle health command
pub async fn handle_health(
    config: OrchestratorConfig,
    model: Option<String>,
    all: bool,
) -> anyhow::Result<()> {
    let enabled: Vec<String> = config
        .get_enabled_models()
        .into_iter()
        .map(|m| m.id.clone())
        .collect();
    let orchestrator = Orchestrator::from_config(config)?;

    if all {
        for id in &enabled {
            let report = orchestrator.check_model(id).await;
            if report.ok {
                println!("✅ {} ({} ms)", id, report.latency_ms);
            } else {
                println!("❌ {}: {}", id, report.message.unwrap_or_default());
            }
        }
    } else {
        let report = match model {
            Some(model) => orchestrator.check_model(&model).await,
            None => orchestrator.check_health().await,
        };

        if report.ok {
            println!("✅ Upstream reachable ({} ms)", report.latency_ms);
        } else {
            println!(
                "❌ Upstream check failed: {}",
                report.message.unwrap_or_default()
            );
        }
    }
    println!("   Status: {}", orchestrator.metrics().status);

    Ok(())
}

/// Handle reservoir command
pub async fn handle_reservoir(config: OrchestratorConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let reservoir = orchestrator.reservoir().await;

    println!("🪣 Token reservoir");
    println!("   Remaining: {}/{}", reservoir.remaining, reservoir.capacity);
    println!("   Consumed (all time): {}", reservoir.total_consumed);
    if reservoir.is_exhausted() {
        println!("   ⛔ Exhausted until tomorrow");
    } else if reservoir.is_low() {
        println!("   ⚠️  Less than 10% left today");
    }
    if let Some(refilled) = chrono::DateTime::from_timestamp_millis(reservoir.last_refill) {
        println!(
            "   Last refill: {}",
            refilled.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}
