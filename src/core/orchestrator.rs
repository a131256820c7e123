//! Request orchestration: single-shot, streaming and batch translation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::core::client::{ChunkStream, GeminiBackend, TranslationBackend};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::OrchestratorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::metrics::{HealthStatus, MetricsHub, MetricsSnapshot, Subscription};
use crate::core::models::{
    GenerationConfig, Model, ModelChoice, Tier, TokenReservoir, Tone, TranslationContext,
    TranslationResult, UpstreamRequest,
};
use crate::core::reservoir::Reservoir;
use crate::core::retry::{pause, RetryEngine, RetryPolicy};
use crate::core::selector;
use crate::core::store::{save_progress, BatchProgress, FileStore, KeyValueStore};
use crate::processors::cleaner::{process_raw_response, SubtitleCleaner, TextCleaner};
use crate::processors::dedup::{DedupPlan, SubtitleFormat};
use crate::processors::prompt;

/// Rate-limit rounds a batch chunk may go through before the batch halts
const MAX_RATE_LIMIT_ROUNDS: u32 = 5;

/// Smallest chunk size reachable by rate-limit shrinking
const MIN_CHUNK_SIZE: usize = 2;

/// Health check latency above which the upstream counts as degraded
const DEGRADED_LATENCY_MS: u64 = 2000;

/// Best-effort token estimate for calls without reported usage
pub fn estimate_tokens(input: &str, output: &str) -> u64 {
    let input_tokens = (input.chars().count() as f64 / 3.5).ceil() as u64;
    let output_tokens = (output.chars().count() as f64 / 2.0).ceil() as u64;
    input_tokens + output_tokens + 50
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    model: String,
    text: String,
    movie_title: String,
    tone: Tone,
    speaker: String,
    listener: String,
}

impl CacheKey {
    fn new(model: &str, text: &str, context: &TranslationContext) -> Self {
        Self {
            model: model.to_string(),
            text: text.to_string(),
            movie_title: context.movie_title.clone(),
            tone: context.tone,
            speaker: context.speaker.clone(),
            listener: context.listener.clone(),
        }
    }
}

/// Identity of a streaming call; stale once a newer stream starts
#[derive(Debug, Clone)]
struct StreamSession {
    id: u64,
    token: CancellationToken,
}

impl StreamSession {
    fn is_stale(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Batch translation input
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub lines: Vec<String>,
    pub context: TranslationContext,
    pub format: SubtitleFormat,
    pub model: ModelChoice,
    /// Earlier progress by line index, for resuming
    pub completed: Vec<Option<String>>,
    /// Store key to save progress under after every chunk
    pub progress_key: Option<String>,
}

/// How a batch run ended
#[derive(Debug)]
pub enum BatchOutcome {
    Completed,
    Cancelled,
    /// Stopped on an error; finished lines stay valid for a resume
    Halted(TranslationError),
}

/// Progress notification emitted during a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgressEvent {
    pub chunk: usize,
    pub completed_lines: usize,
    pub total_lines: usize,
    pub chunk_size: usize,
    pub waiting_for_quota: bool,
}

/// Result of a batch run
#[derive(Debug)]
pub struct BatchReport {
    /// `None` marks lines not yet translated
    pub lines: Vec<Option<String>>,
    pub total_lines: usize,
    pub completed_lines: usize,
    pub unique_contents: usize,
    pub chunks_sent: usize,
    pub final_chunk_size: usize,
    pub outcome: BatchOutcome,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Completed)
    }

    /// Output lines with originals filling any gaps
    pub fn merged(&self, originals: &[String]) -> Vec<String> {
        self.lines
            .iter()
            .zip(originals)
            .map(|(line, original)| line.clone().unwrap_or_else(|| original.clone()))
            .collect()
    }
}

/// Outcome of a connectivity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub latency_ms: u64,
    pub message: Option<String>,
}

struct Inner {
    config: OrchestratorConfig,
    backend: Arc<dyn TranslationBackend>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    cleaner: Arc<dyn TextCleaner>,
    reservoir: Reservoir,
    breaker: CircuitBreaker,
    metrics: MetricsHub,
    retry: RetryEngine,
    cache: Mutex<HashMap<CacheKey, String>>,
    current_stream: Mutex<(u64, CancellationToken)>,
}

/// Owns the reservoir, breaker, metrics and cache for every request path
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.inner.backend)
            .field("metrics", &self.inner.metrics)
            .finish()
    }
}

impl Orchestrator {
    /// Build with the system clock and the default subtitle cleaner
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn TranslationBackend>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::with_parts(
            config,
            backend,
            store,
            Arc::new(SystemClock),
            Arc::new(SubtitleCleaner),
        )
    }

    pub fn with_parts(
        config: OrchestratorConfig,
        backend: Arc<dyn TranslationBackend>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        cleaner: Arc<dyn TextCleaner>,
    ) -> Self {
        let reservoir = Reservoir::load(config.daily_token_limit, store.clone(), clock.clone());
        let remaining = reservoir
            .peek()
            .map(|r| r.remaining)
            .unwrap_or(config.daily_token_limit);
        let metrics = MetricsHub::new(clock.now_ms(), remaining);
        let reservoir = reservoir.with_metrics(metrics.clone());
        let breaker = CircuitBreaker::new(clock.clone(), metrics.clone());
        let retry = RetryEngine::new(
            reservoir.clone(),
            breaker.clone(),
            metrics.clone(),
            config.retry_policy(),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                store,
                clock,
                cleaner,
                reservoir,
                breaker,
                metrics,
                retry,
                cache: Mutex::new(HashMap::new()),
                current_stream: Mutex::new((0, CancellationToken::new())),
            }),
        }
    }

    /// Gemini backend and the on-disk store for `config`
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(GeminiBackend::new(&config)?);
        let store = Arc::new(FileStore::open(config.store_path()));
        Ok(Self::new(config, backend, store))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.inner.store.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Register a callback run after every metrics change
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.metrics.subscribe(callback)
    }

    pub async fn reservoir(&self) -> TokenReservoir {
        self.inner.reservoir.snapshot().await
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Resolve the concrete model for a request
    pub fn resolve_model(
        &self,
        choice: &ModelChoice,
        text: &str,
        context: &TranslationContext,
    ) -> Result<Model> {
        let tier = match choice {
            ModelChoice::Auto => selector::select(text, context),
            ModelChoice::Tier(tier) => *tier,
            ModelChoice::Named(id) => {
                return Ok(self.inner.config.find_model(id).cloned().unwrap_or_else(|| Model {
                    id: id.clone(),
                    tier: Tier::Fast,
                    high_reasoning: id.contains("gemini-3"),
                    enabled: true,
                }));
            }
        };

        self.inner
            .config
            .get_model_for_tier(tier)
            .cloned()
            .ok_or_else(|| TranslationError::ConfigError {
                message: format!("No models available for tier: {}", tier),
            })
    }

    fn upstream_request(&self, model: &Model, prompt: String) -> UpstreamRequest {
        UpstreamRequest {
            model: model.id.clone(),
            system_instruction: Some(prompt::system_instruction(&self.inner.config.target_language)),
            prompt,
            config: GenerationConfig::for_model(model),
        }
    }

    async fn charge(&self, tokens: u64) {
        let state = self.inner.reservoir.consume(tokens).await;
        self.inner.metrics.update(|m| {
            m.total_tokens_used += tokens;
            m.reservoir_tokens = state.remaining;
        });
        if state.is_low() {
            warn!(
                "Token reservoir low: {}/{} remaining",
                state.remaining, state.capacity
            );
        }
    }

    /// Translate one line or passage, served from cache when possible
    pub async fn translate(
        &self,
        text: &str,
        context: &TranslationContext,
        choice: &ModelChoice,
    ) -> Result<TranslationResult> {
        let model = self.resolve_model(choice, text, context)?;
        if text.trim().is_empty() {
            return Ok(TranslationResult {
                translation: String::new(),
                tokens_used: 0,
                model_used: model.id,
                cached: false,
            });
        }

        let key = CacheKey::new(&model.id, text, context);
        if let Some(hit) = self.inner.cache.lock().get(&key).cloned() {
            debug!("Cache hit for {} chars on {}", text.len(), model.id);
            return Ok(TranslationResult {
                translation: hit,
                tokens_used: 0,
                model_used: model.id,
                cached: true,
            });
        }

        let prompt_text = prompt::single_prompt(text, context, &self.inner.config.target_language);
        let request = self.upstream_request(&model, prompt_text);
        let backend = &self.inner.backend;
        let request_ref = &request;

        let response = self
            .inner
            .retry
            .execute(move || async move { backend.generate(request_ref).await })
            .await?;

        let tokens = response
            .total_tokens
            .unwrap_or_else(|| estimate_tokens(&request.prompt, &response.text));
        self.charge(tokens).await;

        let translation = process_raw_response(&response.text, self.inner.cleaner.as_ref())
            .join("\n")
            .trim()
            .to_string();
        self.inner.cache.lock().insert(key, translation.clone());

        Ok(TranslationResult {
            translation,
            tokens_used: tokens,
            model_used: model.id,
            cached: false,
        })
    }

    fn begin_stream(&self) -> StreamSession {
        let mut current = self.inner.current_stream.lock();
        current.1.cancel();
        current.0 += 1;
        current.1 = CancellationToken::new();
        StreamSession {
            id: current.0,
            token: current.1.clone(),
        }
    }

    fn stream_failed(&self, err: TranslationError) -> TranslationError {
        self.inner.retry.record_failure(err.kind(), &err);
        err
    }

    /// Stream raw chunks for a single line.
    ///
    /// The session is registered when this is called, not when the stream is
    /// first polled. A later call makes this stream end silently without
    /// charging tokens or recording success. There are no retries.
    pub fn translate_stream(
        &self,
        text: &str,
        context: &TranslationContext,
        choice: &ModelChoice,
    ) -> ChunkStream {
        let session = self.begin_stream();
        let this = self.clone();
        let text = text.to_string();
        let context = context.clone();
        let choice = choice.clone();

        let stream = async_stream::try_stream! {
            if session.is_stale() {
                return;
            }
            let admitted = match this.resolve_model(&choice, &text, &context) {
                Ok(model) => this.inner.retry.admit().await.map(|_| model),
                Err(err) => Err(err),
            };
            if session.is_stale() {
                return;
            }
            let model = admitted?;

            let prompt_text = prompt::single_prompt(&text, &context, &this.inner.config.target_language);
            let request = this.upstream_request(&model, prompt_text);
            this.inner.metrics.update(|m| m.total_requests += 1);
            let started = Instant::now();

            let mut upstream = match this.inner.backend.generate_stream(&request).await {
                Ok(upstream) => upstream,
                Err(err) => {
                    let err = this.stream_failed(err);
                    if session.is_stale() {
                        return;
                    }
                    Err::<ChunkStream, _>(err)?
                }
            };

            let mut full = String::new();
            while let Some(chunk) = upstream.next().await {
                if session.is_stale() {
                    debug!("Stream {} superseded, dropping output", session.id);
                    return;
                }
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let err = this.stream_failed(err);
                        if session.is_stale() {
                            return;
                        }
                        Err::<String, _>(err)?
                    }
                };
                full.push_str(&chunk);
                yield chunk;
            }

            if session.is_stale() {
                return;
            }
            this.charge(estimate_tokens(&request.prompt, &full)).await;
            this.inner.retry.record_success(started.elapsed());
        };

        stream.boxed()
    }

    /// Translate file lines in sequential, deduplicated chunks
    pub async fn translate_batch(&self, request: BatchRequest, cancel: &CancellationToken) -> BatchReport {
        self.translate_batch_with(request, cancel, |_| {}).await
    }

    /// [`translate_batch`](Self::translate_batch) with a progress callback
    pub async fn translate_batch_with<F>(
        &self,
        request: BatchRequest,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> BatchReport
    where
        F: FnMut(BatchProgressEvent),
    {
        let config = &self.inner.config;
        let total_lines = request.lines.len();
        let mut plan = DedupPlan::build(&request.lines, request.format, &request.completed);
        let unique = plan.unique_contents.clone();
        let mut chunk_size = config.batch_size.max(1);
        let mut cursor = 0;
        let mut chunk_no = 0;

        info!(
            "Batch of {} lines: {} pending, {} unique",
            total_lines,
            plan.pending(),
            unique.len()
        );

        let outcome = 'run: loop {
            if cursor >= unique.len() {
                break BatchOutcome::Completed;
            }
            if cancel.is_cancelled() {
                break BatchOutcome::Cancelled;
            }

            chunk_no += 1;
            let mut rate_limit_rounds = 0;

            loop {
                if cancel.is_cancelled() {
                    break 'run BatchOutcome::Cancelled;
                }

                let end = (cursor + chunk_size).min(unique.len());
                let chunk = &unique[cursor..end];
                debug!("Batch chunk {}: unique lines {}..{}", chunk_no, cursor, end);

                match self.translate_chunk(chunk, &request, cancel).await {
                    Ok(translations) => {
                        if let Err(err) = plan.apply(chunk, &translations) {
                            break 'run BatchOutcome::Halted(err);
                        }
                        cursor = end;
                        self.save_batch_progress(&request, &plan);
                        on_progress(BatchProgressEvent {
                            chunk: chunk_no,
                            completed_lines: total_lines - plan.pending(),
                            total_lines,
                            chunk_size,
                            waiting_for_quota: false,
                        });
                        break;
                    }
                    Err(TranslationError::Cancelled) => break 'run BatchOutcome::Cancelled,
                    Err(err) if err.is_rate_limited() => {
                        rate_limit_rounds += 1;
                        if rate_limit_rounds >= MAX_RATE_LIMIT_ROUNDS {
                            warn!("Batch chunk {} still rate limited, halting", chunk_no);
                            break 'run BatchOutcome::Halted(err);
                        }
                        if chunk_size > MIN_CHUNK_SIZE {
                            chunk_size = chunk_size.saturating_sub(2).max(MIN_CHUNK_SIZE);
                        }
                        warn!(
                            "Quota exceeded in batch. Cooling down, chunk size now {}",
                            chunk_size
                        );
                        on_progress(BatchProgressEvent {
                            chunk: chunk_no,
                            completed_lines: total_lines - plan.pending(),
                            total_lines,
                            chunk_size,
                            waiting_for_quota: true,
                        });
                        let wait = self.inner.retry.policy().rate_limit_wait;
                        if pause(wait, Some(cancel)).await.is_err() {
                            break 'run BatchOutcome::Cancelled;
                        }
                    }
                    Err(err) => {
                        warn!("Batch chunk {} failed: {}. Progress saved", chunk_no, err);
                        break 'run BatchOutcome::Halted(err);
                    }
                }
            }

            if cursor < unique.len() && pause(config.batch_delay(), Some(cancel)).await.is_err() {
                break BatchOutcome::Cancelled;
            }
        };

        let completed_lines = total_lines - plan.pending();
        info!(
            "Batch finished: {}/{} lines, {} chunks, outcome {:?}",
            completed_lines, total_lines, chunk_no, outcome
        );

        BatchReport {
            lines: plan.output,
            total_lines,
            completed_lines,
            unique_contents: unique.len(),
            chunks_sent: chunk_no,
            final_chunk_size: chunk_size,
            outcome,
        }
    }

    async fn translate_chunk(
        &self,
        chunk: &[String],
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let text_block = chunk.join("\n");
        let model = self.resolve_model(&request.model, &text_block, &request.context)?;
        let prompt_text =
            prompt::batch_prompt(chunk, &request.context, &self.inner.config.target_language);
        let upstream = self.upstream_request(&model, prompt_text);
        let policy: RetryPolicy = *self.inner.retry.policy();

        let this = self;
        let upstream = &upstream;
        self.inner
            .retry
            .execute_with(
                move || async move {
                    let response = this.inner.backend.generate(upstream).await?;
                    let tokens = response
                        .total_tokens
                        .unwrap_or_else(|| estimate_tokens(&upstream.prompt, &response.text));
                    this.charge(tokens).await;

                    let lines = process_raw_response(&response.text, this.inner.cleaner.as_ref());
                    if lines.len() != chunk.len() {
                        return Err(TranslationError::BatchAlignment {
                            sent: chunk.len(),
                            received: lines.len(),
                        });
                    }
                    Ok(lines)
                },
                &policy,
                Some(cancel),
            )
            .await
    }

    fn save_batch_progress(&self, request: &BatchRequest, plan: &DedupPlan) {
        if let Some(key) = &request.progress_key {
            let progress = BatchProgress {
                timestamp: self.inner.clock.now_ms(),
                lines: plan.output.clone(),
            };
            save_progress(self.inner.store.as_ref(), key, &progress);
        }
    }

    /// Ping the fast model and record the result in the metrics
    pub async fn check_health(&self) -> HealthReport {
        self.inner.metrics.update(|m| m.status = HealthStatus::Healthy);

        let model = match self.resolve_model(&ModelChoice::Tier(Tier::Fast), "", &TranslationContext::default()) {
            Ok(model) => model,
            Err(err) => return self.record_health_failure(err),
        };

        let report = self.check_model(&model.id).await;
        let now = self.inner.clock.now_ms();
        if report.ok {
            let latency = report.latency_ms;
            self.inner.metrics.update(|m| {
                m.last_latency_ms = latency;
                m.last_check_timestamp = now;
                m.status = if latency > DEGRADED_LATENCY_MS {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                m.last_error = None;
            });
        } else {
            let message = report.message.clone();
            self.inner.metrics.update(|m| {
                m.status = HealthStatus::Down;
                m.last_error = message;
                m.last_check_timestamp = now;
            });
        }
        report
    }

    fn record_health_failure(&self, err: TranslationError) -> HealthReport {
        let message = err.to_string();
        let now = self.inner.clock.now_ms();
        let last_error = message.clone();
        self.inner.metrics.update(|m| {
            m.status = HealthStatus::Down;
            m.last_error = Some(last_error);
            m.last_check_timestamp = now;
        });
        HealthReport {
            ok: false,
            latency_ms: 0,
            message: Some(message),
        }
    }

    /// One-token ping of a model; leaves metrics untouched
    pub async fn check_model(&self, model: &str) -> HealthReport {
        let request = UpstreamRequest {
            model: model.to_string(),
            system_instruction: None,
            prompt: "ping".to_string(),
            config: GenerationConfig::health_check(),
        };

        let started = Instant::now();
        match self.inner.backend.generate(&request).await {
            Ok(_) => HealthReport {
                ok: true,
                latency_ms: started.elapsed().as_millis() as u64,
                message: None,
            },
            Err(err) => HealthReport {
                ok: false,
                latency_ms: 0,
                message: Some(err.to_string()),
            },
        }
    }

    /// Operator reset of all metrics to the zero-state
    pub async fn reset_metrics(&self) {
        let remaining = self.inner.reservoir.remaining().await;
        self.inner.metrics.reset(self.inner.clock.now_ms(), remaining);
        info!("Metrics reset");
    }

    /// Pause between chunks configured for batch runs
    pub fn batch_delay(&self) -> Duration {
        self.inner.config.batch_delay()
    }
}
