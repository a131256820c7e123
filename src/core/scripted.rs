//! Scripted in-process backend for tests and offline runs

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::core::client::{ChunkStream, TranslationBackend};
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{UpstreamRequest, UpstreamResponse};

/// One scripted upstream outcome
#[derive(Debug, Clone)]
pub enum Step {
    Reply { text: String, total_tokens: Option<u64> },
    Fail { status: Option<u16>, message: String },
    /// Stream these chunks, then optionally fail
    Stream { chunks: Vec<String>, fail: Option<String> },
}

impl Step {
    pub fn reply(text: impl Into<String>) -> Self {
        Step::Reply {
            text: text.into(),
            total_tokens: None,
        }
    }

    pub fn reply_with_usage(text: impl Into<String>, tokens: u64) -> Self {
        Step::Reply {
            text: text.into(),
            total_tokens: Some(tokens),
        }
    }

    pub fn fail(status: Option<u16>, message: impl Into<String>) -> Self {
        Step::Fail {
            status,
            message: message.into(),
        }
    }

    pub fn stream<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Step::Stream {
            chunks: chunks.into_iter().map(Into::into).collect(),
            fail: None,
        }
    }
}

type Responder = Arc<dyn Fn(&UpstreamRequest) -> Result<UpstreamResponse> + Send + Sync>;

/// Plays back queued [`Step`]s, then falls back to an optional responder
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    steps: Arc<Mutex<VecDeque<Step>>>,
    responder: Option<Responder>,
    requests: Arc<Mutex<Vec<UpstreamRequest>>>,
}

impl fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("queued", &self.steps.lock().len())
            .field("calls", &self.requests.lock().len())
            .finish()
    }
}

impl ScriptedBackend {
    pub fn new<I: IntoIterator<Item = Step>>(steps: I) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into_iter().collect())),
            ..Default::default()
        }
    }

    /// Answer every unscripted call with `f`
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&UpstreamRequest) -> Result<UpstreamResponse> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().push_back(step);
    }

    /// Number of upstream calls received
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().clone()
    }

    fn next_step(&self, request: &UpstreamRequest) -> Result<Step> {
        self.requests.lock().push(request.clone());
        if let Some(step) = self.steps.lock().pop_front() {
            return Ok(step);
        }
        match &self.responder {
            Some(responder) => responder(request).map(|r| Step::Reply {
                text: r.text,
                total_tokens: r.total_tokens,
            }),
            None => Err(TranslationError::upstream(None, "no scripted response left")),
        }
    }
}

#[async_trait]
impl TranslationBackend for ScriptedBackend {
    async fn generate(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        match self.next_step(request)? {
            Step::Reply { text, total_tokens } => Ok(UpstreamResponse { text, total_tokens }),
            Step::Fail { status, message } => Err(TranslationError::upstream(status, message)),
            Step::Stream { chunks, fail: None } => Ok(UpstreamResponse {
                text: chunks.concat(),
                total_tokens: None,
            }),
            Step::Stream {
                fail: Some(message),
                ..
            } => Err(TranslationError::upstream(None, message)),
        }
    }

    async fn generate_stream(&self, request: &UpstreamRequest) -> Result<ChunkStream> {
        let (chunks, fail) = match self.next_step(request)? {
            Step::Reply { text, .. } => (
                text.split_inclusive(' ').map(str::to_string).collect::<Vec<_>>(),
                None,
            ),
            Step::Fail { status, message } => {
                return Err(TranslationError::upstream(status, message))
            }
            Step::Stream { chunks, fail } => (chunks, fail),
        };

        let items = chunks
            .into_iter()
            .map(Ok)
            .chain(fail.map(|m| Err(TranslationError::upstream(None, m))));
        Ok(stream::iter(items.collect::<Vec<_>>()).boxed())
    }
}
