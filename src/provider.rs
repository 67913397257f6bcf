use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::{BlockId, EngineApi};
use crate::error::GenError;
use crate::middleware::{Middleware, Pipeline, compose};
use crate::quick_actions::{QuickAction, QuickActionConfig, QuickActionMap, QuickActionSettings};

/// What a provider produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Image,
    Video,
    Audio,
    Text,
}

/// A finished (or, inside a stream, intermediate) generation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Output {
    Image { url: String, width: u32, height: u32 },
    Video { url: String, duration_secs: f64 },
    Audio { url: String, duration_secs: f64 },
    Text { text: String },
}

/// Result of a terminal generate call: either a single output or a lazy
/// sequence of chunks delivered incrementally.
pub enum GenerationResult {
    Complete(Output),
    Stream(BoxStream<'static, Result<Output, GenError>>),
}

impl GenerationResult {
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// The completed output, or `None` for a stream.
    pub fn into_output(self) -> Option<Output> {
        match self {
            Self::Complete(output) => Some(output),
            Self::Stream(_) => None,
        }
    }

    /// Drain a stream and return its last chunk. A completed result is
    /// returned as is.
    pub async fn finish(self) -> Result<Option<Output>, GenError> {
        match self {
            Self::Complete(output) => Ok(Some(output)),
            Self::Stream(mut chunks) => {
                let mut last = None;
                while let Some(chunk) = chunks.next().await {
                    last = Some(chunk?);
                }
                Ok(last)
            }
        }
    }
}

impl fmt::Debug for GenerationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete(output) => f.debug_tuple("Complete").field(output).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Typed per-call context. Replaces string-keyed UI state lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationContext {
    /// Quick action that triggered the call, if any.
    pub action_id: Option<String>,
    /// Caller identity, used to partition rate limits per user.
    pub user_id: Option<String>,
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Options shared by reference through the whole pipeline.
#[derive(Clone)]
pub struct GenerationOptions {
    pub cancellation: CancellationToken,
    pub engine: Arc<dyn EngineApi>,
    pub blocks: Vec<BlockId>,
    pub context: GenerationContext,
    disposers: Arc<Mutex<Vec<Disposer>>>,
}

impl fmt::Debug for GenerationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationOptions")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("blocks", &self.blocks)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl GenerationOptions {
    pub fn new(engine: Arc<dyn EngineApi>) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            engine,
            blocks: Vec::new(),
            context: GenerationContext::default(),
            disposers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_blocks(mut self, blocks: Vec<BlockId>) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_context(mut self, context: GenerationContext) -> Self {
        self.context = context;
        self
    }

    pub fn check_cancelled(&self) -> Result<(), GenError> {
        if self.cancellation.is_cancelled() {
            return Err(GenError::Cancelled);
        }
        Ok(())
    }

    /// Register cleanup to run when the caller disposes of this generation.
    pub fn add_disposer(&self, disposer: impl FnOnce() + Send + 'static) {
        if let Ok(mut disposers) = self.disposers.lock() {
            disposers.push(Box::new(disposer));
        }
    }

    /// Run registered disposers, most recent first. Returns how many ran.
    pub fn dispose(&self) -> usize {
        let drained: Vec<Disposer> = match self.disposers.lock() {
            Ok(mut disposers) => disposers.drain(..).collect(),
            Err(_) => return 0,
        };
        let count = drained.len();
        for disposer in drained.into_iter().rev() {
            disposer();
        }
        count
    }
}

/// The terminal operation of a pipeline.
pub trait Generate<I>: Send + Sync {
    fn generate<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>>;
}

/// Adapts an async closure into a [`Generate`] implementation.
pub struct GenerateFn<F, I> {
    f: F,
    _input: PhantomData<fn(I)>,
}

pub fn generate_fn<I, F, Fut>(f: F) -> GenerateFn<F, I>
where
    F: Fn(I, GenerationOptions) -> Fut + Send + Sync,
    Fut: Future<Output = Result<GenerationResult, GenError>> + Send + 'static,
{
    GenerateFn {
        f,
        _input: PhantomData,
    }
}

impl<I, F, Fut> Generate<I> for GenerateFn<F, I>
where
    F: Fn(I, GenerationOptions) -> Fut + Send + Sync,
    Fut: Future<Output = Result<GenerationResult, GenError>> + Send + 'static,
{
    fn generate<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>> {
        Box::pin((self.f)(input, options.clone()))
    }
}

/// Whether a provider keeps the outputs it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPolicy {
    /// Keep the most recent `limit` completed outputs in memory.
    Retain { limit: usize },
}

/// Bounded record of completed outputs, newest last.
#[derive(Debug)]
pub struct GenerationHistory {
    limit: usize,
    entries: Mutex<VecDeque<Output>>,
}

impl GenerationHistory {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    fn record(&self, output: &Output) {
        if self.limit == 0 {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.limit {
                entries.pop_front();
            }
            entries.push_back(output.clone());
        }
    }

    pub fn entries(&self) -> Vec<Output> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// A named generation capability with its own middleware defaults.
///
/// Built once through [`ProviderBuilder`]; there are no mutating methods
/// afterwards. Streams are handed to the caller as is and are not recorded in
/// the history.
pub struct Provider<I> {
    id: String,
    kind: ProviderKind,
    pipeline: Pipeline<I>,
    history: Option<GenerationHistory>,
    quick_actions: QuickActionMap<QuickActionConfig>,
}

impl<I: Send + 'static> Provider<I> {
    pub fn builder(
        id: impl Into<String>,
        kind: ProviderKind,
        terminal: Arc<dyn Generate<I>>,
    ) -> ProviderBuilder<I> {
        ProviderBuilder {
            id: id.into(),
            kind,
            terminal,
            middleware: Vec::new(),
            history: None,
            quick_actions: QuickActionMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn history(&self) -> Option<&GenerationHistory> {
        self.history.as_ref()
    }

    pub fn default_quick_actions(&self) -> &QuickActionMap<QuickActionConfig> {
        &self.quick_actions
    }

    /// Merge this provider's default quick actions with deployment settings.
    pub fn quick_actions(
        &self,
        settings: &QuickActionSettings<QuickActionConfig>,
    ) -> QuickActionMap<QuickActionConfig> {
        crate::quick_actions::merge_quick_actions(&self.quick_actions, settings)
    }

    /// Run the input through the middleware chain and the terminal operation.
    pub async fn generate(
        &self,
        input: I,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, GenError> {
        let result = self.pipeline.run(input, options).await?;
        if let (Some(history), GenerationResult::Complete(output)) = (&self.history, &result) {
            history.record(output);
        }
        Ok(result)
    }
}

pub struct ProviderBuilder<I> {
    id: String,
    kind: ProviderKind,
    terminal: Arc<dyn Generate<I>>,
    middleware: Vec<Arc<dyn Middleware<I>>>,
    history: Option<HistoryPolicy>,
    quick_actions: QuickActionMap<QuickActionConfig>,
}

impl<I: Send + 'static> ProviderBuilder<I> {
    /// Append a middleware. The first one added is the outermost.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware<I>>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn history(mut self, policy: HistoryPolicy) -> Self {
        self.history = Some(policy);
        self
    }

    pub fn quick_action(mut self, id: impl Into<String>, action: QuickAction<QuickActionConfig>) -> Self {
        self.quick_actions.insert(id.into(), action);
        self
    }

    pub fn build(self) -> Provider<I> {
        let history = self.history.map(|policy| match policy {
            HistoryPolicy::Retain { limit } => GenerationHistory::new(limit),
        });
        Provider {
            id: self.id,
            kind: self.kind,
            pipeline: compose(self.middleware, self.terminal),
            history,
            quick_actions: self.quick_actions,
        }
    }
}
