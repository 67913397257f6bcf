//! Onion-style composition of cross-cutting behavior around a generate call.
//!
//! A [`Middleware`] receives the input, the shared [`GenerationOptions`] and a
//! [`Next`] handle for the rest of the chain. `Next` is consumed when run, so a
//! middleware can call it at most once; retries and fan-out must go through
//! [`Pipeline::run`] again.
//!
//! A middleware that does not understand streaming must hand a
//! [`GenerationResult::Stream`] back untouched instead of collecting it.

pub mod rate_limit;
pub mod trace;
pub mod translate;

pub use rate_limit::{KeySource, RateLimitInfo, RateLimitMiddleware, RateLimitOptions};
pub use trace::TraceMiddleware;
pub use translate::{MapOutput, TranslateErrors};

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::GenError;
use crate::provider::{Generate, GenerationOptions, GenerationResult};

pub trait Middleware<I>: Send + Sync {
    fn handle<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
        next: Next<'a, I>,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>>;
}

/// The remainder of the pipeline after the current middleware.
pub struct Next<'a, I> {
    chain: &'a [Arc<dyn Middleware<I>>],
    terminal: &'a dyn Generate<I>,
}

impl<'a, I: Send + 'static> Next<'a, I> {
    pub fn run(
        self,
        input: I,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>> {
        match self.chain.split_first() {
            Some((current, rest)) => current.handle(
                input,
                options,
                Next {
                    chain: rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.generate(input, options),
        }
    }
}

/// A terminal operation wrapped by an ordered list of middlewares.
pub struct Pipeline<I> {
    middleware: Vec<Arc<dyn Middleware<I>>>,
    terminal: Arc<dyn Generate<I>>,
}

/// Compose `middleware` (outermost first) around `terminal`.
pub fn compose<I>(
    middleware: Vec<Arc<dyn Middleware<I>>>,
    terminal: Arc<dyn Generate<I>>,
) -> Pipeline<I> {
    Pipeline {
        middleware,
        terminal,
    }
}

impl<I: Send + 'static> Pipeline<I> {
    pub fn run<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>> {
        Next {
            chain: &self.middleware,
            terminal: self.terminal.as_ref(),
        }
        .run(input, options)
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }
}

impl<I: Send + 'static> Generate<I> for Pipeline<I> {
    fn generate<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>> {
        self.run(input, options)
    }
}
