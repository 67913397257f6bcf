use futures_util::future::BoxFuture;

use super::{Middleware, Next};
use crate::error::GenError;
use crate::provider::{GenerationOptions, GenerationResult, Output};

/// Rewrites errors coming out of the rest of the pipeline.
///
/// Typical use is turning vendor failures into messages a user can act on.
pub struct TranslateErrors<F> {
    translate: F,
}

impl<F> TranslateErrors<F>
where
    F: Fn(GenError) -> GenError + Send + Sync,
{
    pub fn new(translate: F) -> Self {
        Self { translate }
    }
}

impl<I, F> Middleware<I> for TranslateErrors<F>
where
    I: Send + 'static,
    F: Fn(GenError) -> GenError + Send + Sync,
{
    fn handle<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
        next: Next<'a, I>,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>> {
        Box::pin(async move { next.run(input, options).await.map_err(&self.translate) })
    }
}

/// Transforms completed outputs. Streams pass through unchanged.
pub struct MapOutput<F> {
    map: F,
}

impl<F> MapOutput<F>
where
    F: Fn(Output) -> Output + Send + Sync,
{
    pub fn new(map: F) -> Self {
        Self { map }
    }
}

impl<I, F> Middleware<I> for MapOutput<F>
where
    I: Send + 'static,
    F: Fn(Output) -> Output + Send + Sync,
{
    fn handle<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
        next: Next<'a, I>,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>> {
        Box::pin(async move {
            match next.run(input, options).await? {
                GenerationResult::Complete(output) => {
                    Ok(GenerationResult::Complete((self.map)(output)))
                }
                stream @ GenerationResult::Stream(_) => Ok(stream),
            }
        })
    }
}
