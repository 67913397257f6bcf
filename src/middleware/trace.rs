use std::time::Instant;

use futures_util::future::BoxFuture;
use tracing::Instrument;

use super::{Middleware, Next};
use crate::error::GenError;
use crate::provider::{GenerationOptions, GenerationResult};

/// Wraps each call in a `generate` span and logs its outcome and latency.
pub struct TraceMiddleware {
    provider_id: String,
}

impl TraceMiddleware {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
        }
    }
}

impl<I: Send + 'static> Middleware<I> for TraceMiddleware {
    fn handle<'a>(
        &'a self,
        input: I,
        options: &'a GenerationOptions,
        next: Next<'a, I>,
    ) -> BoxFuture<'a, Result<GenerationResult, GenError>> {
        let span = tracing::info_span!(
            "generate",
            provider = %self.provider_id,
            action = options.context.action_id.as_deref().unwrap_or("-"),
            blocks = options.blocks.len(),
        );
        Box::pin(
            async move {
                let start = Instant::now();
                let result = next.run(input, options).await;
                let elapsed_ms = start.elapsed().as_millis() as u64;
                match &result {
                    // Chunks are still pending; only the hand-off is timed.
                    Ok(GenerationResult::Stream(_)) => {
                        tracing::debug!(elapsed_ms, "stream handed off");
                    }
                    Ok(GenerationResult::Complete(_)) => {
                        tracing::debug!(elapsed_ms, "generation complete");
                    }
                    Err(GenError::Cancelled) => {
                        tracing::info!(elapsed_ms, "generation cancelled");
                    }
                    Err(e) => {
                        tracing::warn!(elapsed_ms, error = %e, "generation failed");
                    }
                }
                result
            }
            .instrument(span),
        )
    }
}
