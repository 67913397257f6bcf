use std::sync::Arc;
use std::time::Duration;

use gencore::config::Config;
use gencore::engine::{EngineApi, FillSource, MemoryEngine};
use gencore::error::GenError;
use gencore::lock::with_lock;
use gencore::middleware::{RateLimitMiddleware, RateLimitOptions, TraceMiddleware};
use gencore::processing::{ProcessingOptions, Progress, process_fill};
use gencore::provider::{
    GenerationOptions, GenerationResult, HistoryPolicy, Output, Provider, ProviderKind,
    generate_fn,
};
use gencore::quick_actions::{QuickAction, QuickActionConfig};
use gencore::store::RateLimitStorage;

const PROVIDER_ID: &str = "demo/background-removal";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load();
    tracing::info!(
        max_requests = config.rate_limit.max_requests,
        time_window_ms = config.rate_limit.time_window_ms,
        durable = config.storage.durable,
        "gencore demo starting"
    );

    let storage = Arc::new(if config.storage.durable {
        RateLimitStorage::file(&config.storage.dir)
    } else {
        RateLimitStorage::in_memory()
    });

    let rate_limit = RateLimitMiddleware::new(
        RateLimitOptions::new(config.rate_limit.max_requests, config.rate_limit.time_window_ms),
        storage,
    );

    let terminal = generate_fn(|prompt: String, options: GenerationOptions| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        options.check_cancelled()?;
        Ok::<_, GenError>(GenerationResult::Complete(Output::Image {
            url: format!("memory://cutout/{}", prompt.len()),
            width: 512,
            height: 512,
        }))
    });

    let provider =
        Provider::<String>::builder(PROVIDER_ID, ProviderKind::Image, Arc::new(terminal))
            .middleware(Arc::new(TraceMiddleware::new(PROVIDER_ID)))
            .middleware(Arc::new(rate_limit))
            .history(HistoryPolicy::Retain { limit: 8 })
            .quick_action("remove-background", QuickAction::Enabled)
            .quick_action(
                "vectorize",
                QuickAction::configured(QuickActionConfig {
                    label: Some("Vectorize".to_string()),
                    prompt: None,
                }),
            )
            .build();

    let settings = config.quick_action_settings::<QuickActionConfig>(PROVIDER_ID)?;
    let actions = provider.quick_actions(&settings);
    tracing::info!(
        defaults = provider.default_quick_actions().len(),
        actions = ?actions.keys().collect::<Vec<_>>(),
        "quick actions resolved"
    );

    let engine = Arc::new(MemoryEngine::new());
    let page = engine.create_block(None);
    let block = engine.create_block(Some(page));
    engine.create_fill(block, FillSource::from_uri("memory://photo.jpg", 1024, 768))?;
    let engine: Arc<dyn EngineApi> = engine;

    let options = GenerationOptions::new(engine.clone()).with_blocks(vec![block]);
    let lock_options = config.lock.options();
    let processing = ProcessingOptions {
        progress_interval: config.processing.progress_interval(),
        cancellation: options.cancellation.clone(),
    };

    let provider = &provider;
    let request = &options;
    let processing = &processing;
    let worker = engine.clone();
    let locked = with_lock(engine.clone(), &[block], &lock_options, move || async move {
        process_fill(worker, block, processing, move |_original, progress| async move {
            progress.report(Progress {
                key: "upload".to_string(),
                current: 0,
                total: 1,
            });
            let output = provider
                .generate("remove the background".to_string(), request)
                .await
                .inspect_err(|e| {
                    tracing::warn!(error = %e, user_message = %e.user_message(), "generation failed")
                })?
                .into_output();
            match output {
                Some(Output::Image { url, width, height }) => {
                    Ok(FillSource::from_uri(url, width, height))
                }
                _ => Err(GenError::generation(PROVIDER_ID, "expected an image output")),
            }
        })
        .await
    })
    .await?;

    tracing::info!(outcome = ?locked.return_value, "fill processing finished");
    if let Some(history) = provider.history() {
        tracing::info!(entries = history.entries().len(), "generation history");
    }

    options.dispose();
    tracing::info!("gencore demo finished");
    Ok(())
}
