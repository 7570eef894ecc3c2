use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::{info, warn};

use waypoint_core::config::RetryConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::LlmExecutor;
use waypoint_core::types::*;

/// An LLM backend that retries failed requests and falls back to alternative
/// (backend, model) pairs.
///
/// For streaming only opening the stream is retried; an error that surfaces
/// mid-stream is passed through to the consumer.
pub struct RetryingExecutor {
    primary: Arc<dyn LlmExecutor>,
    fallbacks: Vec<(Arc<dyn LlmExecutor>, LlmModel)>,
    retry_config: RetryConfig,
}

impl RetryingExecutor {
    pub fn new(primary: Arc<dyn LlmExecutor>, retry_config: RetryConfig) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            retry_config,
        }
    }

    /// Try `model` on `executor` once the primary is exhausted.
    pub fn with_fallback(mut self, executor: Arc<dyn LlmExecutor>, model: LlmModel) -> Self {
        self.fallbacks.push((executor, model));
        self
    }

    async fn call_with_retries<T, F>(
        &self,
        prompt: Prompt,
        model: LlmModel,
        tools: Vec<ToolDescriptor>,
        call: F,
    ) -> Result<T>
    where
        F: for<'x> Fn(
            &'x dyn LlmExecutor,
            Prompt,
            LlmModel,
            Vec<ToolDescriptor>,
        ) -> BoxFuture<'x, Result<T>>,
    {
        let max_retries = self.retry_config.max_retries;

        let mut last_err = None;
        for attempt in 0..=max_retries {
            match call(
                self.primary.as_ref(),
                prompt.clone(),
                model.clone(),
                tools.clone(),
            )
            .await
            {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if is_retryable(&e) && attempt < max_retries {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            model = %model,
                            error = %e,
                            "Retrying LLM request"
                        );
                        tokio::time::sleep(backoff).await;
                        last_err = Some(e);
                        continue;
                    }
                    last_err = Some(e);
                    break;
                }
            }
        }

        if !self.fallbacks.is_empty() {
            info!(model = %model, "Primary LLM exhausted, trying fallback models");
        }
        for (executor, fb_model) in &self.fallbacks {
            match call(
                executor.as_ref(),
                prompt.clone(),
                fb_model.clone(),
                tools.clone(),
            )
            .await
            {
                Ok(value) => {
                    info!(model = %fb_model, "Fell back to alternative model");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(model = %fb_model, error = %e, "Fallback model also failed");
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| WaypointError::LlmRequest("All backends failed".into())))
    }
}

pub(crate) fn is_retryable(e: &WaypointError) -> bool {
    match e {
        WaypointError::LlmRequest(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        WaypointError::LlmStream(_) => true,
        _ => false,
    }
}

pub(crate) fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

fn execute_once<'x>(
    executor: &'x dyn LlmExecutor,
    prompt: Prompt,
    model: LlmModel,
    tools: Vec<ToolDescriptor>,
) -> BoxFuture<'x, Result<Vec<ChatMessage>>> {
    executor.execute(prompt, model, tools)
}

fn open_stream<'x>(
    executor: &'x dyn LlmExecutor,
    prompt: Prompt,
    model: LlmModel,
    tools: Vec<ToolDescriptor>,
) -> BoxFuture<'x, Result<BoxStream<'static, Result<StreamFrame>>>> {
    executor.execute_streaming(prompt, model, tools)
}

impl LlmExecutor for RetryingExecutor {
    fn execute(
        &self,
        prompt: Prompt,
        model: LlmModel,
        tools: Vec<ToolDescriptor>,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        Box::pin(self.call_with_retries(prompt, model, tools, execute_once))
    }

    fn execute_streaming(
        &self,
        prompt: Prompt,
        model: LlmModel,
        tools: Vec<ToolDescriptor>,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamFrame>>>> {
        Box::pin(self.call_with_retries(prompt, model, tools, open_stream))
    }

    fn moderate(&self, prompt: Prompt, model: LlmModel) -> BoxFuture<'_, Result<ModerationResult>> {
        self.primary.moderate(prompt, model)
    }
}
