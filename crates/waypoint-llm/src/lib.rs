pub mod retry;

pub use retry::RetryingExecutor;

use std::sync::Arc;

use waypoint_core::config::AppConfig;
use waypoint_core::traits::LlmExecutor;

/// Wrap `primary` with retries and the configured fallback models.
///
/// Fallback models are served by the same backend, since providers are
/// supplied by the caller.
pub fn with_retries(primary: Arc<dyn LlmExecutor>, config: &AppConfig) -> RetryingExecutor {
    config.fallback_models.iter().fold(
        RetryingExecutor::new(primary.clone(), config.retry.clone()),
        |executor, fallback| executor.with_fallback(primary.clone(), fallback.to_model()),
    )
}
