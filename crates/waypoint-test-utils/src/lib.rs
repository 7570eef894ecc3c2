//! Shared test fixtures: a scripted LLM backend, an event recorder and a few
//! sample tools.

pub mod mock_executor;
pub mod recorder;
pub mod tools;

pub use mock_executor::{MockExecutor, MockResponse, RecordedCall};
pub use recorder::EventRecorder;
pub use tools::{CalculatorTool, CrashingTool, EchoTool, FailingTool};

use waypoint_core::types::LlmModel;

pub fn test_model() -> LlmModel {
    LlmModel::new("mock", "mock-model")
}

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("waypoint_agent=debug,waypoint_llm=debug,warn")),
        )
        .with_test_writer()
        .try_init();
}
