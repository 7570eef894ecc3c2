use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::Tool;
use waypoint_core::types::{ToolContext, ToolResult};

type Handler<A, R> = Arc<dyn Fn(A, ToolContext) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// A tool backed by an async closure over typed arguments.
///
/// Arguments are deserialized into `A`; a decode failure is reported as a
/// validation error. The returned `R` is JSON-encoded for the model, except
/// that plain strings are passed through unquoted.
pub struct FnTool<A, R> {
    name: String,
    description: String,
    schema: serde_json::Value,
    timeout_secs: u64,
    handler: Handler<A, R>,
    _marker: PhantomData<fn() -> (A, R)>,
}

impl<A, R> FnTool<A, R>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(A, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            timeout_secs: 30,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
            _marker: PhantomData,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl<A, R> FnTool<A, R>
where
    A: JsonSchema + DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    /// Like [`FnTool::new`], with the input schema derived from `A`.
    pub fn typed<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(A, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self::new(name, description, schema_of::<A>(), handler)
    }
}

/// JSON Schema for `T`, without the `$schema` key.
pub fn schema_of<T: JsonSchema>() -> serde_json::Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
    }
    schema
}

impl<A, R> Tool for FnTool<A, R>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let typed: A = serde_json::from_value(args).map_err(|e| {
                WaypointError::ToolValidation(format!("{}: {}", self.name, e))
            })?;
            let output = (self.handler)(typed, ctx).await?;
            Ok(ToolResult::success(encode_result(&output)?))
        })
    }
}

fn encode_result<R: Serialize>(output: &R) -> Result<String> {
    Ok(match serde_json::to_value(output)? {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}
