use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::Tool;
use waypoint_core::types::{ToolContext, ToolDescriptor, ToolResult};

/// Registry of available tools, keyed by unique name.
///
/// Built once before a run and shared behind an `Arc`; the engine never
/// mutates it while a run is in flight.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a tool. Names must be unique.
    pub fn register(&mut self, tool: impl Tool) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(WaypointError::Config(format!(
                "Tool '{}' is already registered",
                name
            )));
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Builder-style registration.
    pub fn with(mut self, tool: impl Tool) -> Result<Self> {
        self.register(tool)?;
        Ok(self)
    }

    /// Add every tool of `other`; fails on the first name clash.
    pub fn merge(&mut self, other: &ToolRegistry) -> Result<()> {
        for name in &other.order {
            if let Some(tool) = other.tools.get(name) {
                self.register_arc(tool.clone())?;
            }
        }
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Get tool descriptors for sending to the LLM.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.descriptor())
            .collect()
    }

    /// Descriptors for a named subset, in the order given.
    pub fn descriptors_for(&self, names: &[String]) -> Result<Vec<ToolDescriptor>> {
        names
            .iter()
            .map(|name| {
                self.tools
                    .get(name)
                    .map(|t| t.descriptor())
                    .ok_or_else(|| WaypointError::ToolNotFound(name.clone()))
            })
            .collect()
    }

    /// Execute a tool by name with already-decoded arguments.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| WaypointError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());
        debug!(tool = %name, timeout_secs = tool.timeout_secs(), "Executing tool");

        match tokio::time::timeout(timeout, tool.execute(args, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(WaypointError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.order).finish()
    }
}
