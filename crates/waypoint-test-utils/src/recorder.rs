use std::sync::{Arc, Mutex};

use waypoint_core::event::{EventKind, EventMeta, EventPipeline, Feature, LifecycleEvent};

/// Records every lifecycle event in emission order.
///
/// Labels have the form `Kind` or `Kind(subject)`, e.g. `NodeStarting(llm)`
/// or `ToolCallCompleted(add)`, which keeps ordering assertions readable.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<(EventMeta, LifecycleEvent)>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(EventMeta, LifecycleEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|(_, e)| e.kind()).collect()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(_, e)| label(e)).collect()
    }

    /// Labels of the given kinds only.
    pub fn labels_of(&self, kinds: &[EventKind]) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| kinds.contains(&e.kind()))
            .map(|(_, e)| label(e))
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl Feature for EventRecorder {
    fn name(&self) -> &str {
        "event-recorder"
    }

    fn install(&self, pipeline: &mut EventPipeline) {
        let events = self.events.clone();
        pipeline.on_any(move |meta, event| {
            events.lock().unwrap().push((meta.clone(), event.clone()));
        });
    }
}

fn label(event: &LifecycleEvent) -> String {
    let subject = match event {
        LifecycleEvent::AgentStarting(e) => Some(e.strategy.as_str()),
        LifecycleEvent::AgentCompleted(e) => Some(e.strategy.as_str()),
        LifecycleEvent::AgentFailed(e) => Some(e.strategy.as_str()),
        LifecycleEvent::StrategyStarting(e) => Some(e.strategy.as_str()),
        LifecycleEvent::StrategyCompleted(e) => Some(e.strategy.as_str()),
        LifecycleEvent::NodeStarting(e) => Some(e.node.as_str()),
        LifecycleEvent::NodeCompleted(e) => Some(e.node.as_str()),
        LifecycleEvent::NodeFailed(e) => Some(e.node.as_str()),
        LifecycleEvent::SubgraphStarting(e) => Some(e.subgraph.as_str()),
        LifecycleEvent::SubgraphCompleted(e) => Some(e.subgraph.as_str()),
        LifecycleEvent::SubgraphFailed(e) => Some(e.subgraph.as_str()),
        LifecycleEvent::ToolCallStarting(e) => Some(e.call.tool.as_str()),
        LifecycleEvent::ToolCallCompleted(e) => Some(e.call.tool.as_str()),
        LifecycleEvent::ToolCallFailed(e) => Some(e.call.tool.as_str()),
        LifecycleEvent::ToolValidationFailed(e) => Some(e.call.tool.as_str()),
        _ => None,
    };
    match subject {
        Some(s) => format!("{:?}({})", event.kind(), s),
        None => format!("{:?}", event.kind()),
    }
}
