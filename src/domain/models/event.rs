//! Event envelope and namespaced type keys.
//!
//! Events are immutable value objects. Handlers may produce new events as
//! reactions but never mutate their inputs; the type key is frozen at
//! construction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::{RuntimeError, RuntimeResult};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which kernel a type key routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelNamespace {
    /// Business events: persistence, snapshots, agent work.
    Agent,
    /// Fire-and-forget telemetry events.
    Observability,
}

impl std::fmt::Display for KernelNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Observability => write!(f, "observability"),
        }
    }
}

/// Type prefixes reserved for the observability kernel.
const OBSERVABILITY_PREFIXES: &[&str] =
    &["obs.", "log.", "metric.", "trace.", "alert.", "health."];

/// Infix markers that also route a type to the observability kernel.
const OBSERVABILITY_INFIXES: &[&str] = &[".log.", ".metric.", ".trace."];

/// Validated dot-delimited event type key, e.g. `agent.tool.call`.
///
/// ASCII only, 1-128 characters, frozen after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Parse and validate a type key.
    pub fn parse(raw: impl Into<String>) -> RuntimeResult<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > 128 {
            return Err(RuntimeError::InvalidEventType(format!(
                "type key must be 1-128 chars, got {}",
                raw.len()
            )));
        }
        if !raw.is_ascii() {
            return Err(RuntimeError::InvalidEventType(format!(
                "type key must be ASCII: {raw}"
            )));
        }
        if raw.starts_with('.') || raw.ends_with('.') || raw.contains("..") {
            return Err(RuntimeError::InvalidEventType(format!(
                "malformed dotted key: {raw}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading namespace segment (`agent` in `agent.tool.call`).
    pub fn prefix(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// Which kernel this type routes to.
    ///
    /// Reserved prefixes (`obs.`, `log.`, `metric.`, `trace.`, `alert.`,
    /// `health.`) and infix markers (`.log.`, `.metric.`, `.trace.`) route
    /// to the observability kernel; everything else to the agent kernel.
    pub fn namespace(&self) -> KernelNamespace {
        let key = self.0.as_str();
        if OBSERVABILITY_PREFIXES.iter().any(|p| key.starts_with(p))
            || OBSERVABILITY_INFIXES.iter().any(|m| key.contains(m))
        {
            KernelNamespace::Observability
        } else {
            KernelNamespace::Agent
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EventType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Optional correlation metadata carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Correlates request/response pairs and bridged copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Owning tenant; stamped by the kernel when isolation is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Atomic-operation id used for idempotent emission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

impl EventMetadata {
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none() && self.tenant_id.is_none() && self.operation_id.is_none()
    }
}

/// Immutable event record flowing through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Events sharing a thread id are processed strictly in order.
    pub thread_id: String,
    /// Epoch milliseconds at creation.
    pub ts: i64,
    /// Opaque payload.
    pub data: Value,
    #[serde(default, skip_serializing_if = "EventMetadata::is_empty")]
    pub metadata: EventMetadata,
}

impl Event {
    /// Build an event with a fresh id and current timestamp.
    pub fn new(event_type: EventType, thread_id: impl Into<String>, data: Value) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            thread_id: thread_id.into(),
            ts: Utc::now().timestamp_millis(),
            data,
            metadata: EventMetadata::default(),
        }
    }

    /// Parse the type key and build an event in one step.
    pub fn parse_new(
        event_type: &str,
        thread_id: impl Into<String>,
        data: Value,
    ) -> RuntimeResult<Self> {
        Ok(Self::new(EventType::parse(event_type)?, thread_id, data))
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.metadata.correlation_id = Some(id);
        self
    }

    pub fn with_tenant_id(mut self, tenant: impl Into<String>) -> Self {
        self.metadata.tenant_id = Some(tenant.into());
        self
    }

    pub fn with_operation_id(mut self, op: impl Into<String>) -> Self {
        self.metadata.operation_id = Some(op.into());
        self
    }

    /// Which kernel this event routes to.
    pub fn namespace(&self) -> KernelNamespace {
        self.event_type.namespace()
    }

    /// A reaction event derived from this one, preserving thread and
    /// correlation so cascades stay ordered and traceable.
    pub fn derive(&self, event_type: EventType, data: Value) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            thread_id: self.thread_id.clone(),
            ts: Utc::now().timestamp_millis(),
            data,
            metadata: EventMetadata {
                correlation_id: self.metadata.correlation_id,
                tenant_id: self.metadata.tenant_id.clone(),
                operation_id: None,
            },
        }
    }
}

/// Try to interpret a handler-returned JSON value as a well-formed event.
///
/// Reactions that deserialize into an `Event` are resubmitted through the
/// processor fast path; anything else is treated as inert output.
pub fn as_reaction_event(value: &Value) -> Option<Event> {
    if !value.is_object() {
        return None;
    }
    let obj = value.as_object()?;
    if !obj.contains_key("type") || !obj.contains_key("data") {
        return None;
    }
    serde_json::from_value::<Event>(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_validation() {
        assert!(EventType::parse("agent.tool.call").is_ok());
        assert!(EventType::parse("a").is_ok());
        assert!(EventType::parse("").is_err());
        assert!(EventType::parse("a".repeat(129)).is_err());
        assert!(EventType::parse(".leading").is_err());
        assert!(EventType::parse("trailing.").is_err());
        assert!(EventType::parse("dou..ble").is_err());
        assert!(EventType::parse("ünïcode.type").is_err());
    }

    #[test]
    fn test_namespace_routing_prefixes() {
        for key in ["obs.span", "log.line", "metric.count", "trace.span", "alert.fired", "health.check"] {
            assert_eq!(
                EventType::parse(key).unwrap().namespace(),
                KernelNamespace::Observability,
                "{key} should route to observability"
            );
        }
        assert_eq!(
            EventType::parse("agent.tool.call").unwrap().namespace(),
            KernelNamespace::Agent
        );
    }

    #[test]
    fn test_namespace_routing_infixes() {
        assert_eq!(
            EventType::parse("agent.log.entry").unwrap().namespace(),
            KernelNamespace::Observability
        );
        assert_eq!(
            EventType::parse("agent.metric.count").unwrap().namespace(),
            KernelNamespace::Observability
        );
        assert_eq!(
            EventType::parse("agent.trace.span").unwrap().namespace(),
            KernelNamespace::Observability
        );
        // `logs` is not the `.log.` marker
        assert_eq!(
            EventType::parse("agent.logs.rotated").unwrap().namespace(),
            KernelNamespace::Agent
        );
    }

    #[test]
    fn test_event_builder() {
        let event = Event::parse_new("agent.started", "thread-1", json!({"k": 1}))
            .unwrap()
            .with_tenant_id("acme")
            .with_operation_id("op-1");

        assert_eq!(event.thread_id, "thread-1");
        assert_eq!(event.metadata.tenant_id.as_deref(), Some("acme"));
        assert_eq!(event.metadata.operation_id.as_deref(), Some("op-1"));
        assert!(event.ts > 0);
    }

    #[test]
    fn test_derive_preserves_thread_and_correlation() {
        let corr = Uuid::new_v4();
        let event = Event::parse_new("agent.step", "t-9", json!({}))
            .unwrap()
            .with_correlation_id(corr);

        let child = event.derive(EventType::parse("agent.step.done").unwrap(), json!({"ok": true}));
        assert_eq!(child.thread_id, "t-9");
        assert_eq!(child.metadata.correlation_id, Some(corr));
        assert_ne!(child.id, event.id);
    }

    #[test]
    fn test_reaction_event_detection() {
        let event = Event::parse_new("agent.next", "t", json!({"x": 1})).unwrap();
        let value = serde_json::to_value(&event).unwrap();
        let parsed = as_reaction_event(&value).expect("round-trips as reaction");
        assert_eq!(parsed.event_type, event.event_type);

        assert!(as_reaction_event(&json!({"not": "an event"})).is_none());
        assert!(as_reaction_event(&json!(42)).is_none());
    }

    #[test]
    fn test_serde_round_trip() {
        let event = Event::parse_new("agent.tool.call", "t-1", json!({"tool": "search"})).unwrap();
        let raw = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.data, event.data);
    }
}
