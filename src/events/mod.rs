//! Outbound events
//!
//! Every pass produces a list of events describing what changed: price
//! moves worth a notification, properties newly rated high risk, records
//! sent to quarantine and identity corrections. The engine only produces
//! them; delivery belongs to whoever subscribes to the bus.
//!
//! # Event Types
//! - `PriceDelta`: recommended price moved by more than the delta threshold
//! - `HighRisk`: a property entered the high risk tier
//! - `Quarantined`: a raw listing failed normalization
//! - `ClusterSplit`: a member was detached into its own property
//! - `ClusterMerged`: two properties were recognised as one

use crate::error::Result;
use crate::fraud::{RiskTier, RuleName};
use crate::normalize::{Rejection, RejectionReason};
use crate::pricing::PriceDelta;
use crate::resolve::{MergeOutcome, SplitOutcome};
use crate::types::{ClusterId, ListingKey};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PriceDelta,
    HighRisk,
    Quarantined,
    ClusterSplit,
    ClusterMerged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::PriceDelta => "price_delta",
            EventKind::HighRisk => "high_risk",
            EventKind::Quarantined => "quarantined",
            EventKind::ClusterSplit => "cluster_split",
            EventKind::ClusterMerged => "cluster_merged",
        };
        f.write_str(name)
    }
}

/// Base event wrapper with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Component that produced the event
    pub source: String,
    /// Batch the event belongs to
    pub correlation_id: Option<String>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: &str, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            correlation_id: None,
            payload,
        }
    }

    /// Pin the timestamp to the pass clock
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Property the event is about, if any
    pub fn cluster_id(&self) -> Option<ClusterId> {
        match &self.payload {
            EventPayload::PriceDelta(delta) => Some(delta.cluster_id),
            EventPayload::HighRisk(risk) => Some(risk.cluster_id),
            EventPayload::Quarantined(_) => None,
            EventPayload::ClusterSplit(split) => Some(split.source),
            EventPayload::ClusterMerged(merge) => Some(merge.survivor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    PriceDelta(PriceDelta),
    HighRisk(HighRiskPayload),
    Quarantined(QuarantinedPayload),
    ClusterSplit(SplitOutcome),
    ClusterMerged(MergeOutcome),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PriceDelta(_) => EventKind::PriceDelta,
            EventPayload::HighRisk(_) => EventKind::HighRisk,
            EventPayload::Quarantined(_) => EventKind::Quarantined,
            EventPayload::ClusterSplit(_) => EventKind::ClusterSplit,
            EventPayload::ClusterMerged(_) => EventKind::ClusterMerged,
        }
    }
}

/// A property newly rated high risk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighRiskPayload {
    pub cluster_id: ClusterId,
    pub version: u64,
    pub score: Decimal,
    pub rules: Vec<RuleName>,
    /// Tier of the last published signal, if there was one
    pub previous_tier: Option<RiskTier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedPayload {
    pub key: ListingKey,
    pub reason: RejectionReason,
    pub detail: String,
}

impl From<&Rejection> for QuarantinedPayload {
    fn from(rejection: &Rejection) -> Self {
        Self {
            key: rejection.key.clone(),
            reason: rejection.reason,
            detail: rejection.detail.clone(),
        }
    }
}

/// Event handler trait - implement this to react to engine events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name for logging
    fn name(&self) -> &str;

    /// Event kinds this handler is interested in
    fn handles(&self) -> Vec<EventKind>;

    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Fan-out of engine events to handlers and broadcast subscribers
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    broadcast_tx: broadcast::Sender<Event>,
    /// Published events per kind
    event_count: RwLock<HashMap<EventKind, u64>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            broadcast_tx,
            event_count: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    /// Publish one event to subscribers and interested handlers.
    ///
    /// A failing handler is logged and skipped; it never blocks the others.
    pub async fn publish(&self, event: Event) {
        *self.event_count.write().await.entry(event.kind()).or_insert(0) += 1;

        // No subscribers is not an error
        let _ = self.broadcast_tx.send(event.clone());

        let handlers = self.handlers.read().await;
        for handler in handlers.iter().filter(|h| h.handles().contains(&event.kind())) {
            if let Err(e) = handler.handle(&event).await {
                tracing::error!("Handler {} failed for event {}: {}", handler.name(), event.id, e);
            }
        }
    }

    pub async fn publish_all(&self, events: Vec<Event>) {
        for event in events {
            self.publish(event).await;
        }
    }

    pub async fn get_metrics(&self) -> HashMap<EventKind, u64> {
        self.event_count.read().await.clone()
    }

    pub async fn reset_metrics(&self) {
        self.event_count.write().await.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::testing::day;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delta_event() -> Event {
        Event::new(
            "pricing",
            EventPayload::PriceDelta(PriceDelta {
                cluster_id: ClusterId(3),
                previous: dec!(118750),
                current: dec!(104500),
                change_pct: dec!(-0.12),
                at: day(5),
            }),
        )
    }

    struct CountingHandler {
        kinds: Vec<EventKind>,
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        fn handles(&self) -> Vec<EventKind> {
            self.kinds.clone()
        }

        async fn handle(&self, _event: &Event) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Internal("handler down".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_event_creation() {
        let event = delta_event().at(day(5)).with_correlation_id("batch-1");
        assert!(!event.id.is_empty());
        assert_eq!(event.kind(), EventKind::PriceDelta);
        assert_eq!(event.cluster_id(), Some(ClusterId(3)));
        assert_eq!(event.timestamp, day(5));
        assert_eq!(event.correlation_id.as_deref(), Some("batch-1"));
    }

    #[test]
    fn test_payload_serializes_with_kind_tag() {
        let event = delta_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["kind"], "price_delta");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_counts() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(delta_event()).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), EventKind::PriceDelta);
        let metrics = bus.get_metrics().await;
        assert_eq!(metrics.get(&EventKind::PriceDelta), Some(&1));

        bus.reset_metrics().await;
        assert!(bus.get_metrics().await.is_empty());
    }

    #[tokio::test]
    async fn test_handlers_filtered_by_kind_and_failures_isolated() {
        let bus = EventBus::default();
        let failing = Arc::new(CountingHandler {
            kinds: vec![EventKind::PriceDelta],
            seen: AtomicUsize::new(0),
            fail: true,
        });
        let risk_only = Arc::new(CountingHandler {
            kinds: vec![EventKind::HighRisk],
            seen: AtomicUsize::new(0),
            fail: false,
        });
        bus.register_handler(failing.clone()).await;
        bus.register_handler(risk_only.clone()).await;

        bus.publish_all(vec![delta_event(), delta_event()]).await;

        assert_eq!(failing.seen.load(Ordering::SeqCst), 2);
        assert_eq!(risk_only.seen.load(Ordering::SeqCst), 0);
    }
}
