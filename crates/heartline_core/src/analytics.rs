//! Fire-and-forget product analytics.
//!
//! Emitting never blocks a turn and never fails it: sinks drop events they
//! cannot deliver.

use crate::relationship::RelationshipStage;
use crate::scenario::ScenarioType;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const ANALYTICS_TARGET: &str = "heartline::analytics";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    PaywallHit {
        user_id: String,
        persona_id: String,
        session_id: Uuid,
        choice_id: String,
    },
    StageTransition {
        user_id: String,
        persona_id: String,
        from: RelationshipStage,
        to: RelationshipStage,
    },
    ScenarioOffered {
        session_id: Uuid,
        scenario_type: ScenarioType,
    },
    ScenarioAccepted {
        session_id: Uuid,
        scenario_type: ScenarioType,
    },
    ScenarioDeclined {
        session_id: Uuid,
        scenario_type: ScenarioType,
    },
    GenerationDegraded {
        session_id: Uuid,
        reason: String,
    },
}

impl AnalyticsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AnalyticsEvent::PaywallHit { .. } => "paywall_hit",
            AnalyticsEvent::StageTransition { .. } => "stage_transition",
            AnalyticsEvent::ScenarioOffered { .. } => "scenario_offered",
            AnalyticsEvent::ScenarioAccepted { .. } => "scenario_accepted",
            AnalyticsEvent::ScenarioDeclined { .. } => "scenario_declined",
            AnalyticsEvent::GenerationDegraded { .. } => "generation_degraded",
        }
    }
}

pub trait AnalyticsSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// Writes events as structured log lines on the analytics target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn emit(&self, event: AnalyticsEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(target: ANALYTICS_TARGET, event = event.name(), %payload);
    }
}

/// Forwards events to a bounded channel; drops on a full or closed channel.
#[derive(Debug, Clone)]
pub struct ChannelAnalytics {
    tx: mpsc::Sender<AnalyticsEvent>,
}

impl ChannelAnalytics {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AnalyticsEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AnalyticsSink for ChannelAnalytics {
    fn emit(&self, event: AnalyticsEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(target: ANALYTICS_TARGET, "Dropped analytics event: {}", e);
        }
    }
}
